mod config;
mod election;
mod escalator;
mod process_tree;
mod report;
mod signals;
mod supervisor;

use clap::Parser;
use config::{ConfigError, Overrides, RunConfig};
use election::{ElectionError, FileLeaseElector};
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::Supervisor;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Run a command on exactly one instance of a fleet: contend for a shared
/// lock, run the command while holding it, forward termination signals to it,
/// and release the lock once it exits.
#[derive(Parser, Debug)]
#[command(name = "runlock", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "runlock.toml")]
    config: PathBuf,

    /// ID of this instance vying for leadership (default: $HOSTNAME)
    #[arg(long)]
    id: Option<String>,

    /// Lock name
    #[arg(long)]
    name: Option<String>,

    /// Lock namespace
    #[arg(long)]
    namespace: Option<String>,

    /// Directory holding the lock files, shared by every instance
    #[arg(long)]
    lock_dir: Option<PathBuf>,

    /// Seconds the lock is held before another instance may take over
    #[arg(long, value_name = "SECS")]
    lease_duration: Option<u64>,

    /// Seconds the leader retries renewing before giving up leadership
    #[arg(long, value_name = "SECS")]
    renew_deadline: Option<u64>,

    /// Seconds between attempts to obtain or renew the lock
    #[arg(long, value_name = "SECS")]
    retry_period: Option<u64>,

    /// Seconds the command gets to exit after a forwarded signal before SIGKILL
    #[arg(long, value_name = "SECS")]
    grace_period: Option<u64>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (resolved settings, signal and kill decisions)
    #[arg(short, long)]
    verbose: bool,

    /// Command to run, followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            identity: self.id.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            lock_dir: self.lock_dir.clone(),
            lease_duration_secs: self.lease_duration,
            renew_deadline_secs: self.renew_deadline,
            retry_period_secs: self.retry_period,
            grace_period_secs: self.grace_period,
        }
    }
}

fn load_config(cli: &Cli) -> Result<RunConfig, ConfigError> {
    let mut config = RunConfig::load(&cli.config)?;
    config.apply(cli.overrides());
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "unable to load configuration");
            return ExitCode::from(report::EXIT_CONFIG);
        }
    };
    let election = &config.election;
    tracing::debug!(
        command = %cli.command[0],
        args = ?&cli.command[1..],
        id = %election.identity,
        name = %election.name,
        namespace = %election.namespace,
        lock_dir = %election.lock_dir.display(),
        lease_duration_secs = election.lease_duration_secs,
        renew_deadline_secs = election.renew_deadline_secs,
        retry_period_secs = election.retry_period_secs,
        grace_period_secs = config.supervisor.grace_period_secs,
        "resolved settings"
    );

    if cli.dry_run {
        println!("runlock v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("Identity: {}", election.identity);
        println!("Lock: {}/{} in {}", election.namespace, election.name, election.lock_dir.display());
        println!(
            "Lease: {}s, renew deadline {}s, retry every {}s",
            election.lease_duration_secs, election.renew_deadline_secs, election.retry_period_secs
        );
        println!("Grace period: {}s", config.supervisor.grace_period_secs);
        println!("Command: {:?}", cli.command);
        println!("Dry run mode: config validated, not running.");
        return ExitCode::SUCCESS;
    }

    let supervisor = Supervisor::new(
        cli.command.clone(),
        election.identity.clone(),
        config.grace_period(),
    );
    let elector = FileLeaseElector::new(election);

    tracing::info!(
        namespace = %election.namespace,
        name = %election.name,
        lock = %elector.lock_path().display(),
        "attempting to get a lock"
    );
    match elector.run(&supervisor, CancellationToken::new()).await {
        Ok(Some(outcome)) => report::report(&outcome),
        Ok(None) => ExitCode::SUCCESS,
        Err(ElectionError::Invariant(e)) => {
            tracing::error!(error = %e, "aborting: leadership invariant violated");
            ExitCode::from(report::EXIT_INVARIANT)
        }
        Err(e) => {
            tracing::error!(error = %e, "leader election failed");
            ExitCode::from(report::EXIT_ELECTION)
        }
    }
}
