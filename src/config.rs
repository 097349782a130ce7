use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for every configured duration: one year.
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Top-level configuration loaded from runlock.toml.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub election: ElectionConfig,
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Identity of this instance, as recorded in the lease.
    pub identity: String,
    /// Lock name; one lock per supervised job.
    pub name: String,
    pub namespace: String,
    /// Directory shared by every contender.
    pub lock_dir: PathBuf,
    /// How long a lease is considered held without renewal.
    pub lease_duration_secs: u64,
    /// How long the leader keeps retrying a failed renewal before giving up.
    pub renew_deadline_secs: u64,
    /// Wait between acquisition attempts and between renewals.
    pub retry_period_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Time the command gets to exit after a forwarded termination signal.
    pub grace_period_secs: u64,
}

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Values given on the command line; each one replaces its file counterpart.
#[derive(Debug, Default)]
pub struct Overrides {
    pub identity: Option<String>,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub lock_dir: Option<PathBuf>,
    pub lease_duration_secs: Option<u64>,
    pub renew_deadline_secs: Option<u64>,
    pub retry_period_secs: Option<u64>,
    pub grace_period_secs: Option<u64>,
}

// --- Default implementations ---

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            name: "example-app".to_string(),
            namespace: "default".to_string(),
            lock_dir: std::env::temp_dir().join("runlock"),
            lease_duration_secs: 15,
            renew_deadline_secs: 10,
            retry_period_secs: 2,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: crate::escalator::DEFAULT_GRACE_PERIOD.as_secs(),
        }
    }
}

/// `$HOSTNAME`, else the kernel hostname, else empty (rejected by validation).
fn default_identity() -> String {
    if let Ok(host) = std::env::var("HOSTNAME") {
        if !host.is_empty() {
            return host;
        }
    }
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default()
}

impl RunConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply(&mut self, overrides: Overrides) {
        let election = &mut self.election;
        if let Some(identity) = overrides.identity {
            election.identity = identity;
        }
        if let Some(name) = overrides.name {
            election.name = name;
        }
        if let Some(namespace) = overrides.namespace {
            election.namespace = namespace;
        }
        if let Some(lock_dir) = overrides.lock_dir {
            election.lock_dir = lock_dir;
        }
        if let Some(secs) = overrides.lease_duration_secs {
            election.lease_duration_secs = secs;
        }
        if let Some(secs) = overrides.renew_deadline_secs {
            election.renew_deadline_secs = secs;
        }
        if let Some(secs) = overrides.retry_period_secs {
            election.retry_period_secs = secs;
        }
        if let Some(secs) = overrides.grace_period_secs {
            self.supervisor.grace_period_secs = secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let e = &self.election;
        if e.identity.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "identity is empty; set --id or HOSTNAME".to_string(),
            ));
        }
        for (field, value) in [("name", &e.name), ("namespace", &e.namespace)] {
            if value.is_empty() {
                return Err(ConfigError::Invalid(format!("{field} is empty")));
            }
            if value.contains('/') || value.contains('\\') || value == "." || value == ".." {
                return Err(ConfigError::Invalid(format!(
                    "{field} {value:?} must not contain path separators"
                )));
            }
        }
        if e.retry_period_secs == 0 {
            return Err(ConfigError::Invalid("retry period must be positive".to_string()));
        }
        if e.renew_deadline_secs <= e.retry_period_secs {
            return Err(ConfigError::Invalid(format!(
                "renew deadline ({}s) must be greater than retry period ({}s)",
                e.renew_deadline_secs, e.retry_period_secs
            )));
        }
        if e.lease_duration_secs > MAX_DURATION_SECS {
            return Err(ConfigError::Invalid(format!(
                "lease duration ({}s) must not exceed {MAX_DURATION_SECS}s",
                e.lease_duration_secs
            )));
        }
        if e.lease_duration_secs <= e.renew_deadline_secs {
            return Err(ConfigError::Invalid(format!(
                "lease duration ({}s) must be greater than renew deadline ({}s)",
                e.lease_duration_secs, e.renew_deadline_secs
            )));
        }
        if self.supervisor.grace_period_secs == 0 {
            return Err(ConfigError::Invalid("grace period must be positive".to_string()));
        }
        if self.supervisor.grace_period_secs > MAX_DURATION_SECS {
            return Err(ConfigError::Invalid(format!(
                "grace period ({}s) must not exceed {MAX_DURATION_SECS}s",
                self.supervisor.grace_period_secs
            )));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.supervisor.grace_period_secs)
    }
}
