/// Leadership-driven subprocess supervision: spawn the command when this
/// instance becomes leader, forward termination signals to it, escalate to a
/// hard kill when it does not comply, and hand leadership back once it exits.
use crate::election::{LeaderCallbacks, LeadershipSession};
use crate::escalator::{Decision, Escalator};
use crate::process_tree::{ProcessGroup, ProcessTree};
use crate::signals::{OsSignals, SignalSource};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// How the supervised command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited on its own with this code.
    NormalExit(i32),
    /// Terminated by a signal after termination was requested (the raw signal
    /// number, when known).
    SignalExit(Option<i32>),
    /// Died from a signal nobody asked for, such as a crash or an outside kill.
    UnexpectedSignal(Option<i32>),
    /// Never ran.
    StartFailure(String),
}

/// Lifecycle of the supervised process within one leadership session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    SoftKillPending,
    HardKillPending,
    Terminated,
}

/// The election provider gave up the lock while the command was still running.
///
/// Continuing would let another instance start the command concurrently.
#[derive(Debug, thiserror::Error)]
#[error("lock released while {identity} is still running the command")]
pub struct InvariantViolation {
    pub identity: String,
}

/// Runs one command per leadership session.
#[derive(Debug)]
pub struct Supervisor {
    argv: Vec<String>,
    identity: String,
    grace_period: Duration,
}

impl Supervisor {
    pub fn new(argv: Vec<String>, identity: impl Into<String>, grace_period: Duration) -> Self {
        Self {
            argv,
            identity: identity.into(),
            grace_period,
        }
    }

    /// Supervise the command with `signals` as the termination source.
    ///
    /// Returns once the child has terminated (or failed to start). The signal
    /// subscription is dropped and the session released before returning, in
    /// that order, on every path.
    pub async fn supervise<S: SignalSource>(
        &self,
        session: &LeadershipSession,
        mut signals: S,
    ) -> ExitOutcome {
        let outcome = self.drive(session, &mut signals).await;
        drop(signals);
        session.release();
        outcome
    }

    async fn drive<S: SignalSource>(
        &self,
        session: &LeadershipSession,
        signals: &mut S,
    ) -> ExitOutcome {
        let mut state = ProcessState::NotStarted;

        if session.is_released() || session.is_revoked() {
            return ExitOutcome::StartFailure(
                "leadership session cancelled before launch".to_string(),
            );
        }
        let Some((program, args)) = self.argv.split_first() else {
            return ExitOutcome::StartFailure("empty command".to_string());
        };

        let mut child = match Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0) // Own group so the whole tree can be killed
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(command = %program, error = %e, "failed to start subprocess");
                return ExitOutcome::StartFailure(format!("{program}: {e}"));
            }
        };
        let Some(pid) = child.id() else {
            return ExitOutcome::StartFailure(format!("{program}: no pid after spawn"));
        };
        let mut tree = ProcessGroup::new(pid);
        info!(pid, pgid = tree.pid(), command = %program, args = ?args, "subprocess started");
        transition(&mut state, ProcessState::Running);

        let mut escalator = Escalator::new(self.grace_period);
        let mut signals_open = true;
        let mut revoked = false;

        let outcome = loop {
            let deadline = escalator.deadline();
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => {
                            tree.mark_reaped();
                            debug!(%status, "subprocess finished");
                            break outcome_from(status, state);
                        }
                        Err(e) => {
                            // Unreaped: dropping the tree kills the group.
                            error!(pid, error = %e, "failed to wait for subprocess");
                            break ExitOutcome::StartFailure(format!("{program}: wait failed: {e}"));
                        }
                    }
                }
                received = signals.recv(), if signals_open => match received {
                    Some(signal) => {
                        info!(%signal, "received termination signal");
                        let decision = escalator.on_signal(signal, Instant::now());
                        apply(decision, &tree, &mut escalator, &mut state);
                    }
                    None => signals_open = false,
                },
                () = timer => {
                    let decision = escalator.on_deadline();
                    apply(decision, &tree, &mut escalator, &mut state);
                }
                () = session.revoked(), if !revoked => {
                    revoked = true;
                    error!(pid, "leadership revoked, killing subprocess");
                    let decision = escalator.on_revoked();
                    apply(decision, &tree, &mut escalator, &mut state);
                }
            }
        };

        transition(&mut state, ProcessState::Terminated);
        outcome
    }
}

/// Carry out an escalator decision against the process tree, feeding the soft
/// kill delivery result back until nothing is left to do.
fn apply(
    mut decision: Decision,
    tree: &impl ProcessTree,
    escalator: &mut Escalator,
    state: &mut ProcessState,
) {
    loop {
        decision = match decision {
            Decision::SoftKill(signal) => {
                info!(%signal, "signaling subprocess to shut down");
                let delivered = match tree.signal_tree(signal) {
                    Ok(()) => true,
                    Err(e) => {
                        error!(%signal, error = %e, "error passing signal to subprocess");
                        false
                    }
                };
                escalator.forward_result(delivered)
            }
            Decision::ArmTimer(deadline) => {
                debug!(
                    in_secs = deadline.saturating_duration_since(Instant::now()).as_secs_f64(),
                    "waiting for subprocess to stop gracefully"
                );
                transition(state, ProcessState::SoftKillPending);
                return;
            }
            Decision::HardKill => {
                if let Err(e) = tree.hard_kill() {
                    error!(error = %e, "hard kill failed, leaving subprocess to exit on its own");
                }
                transition(state, ProcessState::HardKillPending);
                return;
            }
            Decision::None => return,
        };
    }
}

fn transition(state: &mut ProcessState, next: ProcessState) {
    if *state != next {
        debug!(from = ?*state, to = ?next, "subprocess state");
        *state = next;
    }
}

/// A signal death counts as requested only while a soft or hard kill is pending.
fn outcome_from(status: ExitStatus, state: ProcessState) -> ExitOutcome {
    match (status.code(), state) {
        (Some(code), _) => ExitOutcome::NormalExit(code),
        (None, ProcessState::SoftKillPending | ProcessState::HardKillPending) => {
            ExitOutcome::SignalExit(status.signal())
        }
        (None, _) => ExitOutcome::UnexpectedSignal(status.signal()),
    }
}

impl LeaderCallbacks for Supervisor {
    type Outcome = ExitOutcome;

    async fn on_acquired_leadership(&self, session: LeadershipSession) -> ExitOutcome {
        info!("lock obtained, running command");
        match OsSignals::subscribe() {
            Ok(signals) => self.supervise(&session, signals).await,
            Err(e) => {
                session.release();
                ExitOutcome::StartFailure(format!("failed to subscribe to termination signals: {e}"))
            }
        }
    }

    fn on_lost_leadership(&self, session: &LeadershipSession) -> Result<(), InvariantViolation> {
        if session.is_revoked() {
            error!(identity = %self.identity, "lease lost while the command was running");
            return Err(InvariantViolation {
                identity: self.identity.clone(),
            });
        }
        if session.is_released() {
            return Ok(());
        }
        error!(identity = %self.identity, "lock lost while the command is still running");
        Err(InvariantViolation {
            identity: self.identity.clone(),
        })
    }

    fn on_observed_leader(&self, identity: &str) {
        if identity == self.identity {
            return;
        }
        info!(leader = identity, "current leader is another instance");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_tree::KillError;
    use crate::signals::TermSignal;
    use nix::errno::Errno;
    use nix::sys::signal::Signal;
    use std::cell::Cell;
    use std::path::Path;
    use tempfile::tempdir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn supervisor(argv: &[&str], grace: Duration) -> Supervisor {
        Supervisor::new(argv.iter().map(|s| s.to_string()).collect(), "me", grace)
    }

    fn sh(script: &str, grace: Duration) -> Supervisor {
        supervisor(&["sh", "-c", script], grace)
    }

    fn session() -> LeadershipSession {
        LeadershipSession::new("me", CancellationToken::new())
    }

    /// Supervise with no signals ever arriving.
    async fn run_quiet(sup: &Supervisor) -> (ExitOutcome, LeadershipSession) {
        let session = session();
        let (_tx, rx) = mpsc::unbounded_channel();
        let outcome = sup.supervise(&session, rx).await;
        (outcome, session)
    }

    /// Supervise while sending `signals` at the given offsets from start.
    async fn run_with_signals(
        sup: &Supervisor,
        signals: &[(u64, TermSignal)],
    ) -> (ExitOutcome, Duration) {
        let session = session();
        let (tx, rx) = mpsc::unbounded_channel();
        let schedule = signals.to_vec();
        let start = Instant::now();
        tokio::spawn(async move {
            for (at_ms, signal) in schedule {
                tokio::time::sleep_until(start + Duration::from_millis(at_ms)).await;
                let _ = tx.send(signal);
            }
            // Keep the source open so it never reports exhaustion mid-test
            std::future::pending::<()>().await;
        });
        let outcome = sup.supervise(&session, rx).await;
        assert!(session.is_released());
        (outcome, start.elapsed())
    }

    fn wait_for_file(path: &Path) -> String {
        for _ in 0..200 {
            if let Ok(contents) = std::fs::read_to_string(path) {
                if !contents.trim().is_empty() {
                    return contents;
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("{} never written", path.display());
    }

    /// The process is gone or a zombie waiting for init to reap it.
    fn is_dead(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
        }
    }

    #[tokio::test]
    async fn test_completed_command_reports_exit_zero() {
        let (outcome, session) = run_quiet(&supervisor(&["sleep", "0.2"], Duration::from_secs(90))).await;
        assert_eq!(outcome, ExitOutcome::NormalExit(0));
        assert!(session.is_released());
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_is_preserved() {
        let (outcome, _) = run_quiet(&sh("exit 12", Duration::from_secs(90))).await;
        assert_eq!(outcome, ExitOutcome::NormalExit(12));
    }

    #[tokio::test]
    async fn test_unresolvable_command_is_start_failure() {
        let (outcome, session) =
            run_quiet(&supervisor(&["nonexistent-binary-xyz"], Duration::from_secs(90))).await;
        match outcome {
            ExitOutcome::StartFailure(reason) => assert!(reason.contains("nonexistent-binary-xyz")),
            other => panic!("expected start failure, got {other:?}"),
        }
        assert!(session.is_released());
    }

    #[tokio::test]
    async fn test_empty_command_is_start_failure() {
        let (outcome, _) = run_quiet(&supervisor(&[], Duration::from_secs(90))).await;
        assert_eq!(outcome, ExitOutcome::StartFailure("empty command".to_string()));
    }

    #[tokio::test]
    async fn test_released_session_refuses_launch() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("ran");
        let sup = sh(&format!("touch {}", marker.display()), Duration::from_secs(90));

        let session = session();
        session.release();
        let (_tx, rx) = mpsc::unbounded_channel();
        let outcome = sup.supervise(&session, rx).await;

        assert!(matches!(outcome, ExitOutcome::StartFailure(_)));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_single_signal_is_forwarded_without_hard_kill() {
        let sup = supervisor(&["sleep", "10"], Duration::from_secs(90));
        let (outcome, elapsed) = run_with_signals(&sup, &[(200, TermSignal::Interrupt)]).await;

        assert_eq!(outcome, ExitOutcome::SignalExit(Some(Signal::SIGINT as i32)));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_terminate_is_forwarded_as_terminate() {
        let sup = supervisor(&["sleep", "10"], Duration::from_secs(90));
        let (outcome, _) = run_with_signals(&sup, &[(200, TermSignal::Terminate)]).await;
        assert_eq!(outcome, ExitOutcome::SignalExit(Some(Signal::SIGTERM as i32)));
    }

    #[tokio::test]
    async fn test_graceful_child_exits_with_its_own_code() {
        let sup = sh("trap 'exit 3' INT; sleep 10 & wait", Duration::from_secs(90));
        let (outcome, elapsed) = run_with_signals(&sup, &[(300, TermSignal::Interrupt)]).await;
        assert_eq!(outcome, ExitOutcome::NormalExit(3));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_ignored_signal_escalates_after_grace_period() {
        let grace = Duration::from_millis(400);
        let sup = sh("trap '' INT; sleep 10", grace);
        let (outcome, elapsed) = run_with_signals(&sup, &[(300, TermSignal::Interrupt)]).await;

        assert_eq!(outcome, ExitOutcome::SignalExit(Some(Signal::SIGKILL as i32)));
        assert!(elapsed >= Duration::from_millis(700), "killed too early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_second_signal_hard_kills_immediately() {
        let sup = sh("trap '' INT; sleep 10", Duration::from_secs(90));
        let (outcome, elapsed) = run_with_signals(
            &sup,
            &[(300, TermSignal::Interrupt), (800, TermSignal::Interrupt)],
        )
        .await;

        assert_eq!(outcome, ExitOutcome::SignalExit(Some(Signal::SIGKILL as i32)));
        assert!(elapsed >= Duration::from_millis(800));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_hard_kill_reaches_grandchildren() {
        let dir = tempdir().unwrap();
        let pidfile = dir.path().join("grandchild.pid");
        let script = format!(
            "trap '' INT; sleep 30 & echo $! > {}; wait",
            pidfile.display()
        );
        let sup = sh(&script, Duration::from_secs(90));

        let session = session();
        let (tx, rx) = mpsc::unbounded_channel();
        let watched = pidfile.clone();
        let sender = tokio::task::spawn_blocking(move || {
            let pid: i32 = wait_for_file(&watched).trim().parse().unwrap();
            tx.send(TermSignal::Interrupt).unwrap();
            std::thread::sleep(Duration::from_millis(200));
            tx.send(TermSignal::Interrupt).unwrap();
            (pid, tx)
        });

        let outcome = sup.supervise(&session, rx).await;
        let (grandchild, _tx) = sender.await.unwrap();

        assert_eq!(outcome, ExitOutcome::SignalExit(Some(Signal::SIGKILL as i32)));
        let mut dead = false;
        for _ in 0..100 {
            if is_dead(grandchild) {
                dead = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(dead, "grandchild {grandchild} survived the hard kill");
    }

    #[tokio::test]
    async fn test_exhausted_signal_source_does_not_stop_supervision() {
        let sup = supervisor(&["sleep", "0.2"], Duration::from_secs(90));
        let session = session();
        let (tx, rx) = mpsc::unbounded_channel::<TermSignal>();
        drop(tx);

        let outcome = sup.supervise(&session, rx).await;
        assert_eq!(outcome, ExitOutcome::NormalExit(0));
    }

    #[test]
    fn test_lost_leadership_while_running_is_invariant_violation() {
        let sup = supervisor(&["true"], Duration::from_secs(90));
        let session = session();

        let err = sup.on_lost_leadership(&session).unwrap_err();
        assert_eq!(err.identity, "me");
        assert!(err.to_string().contains("still running"));
    }

    #[tokio::test]
    async fn test_lost_leadership_after_termination_is_accepted() {
        let sup = supervisor(&["true"], Duration::from_secs(90));
        let session = session();
        let outcome = sup.on_acquired_leadership(session.clone()).await;

        assert_eq!(outcome, ExitOutcome::NormalExit(0));
        assert!(session.is_released());
        assert!(sup.on_lost_leadership(&session).is_ok());
    }

    #[test]
    fn test_observed_leader_causes_no_transition() {
        let sup = supervisor(&["true"], Duration::from_secs(90));
        sup.on_observed_leader("me");
        sup.on_observed_leader("someone-else");
        assert_eq!(sup.identity, "me");
    }

    #[tokio::test]
    async fn test_crash_without_termination_request_is_unexpected() {
        let (outcome, _) = run_quiet(&sh("kill -SEGV $$", Duration::from_secs(90))).await;
        assert_eq!(
            outcome,
            ExitOutcome::UnexpectedSignal(Some(Signal::SIGSEGV as i32))
        );
    }

    #[tokio::test]
    async fn test_revoked_session_kills_command_without_grace() {
        let sup = sh("trap '' INT TERM; sleep 30", Duration::from_secs(90));
        let session = session();
        let (_tx, rx) = mpsc::unbounded_channel();
        let revoker = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            revoker.revoke();
        });

        let start = Instant::now();
        let outcome = sup.supervise(&session, rx).await;

        assert_eq!(outcome, ExitOutcome::SignalExit(Some(Signal::SIGKILL as i32)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(sup.on_lost_leadership(&session).is_err());
    }

    #[tokio::test]
    async fn test_revoked_session_refuses_launch() {
        let sup = supervisor(&["true"], Duration::from_secs(90));
        let session = session();
        session.revoke();
        let (_tx, rx) = mpsc::unbounded_channel();
        let outcome = sup.supervise(&session, rx).await;
        assert!(matches!(outcome, ExitOutcome::StartFailure(_)));
    }

    /// Process tree that fails soft kills with a fixed error and counts hard kills.
    struct FakeTree {
        signal_result: Result<(), Errno>,
        signaled: Cell<u32>,
        hard_kills: Cell<u32>,
    }

    impl FakeTree {
        fn new(signal_result: Result<(), Errno>) -> Self {
            Self {
                signal_result,
                signaled: Cell::new(0),
                hard_kills: Cell::new(0),
            }
        }
    }

    impl ProcessTree for FakeTree {
        fn signal_tree(&self, _signal: TermSignal) -> Result<(), Errno> {
            self.signaled.set(self.signaled.get() + 1);
            self.signal_result
        }

        fn hard_kill(&self) -> Result<(), KillError> {
            self.hard_kills.set(self.hard_kills.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn test_undeliverable_soft_kill_hard_kills_once() {
        let tree = FakeTree::new(Err(Errno::ESRCH));
        let mut escalator = Escalator::new(Duration::from_secs(90));
        let mut state = ProcessState::Running;

        let decision = escalator.on_signal(TermSignal::Interrupt, Instant::now());
        apply(decision, &tree, &mut escalator, &mut state);

        assert_eq!(tree.signaled.get(), 1);
        assert_eq!(tree.hard_kills.get(), 1);
        assert_eq!(state, ProcessState::HardKillPending);
        assert!(escalator.deadline().is_none());
    }

    #[test]
    fn test_delivered_soft_kill_waits_for_grace_period() {
        let tree = FakeTree::new(Ok(()));
        let mut escalator = Escalator::new(Duration::from_secs(90));
        let mut state = ProcessState::Running;

        let decision = escalator.on_signal(TermSignal::Terminate, Instant::now());
        apply(decision, &tree, &mut escalator, &mut state);

        assert_eq!(tree.hard_kills.get(), 0);
        assert_eq!(state, ProcessState::SoftKillPending);
        assert!(escalator.deadline().is_some());
    }

    #[test]
    fn test_transition_updates_state() {
        let mut state = ProcessState::NotStarted;
        transition(&mut state, ProcessState::Running);
        assert_eq!(state, ProcessState::Running);
        transition(&mut state, ProcessState::Terminated);
        assert_eq!(state, ProcessState::Terminated);
    }
}
