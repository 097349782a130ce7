/// Process-tree termination.
///
/// The supervised command is spawned as the leader of its own process group,
/// so one signal to the negative group id reaches every descendant that did
/// not move itself to another group.
use crate::signals::TermSignal;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

/// Both the group kill and the direct-process fallback failed.
#[derive(Debug, thiserror::Error)]
#[error("failed to kill process tree (group {pgid}: {group}; process {pid}: {direct})")]
pub struct KillError {
    pub pid: i32,
    pub pgid: i32,
    pub group: Errno,
    pub direct: Errno,
}

/// Capability to signal and forcefully terminate a spawned process and its descendants.
///
/// The supervisor and escalator only talk to this trait; the platform strategy
/// lives behind it.
pub trait ProcessTree {
    /// Deliver `signal` to the whole tree (soft kill).
    fn signal_tree(&self, signal: TermSignal) -> Result<(), Errno>;

    /// Forcefully terminate the whole tree, falling back to the direct child.
    fn hard_kill(&self) -> Result<(), KillError>;
}

/// POSIX strategy: the child leads a process group whose id equals its pid.
#[derive(Debug)]
pub struct ProcessGroup {
    pid: Pid,
    reaped: bool,
}

impl ProcessGroup {
    /// Track a child spawned with `process_group(0)`.
    pub fn new(pid: u32) -> Self {
        Self {
            pid: Pid::from_raw(pid as i32),
            reaped: false,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    fn group(&self) -> Pid {
        Pid::from_raw(-self.pid.as_raw())
    }

    /// The child has been waited on. Its pid may now be reused, so the drop
    /// guard must no longer fire.
    pub fn mark_reaped(&mut self) {
        self.reaped = true;
    }
}

impl ProcessTree for ProcessGroup {
    fn signal_tree(&self, signal: TermSignal) -> Result<(), Errno> {
        kill(self.group(), signal.as_nix())?;
        debug!(pgid = self.pid.as_raw(), %signal, "signal forwarded to process group");
        Ok(())
    }

    fn hard_kill(&self) -> Result<(), KillError> {
        info!(pgid = self.pid.as_raw(), "proceeding with SIGKILL");
        let group = match kill(self.group(), Signal::SIGKILL) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!(pgid = self.pid.as_raw(), error = %group, "group kill failed, killing direct child");
        match kill(self.pid, Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(direct) => Err(KillError {
                pid: self.pid.as_raw(),
                pgid: self.pid.as_raw(),
                group,
                direct,
            }),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        // Supervision abandoned with the child still unreaped.
        if let Err(e) = self.hard_kill() {
            error!(error = %e, "could not kill abandoned process tree");
        }
    }
}
