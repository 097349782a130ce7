/// Exit status reporting: turn the supervised command's outcome, or a fatal
/// infrastructure error, into this program's own exit status.
use crate::supervisor::ExitOutcome;
use std::process::ExitCode;

/// The command could not be launched. Same convention as `env` and shells.
///
/// A command that runs and itself exits 127 (for example `sh -c missing-cmd`)
/// produces the same status. The two are told apart by the log: only a launch
/// failure emits "error starting subprocess".
pub const EXIT_START_FAILURE: u8 = 127;
/// The lock was lost while the command was still running (EX_SOFTWARE).
pub const EXIT_INVARIANT: u8 = 70;
/// The election provider failed (EX_UNAVAILABLE).
pub const EXIT_ELECTION: u8 = 69;
/// Configuration could not be loaded or is invalid (EX_CONFIG).
pub const EXIT_CONFIG: u8 = 78;

/// Shell convention for a command killed by a signal nobody requested.
const SIGNAL_EXIT_BASE: u8 = 128;

/// Exit status for a finished supervision run.
///
/// A command terminated after a forwarded signal is not an application error:
/// the termination was requested by an operator or the system. A command that
/// dies from any other signal exits `128 + signo`.
pub fn status_code(outcome: &ExitOutcome) -> u8 {
    match outcome {
        ExitOutcome::NormalExit(code) => u8::try_from(*code).unwrap_or(1),
        ExitOutcome::SignalExit(_) => 0,
        ExitOutcome::UnexpectedSignal(signal) => signal
            .and_then(|signo| u8::try_from(signo).ok())
            .and_then(|signo| SIGNAL_EXIT_BASE.checked_add(signo))
            .unwrap_or(1),
        ExitOutcome::StartFailure(_) => EXIT_START_FAILURE,
    }
}

/// Log the outcome and convert it to the process exit code.
pub fn report(outcome: &ExitOutcome) -> ExitCode {
    match outcome {
        ExitOutcome::NormalExit(0) => tracing::info!("command completed successfully"),
        ExitOutcome::NormalExit(code) => tracing::info!(code, "command exited with failure"),
        ExitOutcome::SignalExit(signal) => {
            tracing::info!(signal = ?signal, "command terminated by signal")
        }
        ExitOutcome::UnexpectedSignal(signal) => {
            tracing::error!(signal = ?signal, "command died from an unrequested signal")
        }
        ExitOutcome::StartFailure(reason) => {
            tracing::error!(%reason, "error starting subprocess")
        }
    }
    ExitCode::from(status_code(outcome))
}
