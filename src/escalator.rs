use crate::signals::TermSignal;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default grace period between forwarding a termination signal and forcing a kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(90);

/// Stand-in deadline for a grace period too long to add to an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Action the supervisor must apply after feeding an event to the escalator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Forward the received signal to the process group, then report back
    /// through [`Escalator::forward_result`].
    SoftKill(TermSignal),
    /// Soft kill delivered: wake up at this deadline unless the child exits first.
    ArmTimer(Instant),
    /// Forcefully terminate the process tree now.
    HardKill,
    /// Nothing to do.
    None,
}

/// A termination request awaiting escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationRequest {
    pub signal: TermSignal,
    pub issued_at: Instant,
    pub deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    /// Soft kill decided, delivery outcome not yet known.
    Forwarding(TermSignal, Instant),
    Pending(TerminationRequest),
    /// A hard kill was issued; later signals repeat it.
    HardKilled,
}

/// Turns termination signals and elapsed time into a soft-kill-then-hard-kill decision.
///
/// Pure state machine: it never touches a process, so every transition can be
/// exercised with synthetic instants. At most one request is pending at a time;
/// a second signal while one is pending escalates immediately.
#[derive(Debug)]
pub struct Escalator {
    grace_period: Duration,
    state: State,
}

impl Escalator {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            grace_period,
            state: State::Idle,
        }
    }

    /// A termination signal arrived from the environment at `now`.
    pub fn on_signal(&mut self, signal: TermSignal, now: Instant) -> Decision {
        match self.state {
            State::Idle => {
                self.state = State::Forwarding(signal, now);
                Decision::SoftKill(signal)
            }
            State::Forwarding(..) | State::Pending(_) => {
                debug!(%signal, "soft kill already attempted, escalating");
                self.state = State::HardKilled;
                Decision::HardKill
            }
            State::HardKilled => {
                debug!(%signal, "hard kill already issued, repeating");
                Decision::HardKill
            }
        }
    }

    /// Outcome of delivering the soft-kill signal requested by [`Decision::SoftKill`].
    ///
    /// A failed delivery means graceful shutdown cannot be relied on, so it is
    /// treated as if the grace period had already elapsed.
    pub fn forward_result(&mut self, delivered: bool) -> Decision {
        let State::Forwarding(signal, issued_at) = self.state else {
            return Decision::None;
        };
        if delivered {
            let deadline = issued_at
                .checked_add(self.grace_period)
                .unwrap_or_else(|| issued_at + FAR_FUTURE);
            let request = TerminationRequest {
                signal,
                issued_at,
                deadline,
            };
            self.state = State::Pending(request);
            Decision::ArmTimer(request.deadline)
        } else {
            warn!(%signal, "soft kill could not be delivered, escalating immediately");
            self.state = State::HardKilled;
            Decision::HardKill
        }
    }

    /// The escalation timer fired.
    pub fn on_deadline(&mut self) -> Decision {
        match self.state {
            State::Pending(request) => {
                warn!(
                    signal = %request.signal,
                    waited_secs = request.issued_at.elapsed().as_secs_f64(),
                    grace_secs = self.grace_period.as_secs_f64(),
                    "timed out waiting for subprocess to exit"
                );
                self.state = State::HardKilled;
                Decision::HardKill
            }
            _ => Decision::None,
        }
    }

    /// Leadership was lost: no grace period, kill now.
    pub fn on_revoked(&mut self) -> Decision {
        if self.state != State::HardKilled {
            warn!("leadership lost, escalating straight to hard kill");
        }
        self.state = State::HardKilled;
        Decision::HardKill
    }

    /// Deadline of the pending request, if any. The supervisor sleeps on this.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            State::Pending(request) => Some(request.deadline),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> Option<&TerminationRequest> {
        match &self.state {
            State::Pending(request) => Some(request),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn hard_killed(&self) -> bool {
        self.state == State::HardKilled
    }
}
