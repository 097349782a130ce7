/// Termination signals from the environment.
///
/// Subscribes to SIGINT and SIGTERM for as long as an [`OsSignals`] value lives.
/// The supervisor creates one per leadership session and drops it when its
/// event loop exits.
use std::fmt;
use std::future::Future;
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Semantic termination signal received by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    Interrupt,
    Terminate,
}

impl TermSignal {
    pub fn as_nix(self) -> nix::sys::signal::Signal {
        match self {
            TermSignal::Interrupt => nix::sys::signal::Signal::SIGINT,
            TermSignal::Terminate => nix::sys::signal::Signal::SIGTERM,
        }
    }
}

impl fmt::Display for TermSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_nix().as_str())
    }
}

/// A stream of termination signals. `None` means the source is exhausted.
pub trait SignalSource {
    fn recv(&mut self) -> impl Future<Output = Option<TermSignal>> + Send;
}

/// OS-level subscription to SIGINT and SIGTERM.
pub struct OsSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl OsSignals {
    pub fn subscribe() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }
}

impl SignalSource for OsSignals {
    async fn recv(&mut self) -> Option<TermSignal> {
        tokio::select! {
            Some(()) = self.interrupt.recv() => Some(TermSignal::Interrupt),
            Some(()) = self.terminate.recv() => Some(TermSignal::Terminate),
            else => None,
        }
    }
}

#[cfg(test)]
impl SignalSource for tokio::sync::mpsc::UnboundedReceiver<TermSignal> {
    async fn recv(&mut self) -> Option<TermSignal> {
        tokio::sync::mpsc::UnboundedReceiver::recv(self).await
    }
}
