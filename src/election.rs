//! Leader election.
//!
//! Defines the contract between an election provider and the code that runs
//! while this instance leads ([`LeaderCallbacks`]), and ships one provider:
//! [`FileLeaseElector`], an advisory file lock shared by every replica that
//! can see the same lock directory.
//!
//! # Lifecycle
//!
//! One call to [`FileLeaseElector::run`] covers one leadership term:
//!
//! 1. Contend for the lock every `retry_period`, reporting the current holder
//!    through [`LeaderCallbacks::on_observed_leader`] whenever it changes.
//! 2. Once acquired, call [`LeaderCallbacks::on_acquired_leadership`] and keep
//!    the lease record fresh while it runs.
//! 3. When it returns, release the lock and call
//!    [`LeaderCallbacks::on_lost_leadership`].
//!
//! Losing the lease while step 2 is still running revokes the session. The
//! provider keeps the lock until `on_acquired_leadership` has returned, so the
//! command it started is gone before any other instance can take over; step 3
//! then runs and the term ends with [`ElectionError::Invariant`].

use crate::config::ElectionConfig;
use crate::supervisor::InvariantViolation;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that end an election run.
#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("failed to create lock directory {}: {source}", path.display())]
    LockDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to acquire lock {}: {source}", path.display())]
    LockAcquisition {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write lease record {}: {source}", path.display())]
    Record {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode lease record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

/// One leadership term as seen by the callbacks.
///
/// Cloning shares the same tokens. Once released, nothing tied to this session
/// may issue further work, and the provider gives up the lock. Once revoked,
/// the lease could not be kept and whatever runs under it must stop now.
#[derive(Debug, Clone)]
pub struct LeadershipSession {
    identity: String,
    cancel: CancellationToken,
    revoke: CancellationToken,
}

impl LeadershipSession {
    pub fn new(identity: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            identity: identity.into(),
            cancel,
            revoke: CancellationToken::new(),
        }
    }

    #[cfg(test)]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Raise the cancellation signal.
    pub fn release(&self) {
        self.cancel.cancel();
    }

    pub fn is_released(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The lease was lost while leading.
    pub fn revoke(&self) {
        self.revoke.cancel();
    }

    pub fn is_revoked(&self) -> bool {
        self.revoke.is_cancelled()
    }

    /// Completes once the session is revoked.
    pub async fn revoked(&self) {
        self.revoke.cancelled().await
    }
}

/// Handlers an election provider drives.
///
/// A provider never runs `on_lost_leadership` or `on_observed_leader`
/// concurrently with an active `on_acquired_leadership`. When the lease is lost
/// underneath it, the provider revokes the session and still waits for
/// `on_acquired_leadership` to return; `on_lost_leadership` must then treat the
/// revoked session as fatal.
pub trait LeaderCallbacks {
    type Outcome;

    /// Runs for the whole leadership term. The lock is held until this returns.
    fn on_acquired_leadership(
        &self,
        session: LeadershipSession,
    ) -> impl Future<Output = Self::Outcome>;

    /// The lock has been given up.
    fn on_lost_leadership(&self, session: &LeadershipSession) -> Result<(), InvariantViolation>;

    /// Informational: `identity` currently holds the lock.
    fn on_observed_leader(&self, identity: &str);
}

/// Persisted view of the lock, readable by every contender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Empty once the holder released the lock cleanly.
    pub holder_identity: String,
    pub lease_duration_secs: u64,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    pub leader_transitions: u32,
}

impl LeaseRecord {
    /// The holder has not renewed within its lease duration. A lease too long
    /// to represent never goes stale.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let Some(lease) = i64::try_from(self.lease_duration_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
        else {
            return false;
        };
        match self.renew_time.checked_add_signed(lease) {
            Some(expiry) => expiry < now,
            None => false,
        }
    }
}

/// Exclusive lock plus the lease record that describes it.
struct HeldLock {
    file: File,
    record: LeaseRecord,
}

/// File-lock based election provider.
pub struct FileLeaseElector {
    identity: String,
    lock_path: PathBuf,
    record_path: PathBuf,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
}

impl FileLeaseElector {
    pub fn new(config: &ElectionConfig) -> Self {
        let dir = config.lock_dir.join(&config.namespace);
        Self {
            identity: config.identity.clone(),
            lock_path: dir.join(format!("{}.lock", config.name)),
            record_path: dir.join(format!("{}.json", config.name)),
            lease_duration: Duration::from_secs(config.lease_duration_secs),
            renew_deadline: Duration::from_secs(config.renew_deadline_secs),
            retry_period: Duration::from_secs(config.retry_period_secs),
        }
    }

    /// Override the timing so tests can run with sub-second periods.
    #[cfg(test)]
    pub fn with_timing(mut self, renew_deadline: Duration, retry_period: Duration) -> Self {
        self.renew_deadline = renew_deadline;
        self.retry_period = retry_period;
        self
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    #[cfg(test)]
    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    /// Contend for the lock and run one leadership term.
    ///
    /// Returns `Ok(None)` if `token` is cancelled before the lock is acquired.
    /// The same token is handed to the callbacks as the session's cancellation
    /// signal.
    pub async fn run<C: LeaderCallbacks>(
        &self,
        callbacks: &C,
        token: CancellationToken,
    ) -> Result<Option<C::Outcome>, ElectionError> {
        let Some(held) = self.acquire(callbacks, &token).await? else {
            return Ok(None);
        };
        info!(identity = %self.identity, lock = %self.lock_path.display(), "lock obtained");
        callbacks.on_observed_leader(&self.identity);

        let session = LeadershipSession::new(self.identity.clone(), token);
        let (held, outcome) = self.lead(callbacks, &session, held).await;

        self.release(held);
        callbacks.on_lost_leadership(&session)?;
        if session.is_revoked() {
            return Err(ElectionError::Invariant(InvariantViolation {
                identity: self.identity.clone(),
            }));
        }
        info!("lock released");
        Ok(Some(outcome))
    }

    async fn acquire<C: LeaderCallbacks>(
        &self,
        callbacks: &C,
        token: &CancellationToken,
    ) -> Result<Option<HeldLock>, ElectionError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).map_err(|source| ElectionError::LockDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut observed: Option<String> = None;
        loop {
            if token.is_cancelled() {
                return Ok(None);
            }

            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&self.lock_path)
                .map_err(|source| ElectionError::LockAcquisition {
                    path: self.lock_path.clone(),
                    source,
                })?;

            match file.try_lock_exclusive() {
                Ok(()) => {
                    let record = self.take_over(self.read_record())?;
                    return Ok(Some(HeldLock { file, record }));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.observe(callbacks, &mut observed);
                }
                Err(source) => {
                    return Err(ElectionError::LockAcquisition {
                        path: self.lock_path.clone(),
                        source,
                    })
                }
            }
            drop(file);

            tokio::select! {
                _ = token.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.retry_period) => {}
            }
        }
    }

    /// Report the current holder if it changed since the last attempt.
    fn observe<C: LeaderCallbacks>(&self, callbacks: &C, observed: &mut Option<String>) {
        let Some(record) = self.read_record() else {
            return;
        };
        if record.holder_identity.is_empty() {
            return;
        }
        if record.is_stale(Utc::now()) {
            debug!(
                holder = %record.holder_identity,
                renew_time = %record.renew_time,
                "lease record looks stale but the lock is still held"
            );
        }
        if observed.as_deref() != Some(record.holder_identity.as_str()) {
            callbacks.on_observed_leader(&record.holder_identity);
            *observed = Some(record.holder_identity);
        }
    }

    fn take_over(&self, previous: Option<LeaseRecord>) -> Result<LeaseRecord, ElectionError> {
        let now = Utc::now();
        let transitions = match &previous {
            Some(prev) if prev.holder_identity != self.identity => prev.leader_transitions + 1,
            Some(prev) => prev.leader_transitions,
            None => 1,
        };
        let record = LeaseRecord {
            holder_identity: self.identity.clone(),
            lease_duration_secs: self.lease_duration.as_secs(),
            acquire_time: now,
            renew_time: now,
            leader_transitions: transitions,
        };
        self.write_record(&record)?;
        Ok(record)
    }

    /// Run the acquired callback while renewing the lease.
    ///
    /// Missing the renew deadline revokes the session and stops renewing, but
    /// the lock stays held until the callback has returned.
    async fn lead<C: LeaderCallbacks>(
        &self,
        callbacks: &C,
        session: &LeadershipSession,
        mut held: HeldLock,
    ) -> (HeldLock, C::Outcome) {
        let acquired = callbacks.on_acquired_leadership(session.clone());
        tokio::pin!(acquired);

        let mut ticker = tokio::time::interval(self.retry_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut last_renewed = Instant::now();

        loop {
            tokio::select! {
                outcome = &mut acquired => return (held, outcome),
                _ = ticker.tick(), if !session.is_revoked() => {
                    held.record.renew_time = Utc::now();
                    match self.write_record(&held.record) {
                        Ok(()) => last_renewed = Instant::now(),
                        Err(e) => {
                            warn!(error = %e, "failed to renew lease");
                            if last_renewed.elapsed() >= self.renew_deadline {
                                error!(
                                    renew_deadline_secs = self.renew_deadline.as_secs_f64(),
                                    "lease not renewed within deadline, leadership lost"
                                );
                                session.revoke();
                            }
                        }
                    }
                }
            }
        }
    }

    /// Clear the holder so contenders see a clean handover, then unlock.
    fn release(&self, mut held: HeldLock) {
        held.record.holder_identity.clear();
        held.record.renew_time = Utc::now();
        if let Err(e) = self.write_record(&held.record) {
            warn!(error = %e, "failed to clear lease record on release");
        }
        if let Err(e) = held.file.unlock() {
            warn!(error = %e, "failed to unlock lock file");
        }
    }

    fn read_record(&self) -> Option<LeaseRecord> {
        let contents = fs::read_to_string(&self.record_path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, path = %self.record_path.display(), "ignoring unreadable lease record");
                None
            }
        }
    }

    /// Atomic write via temp file and rename.
    fn write_record(&self, record: &LeaseRecord) -> Result<(), ElectionError> {
        let json = serde_json::to_vec_pretty(record)?;
        let tmp = self.record_path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .and_then(|()| fs::rename(&tmp, &self.record_path))
            .map_err(|source| ElectionError::Record {
                path: self.record_path.clone(),
                source,
            })
    }
}
