//! Distributed Lock Coordination
//!
//! Only one process in the fleet may run the migration protocol at a time. A
//! [`LockBackend`] exposes a non-blocking attempt at a database-visible lock;
//! the [`LockCoordinator`] turns that into a blocking acquire that retries on a
//! fixed interval, and hands back a [`LockGuard`] that owns the lock until it is
//! released.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::MigrateResult;

/// Identifier of a database-visible lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(i64);

impl LockId {
    /// The lock serializing schema migrations. ASCII "SCHEMA", kept clear of the
    /// small sequential ids other subsystems hand out.
    pub const DATABASE_MIGRATION: LockId = LockId(0x5343_4845_4d41);

    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A lock implementation shared by every process that migrates the database
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Try once to take the lock. `Ok(None)` means another holder has it;
    /// `Err` means the backend itself is unusable.
    async fn try_acquire(&self, id: LockId) -> MigrateResult<Option<Box<dyn LockHandle>>>;
}

/// Proof of a held lock
#[async_trait]
pub trait LockHandle: Send {
    fn id(&self) -> LockId;

    /// Release the lock
    async fn release(self: Box<Self>) -> MigrateResult<()>;

    /// Give the lock up without awaiting, e.g. by tearing down the owning
    /// session. Used when a guard is dropped before it was released.
    fn abandon(self: Box<Self>);
}

/// Blocking acquisition on top of a [`LockBackend`]
#[derive(Clone)]
pub struct LockCoordinator {
    backend: Arc<dyn LockBackend>,
    retry_interval: Duration,
}

impl LockCoordinator {
    pub fn new(backend: Arc<dyn LockBackend>, retry_interval: Duration) -> Self {
        Self {
            backend,
            retry_interval,
        }
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Wait until the lock is ours.
    ///
    /// Contention is retried forever on the configured interval; there is no
    /// timeout. Callers that want to give up drop the returned future, which is
    /// safe at any point since the sleep between attempts is the only suspension
    /// that does not hold a lock.
    pub async fn acquire(&self, id: LockId) -> MigrateResult<LockGuard> {
        let mut attempts: u64 = 0;

        loop {
            attempts += 1;

            if let Some(handle) = self.backend.try_acquire(id).await? {
                info!("Acquired lock {} after {} attempt(s)", id, attempts);
                return Ok(LockGuard::new(handle));
            }

            if attempts == 1 {
                info!("Lock {} is held by another process, waiting", id);
            } else {
                debug!("Lock {} still held, attempt {}", id, attempts);
            }

            tokio::time::sleep(self.retry_interval).await;
        }
    }
}

/// Owned lock that is given back on every exit path.
///
/// Call [`LockGuard::release`] on normal and error returns. If the guard is
/// dropped instead (a panic, or the surrounding future being cancelled) the
/// handle is abandoned, which for session-scoped backends ends the session and
/// with it the lock.
pub struct LockGuard {
    handle: Option<Box<dyn LockHandle>>,
}

impl LockGuard {
    pub fn new(handle: Box<dyn LockHandle>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub fn id(&self) -> Option<LockId> {
        self.handle.as_ref().map(|handle| handle.id())
    }

    /// Release the lock
    pub async fn release(mut self) -> MigrateResult<()> {
        match self.handle.take() {
            Some(handle) => {
                let id = handle.id();
                handle.release().await?;
                debug!("Released lock {}", id);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            warn!(
                "Lock {} dropped without explicit release, abandoning it",
                handle.id()
            );
            handle.abandon();
        }
    }
}
