//! In-process lock backend
//!
//! Behaves like a database advisory lock shared by every runner built on the
//! same [`MemoryLockBackend`]: at most one holder per id, contention answered
//! with "not now" rather than blocking.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use strata_migrate::{LockBackend, LockHandle, LockId, MigrateResult, MigrationError};

#[derive(Default)]
struct LockState {
    held: DashSet<LockId>,
    attempts: AtomicUsize,
    acquisitions: AtomicUsize,
    releases: AtomicUsize,
    abandons: AtomicUsize,
    unavailable: AtomicBool,
    failing_release: AtomicBool,
}

/// Lock backend kept in memory. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryLockBackend {
    state: Arc<LockState>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, id: LockId) -> bool {
        self.state.held.contains(&id)
    }

    /// Take the lock from outside any runner, e.g. to simulate another process
    pub fn hold(&self, id: LockId) -> bool {
        self.state.held.insert(id)
    }

    /// Give up a lock taken with [`MemoryLockBackend::hold`]
    pub fn free(&self, id: LockId) -> bool {
        self.state.held.remove(&id).is_some()
    }

    /// Make every acquisition attempt fail as if the backend were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make releases report an error. The lock is still given up.
    pub fn set_failing_release(&self, failing: bool) {
        self.state.failing_release.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub fn acquisitions(&self) -> usize {
        self.state.acquisitions.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.state.releases.load(Ordering::SeqCst)
    }

    pub fn abandons(&self) -> usize {
        self.state.abandons.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_acquire(&self, id: LockId) -> MigrateResult<Option<Box<dyn LockHandle>>> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);

        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(MigrationError::LockBackend(
                "lock backend is unavailable".to_string(),
            ));
        }

        if !self.state.held.insert(id) {
            return Ok(None);
        }

        self.state.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Box::new(MemoryLockHandle {
            id,
            state: self.state.clone(),
        })))
    }
}

struct MemoryLockHandle {
    id: LockId,
    state: Arc<LockState>,
}

#[async_trait]
impl LockHandle for MemoryLockHandle {
    fn id(&self) -> LockId {
        self.id
    }

    async fn release(self: Box<Self>) -> MigrateResult<()> {
        self.state.held.remove(&self.id);
        self.state.releases.fetch_add(1, Ordering::SeqCst);

        if self.state.failing_release.load(Ordering::SeqCst) {
            return Err(MigrationError::LockBackend(format!(
                "failed to confirm release of lock {}",
                self.id
            )));
        }
        Ok(())
    }

    fn abandon(self: Box<Self>) {
        self.state.held.remove(&self.id);
        self.state.abandons.fetch_add(1, Ordering::SeqCst);
    }
}
