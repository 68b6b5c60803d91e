//! Per-repository run guard.
//!
//! [`RepoLocks`] is an explicitly owned registry of repositories that have a
//! synchronization in flight. Acquiring a lease never blocks: a second
//! caller for the same repository is rejected immediately.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::errors::SyncError;

/// Registry of repositories currently being synchronized.
#[derive(Debug, Clone, Default)]
pub struct RepoLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `repository`, failing with
    /// [`SyncError::AlreadyRunning`] if another run holds it.
    pub fn try_acquire(&self, repository: &str) -> Result<SyncLease, SyncError> {
        let mut held = self.held();
        if !held.insert(repository.to_string()) {
            debug!(repository, "sync lease already held");
            return Err(SyncError::AlreadyRunning {
                repository: repository.to_string(),
            });
        }
        debug!(repository, "sync lease acquired");
        Ok(SyncLease {
            held: Arc::clone(&self.held),
            repository: repository.to_string(),
        })
    }

    pub fn is_running(&self, repository: &str) -> bool {
        self.held().contains(repository)
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("repository lock registry was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// RAII lease on one repository; released on drop.
#[derive(Debug)]
pub struct SyncLease {
    held: Arc<Mutex<HashSet<String>>>,
    repository: String,
}

impl SyncLease {
    pub fn repository(&self) -> &str {
        &self.repository
    }
}

impl Drop for SyncLease {
    fn drop(&mut self) {
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.repository);
        debug!(repository = %self.repository, "sync lease released");
    }
}
