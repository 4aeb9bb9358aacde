//! Per-domain write locks
//!
//! Writes to one routing domain's files are serialized; different domains
//! proceed in parallel. The registry map is a `DashMap`, so insert-if-absent
//! is atomic and two callers racing on a new domain get the same lock.

use crate::model::RoutingDomain;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lazily created lock per routing domain. Entries are never removed.
#[derive(Debug, Default)]
pub struct TenantLocks {
    locks: DashMap<RoutingDomain, Arc<Mutex<()>>>,
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `domain`, created on first use
    pub fn lock_for(&self, domain: &RoutingDomain) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(domain) {
            return Arc::clone(&lock);
        }
        Arc::clone(&self.locks.entry(domain.clone()).or_default())
    }

    /// Acquire the domain's lock; released when the guard drops
    pub async fn acquire(&self, domain: &RoutingDomain) -> OwnedMutexGuard<()> {
        self.lock_for(domain).lock_owned().await
    }

    /// Number of domains seen so far
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
