//! Lock collaborator: short-lived distributed locks.
//!
//! Only the handshake timeout sweep takes one. A lease that is never
//! released expires after its TTL so a crashed holder cannot wedge the fleet.

use crate::errors::Result;
use crate::utils::generate_id;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A held lock.
#[async_trait]
pub trait Lease: Send + Sync {
    /// The locked resource.
    fn resource(&self) -> &str;

    /// Releases the lock if it is still held by this lease.
    async fn unlock(self: Box<Self>) -> Result<()>;
}

/// Acquires locks by resource name.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Tries once to lock `resource` for `ttl`. Returns `None` when it is held elsewhere.
    async fn try_lock(&self, resource: &str, ttl: Duration) -> Result<Option<Box<dyn Lease>>>;
}

#[derive(Debug)]
struct Holder {
    token: Uuid,
    expires_at: Instant,
}

type LockTable = Arc<Mutex<HashMap<String, Holder>>>;

/// In-process [`LockProvider`] with TTL expiry and token-checked release.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockProvider {
    holders: LockTable,
}

impl InMemoryLockProvider {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `resource` is currently held.
    #[must_use]
    pub fn is_locked(&self, resource: &str) -> bool {
        self.holders
            .lock()
            .get(resource)
            .is_some_and(|holder| holder.expires_at > Instant::now())
    }
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn try_lock(&self, resource: &str, ttl: Duration) -> Result<Option<Box<dyn Lease>>> {
        let now = Instant::now();
        let mut holders = self.holders.lock();
        if holders
            .get(resource)
            .is_some_and(|holder| holder.expires_at > now)
        {
            return Ok(None);
        }

        let token = generate_id();
        holders.insert(
            resource.to_string(),
            Holder {
                token,
                expires_at: now + ttl,
            },
        );
        Ok(Some(Box::new(InMemoryLease {
            resource: resource.to_string(),
            token,
            holders: Arc::clone(&self.holders),
        })))
    }
}

struct InMemoryLease {
    resource: String,
    token: Uuid,
    holders: LockTable,
}

#[async_trait]
impl Lease for InMemoryLease {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn unlock(self: Box<Self>) -> Result<()> {
        let mut holders = self.holders.lock();
        if holders
            .get(&self.resource)
            .is_some_and(|holder| holder.token == self.token)
        {
            holders.remove(&self.resource);
        }
        Ok(())
    }
}
