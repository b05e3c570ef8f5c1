//! Named, TTL-bounded distributed leases.
//!
//! A lease is acquired with attempt-and-skip semantics: callers either get a
//! [`LeaseGuard`] or learn that someone else holds the name. Guards release on
//! [`LeaseGuard::release`] or, best effort, when dropped; the TTL covers
//! crashed holders.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

pub use memory::InMemoryLeaseService;
#[cfg(feature = "redis")]
pub use self::redis::RedisLeaseService;

/// Proof of holding a lease. `token` is unique per acquisition so a holder
/// can never release a lease re-acquired by someone else after expiry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeaseToken {
    pub name: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl LeaseToken {
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            name: name.into(),
            token: Uuid::now_v7().to_string(),
            expires_at: Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

#[async_trait]
pub trait LeaseService: Send + Sync {
    /// Try once to take `name` for `ttl`. `Ok(None)` means it is held elsewhere.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LeaseToken>>;

    /// Release if still held by `token`. Returns whether anything was released.
    async fn release(&self, token: &LeaseToken) -> Result<bool>;
}

/// Scoped holder of a lease.
pub struct LeaseGuard {
    service: Arc<dyn LeaseService>,
    token: LeaseToken,
    released: bool,
}

impl fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("name", &self.token.name)
            .field("expires_at", &self.token.expires_at)
            .field("released", &self.released)
            .finish()
    }
}

impl LeaseGuard {
    /// Acquire `name` through `service`, wrapping the token in a guard.
    pub async fn try_acquire(
        service: &Arc<dyn LeaseService>,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<LeaseGuard>> {
        Ok(service
            .try_acquire(name, ttl)
            .await?
            .map(|token| LeaseGuard {
                service: Arc::clone(service),
                token,
                released: false,
            }))
    }

    pub fn name(&self) -> &str {
        &self.token.name
    }

    pub fn token(&self) -> &LeaseToken {
        &self.token
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let released = self.service.release(&self.token).await?;
        if !released {
            debug!(target: "lease", name = %self.token.name, "lease already expired or taken over");
        }
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // No runtime means we are tearing down; the TTL cleans up.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let service = Arc::clone(&self.service);
        let token = self.token.clone();
        handle.spawn(async move {
            if let Err(err) = service.release(&token).await {
                warn!(target: "lease", name = %token.name, "release on drop failed: {err}");
            }
        });
    }
}
