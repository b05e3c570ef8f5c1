use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    error::Result,
    lease::{LeaseService, LeaseToken},
};

/// Single-process lease table. Suitable for tests and one-replica setups.
#[derive(Debug, Default)]
pub struct InMemoryLeaseService {
    leases: RwLock<HashMap<String, LeaseToken>>,
}

impl InMemoryLeaseService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn holder(&self, name: &str) -> Option<LeaseToken> {
        let leases = self.leases.read().await;
        leases
            .get(name)
            .filter(|lease| lease.expires_at > Utc::now())
            .cloned()
    }
}

#[async_trait]
impl LeaseService for InMemoryLeaseService {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LeaseToken>> {
        let mut leases = self.leases.write().await;
        if let Some(existing) = leases.get(name)
            && existing.expires_at > Utc::now()
        {
            return Ok(None);
        }

        let token = LeaseToken::new(name, ttl);
        leases.insert(name.to_string(), token.clone());
        Ok(Some(token))
    }

    async fn release(&self, token: &LeaseToken) -> Result<bool> {
        let mut leases = self.leases.write().await;
        match leases.get(&token.name) {
            Some(current) if current.token == token.token => {
                leases.remove(&token.name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
