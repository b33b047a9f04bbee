use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Tokens invalidated by logout, remembered until they would have expired
/// anyway. Shared through Redis when configured so every replica sees them.
#[derive(Clone)]
pub enum RevocationList {
    Redis(redis::aio::ConnectionManager),
    Memory(Arc<Mutex<HashMap<String, usize>>>),
}

fn fingerprint(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn now() -> usize {
    chrono::Utc::now().timestamp().max(0) as usize
}

impl RevocationList {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::default())
    }

    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_tokio_connection_manager().await?;
        Ok(Self::Redis(manager))
    }

    pub async fn is_revoked(&self, token: &str) -> bool {
        let key = fingerprint(token);
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                match redis::cmd("EXISTS")
                    .arg(format!("revoked:{key}"))
                    .query_async::<_, bool>(&mut conn)
                    .await
                {
                    Ok(revoked) => revoked,
                    Err(err) => {
                        tracing::warn!(error = %err, "revocation lookup failed");
                        false
                    }
                }
            }
            Self::Memory(entries) => {
                let mut entries = entries.lock();
                let now = now();
                entries.retain(|_, expires_at| *expires_at > now);
                entries.contains_key(&key)
            }
        }
    }

    /// Remembers `token` as revoked until `expires_at` (seconds since epoch).
    pub async fn revoke(&self, token: &str, expires_at: usize) -> anyhow::Result<()> {
        let remaining = expires_at.saturating_sub(now());
        if remaining == 0 {
            return Ok(());
        }
        let key = fingerprint(token);
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                redis::cmd("SET")
                    .arg(format!("revoked:{key}"))
                    .arg(1)
                    .arg("EX")
                    .arg(remaining)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
            }
            Self::Memory(entries) => {
                entries.lock().insert(key, expires_at);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn revoked_tokens_are_remembered_until_expiry() {
        let list = RevocationList::in_memory();
        list.revoke("live", now() + 60).await.unwrap();
        list.revoke("stale", now().saturating_sub(1)).await.unwrap();

        assert!(list.is_revoked("live").await);
        assert!(!list.is_revoked("stale").await);
        assert!(!list.is_revoked("other").await);
    }
}
