//! Shared validation cache backed by KeyDB.
//!
//! Verdicts are keyed by a SHA-256 fingerprint of the credential so that raw
//! bearer strings are never stored or logged.

use std::time::Duration;

use anyhow::{Context, Result};
use fred::interfaces::{ClientLike, KeysInterface};
use sha2::{Digest, Sha256};
use tracing::trace;

use super::verdict::CachedVerdict;

const VERDICT_PREFIX: &str = "authrelay:verdict:";

/// Stable, collision-resistant fingerprint of a credential.
pub fn fingerprint(credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    hex::encode(hasher.finalize())
}

/// Leading slice of a fingerprint, for log lines.
pub fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

pub fn verdict_key(fingerprint: &str) -> String {
    format!("{VERDICT_PREFIX}{fingerprint}")
}

/// Atomic verdict storage.  Every write is a single SET with expiry at the
/// store, so concurrent relays never race on a read-modify-write.
#[async_trait::async_trait]
pub trait VerdictStore: Send + Sync {
    async fn get(&self, fingerprint: &str) -> Result<Option<CachedVerdict>>;

    async fn put(&self, fingerprint: &str, verdict: &CachedVerdict, ttl: Duration) -> Result<()>;

    /// Returns `true` if an entry was removed.
    async fn remove(&self, fingerprint: &str) -> Result<bool>;

    /// Round trip to the backing store, for health reporting.
    async fn ping(&self) -> Result<()>;
}

pub struct KeyDbVerdictStore {
    pool: fred::clients::Pool,
}

impl KeyDbVerdictStore {
    pub fn new(pool: fred::clients::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl VerdictStore for KeyDbVerdictStore {
    async fn get(&self, fingerprint: &str) -> Result<Option<CachedVerdict>> {
        let key = verdict_key(fingerprint);
        let raw: Option<String> = self.pool.get(&key).await.context("KeyDB GET failed")?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        trace!(fp = short(fingerprint), "verdict cache hit");
        let verdict = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt verdict entry at {key}"))?;
        Ok(Some(verdict))
    }

    async fn put(&self, fingerprint: &str, verdict: &CachedVerdict, ttl: Duration) -> Result<()> {
        // EX takes whole seconds; round up so a sub-second TTL is not dropped.
        let ttl_secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        if ttl_secs == 0 {
            return Ok(());
        }
        let value = serde_json::to_string(verdict).context("serialize verdict")?;
        let _: () = self
            .pool
            .set(
                verdict_key(fingerprint),
                value,
                Some(fred::types::Expiration::EX(ttl_secs as i64)),
                None,
                false,
            )
            .await
            .context("KeyDB SET failed")?;
        trace!(fp = short(fingerprint), ttl_secs, "verdict cached");
        Ok(())
    }

    async fn remove(&self, fingerprint: &str) -> Result<bool> {
        let removed: i64 = self
            .pool
            .del(verdict_key(fingerprint))
            .await
            .context("KeyDB DEL failed")?;
        if removed > 0 {
            trace!(fp = short(fingerprint), "verdict invalidated");
        }
        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<()> {
        let _: String = self.pool.ping(None).await.context("KeyDB PING failed")?;
        Ok(())
    }
}
