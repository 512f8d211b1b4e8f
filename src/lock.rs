//! Distributed mutual-exclusion locks
//!
//! A lock is a single store key holding an opaque owner token with a TTL.
//! At most one owner exists per key at any instant, enforced solely by the
//! atomicity of the acquire script. There is no renewal watchdog: callers
//! holding a lock across a long operation must renew before the TTL expires.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{ReleaseStatus, StoreCommands};

/// Server-side script bodies, registered through the transport at connect
/// time. Each runs atomically on the store.
pub(crate) mod scripts {
    /// Distinguished status string returned by the release script on success
    pub const RELEASE_OK: &str = "OK";
    /// Distinguished status string returned when the token does not match
    pub const RELEASE_NOT_OWNER: &str = "NOT_OWNER";

    /// KEYS[1] = lock key, ARGV[1] = owner token, ARGV[2] = ttl seconds.
    /// Returns 1 when the lock was taken, 0 when already held.
    pub const ACQUIRE: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    redis.call('SET', KEYS[1], ARGV[1])
    redis.call('EXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
";

    /// KEYS[1] = lock key, ARGV[1] = owner token.
    /// Absent keys release cleanly so release stays idempotent.
    pub const RELEASE: &str = r"
local current = redis.call('GET', KEYS[1])
if current == false then
    return 'OK'
end
if current == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 'OK'
end
return 'NOT_OWNER'
";

    /// KEYS[i] = lock key, ARGV[i] = ttl seconds for that key.
    /// No ownership verification; see LockService::renew.
    pub const RENEW: &str = r"
for i, key in ipairs(KEYS) do
    redis.call('EXPIRE', key, ARGV[i])
end
return #KEYS
";

    /// KEYS[i] = lock key. Returns 1/0 per key in one round trip.
    pub const EXISTS: &str = r"
local found = {}
for i, key in ipairs(KEYS) do
    found[i] = redis.call('EXISTS', key)
end
return found
";
}

/// Mutual-exclusion lock service over the store command surface
pub struct LockService {
    store: Arc<dyn StoreCommands>,
}

impl LockService {
    /// Create a lock service over an initialized transport
    pub fn new(store: Arc<dyn StoreCommands>) -> Self {
        Self { store }
    }

    /// Atomically acquire `key` for `token` with a TTL.
    ///
    /// Fails with [`Error::LockExists`] when the key is already held, by this
    /// token or any other. Never retried internally: a blind retry could take
    /// the lock the moment the legitimate owner expires.
    pub async fn acquire(&self, key: &str, token: &str, ttl_secs: u64) -> Result<()> {
        if self.store.lock_acquire(key, token, ttl_secs).await? {
            debug!("Acquired lock {} for {}", key, token);
            Ok(())
        } else {
            Err(Error::LockExists {
                key: key.to_string(),
            })
        }
    }

    /// Acquire `key` with a generated owner token, returning the token.
    /// The token must be presented again at release time.
    pub async fn acquire_owned(&self, key: &str, ttl_secs: u64) -> Result<String> {
        let token = Uuid::new_v4().to_string();
        self.acquire(key, &token, ttl_secs).await?;
        Ok(token)
    }

    /// Acquire several keys for one token, as a convenience loop.
    ///
    /// This is NOT all-or-nothing: each key is acquired by its own
    /// single-key-atomic script and the loop stops at the first conflict.
    /// On failure, keys earlier in the slice stay taken; callers wanting
    /// cleanup must release those themselves.
    pub async fn acquire_all(
        &self,
        keys: &[String],
        token: &str,
        ttl_secs: u64,
    ) -> Result<Vec<String>> {
        let mut acquired = Vec::with_capacity(keys.len());
        for key in keys {
            match self.acquire(key, token, ttl_secs).await {
                Ok(()) => acquired.push(key.clone()),
                Err(e) => {
                    debug!("Batch acquire stopped at {}: {}", key, e);
                    return Err(e);
                }
            }
        }
        Ok(acquired)
    }

    /// Atomically release `key` if `token` owns it.
    ///
    /// Releasing an absent key succeeds (idempotent no-op). A token mismatch
    /// fails with [`Error::NotLockOwner`] and leaves the lock intact.
    pub async fn release(&self, key: &str, token: &str) -> Result<()> {
        match self.store.lock_release(key, token).await? {
            ReleaseStatus::Released => {
                debug!("Released lock {}", key);
                Ok(())
            }
            ReleaseStatus::NotOwner => Err(Error::NotLockOwner {
                key: key.to_string(),
                token: token.to_string(),
            }),
        }
    }

    /// Extend the TTLs of several held locks in one atomic call.
    ///
    /// Trusted maintenance operation: no ownership check is performed, so a
    /// caller renewing keys it no longer holds will extend someone else's
    /// lock. Callers must still hold every lock they renew.
    pub async fn renew(&self, keys: &[String], ttl_secs: &[u64]) -> Result<()> {
        if keys.len() != ttl_secs.len() {
            return Err(Error::Internal(format!(
                "renew called with {} keys but {} ttls",
                keys.len(),
                ttl_secs.len()
            )));
        }
        self.store.lock_renew(keys, ttl_secs).await
    }

    /// Batched existence probe, for diagnostics only. One round trip, but
    /// not atomic across keys.
    pub async fn check_exists(&self, keys: &[String]) -> Result<Vec<bool>> {
        self.store.lock_exists(keys).await
    }

    /// Current owner token of `key`, if any. Informational read that may
    /// race with a concurrent acquire or release.
    pub async fn owner(&self, key: &str) -> Result<Option<String>> {
        self.store.lock_owner(key).await
    }
}
