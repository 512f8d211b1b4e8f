//! Transport - sole point of contact with the backing store
//!
//! Owns the Redis connection and exposes exactly the command surface the
//! coordination layer consumes, as the [`StoreCommands`] capability trait.
//! Atomic mutations are compiled into [`ScriptHandle`]s at connect time and
//! executed server-side. No retry or backoff lives here; every failure
//! propagates to the caller.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamInfoGroupsReply, StreamMaxlen, StreamPendingCountReply,
    StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use tracing::debug;

use crate::error::Result;
use crate::lock::scripts;

/// One entry as read off the wire: store-assigned id plus raw field bytes
#[derive(Debug, Clone)]
pub struct RawEntry {
    /// Store-assigned, monotonically increasing id
    pub id: String,
    /// Field name -> raw bytes
    pub fields: HashMap<String, Vec<u8>>,
}

impl RawEntry {
    fn from_stream_id(sid: StreamId) -> Self {
        let fields = sid
            .map
            .iter()
            .filter_map(|(k, v)| {
                redis::from_redis_value::<Vec<u8>>(v)
                    .ok()
                    .map(|bytes| (k.clone(), bytes))
            })
            .collect();
        Self { id: sid.id, fields }
    }
}

/// One delivered-but-unacknowledged entry, as reported by the pending query
#[derive(Debug, Clone)]
pub struct PendingInfo {
    pub id: String,
    /// Consumer the entry was last delivered to
    pub consumer: String,
    /// Idle time since last delivery, in milliseconds
    pub idle_ms: u64,
    /// Delivery count, including the original delivery
    pub deliveries: u64,
}

/// Outcome of an owner-checked release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStatus {
    /// Deleted by the owner, or the key was already gone (idempotent no-op)
    Released,
    /// Current value belongs to someone else; the lock was left intact
    NotOwner,
}

/// A compiled server-side script, invokable with keys and args
#[derive(Clone)]
pub struct ScriptHandle {
    script: redis::Script,
}

impl ScriptHandle {
    /// Execute the script atomically on the store
    pub async fn invoke<T: redis::FromRedisValue>(
        &self,
        conn: &mut ConnectionManager,
        keys: &[&str],
        args: &[String],
    ) -> Result<T> {
        let mut invocation = self.script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }
        Ok(invocation.invoke_async(conn).await?)
    }
}

/// The explicit, narrow command surface consumed by the coordination layer.
///
/// Listed commands are the contract; nothing is forwarded dynamically. The
/// production implementation is [`Transport`]; tests substitute an in-memory
/// store with the same semantics.
#[async_trait]
pub trait StoreCommands: Send + Sync {
    // ------------------------------------------------------------------
    // Lock primitives (each call is one atomic server-side script)
    // ------------------------------------------------------------------

    /// Set `key` to `token` with a TTL iff absent. Returns false if held.
    async fn lock_acquire(&self, key: &str, token: &str, ttl_secs: u64) -> Result<bool>;

    /// Delete `key` iff its value equals `token`. Absent keys release cleanly.
    async fn lock_release(&self, key: &str, token: &str) -> Result<ReleaseStatus>;

    /// Extend TTLs for multiple keys. Performs no ownership check.
    async fn lock_renew(&self, keys: &[String], ttl_secs: &[u64]) -> Result<()>;

    /// Batched existence probe. Single round trip, not atomic across keys.
    async fn lock_exists(&self, keys: &[String]) -> Result<Vec<bool>>;

    /// Current owner token, if any. Informational read; may race.
    async fn lock_owner(&self, key: &str) -> Result<Option<String>>;

    // ------------------------------------------------------------------
    // Stream primitives
    // ------------------------------------------------------------------

    /// Append one entry; the store assigns and returns its id.
    async fn stream_append(&self, topic: &str, fields: &[(String, Vec<u8>)]) -> Result<String>;

    /// Blocking consumer-group read with "new entries only" cursor semantics.
    /// A timeout yields an empty batch, not an error.
    async fn stream_read_group(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<RawEntry>>;

    /// Batched acknowledgment. Acking an already-acked id is a safe no-op.
    async fn stream_ack(&self, topic: &str, group: &str, ids: &[String]) -> Result<u64>;

    /// Pending entries for the group, capped at `count`
    async fn stream_pending(
        &self,
        topic: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingInfo>>;

    /// Explicitly redeliver pending entries to `consumer`. The store enforces
    /// `min_idle_ms` again at claim time, so racing claimers cannot double-claim.
    async fn stream_claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<RawEntry>>;

    /// Names of the groups existing on `topic` (empty when the topic is absent)
    async fn group_names(&self, topic: &str) -> Result<Vec<String>>;

    /// Create a group with a "future entries only" cursor, creating the topic
    /// storage if absent. Succeeds if the group already exists.
    async fn group_create(&self, topic: &str, group: &str) -> Result<()>;

    /// Bound the retained length of `topic` to approximately `max_len`
    async fn stream_trim(&self, topic: &str, max_len: usize) -> Result<u64>;
}

/// Redis transport: one managed connection plus the compiled lock scripts
pub struct Transport {
    manager: ConnectionManager,
    acquire_script: ScriptHandle,
    release_script: ScriptHandle,
    renew_script: ScriptHandle,
    exists_script: ScriptHandle,
}

impl Transport {
    /// Connect to the store and compile the atomic script handles
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        debug!("Connected to store at {}", url);

        Ok(Self {
            manager,
            acquire_script: Self::register_script(scripts::ACQUIRE),
            release_script: Self::register_script(scripts::RELEASE),
            renew_script: Self::register_script(scripts::RENEW),
            exists_script: Self::register_script(scripts::EXISTS),
        })
    }

    /// Compile a script body into an invokable handle
    pub fn register_script(body: &str) -> ScriptHandle {
        ScriptHandle {
            script: redis::Script::new(body),
        }
    }

    /// Tear down the connection. Dropping the last clone closes the socket.
    pub fn close(self) {
        debug!("Closing store connection");
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

/// True when the error is the store's "no such key" reply to introspection
/// on a topic that does not exist yet. Anything else, including a key of the
/// wrong type, is a real error.
fn is_missing_stream(e: &redis::RedisError) -> bool {
    e.kind() == redis::ErrorKind::ResponseError
        && e.detail().map_or(false, |d| d.contains("no such key"))
}

#[async_trait]
impl StoreCommands for Transport {
    async fn lock_acquire(&self, key: &str, token: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn();
        let set: i64 = self
            .acquire_script
            .invoke(&mut conn, &[key], &[token.to_string(), ttl_secs.to_string()])
            .await?;
        Ok(set == 1)
    }

    async fn lock_release(&self, key: &str, token: &str) -> Result<ReleaseStatus> {
        let mut conn = self.conn();
        let status: String = self
            .release_script
            .invoke(&mut conn, &[key], &[token.to_string()])
            .await?;
        if status == scripts::RELEASE_OK {
            Ok(ReleaseStatus::Released)
        } else {
            Ok(ReleaseStatus::NotOwner)
        }
    }

    async fn lock_renew(&self, keys: &[String], ttl_secs: &[u64]) -> Result<()> {
        let mut conn = self.conn();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let args: Vec<String> = ttl_secs.iter().map(ToString::to_string).collect();
        let _renewed: i64 = self.renew_script.invoke(&mut conn, &key_refs, &args).await?;
        Ok(())
    }

    async fn lock_exists(&self, keys: &[String]) -> Result<Vec<bool>> {
        let mut conn = self.conn();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let found: Vec<i64> = self.exists_script.invoke(&mut conn, &key_refs, &[]).await?;
        Ok(found.into_iter().map(|f| f == 1).collect())
    }

    async fn lock_owner(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let owner: Option<String> = conn.get(key).await?;
        Ok(owner)
    }

    async fn stream_append(&self, topic: &str, fields: &[(String, Vec<u8>)]) -> Result<String> {
        let mut conn = self.conn();
        let id: String = conn.xadd(topic, "*", fields).await?;
        Ok(id)
    }

    async fn stream_read_group(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<RawEntry>> {
        let mut conn = self.conn();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(usize::try_from(block_ms).unwrap_or(usize::MAX));

        // ">" = entries never delivered to any consumer in this group
        let reply: Option<StreamReadReply> =
            conn.xread_options(&[topic], &[">"], &options).await?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        Ok(reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(RawEntry::from_stream_id)
            .collect())
    }

    async fn stream_ack(&self, topic: &str, group: &str, ids: &[String]) -> Result<u64> {
        let mut conn = self.conn();
        let acked: u64 = conn.xack(topic, group, ids).await?;
        Ok(acked)
    }

    async fn stream_pending(
        &self,
        topic: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingInfo>> {
        let mut conn = self.conn();
        let reply: StreamPendingCountReply =
            conn.xpending_count(topic, group, "-", "+", count).await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingInfo {
                id: p.id,
                consumer: p.consumer,
                idle_ms: p.last_delivered_ms as u64,
                deliveries: p.times_delivered as u64,
            })
            .collect())
    }

    async fn stream_claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<RawEntry>> {
        let mut conn = self.conn();
        let reply: StreamClaimReply =
            conn.xclaim(topic, group, consumer, min_idle_ms, ids).await?;

        Ok(reply
            .ids
            .into_iter()
            .map(RawEntry::from_stream_id)
            .collect())
    }

    async fn group_names(&self, topic: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        match conn.xinfo_groups::<_, StreamInfoGroupsReply>(topic).await {
            Ok(reply) => Ok(reply.groups.into_iter().map(|g| g.name).collect()),
            // Introspection on a topic that does not exist yet
            Err(e) if is_missing_stream(&e) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn group_create(&self, topic: &str, group: &str) -> Result<()> {
        let mut conn = self.conn();
        // "$" = deliver only entries appended after group creation; MKSTREAM
        // creates the backing topic storage when absent
        match conn
            .xgroup_create_mkstream::<_, _, _, String>(topic, group, "$")
            .await
        {
            Ok(_) => Ok(()),
            // Lost a creation race; the group exists, which is what we wanted
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stream_trim(&self, topic: &str, max_len: usize) -> Result<u64> {
        let mut conn = self.conn();
        let removed: u64 = conn.xtrim(topic, StreamMaxlen::Approx(max_len)).await?;
        Ok(removed)
    }
}
