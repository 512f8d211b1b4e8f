//! Shared test fixtures: an in-memory store implementing the same command
//! semantics as the Redis transport, plus a recording entry handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use corral::{EntryHandler, Error, Headers, PendingInfo, RawEntry, ReleaseStatus, StoreCommands};

type Result<T> = std::result::Result<T, Error>;

#[derive(Default)]
struct LockVal {
    token: String,
    ttl_secs: u64,
}

struct PendingRec {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Default)]
struct GroupState {
    /// Index of the next never-delivered entry
    cursor: usize,
    pending: HashMap<String, PendingRec>,
}

#[derive(Default)]
struct TopicState {
    entries: Vec<(String, Vec<(String, Vec<u8>)>)>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct Inner {
    locks: HashMap<String, LockVal>,
    topics: HashMap<String, TopicState>,
}

/// In-memory stand-in for the Redis transport. Every method holds one lock
/// for its whole body, mirroring the per-script atomicity of the real store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    ack_failures_left: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` ack calls fail, to exercise the bounded retry
    pub fn inject_ack_failures(&self, n: u32) {
        self.ack_failures_left.store(n, Ordering::SeqCst);
    }

    pub fn topic_len(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map_or(0, |t| t.entries.len())
    }

    pub fn pending_len(&self, topic: &str, group: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    pub fn lock_ttl(&self, key: &str) -> Option<u64> {
        self.inner.lock().locks.get(key).map(|l| l.ttl_secs)
    }

    fn take_batch(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<RawEntry>> {
        let mut inner = self.inner.lock();
        let state = inner
            .topics
            .get_mut(topic)
            .ok_or_else(|| Error::Internal(format!("no such topic: {topic}")))?;
        let entries = state.entries.clone();
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| Error::Internal(format!("no such group: {group}")))?;

        let mut batch = Vec::new();
        while group_state.cursor < entries.len() && batch.len() < count {
            let (id, fields) = &entries[group_state.cursor];
            group_state.cursor += 1;
            group_state.pending.insert(
                id.clone(),
                PendingRec {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    deliveries: 1,
                },
            );
            batch.push(RawEntry {
                id: id.clone(),
                fields: fields.iter().cloned().collect(),
            });
        }
        Ok(batch)
    }
}

#[async_trait]
impl StoreCommands for MemoryStore {
    async fn lock_acquire(&self, key: &str, token: &str, ttl_secs: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.locks.contains_key(key) {
            return Ok(false);
        }
        inner.locks.insert(
            key.to_string(),
            LockVal {
                token: token.to_string(),
                ttl_secs,
            },
        );
        Ok(true)
    }

    async fn lock_release(&self, key: &str, token: &str) -> Result<ReleaseStatus> {
        let mut inner = self.inner.lock();
        match inner.locks.get(key) {
            None => Ok(ReleaseStatus::Released),
            Some(held) if held.token == token => {
                inner.locks.remove(key);
                Ok(ReleaseStatus::Released)
            }
            Some(_) => Ok(ReleaseStatus::NotOwner),
        }
    }

    async fn lock_renew(&self, keys: &[String], ttl_secs: &[u64]) -> Result<()> {
        let mut inner = self.inner.lock();
        for (key, ttl) in keys.iter().zip(ttl_secs) {
            if let Some(held) = inner.locks.get_mut(key) {
                held.ttl_secs = *ttl;
            }
        }
        Ok(())
    }

    async fn lock_exists(&self, keys: &[String]) -> Result<Vec<bool>> {
        let inner = self.inner.lock();
        Ok(keys.iter().map(|k| inner.locks.contains_key(k)).collect())
    }

    async fn lock_owner(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock();
        Ok(inner.locks.get(key).map(|l| l.token.clone()))
    }

    async fn stream_append(&self, topic: &str, fields: &[(String, Vec<u8>)]) -> Result<String> {
        let mut inner = self.inner.lock();
        let state = inner.topics.entry(topic.to_string()).or_default();
        state.next_seq += 1;
        let id = format!("{}-0", state.next_seq);
        state.entries.push((id.clone(), fields.to_vec()));
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
        // Model the blocking read: poll until entries arrive or the (capped)
        // block timeout elapses, then return an empty batch.
        let deadline = Instant::now() + std::time::Duration::from_millis(block_ms.min(200));
        loop {
            let batch = self.take_batch(topic, group, consumer, count)?;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    async fn stream_ack(&self, topic: &str, group: &str, ids: &[String]) -> Result<u64> {
        if self.ack_failures_left.load(Ordering::SeqCst) > 0 {
            self.ack_failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Internal("injected ack failure".into()));
        }
        let mut inner = self.inner.lock();
        let group_state = inner
            .topics
            .get_mut(topic)
            .and_then(|t| t.groups.get_mut(group))
            .ok_or_else(|| Error::Internal(format!("no such group: {group}")))?;
        let mut acked = 0;
        for id in ids {
            if group_state.pending.remove(id).is_some() {
                acked += 1;
            }
        }
        Ok(acked)
    }

    async fn stream_pending(
        &self,
        topic: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingInfo>> {
        let inner = self.inner.lock();
        let group_state = inner
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .ok_or_else(|| Error::Internal(format!("no such group: {group}")))?;
        let mut pending: Vec<PendingInfo> = group_state
            .pending
            .iter()
            .map(|(id, rec)| PendingInfo {
                id: id.clone(),
                consumer: rec.consumer.clone(),
                idle_ms: rec.delivered_at.elapsed().as_millis() as u64,
                deliveries: rec.deliveries,
            })
            .collect();
        pending.sort_by(|a, b| a.id.cmp(&b.id));
        pending.truncate(count);
        Ok(pending)
    }

    async fn stream_claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<RawEntry>> {
        let mut inner = self.inner.lock();
        let state = inner
            .topics
            .get_mut(topic)
            .ok_or_else(|| Error::Internal(format!("no such topic: {topic}")))?;
        let entries = state.entries.clone();
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| Error::Internal(format!("no such group: {group}")))?;

        let mut claimed = Vec::new();
        for id in ids {
            let Some(rec) = group_state.pending.get_mut(id) else {
                continue;
            };
            // The store re-checks idle at claim time
            if (rec.delivered_at.elapsed().as_millis() as u64) < min_idle_ms {
                continue;
            }
            if let Some((_, fields)) = entries.iter().find(|(eid, _)| eid == id) {
                rec.consumer = consumer.to_string();
                rec.delivered_at = Instant::now();
                rec.deliveries += 1;
                claimed.push(RawEntry {
                    id: id.clone(),
                    fields: fields.iter().cloned().collect(),
                });
            } else {
                // Entry data trimmed away; drop the orphaned pending record
                group_state.pending.remove(id);
            }
        }
        Ok(claimed)
    }

    async fn group_names(&self, topic: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .topics
            .get(topic)
            .map(|t| t.groups.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn group_create(&self, topic: &str, group: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.topics.entry(topic.to_string()).or_default();
        let cursor = state.entries.len();
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                // "future entries only" on first creation
                cursor,
                pending: HashMap::new(),
            });
        Ok(())
    }

    async fn stream_trim(&self, topic: &str, max_len: usize) -> Result<u64> {
        let mut inner = self.inner.lock();
        let Some(state) = inner.topics.get_mut(topic) else {
            return Ok(0);
        };
        if state.entries.len() <= max_len {
            return Ok(0);
        }
        let removed = state.entries.len() - max_len;
        state.entries.drain(..removed);
        // Delivery cursors are positional here (the real store's are id-based)
        for group in state.groups.values_mut() {
            group.cursor = group.cursor.saturating_sub(removed);
        }
        Ok(removed as u64)
    }
}

/// Handler that records every delivery and can be told to fail on a marker
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<(Option<Headers>, Bytes)>>,
    pub fail_on: Option<Bytes>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_on(marker: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            fail_on: Some(Bytes::copy_from_slice(marker)),
        })
    }

    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.seen.lock().iter().map(|(_, b)| b.to_vec()).collect()
    }
}

#[async_trait]
impl EntryHandler for RecordingHandler {
    async fn handle(&self, headers: Option<Headers>, body: Bytes) -> anyhow::Result<()> {
        if let Some(marker) = &self.fail_on {
            if body == *marker {
                anyhow::bail!("handler rejected marked entry");
            }
        }
        self.seen.lock().push((headers, body));
        Ok(())
    }
}
