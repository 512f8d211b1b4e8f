//! Stream consumer: poll, dispatch, acknowledge, recover
//!
//! One consumer is bound to a (topic, group, consumer-name) triple and runs
//! a poll -> dispatch -> ack loop. Delivery is at-least-once per group:
//! handlers must tolerate duplicates. Pending-entry recovery is a separate,
//! best-effort path that must never stop the main loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::retry;
use crate::stream::headers::Headers;
use crate::stream::StreamEntry;
use crate::transport::{RawEntry, StoreCommands};

/// Caller-supplied per-entry handler.
///
/// Handler errors propagate to the consumer's caller on the normal processing
/// path, leaving unacked entries pending for redelivery.
#[async_trait]
pub trait EntryHandler: Send + Sync {
    async fn handle(&self, headers: Option<Headers>, body: Bytes) -> anyhow::Result<()>;
}

/// Consumer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Polling,
    Processing,
    Closed,
}

/// One competing consumer within a group
pub struct StreamConsumer {
    store: Arc<dyn StoreCommands>,
    topic: String,
    group: String,
    name: String,
    config: StreamConfig,
    handler: Arc<dyn EntryHandler>,
    state: RwLock<ConsumerState>,
    cancel: CancellationToken,
}

impl StreamConsumer {
    pub fn new(
        store: Arc<dyn StoreCommands>,
        topic: impl Into<String>,
        config: StreamConfig,
        handler: Arc<dyn EntryHandler>,
    ) -> Self {
        let name = config.resolved_consumer_name();
        Self {
            store,
            topic: topic.into(),
            group: config.group.clone(),
            name,
            config,
            handler,
            state: RwLock::new(ConsumerState::Idle),
            cancel: CancellationToken::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.read()
    }

    /// Read the next batch of never-delivered entries for this group.
    ///
    /// Blocks up to the configured read timeout; a timeout yields an empty
    /// batch so the caller's loop periodically regains control even with no
    /// traffic. Entries that fail to decode are acked and dropped rather
    /// than failing the batch: their valid batch-mates were already
    /// delivered, and an unprocessable entry leaves the pending set no
    /// other way.
    pub async fn poll_batch(&self) -> Result<Vec<StreamEntry>> {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }
        *self.state.write() = ConsumerState::Polling;

        let raw = self
            .store
            .stream_read_group(
                &self.topic,
                &self.group,
                &self.name,
                self.config.batch_size,
                self.config.read_block_ms,
            )
            .await;

        *self.state.write() = ConsumerState::Idle;
        let (entries, undecodable) = self.split_decoded(raw?);
        self.ack_discarded(&undecodable).await;
        Ok(entries)
    }

    /// Dispatch a batch to the handler, then acknowledge everything that was
    /// handled in one batched call.
    ///
    /// The ack is retried a bounded number of times with a fixed delay;
    /// re-acking an already-acked id is a safe no-op, which is what makes the
    /// retry safe. A handler error still acks the entries handled before it,
    /// then propagates.
    pub async fn process_batch(&self, batch: Vec<StreamEntry>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        *self.state.write() = ConsumerState::Processing;

        let mut handled: Vec<String> = Vec::with_capacity(batch.len());
        let mut handler_failure: Option<Error> = None;

        for entry in batch {
            match self.handler.handle(entry.headers, entry.body).await {
                Ok(()) => handled.push(entry.id),
                Err(e) => {
                    handler_failure = Some(Error::Handler(e));
                    break;
                }
            }
        }

        let mut ack_failure: Option<Error> = None;
        if !handled.is_empty() {
            match self.ack_with_retry(&handled).await {
                Ok(_) => debug!("Acked {} entries on {}", handled.len(), self.topic),
                Err(e) => ack_failure = Some(e),
            }
        }

        // The state machine must read Idle on every exit from this method,
        // including the failure paths
        *self.state.write() = ConsumerState::Idle;
        if let Some(e) = ack_failure {
            return Err(e);
        }
        match handler_failure {
            Some(e) => Err(e),
            None => Ok(handled.len()),
        }
    }

    /// Query entries left pending beyond the idle threshold and redeliver
    /// them to this consumer, through the normal processing path.
    ///
    /// Best-effort: every error here is logged and swallowed so recovery can
    /// never halt new-entry processing. Returns the number of entries
    /// recovered and processed.
    pub async fn recover_pending(&self) -> usize {
        let pending = match self
            .store
            .stream_pending(&self.topic, &self.group, self.config.batch_size)
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Pending query failed on {}: {}", self.topic, e);
                return 0;
            }
        };

        let stale: Vec<String> = pending
            .into_iter()
            .filter(|p| p.idle_ms >= self.config.pending_idle_ms)
            .map(|p| p.id)
            .collect();
        if stale.is_empty() {
            return 0;
        }

        let claimed = match self
            .store
            .stream_claim(
                &self.topic,
                &self.group,
                &self.name,
                self.config.pending_idle_ms,
                &stale,
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!("Claim failed on {}: {}", self.topic, e);
                return 0;
            }
        };

        let (entries, undecodable) = self.split_decoded(claimed);
        self.ack_discarded(&undecodable).await;
        if entries.is_empty() {
            return 0;
        }

        info!(
            "Recovering {} pending entries on {} as {}",
            entries.len(),
            self.topic,
            self.name
        );
        match self.process_batch(entries).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Recovery processing failed on {}: {}", self.topic, e);
                0
            }
        }
    }

    /// Bound the topic's retained length to the configured maximum.
    /// Approximate trimming; bounded memory is the goal, not exact counts.
    pub async fn trim(&self) -> Result<u64> {
        let removed = self
            .store
            .stream_trim(&self.topic, self.config.trim_max_len)
            .await?;
        if removed > 0 {
            debug!("Trimmed {} entries from {}", removed, self.topic);
        }
        Ok(removed)
    }

    /// Poll -> process until closed.
    ///
    /// Cancellation is checked between store calls only: an in-flight ack is
    /// allowed to complete so shutdown does not manufacture redeliveries.
    /// Handler and transport errors end the loop and surface to the caller.
    pub async fn run(&self) -> Result<()> {
        info!(
            "Consumer {} starting on {} (group {})",
            self.name, self.topic, self.group
        );
        let outcome = self.poll_loop().await;
        // Closed on every exit, cooperative or error
        *self.state.write() = ConsumerState::Closed;
        info!("Consumer {} on {} closed", self.name, self.topic);
        outcome
    }

    async fn poll_loop(&self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let batch = tokio::select! {
                // Entries handed to a read abandoned here surface again
                // through pending recovery
                () = self.cancel.cancelled() => return Ok(()),
                batch = self.poll_batch() => batch?,
            };
            self.process_batch(batch).await?;
        }
    }

    /// Stop issuing new polls. In-flight processing and acks drain before
    /// the run loop exits.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Split raw wire entries into decoded entries and the ids of entries
    /// that could not be decoded
    fn split_decoded(&self, raw: Vec<RawEntry>) -> (Vec<StreamEntry>, Vec<String>) {
        let mut entries = Vec::with_capacity(raw.len());
        let mut undecodable = Vec::new();
        for raw_entry in raw {
            let id = raw_entry.id.clone();
            match StreamEntry::decode(raw_entry) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(
                        "Discarding undecodable entry {} on {}: {}",
                        id, self.topic, e
                    );
                    undecodable.push(id);
                }
            }
        }
        (entries, undecodable)
    }

    /// Ack entries that were discarded without processing. Best-effort: a
    /// failed ack just leaves them pending for the next pass.
    async fn ack_discarded(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.ack_with_retry(ids).await {
            warn!(
                "Failed to ack {} discarded entries on {}: {}",
                ids.len(),
                self.topic,
                e
            );
        }
    }

    async fn ack_with_retry(&self, ids: &[String]) -> Result<u64> {
        let attempts = self.config.ack_retry_attempts;
        let delay = Duration::from_millis(self.config.ack_retry_delay_ms);
        retry::with_fixed_delay(attempts, delay, || {
            self.store.stream_ack(&self.topic, &self.group, ids)
        })
        .await
        .map_err(|e| Error::AckFailed {
            topic: self.topic.clone(),
            attempts: attempts.max(1),
            source: Box::new(e),
        })
    }
}
