//! Stream listener: bootstrap, ownership, maintenance
//!
//! Owns one producer and one consumer per configured topic, ensures each
//! (topic, group) exists before anything polls it, and runs the periodic
//! maintenance tick (trim always, pending recovery only as an explicit
//! opt-in).

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::stream::consumer::{EntryHandler, StreamConsumer};
use crate::stream::producer::StreamProducer;
use crate::transport::StoreCommands;

/// Listener over a set of topics for one consumer group
pub struct StreamListener {
    store: Arc<dyn StoreCommands>,
    config: StreamConfig,
    handler: Arc<dyn EntryHandler>,
    producers: HashMap<String, StreamProducer>,
    consumers: Vec<Arc<StreamConsumer>>,
    tasks: Vec<JoinHandle<Result<()>>>,
    initialized: bool,
}

impl StreamListener {
    pub fn new(
        store: Arc<dyn StoreCommands>,
        config: StreamConfig,
        handler: Arc<dyn EntryHandler>,
    ) -> Self {
        Self {
            store,
            config,
            handler,
            producers: HashMap::new(),
            consumers: Vec::new(),
            tasks: Vec::new(),
            initialized: false,
        }
    }

    /// Idempotent bootstrap: ensure every (topic, group) exists, then build
    /// and start one producer/consumer pair per topic. Calling init twice is
    /// a no-op.
    pub async fn init(&mut self) -> Result<()> {
        if self.initialized {
            debug!("Listener already initialized");
            return Ok(());
        }
        info!(
            "Initializing listener for {} topics (group {})",
            self.config.topics.len(),
            self.config.group
        );

        for topic in self.config.topics.clone() {
            self.ensure_group(&topic).await?;

            self.producers.insert(
                topic.clone(),
                StreamProducer::new(self.store.clone(), topic.clone()),
            );

            let consumer = Arc::new(StreamConsumer::new(
                self.store.clone(),
                topic,
                self.config.clone(),
                self.handler.clone(),
            ));
            let task = tokio::spawn({
                let consumer = consumer.clone();
                async move { consumer.run().await }
            });
            self.consumers.push(consumer);
            self.tasks.push(task);
        }

        self.initialized = true;
        Ok(())
    }

    /// Producer for `topic`, if the listener owns that topic
    pub fn producer(&self, topic: &str) -> Option<&StreamProducer> {
        self.producers.get(topic)
    }

    /// Periodic maintenance across all owned consumers. Trim failures are
    /// logged and skipped so one sick topic cannot starve the rest.
    pub async fn tick(&self) {
        for consumer in &self.consumers {
            if let Err(e) = consumer.trim().await {
                warn!("Trim failed on {}: {}", consumer.topic(), e);
            }
            if self.config.recover_pending {
                let recovered = consumer.recover_pending().await;
                if recovered > 0 {
                    debug!("Recovered {} entries on {}", recovered, consumer.topic());
                }
            }
        }
    }

    /// Stop all consumers and wait for their in-flight work to drain.
    /// The first consumer error, if any, is returned after all have stopped.
    pub async fn close(&mut self) -> Result<()> {
        info!("Closing listener (group {})", self.config.group);
        for consumer in &self.consumers {
            consumer.close();
        }

        let mut first_error: Option<Error> = None;
        for outcome in join_all(self.tasks.drain(..)).await {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Consumer ended with error: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    warn!("Consumer task panicked: {}", e);
                    first_error.get_or_insert(Error::Internal(format!("consumer task: {e}")));
                }
            }
        }

        self.consumers.clear();
        self.producers.clear();
        self.initialized = false;
        first_error.map_or(Ok(()), Err)
    }

    /// Create the (topic, group) pair iff it does not already exist, with a
    /// "future entries only" cursor on first creation.
    async fn ensure_group(&self, topic: &str) -> Result<()> {
        let existing = self.store.group_names(topic).await?;
        if existing.iter().any(|name| name == &self.config.group) {
            debug!("Group {} already exists on {}", self.config.group, topic);
            return Ok(());
        }
        info!("Creating group {} on {}", self.config.group, topic);
        self.store.group_create(topic, &self.config.group).await
    }
}
