//! Configuration for the coordination layer

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Streaming configuration
    #[serde(default)]
    pub stream: StreamConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            stream: StreamConfig::default(),
        }
    }
}

impl CoordinationConfig {
    /// Load configuration from a TOML or JSON file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

        let config: CoordinationConfig =
            if path.as_ref().extension().map_or(false, |ext| ext == "toml") {
                toml::from_str(&content)
                    .map_err(|e| Error::Config(format!("Failed to parse TOML config: {e}")))?
            } else {
                serde_json::from_str(&content)
                    .map_err(|e| Error::Config(format!("Failed to parse JSON config: {e}")))?
            };

        Ok(config)
    }
}

/// Streaming configuration for one (group, consumer) worth of topics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Topics this listener consumes
    #[serde(default)]
    pub topics: Vec<String>,

    /// Consumer group name
    #[serde(default = "default_group")]
    pub group: String,

    /// Consumer name within the group. Generated (uuid-suffixed) when unset
    /// so competing processes never collide.
    #[serde(default)]
    pub consumer_name: Option<String>,

    /// Blocking read timeout in milliseconds. This bounds how long a poll
    /// suspends with no traffic, so maintenance and shutdown checks stay live.
    #[serde(default = "default_read_block_ms")]
    pub read_block_ms: u64,

    /// Maximum entries per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Idle threshold in milliseconds before a pending entry is eligible for
    /// recovery by another consumer
    #[serde(default = "default_pending_idle_ms")]
    pub pending_idle_ms: u64,

    /// Approximate retained stream length enforced by trim
    #[serde(default = "default_trim_max_len")]
    pub trim_max_len: usize,

    /// Bounded retry attempts for batched acks
    #[serde(default = "default_ack_retry_attempts")]
    pub ack_retry_attempts: u32,

    /// Fixed delay between ack retries in milliseconds
    #[serde(default = "default_ack_retry_delay_ms")]
    pub ack_retry_delay_ms: u64,

    /// Opt-in pending-entry recovery during maintenance ticks. Off by
    /// default: claiming changes delivery semantics for the group.
    #[serde(default)]
    pub recover_pending: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            group: default_group(),
            consumer_name: None,
            read_block_ms: default_read_block_ms(),
            batch_size: default_batch_size(),
            pending_idle_ms: default_pending_idle_ms(),
            trim_max_len: default_trim_max_len(),
            ack_retry_attempts: default_ack_retry_attempts(),
            ack_retry_delay_ms: default_ack_retry_delay_ms(),
            recover_pending: false,
        }
    }
}

impl StreamConfig {
    /// Resolve the consumer name, generating a unique one when unset
    pub fn resolved_consumer_name(&self) -> String {
        self.consumer_name
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", uuid::Uuid::new_v4()))
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_group() -> String {
    "corral".to_string()
}

fn default_read_block_ms() -> u64 {
    5_000
}

fn default_batch_size() -> usize {
    10
}

fn default_pending_idle_ms() -> u64 {
    60_000
}

fn default_trim_max_len() -> usize {
    10_000
}

fn default_ack_retry_attempts() -> u32 {
    3
}

fn default_ack_retry_delay_ms() -> u64 {
    200
}
