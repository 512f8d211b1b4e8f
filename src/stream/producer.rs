//! Stream producer

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::stream::headers::Headers;
use crate::stream::{FIELD_BODY, FIELD_HEADERS, FIELD_KEY};
use crate::transport::StoreCommands;

/// Appends entries to one named topic.
///
/// Success means the store accepted the append; there are no acknowledgment
/// semantics and no internal retry. Failures propagate as transport errors.
pub struct StreamProducer {
    store: Arc<dyn StoreCommands>,
    topic: String,
}

impl StreamProducer {
    pub fn new(store: Arc<dyn StoreCommands>, topic: impl Into<String>) -> Self {
        Self {
            store,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Append one entry, returning its store-assigned id
    pub async fn send(
        &self,
        routing_key: Option<&str>,
        headers: Option<&Headers>,
        body: &[u8],
    ) -> Result<String> {
        let mut fields: Vec<(String, Vec<u8>)> = Vec::with_capacity(3);
        if let Some(key) = routing_key {
            fields.push((FIELD_KEY.to_string(), key.as_bytes().to_vec()));
        }
        if let Some(headers) = headers {
            fields.push((FIELD_HEADERS.to_string(), headers.encode()?.to_vec()));
        }
        fields.push((FIELD_BODY.to_string(), body.to_vec()));

        let id = self.store.stream_append(&self.topic, &fields).await?;
        debug!("Appended entry {} to {}", id, self.topic);
        Ok(id)
    }
}
