//! Entry headers: a string-keyed JSON map carried as one opaque blob

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Optional per-entry metadata, serialized as a single JSON blob on the wire
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers(HashMap<String, serde_json::Value>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize into the wire blob
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.0)?))
    }

    /// Deserialize from the wire blob
    pub fn decode(blob: &[u8]) -> Result<Self> {
        Ok(Self(serde_json::from_slice(blob)?))
    }
}

impl FromIterator<(String, serde_json::Value)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, serde_json::Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
