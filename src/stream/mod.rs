//! Stream-based messaging with competing-consumer group delivery
//!
//! Producers append entries to named topics; consumers in a group split
//! delivery between them (each entry goes to exactly one consumer per group),
//! acknowledge what they processed, and recover entries a crashed peer left
//! pending.

use bytes::Bytes;

use crate::error::Result;
use crate::transport::RawEntry;

pub mod consumer;
pub mod headers;
pub mod listener;
pub mod producer;

use headers::Headers;

/// Wire field holding the optional routing key
pub(crate) const FIELD_KEY: &str = "key";
/// Wire field holding the serialized header blob
pub(crate) const FIELD_HEADERS: &str = "headers";
/// Wire field holding the payload bytes
pub(crate) const FIELD_BODY: &str = "body";

/// One decoded stream entry
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Store-assigned, monotonically increasing id
    pub id: String,
    /// Routing key supplied by the producer, if any
    pub key: Option<String>,
    /// Decoded headers, if the producer sent any
    pub headers: Option<Headers>,
    /// Payload bytes
    pub body: Bytes,
}

impl StreamEntry {
    /// Decode a raw wire entry. Fails only on a corrupt header blob.
    pub fn decode(mut raw: RawEntry) -> Result<Self> {
        let key = raw
            .fields
            .remove(FIELD_KEY)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

        let headers = match raw.fields.remove(FIELD_HEADERS) {
            Some(blob) => Some(Headers::decode(&blob)?),
            None => None,
        };

        let body = raw
            .fields
            .remove(FIELD_BODY)
            .map_or_else(Bytes::new, Bytes::from);

        Ok(Self {
            id: raw.id,
            key,
            headers,
            body,
        })
    }
}
