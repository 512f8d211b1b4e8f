//! Corral - Redis-backed distributed coordination
//!
//! Provides cross-process coordination primitives on top of a single Redis
//! connection:
//! - Mutual-exclusion locks with owner tokens and TTL expiry
//! - Stream producers and competing-consumer group delivery
//! - Pending-entry crash recovery and bounded-retention trimming
//! - Idempotent consumer-group bootstrap
//!
//! All atomic mutations run as server-side Lua scripts; the library itself
//! performs no client-side mutual exclusion. Correctness under concurrent
//! callers reduces to the atomicity of each individual script.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod error;
pub mod lock;
pub mod retry;
pub mod stream;
pub mod transport;

pub use config::{CoordinationConfig, StreamConfig};
pub use error::{Error, Result};
pub use lock::LockService;
pub use stream::consumer::{ConsumerState, EntryHandler, StreamConsumer};
pub use stream::headers::Headers;
pub use stream::listener::StreamListener;
pub use stream::producer::StreamProducer;
pub use stream::StreamEntry;
pub use transport::{
    PendingInfo, RawEntry, ReleaseStatus, ScriptHandle, StoreCommands, Transport,
};
