//! # nettables
//!
//! Replicated, typed key-value tables for robots and dashboards.
//!
//! A table is a set of named **topics**. Each topic carries a value of one
//! fixed type (booleans, numbers, strings, raw bytes, or arrays of these),
//! a JSON object of properties, and a short history of recent updates.
//! Code writes through **publishers** and reads through **subscribers**;
//! one process runs as the server and the rest connect as clients, and every
//! value written anywhere reaches every subscriber that covers its topic.
//!
//! ## Quick Start
//!
//! ```no_run
//! use nettables::{EventMask, Instance, ListenerSource, NetworkConfig, Value, ValueKind};
//! use serde_json::Map;
//!
//! #[tokio::main]
//! async fn main() -> nettables::TableResult<()> {
//!     let nt = Instance::create()?;
//!     let addr = nt.start_server(NetworkConfig::new()).await?;
//!     println!("serving on {}", addr);
//!
//!     nt.add_listener(
//!         ListenerSource::Prefixes(vec!["/drive/".to_string()]),
//!         EventMask::VALUE_ALL,
//!         |event| println!("{:?}", event.value()),
//!     )?;
//!
//!     let topic = nt.topic("/drive/speed");
//!     let publisher = nt.publish(topic, ValueKind::Double, Map::new())?;
//!     nt.set(publisher, Value::double(2.5))?;
//!
//!     nt.stop_network().await;
//!     nt.destroy();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`directory`] - topic registry: names, types, properties, publishers
//!   and subscribers, and the announce/unannounce transitions.
//! - [`storage`] - current value and bounded history per topic, ordered by a
//!   global sequence counter.
//! - [`dispatcher`] - listener registry, periodic coalescing and the
//!   delivery threads that run callbacks.
//! - `network` - server and client sessions over [`protocol`] framing.
//! - [`persistence`] - line-per-topic snapshots of persistent topics.
//! - [`instance`] - the public facade tying these together.
//!
//! ## Thread Safety
//!
//! [`Instance`] is `Clone + Send + Sync`; all clones share one table. Every
//! operation except networking and persistence is synchronous and may be
//! called from any thread. Callbacks run on the instance's delivery thread,
//! never on the caller's.

pub mod clock;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod handle;
pub mod instance;
mod network;
pub mod persistence;
pub mod protocol;
pub mod storage;
pub mod value;

// Public API exports
pub use config::{AppConfig, BackoffPolicy, NetworkConfig, Role, TopicSeed};
pub use directory::{PublishOptions, SubscribeOptions, TopicInfo};
pub use error::{TableError, TableResult};
pub use event::{Event, EventData, EventKind, EventMask, ValueEvent};
pub use handle::{
    ConnectionId, EntryHandle, Handle, ListenerHandle, PollerHandle, PublisherHandle,
    SubscriberHandle, TopicHandle,
};
pub use instance::{Instance, ListenerSource, default_instance};
pub use persistence::{LoadError, LoadReport, PersistedTopic};
pub use protocol::{ConnectionInfo, ConnectionState, DEFAULT_PORT};
pub use storage::HistoryItem;
pub use value::{Value, ValueData, ValueKind};

// Re-export commonly used external types for convenience
pub use serde_json::{Value as JsonValue, json};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use nettables::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::NetworkConfig;
    pub use crate::directory::{PublishOptions, SubscribeOptions};
    pub use crate::error::{TableError, TableResult};
    pub use crate::event::{Event, EventKind, EventMask};
    pub use crate::instance::{Instance, ListenerSource};
    pub use crate::value::{Value, ValueKind};
    pub use serde_json::{Value as JsonValue, json};
}
