//! # Tidemark
//!
//! A durable, topic-addressed event bus. Every message gets a globally
//! ordered sequence id, is retained in a per-scope history, and is forwarded
//! to a real-time broker. Clients that were disconnected reconcile against
//! the history to fetch exactly what they missed.
//!
//! ## Core Concepts
//!
//! - **Publisher**: allocates ids, persists, forwards; redelivers what a
//!   broker outage left pending
//! - **History**: per-scope (global or per-repository) topic-grouped storage
//! - **Repository index**: the one cross-scope map from id to owning scope
//! - **Reconciler**: answers "what did I miss" with coded errors for bad or
//!   stale requests
//! - **Pinger**: heartbeat advertising the last allocated id
//!
//! ## Example
//!
//! ```ignore
//! use tidemark::{Bus, BusConfig, ChannelBroker, MemoryBackend, MessageInput, RepositoryId};
//!
//! let (broker, deliveries) = ChannelBroker::unbounded();
//! let bus = Bus::new(Arc::new(MemoryBackend::new()), Arc::new(broker), BusConfig::default())?;
//!
//! // Publish a repository-scoped change
//! let id = bus.publish(
//!     MessageInput::new("front.issue.42")
//!         .in_repository(RepositoryId(7))
//!         .kwarg("state", "closed"),
//! )?;
//!
//! // A reconnecting client catches up
//! let reply = bus.reconcile(&ReconcileRequest::new(
//!     last_seen,
//!     vec![TopicRule::prefix("tidemark.front.")],
//! ))?;
//! ```

pub mod backend;
pub mod broker;
pub mod bus;
pub mod config;
pub mod error;
pub mod history;
pub mod index;
pub mod lock;
pub mod pinger;
pub mod publisher;
pub mod reconcile;
pub mod topics;
pub mod types;

// Re-exports
pub use backend::{Backend, FileBackend, FileBackendConfig, MemoryBackend};
pub use broker::{Broker, BrokerError, ChannelBroker, Delivery, HttpBroker};
pub use bus::Bus;
pub use config::{BusConfig, LockConfig};
pub use error::{BusError, Result};
pub use history::{HistoryStore, KeyLayout, RepositoryHistories, ScopeKeys};
pub use index::RepositoryIndex;
pub use lock::{DistributedLock, LockGuard};
pub use pinger::{Pinger, PingerHandle};
pub use publisher::{Publisher, ReadSnapshot};
pub use reconcile::{
    ReconcileError, ReconcileReply, ReconcileRequest, ReconcileResponse, Reconciler,
};
pub use topics::{CompiledRuleSet, RuleKind, TopicRule};
pub use types::*;
