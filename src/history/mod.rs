//! Message history.
//!
//! Every scope (the global scope and one per repository) keeps its own
//! [`HistoryStore`]: one sorted set of envelopes per topic, keyed by
//! sequence id, plus the scope's watermarks. Range queries run one lookup
//! per matching topic and merge the results, so topic-filtered reads never
//! scan unrelated topics.
//!
//! Repository histories are created lazily through [`RepositoryHistories`],
//! which also records which repositories exist so maintenance can reach
//! them without consulting the index.

mod keys;
mod repository;
mod store;

pub use keys::{KeyLayout, ScopeKeys};
pub use repository::RepositoryHistories;
pub use store::HistoryStore;
