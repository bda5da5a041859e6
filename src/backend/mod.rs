//! Backing store shared by every bus process.
//!
//! The bus treats storage as an opaque key-value store offering:
//! - Score-unique sorted sets with range queries (one member per score)
//! - Counters and scalar watermarks
//! - Unordered string sets
//! - Expiring leases for mutual exclusion
//!
//! Every method is atomic on its own; anything larger is serialized by
//! [`crate::lock::DistributedLock`].

mod file;
mod journal;
mod keyspace;
mod memory;

pub use file::{FileBackend, FileBackendConfig};
pub use memory::MemoryBackend;

use crate::error::Result;
use std::time::Duration;

/// Storage operations the bus relies on.
pub trait Backend: Send + Sync {
    /// Insert `member` at `score`, replacing whatever was stored there.
    fn zadd(&self, key: &str, score: u64, member: Vec<u8>) -> Result<()>;

    /// Members with `min <= score <= max`, ascending. Open bounds are unbounded.
    fn zrange(
        &self,
        key: &str,
        min: Option<u64>,
        max: Option<u64>,
    ) -> Result<Vec<(u64, Vec<u8>)>>;

    /// Remove the member at `score`.
    fn zrem(&self, key: &str, score: u64) -> Result<bool>;

    /// Remove every member with a score below `cutoff`; returns the count removed.
    fn zremrange_below(&self, key: &str, cutoff: u64) -> Result<usize>;

    /// Number of members in a sorted set.
    fn zcard(&self, key: &str) -> Result<usize>;

    fn get(&self, key: &str) -> Result<Option<u64>>;

    fn set(&self, key: &str, value: u64) -> Result<()>;

    /// Raise the value to `value` if it is lower; returns the stored value.
    fn set_max(&self, key: &str, value: u64) -> Result<u64>;

    /// Increment and return the new value (missing keys start at zero).
    fn incr(&self, key: &str) -> Result<u64>;

    fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    fn srem(&self, key: &str, member: &str) -> Result<bool>;

    fn smembers(&self, key: &str) -> Result<Vec<String>>;

    fn delete(&self, key: &str) -> Result<bool>;

    /// Take the lease on `key` for `token` unless a live lease exists.
    fn try_lease(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Drop the lease on `key` if it is still held by `token`.
    fn release_lease(&self, key: &str, token: &str) -> Result<bool>;
}
