//! In-process backend.

use super::keyspace::{Keyspace, Mutation};
use super::Backend;
use crate::error::Result;
use parking_lot::Mutex;
use std::time::Duration;

/// Backend holding everything in memory.
///
/// Share one instance (behind an `Arc`) between several buses to model
/// several processes talking to the same store.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    keyspace: Mutex<Keyspace>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate(&self, mutation: Mutation) -> Result<u64> {
        self.keyspace.lock().apply(&mutation)
    }
}

impl Backend for MemoryBackend {
    fn zadd(&self, key: &str, score: u64, member: Vec<u8>) -> Result<()> {
        self.mutate(Mutation::ZAdd {
            key: key.to_string(),
            score,
            member,
        })
        .map(|_| ())
    }

    fn zrange(&self, key: &str, min: Option<u64>, max: Option<u64>) -> Result<Vec<(u64, Vec<u8>)>> {
        self.keyspace.lock().zrange(key, min, max)
    }

    fn zrem(&self, key: &str, score: u64) -> Result<bool> {
        self.mutate(Mutation::ZRem {
            key: key.to_string(),
            score,
        })
        .map(|removed| removed > 0)
    }

    fn zremrange_below(&self, key: &str, cutoff: u64) -> Result<usize> {
        self.mutate(Mutation::ZRemRangeBelow {
            key: key.to_string(),
            cutoff,
        })
        .map(|removed| removed as usize)
    }

    fn zcard(&self, key: &str) -> Result<usize> {
        self.keyspace.lock().zcard(key)
    }

    fn get(&self, key: &str) -> Result<Option<u64>> {
        self.keyspace.lock().get(key)
    }

    fn set(&self, key: &str, value: u64) -> Result<()> {
        self.mutate(Mutation::Set {
            key: key.to_string(),
            value,
        })
        .map(|_| ())
    }

    fn set_max(&self, key: &str, value: u64) -> Result<u64> {
        self.mutate(Mutation::SetMax {
            key: key.to_string(),
            value,
        })
    }

    fn incr(&self, key: &str) -> Result<u64> {
        self.mutate(Mutation::Incr {
            key: key.to_string(),
        })
    }

    fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.mutate(Mutation::SAdd {
            key: key.to_string(),
            member: member.to_string(),
        })
        .map(|added| added > 0)
    }

    fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.mutate(Mutation::SRem {
            key: key.to_string(),
            member: member.to_string(),
        })
        .map(|removed| removed > 0)
    }

    fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.keyspace.lock().smembers(key)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.mutate(Mutation::Delete {
            key: key.to_string(),
        })
        .map(|deleted| deleted > 0)
    }

    fn try_lease(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        Ok(self.keyspace.lock().try_lease(key, token, ttl))
    }

    fn release_lease(&self, key: &str, token: &str) -> Result<bool> {
        Ok(self.keyspace.lock().release_lease(key, token))
    }
}
