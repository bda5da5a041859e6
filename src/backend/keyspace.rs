//! In-memory keyspace shared by the memory and file backends.

use crate::error::{BusError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::time::{Duration, Instant};

/// A state-changing operation on the keyspace.
///
/// Mutations are deterministic, so replaying a journal of them rebuilds the
/// exact keyspace that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum Mutation {
    ZAdd { key: String, score: u64, member: Vec<u8> },
    ZRem { key: String, score: u64 },
    ZRemRangeBelow { key: String, cutoff: u64 },
    Set { key: String, value: u64 },
    SetMax { key: String, value: u64 },
    Incr { key: String },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    Delete { key: String },
}

impl Mutation {
    fn key(&self) -> &str {
        match self {
            Mutation::ZAdd { key, .. }
            | Mutation::ZRem { key, .. }
            | Mutation::ZRemRangeBelow { key, .. }
            | Mutation::Set { key, .. }
            | Mutation::SetMax { key, .. }
            | Mutation::Incr { key }
            | Mutation::SAdd { key, .. }
            | Mutation::SRem { key, .. }
            | Mutation::Delete { key } => key,
        }
    }

    fn expected_kind(&self) -> Option<ValueKind> {
        match self {
            Mutation::ZAdd { .. } | Mutation::ZRem { .. } | Mutation::ZRemRangeBelow { .. } => {
                Some(ValueKind::SortedSet)
            }
            Mutation::Set { .. } | Mutation::SetMax { .. } | Mutation::Incr { .. } => {
                Some(ValueKind::Counter)
            }
            Mutation::SAdd { .. } | Mutation::SRem { .. } => Some(ValueKind::Set),
            Mutation::Delete { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ValueKind {
    Counter,
    SortedSet,
    Set,
}

#[derive(Clone, Debug)]
enum Value {
    Counter(u64),
    SortedSet(BTreeMap<u64, Vec<u8>>),
    Set(BTreeSet<String>),
}

impl Value {
    fn kind(&self) -> ValueKind {
        match self {
            Value::Counter(_) => ValueKind::Counter,
            Value::SortedSet(_) => ValueKind::SortedSet,
            Value::Set(_) => ValueKind::Set,
        }
    }
}

#[derive(Clone, Debug)]
struct Lease {
    token: String,
    expires_at: Instant,
}

/// Typed key-value state plus process-local leases.
#[derive(Debug, Default)]
pub(crate) struct Keyspace {
    values: HashMap<String, Value>,
    leases: HashMap<String, Lease>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify a mutation would apply cleanly without changing anything.
    pub fn check(&self, mutation: &Mutation) -> Result<()> {
        let key = mutation.key();
        match (self.values.get(key), mutation.expected_kind()) {
            (Some(value), Some(expected)) if value.kind() != expected => {
                Err(BusError::InvalidOperation(format!(
                    "key {:?} holds a {:?} value, not a {:?}",
                    key,
                    value.kind(),
                    expected
                )))
            }
            _ => Ok(()),
        }
    }

    /// Apply a mutation; returns its numeric outcome (new value, count, or 0/1).
    pub fn apply(&mut self, mutation: &Mutation) -> Result<u64> {
        self.check(mutation)?;

        let outcome = match mutation {
            Mutation::ZAdd { key, score, member } => {
                let previous = self.sorted_mut(key).insert(*score, member.clone());
                u64::from(previous.is_none())
            }
            Mutation::ZRem { key, score } => {
                let removed = match self.values.get_mut(key) {
                    Some(Value::SortedSet(set)) => set.remove(score).is_some(),
                    _ => false,
                };
                self.drop_if_empty(key);
                u64::from(removed)
            }
            Mutation::ZRemRangeBelow { key, cutoff } => {
                let removed = match self.values.get_mut(key) {
                    Some(Value::SortedSet(set)) => {
                        let kept = set.split_off(cutoff);
                        let removed = set.len();
                        *set = kept;
                        removed
                    }
                    _ => 0,
                };
                self.drop_if_empty(key);
                removed as u64
            }
            Mutation::Set { key, value } => {
                self.values.insert(key.clone(), Value::Counter(*value));
                *value
            }
            Mutation::SetMax { key, value } => {
                let counter = self.counter_mut(key);
                *counter = (*counter).max(*value);
                *counter
            }
            Mutation::Incr { key } => {
                let counter = self.counter_mut(key);
                *counter += 1;
                *counter
            }
            Mutation::SAdd { key, member } => {
                let set = match self
                    .values
                    .entry(key.clone())
                    .or_insert_with(|| Value::Set(BTreeSet::new()))
                {
                    Value::Set(set) => set,
                    _ => unreachable!("kind checked above"),
                };
                u64::from(set.insert(member.clone()))
            }
            Mutation::SRem { key, member } => {
                let removed = match self.values.get_mut(key) {
                    Some(Value::Set(set)) => set.remove(member),
                    _ => false,
                };
                self.drop_if_empty(key);
                u64::from(removed)
            }
            Mutation::Delete { key } => u64::from(self.values.remove(key).is_some()),
        };

        Ok(outcome)
    }

    pub fn zrange(
        &self,
        key: &str,
        min: Option<u64>,
        max: Option<u64>,
    ) -> Result<Vec<(u64, Vec<u8>)>> {
        if let (Some(min), Some(max)) = (min, max) {
            if min > max {
                return Ok(Vec::new());
            }
        }

        let lower = min.map_or(Bound::Unbounded, Bound::Included);
        let upper = max.map_or(Bound::Unbounded, Bound::Included);

        match self.values.get(key) {
            None => Ok(Vec::new()),
            Some(Value::SortedSet(set)) => Ok(set
                .range((lower, upper))
                .map(|(score, member)| (*score, member.clone()))
                .collect()),
            Some(other) => Err(wrong_kind(key, other.kind(), ValueKind::SortedSet)),
        }
    }

    pub fn zcard(&self, key: &str) -> Result<usize> {
        match self.values.get(key) {
            None => Ok(0),
            Some(Value::SortedSet(set)) => Ok(set.len()),
            Some(other) => Err(wrong_kind(key, other.kind(), ValueKind::SortedSet)),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<u64>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::Counter(value)) => Ok(Some(*value)),
            Some(other) => Err(wrong_kind(key, other.kind(), ValueKind::Counter)),
        }
    }

    pub fn smembers(&self, key: &str) -> Result<Vec<String>> {
        match self.values.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(other) => Err(wrong_kind(key, other.kind(), ValueKind::Set)),
        }
    }

    pub fn try_lease(&mut self, key: &str, token: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        if let Some(lease) = self.leases.get(key) {
            if lease.expires_at > now {
                return false;
            }
        }

        self.leases.insert(
            key.to_string(),
            Lease {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        true
    }

    pub fn release_lease(&mut self, key: &str, token: &str) -> bool {
        let now = Instant::now();
        match self.leases.get(key) {
            Some(lease) if lease.token == token && lease.expires_at > now => {
                self.leases.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Mutations that rebuild the current values from an empty keyspace.
    pub fn snapshot(&self) -> Vec<Mutation> {
        let mut keys: Vec<&String> = self.values.keys().collect();
        keys.sort();

        let mut mutations = Vec::new();
        for key in keys {
            match &self.values[key] {
                Value::Counter(value) => mutations.push(Mutation::Set {
                    key: key.clone(),
                    value: *value,
                }),
                Value::SortedSet(set) => {
                    for (score, member) in set {
                        mutations.push(Mutation::ZAdd {
                            key: key.clone(),
                            score: *score,
                            member: member.clone(),
                        });
                    }
                }
                Value::Set(set) => {
                    for member in set {
                        mutations.push(Mutation::SAdd {
                            key: key.clone(),
                            member: member.clone(),
                        });
                    }
                }
            }
        }
        mutations
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    fn sorted_mut(&mut self, key: &str) -> &mut BTreeMap<u64, Vec<u8>> {
        match self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::SortedSet(BTreeMap::new()))
        {
            Value::SortedSet(set) => set,
            _ => unreachable!("kind checked before mutation"),
        }
    }

    fn counter_mut(&mut self, key: &str) -> &mut u64 {
        match self
            .values
            .entry(key.to_string())
            .or_insert(Value::Counter(0))
        {
            Value::Counter(value) => value,
            _ => unreachable!("kind checked before mutation"),
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.values.get(key) {
            Some(Value::SortedSet(set)) => set.is_empty(),
            Some(Value::Set(set)) => set.is_empty(),
            _ => false,
        };
        if empty {
            self.values.remove(key);
        }
    }
}

fn wrong_kind(key: &str, found: ValueKind, expected: ValueKind) -> BusError {
    BusError::InvalidOperation(format!(
        "key {:?} holds a {:?} value, not a {:?}",
        key, found, expected
    ))
}
