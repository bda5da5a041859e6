//! Core types for the event bus.

use crate::error::{BusError, Result};
use crate::topics::TopicRule;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Keyword argument injected into delivered envelopes to carry routing metadata.
pub const ROUTING_KWARG: &str = "ws_extra";

/// Globally unique, monotonically increasing message identifier.
///
/// Allocated from a single counter shared by every scope, so comparing two
/// ids decides happened-before regardless of which history holds them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct SequenceId(pub u64);

impl fmt::Debug for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceId {
    pub fn next(self) -> Self {
        SequenceId(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(SequenceId(self.0 - 1))
        } else {
            None
        }
    }
}

/// Identifier of the repository owning a scoped message.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RepositoryId(pub u64);

impl fmt::Debug for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepositoryId({})", self.0)
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Partition of history a message belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// No owning repository.
    Global,
    /// Owned by one repository.
    Repository(RepositoryId),
}

impl Scope {
    pub fn from_repository(repository_id: Option<RepositoryId>) -> Self {
        match repository_id {
            Some(id) => Scope::Repository(id),
            None => Scope::Global,
        }
    }

    pub fn repository_id(&self) -> Option<RepositoryId> {
        match self {
            Scope::Global => None,
            Scope::Repository(id) => Some(*id),
        }
    }
}

/// One immutable stored message.
///
/// Serialized as `{"msg_id": .., "topic": .., "args": [..], "kwargs": {..}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "msg_id")]
    pub sequence_id: SequenceId,
    pub topic: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Envelope {
    /// Encode in the compact wire format.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the compact wire format.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| BusError::Deserialization(e.to_string()))
    }

    /// Copy of this envelope with `ws_extra` routing metadata injected into
    /// its kwargs, as delivered to clients.
    pub fn routed(&self, subscribed: Option<&[TopicRule]>) -> Envelope {
        let mut extra = Map::new();
        extra.insert("topic".into(), Value::String(self.topic.clone()));
        extra.insert("msg_id".into(), json!(self.sequence_id.0));
        if let Some(rules) = subscribed {
            extra.insert("subscribed".into(), json!(rules));
        }

        let mut kwargs = self.kwargs.clone();
        kwargs.insert(ROUTING_KWARG.into(), Value::Object(extra));

        Envelope {
            sequence_id: self.sequence_id,
            topic: self.topic.clone(),
            args: self.args.clone(),
            kwargs,
        }
    }
}

/// Entry of the cross-scope repository index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub sequence_id: SequenceId,
    pub repository_id: Option<RepositoryId>,
}

impl IndexEntry {
    pub fn scope(&self) -> Scope {
        Scope::from_repository(self.repository_id)
    }
}

/// Input for publishing a new message (before a sequence id is assigned).
#[derive(Clone, Debug)]
pub struct MessageInput {
    pub topic: String,
    pub repository_id: Option<RepositoryId>,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl MessageInput {
    /// Create a global message with no payload.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            repository_id: None,
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Scope the message to a repository.
    pub fn in_repository(mut self, repository_id: RepositoryId) -> Self {
        self.repository_id = Some(repository_id);
        self
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Replace all keyword arguments with the fields of a serializable struct.
    pub fn json_kwargs(mut self, payload: &impl Serialize) -> Result<Self> {
        match serde_json::to_value(payload)? {
            Value::Object(map) => {
                self.kwargs = map;
                Ok(self)
            }
            other => Err(BusError::Serialization(format!(
                "kwargs must serialize to an object, got {}",
                other
            ))),
        }
    }
}

/// An envelope read back from history, tagged with its scope and the
/// subscription rules that selected it.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredMessage {
    pub envelope: Envelope,
    pub scope: Scope,
    pub matched: Vec<TopicRule>,
}

impl StoredMessage {
    pub fn sequence_id(&self) -> SequenceId {
        self.envelope.sequence_id
    }
}

/// Per-scope counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeStats {
    pub messages: usize,
    pub last_sequence_id: SequenceId,
    pub last_forwarded_sequence_id: SequenceId,
}

/// Bus statistics for maintenance jobs.
#[derive(Clone, Debug, Default)]
pub struct BusStats {
    pub last_sequence_id: SequenceId,
    pub last_forwarded_sequence_id: SequenceId,
    pub oldest_retained_sequence_id: Option<SequenceId>,
    pub index_entries: usize,
    pub global: ScopeStats,
    pub repositories: Vec<(RepositoryId, ScopeStats)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::RuleKind;

    #[test]
    fn test_sequence_navigation() {
        let seq = SequenceId(5);
        assert_eq!(seq.next(), SequenceId(6));
        assert_eq!(seq.prev(), Some(SequenceId(4)));
        assert_eq!(SequenceId(0).prev(), None);
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope {
            sequence_id: SequenceId(12),
            topic: "tidemark.front.issue".into(),
            args: vec![json!(1)],
            kwargs: json!({"id": 3}).as_object().unwrap().clone(),
        };

        let bytes = envelope.to_bytes().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({"msg_id": 12, "topic": "tidemark.front.issue", "args": [1], "kwargs": {"id": 3}})
        );
        assert_eq!(Envelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_routed_injects_ws_extra() {
        let envelope = Envelope {
            sequence_id: SequenceId(4),
            topic: "tidemark.a".into(),
            args: vec![],
            kwargs: Map::new(),
        };
        let rules = vec![TopicRule::new("tidemark.", RuleKind::Prefix)];

        let routed = envelope.routed(Some(&rules));
        assert_eq!(
            routed.kwargs[ROUTING_KWARG],
            json!({"topic": "tidemark.a", "msg_id": 4, "subscribed": [["tidemark.", "prefix"]]})
        );
        // The stored envelope is untouched.
        assert!(envelope.kwargs.is_empty());

        let plain = envelope.routed(None);
        assert!(plain.kwargs[ROUTING_KWARG].get("subscribed").is_none());
    }

    #[test]
    fn test_message_input_builder() {
        #[derive(Serialize)]
        struct Payload {
            number: u32,
        }

        let input = MessageInput::new("front.card")
            .in_repository(RepositoryId(7))
            .arg("x")
            .json_kwargs(&Payload { number: 2 })
            .unwrap();

        assert_eq!(input.repository_id, Some(RepositoryId(7)));
        assert_eq!(input.args, vec![json!("x")]);
        assert_eq!(input.kwargs["number"], json!(2));

        assert!(MessageInput::new("t").json_kwargs(&vec![1, 2]).is_err());
    }
}
