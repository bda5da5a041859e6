//! Catch-up for reconnecting clients.
//!
//! A client reports the last id it received (and, when it noticed a gap,
//! the next id it did receive) together with its subscriptions. The reply
//! holds every retained message it missed plus the highest id it may now
//! consider itself synchronized to.
//!
//! Request problems are answered with a coded error inside the reply, never
//! with `Err`, so one bad request does not tear down a long-lived channel:
//!
//! | Code      | Meaning                                           |
//! |-----------|---------------------------------------------------|
//! | `REC0001` | ids malformed or `next_received_id <= last_received_id` |
//! | `REC0002` | `last_received_id` no longer retained; resync fully |
//! | `REC0003` | `next_received_id` no longer retained              |
//! | `REC0004` | a subscription rule is malformed                   |

use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::publisher::{release, Publisher};
use crate::topics::{narrow_to_namespace, CompiledRuleSet, RuleKind, TopicRule};
use crate::types::{Envelope, SequenceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const INVALID_RANGE: &str = "REC0001";
pub const NOT_RETAINED: &str = "REC0002";
pub const NEXT_NOT_RETAINED: &str = "REC0003";
pub const INVALID_TOPIC_RULE: &str = "REC0004";

/// One reconciliation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub last_received_id: SequenceId,
    #[serde(default)]
    pub next_received_id: Option<SequenceId>,
    #[serde(default)]
    pub topics: Vec<TopicRule>,
    /// How many times the client has retried this gap, starting at 1.
    #[serde(default = "first_iteration")]
    pub iteration: u32,
}

fn first_iteration() -> u32 {
    1
}

impl ReconcileRequest {
    pub fn new(last_received_id: SequenceId, topics: Vec<TopicRule>) -> Self {
        Self {
            last_received_id,
            next_received_id: None,
            topics,
            iteration: first_iteration(),
        }
    }

    pub fn until(mut self, next_received_id: SequenceId) -> Self {
        self.next_received_id = Some(next_received_id);
        self
    }

    pub fn iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }
}

/// Missed messages and the new synchronization point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileResponse {
    /// Missed envelopes, ascending, each carrying `ws_extra.subscribed`.
    #[serde(rename = "missed_entries")]
    pub missed_messages: Vec<Envelope>,
    #[serde(rename = "max_msg_id")]
    pub max_sequence_id: SequenceId,
    #[serde(rename = "last_msg_id")]
    pub last_sequence_id: SequenceId,
    pub iteration: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileError {
    pub code: String,
    pub message: String,
}

impl ReconcileError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Wire reply: either the response object or `{"error": {code, message}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReconcileReply {
    Success(ReconcileResponse),
    Failure { error: ReconcileError },
}

impl ReconcileReply {
    fn failure(code: &str, message: impl Into<String>) -> Self {
        ReconcileReply::Failure {
            error: ReconcileError::new(code, message),
        }
    }

    pub fn into_result(self) -> std::result::Result<ReconcileResponse, ReconcileError> {
        match self {
            ReconcileReply::Success(response) => Ok(response),
            ReconcileReply::Failure { error } => Err(error),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            ReconcileReply::Success(_) => None,
            ReconcileReply::Failure { error } => Some(&error.code),
        }
    }
}

/// Answers reconciliation requests against a publisher's history.
pub struct Reconciler {
    publisher: Arc<Publisher>,
    lock_iteration: u32,
    lock_wait: Duration,
}

impl Reconciler {
    pub fn new(publisher: Arc<Publisher>, config: &BusConfig) -> Self {
        Self {
            publisher,
            lock_iteration: config.reconcile_lock_iteration,
            lock_wait: config.lock.wait,
        }
    }

    /// Serve one request.
    ///
    /// From the configured iteration on, the read happens under the
    /// publisher lock so the client gets a snapshot no publish is racing.
    /// Earlier iterations read lock-free; when nothing matched, the reply's
    /// watermark is the highest id that read could see rather than the
    /// counter, which may already name a message still being written.
    /// `Err` is reserved for infrastructure failures (lock timeout,
    /// storage, index corruption).
    pub fn reconcile(&self, request: &ReconcileRequest) -> Result<ReconcileReply> {
        let last_received = request.last_received_id;

        if let Some(next) = request.next_received_id {
            if next <= last_received {
                return Ok(ReconcileReply::failure(
                    INVALID_RANGE,
                    format!(
                        "next_received_id {} must be greater than last_received_id {}",
                        next, last_received
                    ),
                ));
            }
        }

        if !self.publisher.is_retained(last_received)? {
            tracing::debug!(last_received_id = %last_received, "client fell behind retention");
            return Ok(ReconcileReply::failure(
                NOT_RETAINED,
                format!("message {} is no longer retained", last_received),
            ));
        }

        if let Some(next) = request.next_received_id {
            if !self.publisher.is_retained(next)? {
                return Ok(ReconcileReply::failure(
                    NEXT_NOT_RETAINED,
                    format!("message {} is no longer retained", next),
                ));
            }
        }

        let narrowed = narrow_to_namespace(&request.topics, self.publisher.namespace());
        let rules = match CompiledRuleSet::compile(narrowed) {
            Ok(rules) => rules,
            Err(e) => return Ok(ReconcileReply::failure(INVALID_TOPIC_RULE, e.to_string())),
        };

        let locked_read = request.iteration >= self.lock_iteration;
        let guard = if locked_read {
            tracing::debug!(iteration = request.iteration, "reconciling under lock");
            Some(self.publisher.lock().acquire_or_timeout(self.lock_wait)?)
        } else {
            None
        };

        let read = self.publisher.read(
            Some(last_received.next()),
            request.next_received_id.and_then(SequenceId::prev),
            Some(&rules),
        );
        // Under the lock no publish can move the counter past what was read.
        let counter = guard.as_ref().map(|_| self.publisher.last_sequence_id());
        if let Some(guard) = guard {
            release(guard, "reconciliation");
        }

        let read = read?;
        let last_sequence_id = match counter {
            Some(counter) => counter?,
            None => self.publisher.last_sequence_id()?,
        };
        let synchronized = if locked_read {
            last_sequence_id
        } else {
            read.visible_up_to
        };

        let messages = read.messages;
        let max_sequence_id = match request.next_received_id {
            Some(next) => next.max(last_sequence_id),
            None => messages
                .last()
                .map(|message| message.sequence_id())
                .unwrap_or(synchronized),
        };

        let missed_messages: Vec<_> = messages
            .iter()
            .map(|message| message.envelope.routed(Some(&message.matched)))
            .collect();

        tracing::debug!(
            last_received_id = %last_received,
            missed = missed_messages.len(),
            max_sequence_id = %max_sequence_id,
            iteration = request.iteration,
            "reconciled"
        );

        Ok(ReconcileReply::Success(ReconcileResponse {
            missed_messages,
            max_sequence_id,
            last_sequence_id,
            iteration: request.iteration,
        }))
    }

    /// Serve a request in its JSON form,
    /// `{"last_received_id", "next_received_id"?, "topics": [[pattern, kind], ..], "iteration"?}`.
    pub fn reconcile_json(&self, request: &Value) -> Result<ReconcileReply> {
        match parse_request(request) {
            Ok(request) => self.reconcile(&request),
            Err(error) => Ok(ReconcileReply::Failure { error }),
        }
    }
}

fn parse_request(value: &Value) -> std::result::Result<ReconcileRequest, ReconcileError> {
    let last_received_id = value
        .get("last_received_id")
        .and_then(Value::as_u64)
        .map(SequenceId)
        .ok_or_else(|| {
            ReconcileError::new(INVALID_RANGE, "last_received_id must be a non-negative integer")
        })?;

    let next_received_id = match value.get("next_received_id") {
        None | Some(Value::Null) => None,
        Some(next) => Some(next.as_u64().map(SequenceId).ok_or_else(|| {
            ReconcileError::new(INVALID_RANGE, "next_received_id must be a non-negative integer")
        })?),
    };

    let topics = match value.get("topics") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(parse_rule)
            .collect::<std::result::Result<_, _>>()?,
        Some(_) => {
            return Err(ReconcileError::new(
                INVALID_TOPIC_RULE,
                "topics must be a list of [pattern, kind] pairs",
            ))
        }
    };

    let iteration = match value.get("iteration") {
        None | Some(Value::Null) => first_iteration(),
        Some(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| ReconcileError::new(INVALID_RANGE, "iteration must be an integer"))?,
    };

    Ok(ReconcileRequest {
        last_received_id,
        next_received_id,
        topics,
        iteration,
    })
}

fn parse_rule(item: &Value) -> std::result::Result<TopicRule, ReconcileError> {
    let invalid = |reason: String| ReconcileError::new(INVALID_TOPIC_RULE, reason);

    match item.as_array().map(Vec::as_slice) {
        Some([Value::String(pattern), Value::String(kind)]) => {
            let kind: RuleKind = kind.parse().map_err(|e: BusError| invalid(e.to_string()))?;
            Ok(TopicRule::new(pattern.clone(), kind))
        }
        _ => Err(invalid(format!("{} is not a [pattern, kind] pair", item))),
    }
}
