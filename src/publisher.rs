//! Global sequencer, persister and forwarder.
//!
//! Every publish runs under the publisher lock:
//!
//! 1. Redeliver anything persisted but not yet forwarded.
//! 2. Allocate the next id from the global counter.
//! 3. Record the owner in the repository index and persist the envelope in
//!    its scope's history.
//! 4. Forward it to the broker.
//!
//! Forwarding failures never fail the publish. The envelope stays pending
//! and the next publish (from any process sharing the backend) or an
//! explicit [`Publisher::flush`] redelivers it, oldest first. A new message
//! is only forwarded once everything before it has been, so the broker sees
//! ids in increasing order.

use crate::backend::Backend;
use crate::broker::{Broker, BrokerError};
use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::history::{HistoryStore, KeyLayout, RepositoryHistories};
use crate::index::RepositoryIndex;
use crate::lock::{DistributedLock, LockGuard};
use crate::topics::{normalize_topic, CompiledRuleSet};
use crate::types::{
    BusStats, Envelope, IndexEntry, MessageInput, RepositoryId, Scope, SequenceId, StoredMessage,
    ROUTING_KWARG,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Sequences, stores and forwards messages for one namespace.
///
/// Any number of publishers may share a backend; the lock serializes their
/// critical sections. Reads never take the lock.
pub struct Publisher {
    layout: KeyLayout,
    backend: Arc<dyn Backend>,
    global: HistoryStore,
    repositories: RepositoryHistories,
    index: RepositoryIndex,
    lock: DistributedLock,
    lock_wait: Duration,
    /// Lease time a forward may take; redelivery stops before the lease
    /// could lapse mid-call.
    forward_budget: Duration,
    broker: Arc<dyn Broker>,
}

impl Publisher {
    pub fn new(backend: Arc<dyn Backend>, broker: Arc<dyn Broker>, config: &BusConfig) -> Self {
        let layout = KeyLayout::new(config.namespace.clone());

        Self {
            global: HistoryStore::global(Arc::clone(&backend), &layout),
            repositories: RepositoryHistories::new(Arc::clone(&backend), layout.clone()),
            index: RepositoryIndex::new(Arc::clone(&backend), &layout),
            lock: DistributedLock::new(Arc::clone(&backend), &layout, &config.lock),
            lock_wait: config.lock.wait,
            forward_budget: config.broker_timeout.min(config.lock.ttl / 2),
            backend,
            broker,
            layout,
        }
    }

    pub fn namespace(&self) -> &str {
        self.layout.namespace()
    }

    /// Publish a message, returning its sequence id.
    ///
    /// Fails only if the lock cannot be taken in time or storage fails; a
    /// broker outage leaves the message pending.
    pub fn publish(&self, input: MessageInput) -> Result<SequenceId> {
        check_input(&input)?;
        let guard = self.lock.acquire_or_timeout(self.lock_wait)?;
        let published = self.publish_locked(input, &guard);
        release(guard, "publish");
        published
    }

    /// The publish critical section, for callers that took the lock
    /// themselves.
    pub fn publish_locked(&self, input: MessageInput, guard: &LockGuard) -> Result<SequenceId> {
        check_input(&input)?;
        let topic = normalize_topic(self.namespace(), &input.topic);

        let caught_up = self.send_unsent(guard)?;

        let sequence_id = SequenceId(self.backend.incr(&self.counter_key())?);
        let envelope = Envelope {
            sequence_id,
            topic,
            args: input.args,
            kwargs: input.kwargs,
        };
        let scope = Scope::from_repository(input.repository_id);

        // Index first: a lock-free reader may miss the envelope, never find
        // it without its owner.
        self.index.add(IndexEntry {
            sequence_id,
            repository_id: input.repository_id,
        })?;
        self.history_for_write(scope)?.save(&envelope)?;
        debug!(sequence_id = %sequence_id, topic = %envelope.topic, ?scope, "persisted message");

        if !caught_up {
            debug!(sequence_id = %sequence_id, "left pending behind earlier backlog");
            return Ok(sequence_id);
        }
        if !self.lease_covers_forward(guard) {
            warn!(
                sequence_id = %sequence_id,
                "lock lease too short to forward, message left pending"
            );
            return Ok(sequence_id);
        }

        match self.forward(&envelope) {
            Ok(()) => {
                self.mark_forwarded(scope, sequence_id)?;
                self.global.mark_forwarded(sequence_id)?;
            }
            Err(e) => warn!(
                sequence_id = %sequence_id,
                topic = %envelope.topic,
                error = %e,
                "forwarding failed, message left pending"
            ),
        }

        Ok(sequence_id)
    }

    /// Redeliver pending messages under the lock.
    ///
    /// Returns whether the backlog was fully drained.
    pub fn flush(&self) -> Result<bool> {
        let guard = self.lock.acquire_or_timeout(self.lock_wait)?;
        let drained = self.send_unsent(&guard);
        release(guard, "flush");
        drained
    }

    /// Forward every message after the global forwarded watermark, in order.
    ///
    /// Stops at the first broker failure, or once the lease is too short
    /// for another broker call, keeping the watermark just below the message
    /// not delivered. Returns whether everything was delivered.
    pub fn send_unsent(&self, guard: &LockGuard) -> Result<bool> {
        let last = self.last_sequence_id()?;
        let forwarded = self.global.last_forwarded_sequence_id()?;
        if forwarded >= last {
            return Ok(true);
        }

        let pending = self.get_messages(Some(forwarded.next()), Some(last), None)?;
        let mut delivered = 0;

        for message in &pending {
            let sequence_id = message.sequence_id();
            if !self.lease_covers_forward(guard) {
                warn!(
                    sequence_id = %sequence_id,
                    delivered,
                    remaining = pending.len() - delivered,
                    "lock lease running out, redelivery deferred"
                );
                if let Some(previous) = sequence_id.prev() {
                    self.global.mark_forwarded(previous)?;
                }
                return Ok(false);
            }
            if let Err(e) = self.forward(&message.envelope) {
                warn!(
                    sequence_id = %sequence_id,
                    delivered,
                    remaining = pending.len() - delivered,
                    error = %e,
                    "redelivery stopped"
                );
                if let Some(previous) = sequence_id.prev() {
                    self.global.mark_forwarded(previous)?;
                }
                return Ok(false);
            }
            self.mark_forwarded(message.scope, sequence_id)?;
            delivered += 1;
        }

        // Also covers ids allocated but never persisted.
        self.global.mark_forwarded(last)?;
        if delivered > 0 {
            info!(delivered, up_to = %last, "redelivered pending messages");
        }
        Ok(true)
    }

    /// Messages with ids in `[first, last]` matching `rules` (all when
    /// `None`), from every scope, ascending by sequence id.
    ///
    /// Lock-free; see [`Publisher::read`] for what a read can see.
    pub fn get_messages(
        &self,
        first: Option<SequenceId>,
        last: Option<SequenceId>,
        rules: Option<&CompiledRuleSet>,
    ) -> Result<Vec<StoredMessage>> {
        Ok(self.read(first, last, rules)?.messages)
    }

    /// Read `[first, last]` against one snapshot of the repository index.
    ///
    /// Only ids in the snapshot are visible; anything published after it is
    /// left for the next read. Repository histories are read before the
    /// global one, so a message a concurrent removal moves to the global
    /// scope is found in one or the other. A repository message whose index
    /// entry is missing or names another repository is corruption.
    pub fn read(
        &self,
        first: Option<SequenceId>,
        last: Option<SequenceId>,
        rules: Option<&CompiledRuleSet>,
    ) -> Result<ReadSnapshot> {
        let floor = first.and_then(SequenceId::prev).unwrap_or_default();
        if let (Some(first), Some(last)) = (first, last) {
            if first > last {
                return Ok(ReadSnapshot::empty(floor));
            }
        }

        let entries = self.index.entries(first, last)?;
        let Some((&ceiling, &ceiling_scope)) = entries.iter().next_back() else {
            return Ok(ReadSnapshot::empty(floor));
        };
        let repositories: BTreeSet<RepositoryId> =
            entries.values().filter_map(Scope::repository_id).collect();

        let mut messages = Vec::new();
        for repository_id in repositories {
            let history = self.repositories.get(repository_id);
            for (envelope, matched) in history.range(first, Some(ceiling), rules)? {
                match entries.get(&envelope.sequence_id) {
                    Some(Scope::Repository(owner)) if *owner == repository_id => {}
                    // Rescoped by a removal in progress; the global copy
                    // stands in for it.
                    Some(Scope::Global) => continue,
                    indexed => {
                        error!(
                            sequence_id = %envelope.sequence_id,
                            repository_id = %repository_id,
                            ?indexed,
                            "repository index disagrees with history"
                        );
                        return Err(BusError::Corruption(format!(
                            "message {} of repository {} is indexed as {:?}",
                            envelope.sequence_id, repository_id, indexed
                        )));
                    }
                }
                messages.push(StoredMessage {
                    envelope,
                    scope: Scope::Repository(repository_id),
                    matched,
                });
            }
        }

        for (envelope, matched) in self.global.range(first, Some(ceiling), rules)? {
            messages.push(StoredMessage {
                envelope,
                scope: Scope::Global,
                matched,
            });
        }

        messages.sort_by_key(StoredMessage::sequence_id);
        messages.dedup_by_key(|message| message.sequence_id());

        // The newest indexed id may belong to a publish still writing its
        // envelope.
        let ceiling_read = messages.last().map(StoredMessage::sequence_id) == Some(ceiling);
        let visible_up_to = if ceiling_read || self.is_stored(ceiling, ceiling_scope)? {
            ceiling
        } else {
            ceiling.prev().unwrap_or_default().max(floor)
        };

        Ok(ReadSnapshot {
            messages,
            visible_up_to,
        })
    }

    /// Fold a repository's history into the global scope.
    ///
    /// Its messages keep their ids and topics but become scope-less, so
    /// in-flight reconciliation still finds them. Returns how many moved.
    pub fn remove_repository(&self, repository_id: RepositoryId) -> Result<usize> {
        let guard = self.lock.acquire_or_timeout(self.lock_wait)?;
        let removed = self.remove_repository_locked(repository_id, &guard);
        release(guard, "repository removal");
        removed
    }

    fn remove_repository_locked(
        &self,
        repository_id: RepositoryId,
        _guard: &LockGuard,
    ) -> Result<usize> {
        let history = self.repositories.get(repository_id);
        let envelopes = history.range(None, None, None)?;
        for (envelope, _) in &envelopes {
            self.global.save(envelope)?;
        }

        let rescoped = self.index.rescope(repository_id)?;
        history.destroy()?;
        self.repositories.forget(repository_id)?;

        info!(
            repository_id = %repository_id,
            moved = envelopes.len(),
            rescoped,
            "removed repository history"
        );
        Ok(envelopes.len())
    }

    /// Drop every message and index entry below `min_to_keep`.
    ///
    /// Returns the number of messages removed across all scopes. Runs under
    /// the lock: emptied topics are dropped, which must not race a save.
    pub fn clean(&self, min_to_keep: SequenceId) -> Result<usize> {
        let guard = self.lock.acquire_or_timeout(self.lock_wait)?;
        let removed = self.clean_locked(min_to_keep, &guard);
        release(guard, "clean");
        removed
    }

    fn clean_locked(&self, min_to_keep: SequenceId, _guard: &LockGuard) -> Result<usize> {
        let mut removed = self.global.clean(min_to_keep)?;
        for repository_id in self.repositories.known()? {
            removed += self.repositories.get(repository_id).clean(min_to_keep)?;
        }
        let index_removed = self.index.clean(min_to_keep)?;

        info!(min_to_keep = %min_to_keep, removed, index_removed, "cleaned history");
        Ok(removed)
    }

    /// Highest sequence id allocated so far.
    pub fn last_sequence_id(&self) -> Result<SequenceId> {
        Ok(SequenceId(self.backend.get(&self.counter_key())?.unwrap_or(0)))
    }

    /// Highest id up to which every message reached the broker.
    pub fn last_forwarded_sequence_id(&self) -> Result<SequenceId> {
        self.global.last_forwarded_sequence_id()
    }

    /// Number of ids allocated but not yet forwarded.
    pub fn pending_count(&self) -> Result<u64> {
        let last = self.last_sequence_id()?;
        let forwarded = self.last_forwarded_sequence_id()?;
        Ok(last.0.saturating_sub(forwarded.0))
    }

    /// Whether `id` is still retained in the index.
    pub fn is_retained(&self, id: SequenceId) -> Result<bool> {
        self.index.contains(id)
    }

    pub fn stats(&self) -> Result<BusStats> {
        let mut repositories = Vec::new();
        for repository_id in self.repositories.known()? {
            repositories.push((repository_id, self.repositories.get(repository_id).stats()?));
        }

        Ok(BusStats {
            last_sequence_id: self.last_sequence_id()?,
            last_forwarded_sequence_id: self.last_forwarded_sequence_id()?,
            oldest_retained_sequence_id: self.index.first_sequence_id()?,
            index_entries: self.index.len()?,
            global: self.global.stats()?,
            repositories,
        })
    }

    pub fn global_history(&self) -> &HistoryStore {
        &self.global
    }

    pub fn repository(&self, repository_id: RepositoryId) -> Arc<HistoryStore> {
        self.repositories.get(repository_id)
    }

    pub fn index(&self) -> &RepositoryIndex {
        &self.index
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// How long lock-taking operations wait.
    pub fn lock_wait(&self) -> Duration {
        self.lock_wait
    }

    fn counter_key(&self) -> String {
        self.layout.scope(Scope::Global).last_sequence_id()
    }

    /// Whether the envelope of `id`, indexed under `scope`, is stored.
    fn is_stored(&self, id: SequenceId, scope: Scope) -> Result<bool> {
        if let Scope::Repository(repository_id) = scope {
            if self.repositories.get(repository_id).contains(id)? {
                return Ok(true);
            }
        }
        // A removal copies repository messages to the global scope.
        self.global.contains(id)
    }

    /// Whether the lease outlives one more broker call.
    fn lease_covers_forward(&self, guard: &LockGuard) -> bool {
        guard.remaining() > self.forward_budget
    }

    fn history_for_write(&self, scope: Scope) -> Result<HistoryHandle<'_>> {
        Ok(match scope {
            Scope::Global => HistoryHandle::Global(&self.global),
            Scope::Repository(id) => {
                HistoryHandle::Repository(self.repositories.get_or_create(id)?)
            }
        })
    }

    /// Per-scope forwarded watermark; the global scope's is maintained by
    /// the callers since it also tracks cross-scope progress.
    fn mark_forwarded(&self, scope: Scope, id: SequenceId) -> Result<()> {
        match scope {
            Scope::Global => Ok(()),
            Scope::Repository(repository_id) => {
                self.repositories.get(repository_id).mark_forwarded(id)
            }
        }
    }

    fn forward(&self, envelope: &Envelope) -> std::result::Result<(), BrokerError> {
        let routed = envelope.routed(None);
        self.broker.publish(&routed.topic, &routed.args, &routed.kwargs)?;
        debug!(sequence_id = %envelope.sequence_id, topic = %envelope.topic, "forwarded message");
        Ok(())
    }
}

/// Reject input the bus could not deliver faithfully.
fn check_input(input: &MessageInput) -> Result<()> {
    if input.kwargs.contains_key(ROUTING_KWARG) {
        return Err(BusError::ReservedKwarg(ROUTING_KWARG.to_string()));
    }
    Ok(())
}

/// Release a guard at the end of `operation`, logging a lost lease.
pub(crate) fn release(guard: LockGuard, operation: &str) {
    if let Err(e) = guard.release() {
        warn!(operation, error = %e, "lock expired before release");
    }
}

/// Outcome of one lock-free [`Publisher::read`].
#[derive(Debug)]
pub struct ReadSnapshot {
    pub messages: Vec<StoredMessage>,
    /// Highest id the read could see. Later ids were not yet visible.
    pub visible_up_to: SequenceId,
}

impl ReadSnapshot {
    fn empty(visible_up_to: SequenceId) -> Self {
        Self {
            messages: Vec::new(),
            visible_up_to,
        }
    }
}

enum HistoryHandle<'a> {
    Global(&'a HistoryStore),
    Repository(Arc<HistoryStore>),
}

impl std::ops::Deref for HistoryHandle<'_> {
    type Target = HistoryStore;

    fn deref(&self) -> &HistoryStore {
        match self {
            HistoryHandle::Global(history) => history,
            HistoryHandle::Repository(history) => history,
        }
    }
}
