//! Per-scope message history.

use super::keys::{KeyLayout, ScopeKeys};
use crate::backend::Backend;
use crate::error::Result;
use crate::topics::{restrict, CompiledRuleSet, TopicRule};
use crate::types::{Envelope, Scope, ScopeStats, SequenceId};
use std::sync::Arc;

/// Envelopes of one scope, grouped by topic and ordered by sequence id.
///
/// Tracks two watermarks: the highest sequence id stored in the scope and
/// the highest one successfully handed to the broker. The second never
/// exceeds the first; the gap between them is the backlog awaiting
/// redelivery.
pub struct HistoryStore {
    backend: Arc<dyn Backend>,
    scope: Scope,
    keys: ScopeKeys,

    /// Whether `last_sequence_id` is the global sequence counter itself, in
    /// which case allocation already advanced it.
    owns_counter: bool,
}

impl HistoryStore {
    /// History of messages without an owning repository.
    ///
    /// Its `last_sequence_id` key doubles as the global sequence counter.
    pub fn global(backend: Arc<dyn Backend>, layout: &KeyLayout) -> Self {
        Self {
            backend,
            scope: Scope::Global,
            keys: layout.scope(Scope::Global),
            owns_counter: true,
        }
    }

    /// History of one repository's messages.
    pub fn for_scope(backend: Arc<dyn Backend>, layout: &KeyLayout, scope: Scope) -> Self {
        Self {
            backend,
            scope,
            keys: layout.scope(scope),
            owns_counter: scope == Scope::Global,
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Store an envelope under its topic at its sequence id.
    pub fn save(&self, envelope: &Envelope) -> Result<()> {
        let id = envelope.sequence_id.0;

        self.backend
            .zadd(&self.keys.topic(&envelope.topic), id, envelope.to_bytes()?)?;
        self.backend.sadd(&self.keys.topics(), &envelope.topic)?;

        if !self.owns_counter {
            self.backend.set_max(&self.keys.last_sequence_id(), id)?;
        }

        tracing::trace!(
            scope = ?self.scope,
            sequence_id = id,
            topic = %envelope.topic,
            "saved envelope"
        );
        Ok(())
    }

    /// Envelopes with `first <= sequence_id <= last` whose topic matches
    /// `rules` (all topics when `None`), ascending by sequence id, each with
    /// the rules that matched it.
    pub fn range(
        &self,
        first: Option<SequenceId>,
        last: Option<SequenceId>,
        rules: Option<&CompiledRuleSet>,
    ) -> Result<Vec<(Envelope, Vec<TopicRule>)>> {
        if let (Some(first), Some(last)) = (first, last) {
            if first > last {
                return Ok(Vec::new());
            }
        }

        let topics = self.topics()?;
        let restricted = restrict(topics.iter().map(String::as_str), rules);

        let mut found = Vec::new();
        for (topic, matched) in restricted {
            let members = self.backend.zrange(
                &self.keys.topic(&topic),
                first.map(|id| id.0),
                last.map(|id| id.0),
            )?;
            for (_, member) in members {
                found.push((Envelope::from_bytes(&member)?, matched.clone()));
            }
        }

        // One query per topic; only the merge gives global order.
        found.sort_by_key(|(envelope, _)| envelope.sequence_id);
        Ok(found)
    }

    /// Whether the envelope with `id` is stored, under any topic.
    pub fn contains(&self, id: SequenceId) -> Result<bool> {
        for topic in self.topics()? {
            if !self
                .backend
                .zrange(&self.keys.topic(&topic), Some(id.0), Some(id.0))?
                .is_empty()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Topics with at least one stored envelope.
    pub fn topics(&self) -> Result<Vec<String>> {
        self.backend.smembers(&self.keys.topics())
    }

    pub fn last_sequence_id(&self) -> Result<SequenceId> {
        Ok(SequenceId(
            self.backend.get(&self.keys.last_sequence_id())?.unwrap_or(0),
        ))
    }

    pub fn last_forwarded_sequence_id(&self) -> Result<SequenceId> {
        Ok(SequenceId(
            self.backend
                .get(&self.keys.last_forwarded_sequence_id())?
                .unwrap_or(0),
        ))
    }

    /// Record that everything up to `id` in this scope reached the broker.
    pub fn mark_forwarded(&self, id: SequenceId) -> Result<()> {
        let ceiling = self.last_sequence_id()?;
        self.backend
            .set_max(&self.keys.last_forwarded_sequence_id(), id.min(ceiling).0)?;
        Ok(())
    }

    /// Remove every envelope below `min_to_keep`; returns the count removed.
    ///
    /// Emptied topics are dropped from the topic set, so a save racing this
    /// call could be left unreachable: callers hold the publisher lock.
    pub fn clean(&self, min_to_keep: SequenceId) -> Result<usize> {
        let mut removed = 0;
        for topic in self.topics()? {
            let key = self.keys.topic(&topic);
            removed += self.backend.zremrange_below(&key, min_to_keep.0)?;
            if self.backend.zcard(&key)? == 0 {
                self.backend.srem(&self.keys.topics(), &topic)?;
            }
        }
        Ok(removed)
    }

    /// Number of stored envelopes.
    pub fn message_count(&self) -> Result<usize> {
        let mut count = 0;
        for topic in self.topics()? {
            count += self.backend.zcard(&self.keys.topic(&topic))?;
        }
        Ok(count)
    }

    pub fn stats(&self) -> Result<ScopeStats> {
        Ok(ScopeStats {
            messages: self.message_count()?,
            last_sequence_id: self.last_sequence_id()?,
            last_forwarded_sequence_id: self.last_forwarded_sequence_id()?,
        })
    }

    /// Delete every key of this scope.
    pub(crate) fn destroy(&self) -> Result<()> {
        for topic in self.topics()? {
            self.backend.delete(&self.keys.topic(&topic))?;
        }
        self.backend.delete(&self.keys.topics())?;
        self.backend.delete(&self.keys.last_sequence_id())?;
        self.backend.delete(&self.keys.last_forwarded_sequence_id())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::types::RepositoryId;
    use serde_json::json;

    fn envelope(id: u64, topic: &str) -> Envelope {
        Envelope {
            sequence_id: SequenceId(id),
            topic: topic.into(),
            args: vec![json!(id)],
            kwargs: Default::default(),
        }
    }

    fn repository_history() -> HistoryStore {
        HistoryStore::for_scope(
            Arc::new(MemoryBackend::new()),
            &KeyLayout::new("ns."),
            Scope::Repository(RepositoryId(1)),
        )
    }

    fn ids(found: &[(Envelope, Vec<TopicRule>)]) -> Vec<u64> {
        found.iter().map(|(e, _)| e.sequence_id.0).collect()
    }

    #[test]
    fn test_range_merges_topics_in_sequence_order() {
        let history = repository_history();
        history.save(&envelope(1, "ns.b")).unwrap();
        history.save(&envelope(2, "ns.a")).unwrap();
        history.save(&envelope(3, "ns.b")).unwrap();
        history.save(&envelope(4, "ns.a")).unwrap();

        let found = history.range(None, None, None).unwrap();
        assert_eq!(ids(&found), vec![1, 2, 3, 4]);
        assert!(found.iter().all(|(_, matched)| matched.is_empty()));

        let found = history
            .range(Some(SequenceId(2)), Some(SequenceId(3)), None)
            .unwrap();
        assert_eq!(ids(&found), vec![2, 3]);
    }

    #[test]
    fn test_range_filters_by_rules() {
        let history = repository_history();
        history.save(&envelope(1, "ns.issue.1")).unwrap();
        history.save(&envelope(2, "ns.card.1")).unwrap();
        history.save(&envelope(3, "ns.issue.2")).unwrap();

        let rules = CompiledRuleSet::compile(vec![TopicRule::prefix("ns.issue.")]).unwrap();
        let found = history.range(None, None, Some(&rules)).unwrap();
        assert_eq!(ids(&found), vec![1, 3]);
        assert_eq!(found[0].1, vec![TopicRule::prefix("ns.issue.")]);

        let nothing = CompiledRuleSet::compile(vec![]).unwrap();
        assert!(history.range(None, None, Some(&nothing)).unwrap().is_empty());
    }

    #[test]
    fn test_range_rejects_inverted_bounds() {
        let history = repository_history();
        history.save(&envelope(1, "ns.a")).unwrap();
        assert!(history
            .range(Some(SequenceId(3)), Some(SequenceId(1)), None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_repository_watermarks() {
        let history = repository_history();
        assert_eq!(history.last_sequence_id().unwrap(), SequenceId(0));

        history.save(&envelope(4, "ns.a")).unwrap();
        history.save(&envelope(9, "ns.a")).unwrap();
        assert_eq!(history.last_sequence_id().unwrap(), SequenceId(9));

        history.mark_forwarded(SequenceId(4)).unwrap();
        assert_eq!(history.last_forwarded_sequence_id().unwrap(), SequenceId(4));

        // Never past the last stored id.
        history.mark_forwarded(SequenceId(50)).unwrap();
        assert_eq!(history.last_forwarded_sequence_id().unwrap(), SequenceId(9));
    }

    #[test]
    fn test_global_save_leaves_counter_alone() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let layout = KeyLayout::new("ns.");
        let history = HistoryStore::global(Arc::clone(&backend), &layout);

        backend
            .set(&layout.scope(Scope::Global).last_sequence_id(), 10)
            .unwrap();
        history.save(&envelope(3, "ns.a")).unwrap();
        assert_eq!(history.last_sequence_id().unwrap(), SequenceId(10));
    }

    #[test]
    fn test_clean_removes_below_cutoff() {
        let history = repository_history();
        for id in 1..=8 {
            let topic = if id % 2 == 0 { "ns.even" } else { "ns.odd" };
            history.save(&envelope(id, topic)).unwrap();
        }
        history.save(&envelope(9, "ns.old")).unwrap();

        let removed = history.clean(SequenceId(5)).unwrap();
        assert_eq!(removed, 4);
        assert_eq!(ids(&history.range(None, None, None).unwrap()), vec![5, 6, 7, 8, 9]);

        history.clean(SequenceId(100)).unwrap();
        assert!(history.topics().unwrap().is_empty());
        assert_eq!(history.message_count().unwrap(), 0);
    }

    #[test]
    fn test_contains() {
        let history = repository_history();
        history.save(&envelope(2, "ns.a")).unwrap();
        history.save(&envelope(5, "ns.b")).unwrap();

        assert!(history.contains(SequenceId(2)).unwrap());
        assert!(history.contains(SequenceId(5)).unwrap());
        assert!(!history.contains(SequenceId(3)).unwrap());
    }

    #[test]
    fn test_destroy() {
        let history = repository_history();
        history.save(&envelope(1, "ns.a")).unwrap();
        history.mark_forwarded(SequenceId(1)).unwrap();

        history.destroy().unwrap();
        assert!(history.topics().unwrap().is_empty());
        assert_eq!(history.last_sequence_id().unwrap(), SequenceId(0));
        assert_eq!(history.last_forwarded_sequence_id().unwrap(), SequenceId(0));
    }
}
