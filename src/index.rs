//! Cross-scope repository index.
//!
//! One sorted set keyed by sequence id whose members record the owning
//! repository (or none) of every retained message. It is the only structure
//! spanning scopes: range queries use it to discover which repository
//! histories hold messages in a given interval, and reconciliation uses it
//! to decide whether a client's position is still retained.

use crate::backend::Backend;
use crate::error::{BusError, Result};
use crate::history::KeyLayout;
use crate::types::{IndexEntry, RepositoryId, Scope, SequenceId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The repository index of one bus namespace.
pub struct RepositoryIndex {
    backend: Arc<dyn Backend>,
    key: String,
}

impl RepositoryIndex {
    pub fn new(backend: Arc<dyn Backend>, layout: &KeyLayout) -> Self {
        Self {
            backend,
            key: layout.repository_index(),
        }
    }

    /// Record the owner of a freshly persisted message.
    pub fn add(&self, entry: IndexEntry) -> Result<()> {
        self.backend
            .zadd(&self.key, entry.sequence_id.0, rmp_serde::to_vec(&entry)?)
    }

    /// Whether `id` is still retained.
    pub fn contains(&self, id: SequenceId) -> Result<bool> {
        Ok(!self.backend.zrange(&self.key, Some(id.0), Some(id.0))?.is_empty())
    }

    /// Owning scope of every retained sequence id in `[first, last]`, read
    /// in one query.
    pub fn entries(
        &self,
        first: Option<SequenceId>,
        last: Option<SequenceId>,
    ) -> Result<BTreeMap<SequenceId, Scope>> {
        self.backend
            .zrange(&self.key, first.map(|id| id.0), last.map(|id| id.0))?
            .into_iter()
            .map(|(score, member)| {
                let entry = decode(score, &member)?;
                Ok((entry.sequence_id, entry.scope()))
            })
            .collect()
    }

    /// Rewrite every entry owned by `repository_id` as a global entry.
    ///
    /// Returns the number of entries rewritten.
    pub fn rescope(&self, repository_id: RepositoryId) -> Result<usize> {
        let mut rewritten = 0;
        for (sequence_id, scope) in self.entries(None, None)? {
            if scope == Scope::Repository(repository_id) {
                self.add(IndexEntry {
                    sequence_id,
                    repository_id: None,
                })?;
                rewritten += 1;
            }
        }
        Ok(rewritten)
    }

    /// Remove every entry below `min_to_keep`.
    pub fn clean(&self, min_to_keep: SequenceId) -> Result<usize> {
        self.backend.zremrange_below(&self.key, min_to_keep.0)
    }

    pub fn len(&self) -> Result<usize> {
        self.backend.zcard(&self.key)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Oldest retained sequence id.
    pub fn first_sequence_id(&self) -> Result<Option<SequenceId>> {
        Ok(self
            .backend
            .zrange(&self.key, None, None)?
            .first()
            .map(|(score, _)| SequenceId(*score)))
    }
}

fn decode(score: u64, member: &[u8]) -> Result<IndexEntry> {
    let entry: IndexEntry = rmp_serde::from_slice(member)?;
    if entry.sequence_id.0 != score {
        return Err(BusError::Corruption(format!(
            "index entry for {} stored at score {}",
            entry.sequence_id, score
        )));
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn index() -> RepositoryIndex {
        RepositoryIndex::new(Arc::new(MemoryBackend::new()), &KeyLayout::new("ns."))
    }

    fn entry(id: u64, repository: Option<u64>) -> IndexEntry {
        IndexEntry {
            sequence_id: SequenceId(id),
            repository_id: repository.map(RepositoryId),
        }
    }

    #[test]
    fn test_entries_in_range() {
        let index = index();
        index.add(entry(1, None)).unwrap();
        index.add(entry(2, Some(7))).unwrap();
        index.add(entry(3, Some(4))).unwrap();
        index.add(entry(4, Some(7))).unwrap();

        let entries = index.entries(Some(SequenceId(2)), Some(SequenceId(3))).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[&SequenceId(3)], Scope::Repository(RepositoryId(4)));

        let all = index.entries(None, None).unwrap();
        assert_eq!(all[&SequenceId(1)], Scope::Global);
        assert_eq!(all.keys().next_back(), Some(&SequenceId(4)));

        assert!(index
            .entries(Some(SequenceId(5)), None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_contains_and_clean() {
        let index = index();
        for id in 1..=6 {
            index.add(entry(id, None)).unwrap();
        }
        assert!(index.contains(SequenceId(2)).unwrap());
        assert!(!index.contains(SequenceId(9)).unwrap());

        assert_eq!(index.clean(SequenceId(4)).unwrap(), 3);
        assert!(!index.contains(SequenceId(2)).unwrap());
        assert_eq!(index.first_sequence_id().unwrap(), Some(SequenceId(4)));
        assert_eq!(index.len().unwrap(), 3);
    }

    #[test]
    fn test_rescope() {
        let index = index();
        index.add(entry(1, Some(5))).unwrap();
        index.add(entry(2, Some(6))).unwrap();
        index.add(entry(3, Some(5))).unwrap();

        assert_eq!(index.rescope(RepositoryId(5)).unwrap(), 2);

        let entries = index.entries(None, None).unwrap();
        assert_eq!(entries[&SequenceId(1)], Scope::Global);
        assert_eq!(entries[&SequenceId(2)], Scope::Repository(RepositoryId(6)));
        assert_eq!(entries[&SequenceId(3)], Scope::Global);
        assert_eq!(index.len().unwrap(), 3);
    }

    #[test]
    fn test_empty_index() {
        let index = index();
        assert!(index.is_empty().unwrap());
        assert_eq!(index.first_sequence_id().unwrap(), None);
    }
}
