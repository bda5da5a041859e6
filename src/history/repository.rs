//! Lazily created per-repository histories.

use super::keys::{parse_repository_id, KeyLayout};
use super::store::HistoryStore;
use crate::backend::Backend;
use crate::error::Result;
use crate::types::{RepositoryId, Scope};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of repository histories.
///
/// Handles are cached per process; the set of known repositories lives in
/// the backend so every process sharing it sees the same registry.
pub struct RepositoryHistories {
    backend: Arc<dyn Backend>,
    layout: KeyLayout,
    cache: RwLock<HashMap<RepositoryId, Arc<HistoryStore>>>,
}

impl RepositoryHistories {
    pub fn new(backend: Arc<dyn Backend>, layout: KeyLayout) -> Self {
        Self {
            backend,
            layout,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// History handle for a repository, without registering it.
    pub fn get(&self, id: RepositoryId) -> Arc<HistoryStore> {
        if let Some(history) = self.cache.read().get(&id) {
            return Arc::clone(history);
        }

        let mut cache = self.cache.write();
        let history = cache.entry(id).or_insert_with(|| {
            Arc::new(HistoryStore::for_scope(
                Arc::clone(&self.backend),
                &self.layout,
                Scope::Repository(id),
            ))
        });
        Arc::clone(history)
    }

    /// History handle for a repository about to receive a message.
    pub fn get_or_create(&self, id: RepositoryId) -> Result<Arc<HistoryStore>> {
        if self.backend.sadd(&self.layout.repositories(), &id.to_string())? {
            tracing::debug!(repository_id = %id, "registered repository history");
        }
        Ok(self.get(id))
    }

    /// Every repository that has stored a message and not been removed.
    pub fn known(&self) -> Result<Vec<RepositoryId>> {
        let mut ids: Vec<_> = self
            .backend
            .smembers(&self.layout.repositories())?
            .iter()
            .filter_map(|member| parse_repository_id(member))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Drop a repository from the registry and the local cache.
    ///
    /// Does not touch the repository's stored keys.
    pub fn forget(&self, id: RepositoryId) -> Result<bool> {
        self.cache.write().remove(&id);
        self.backend.srem(&self.layout.repositories(), &id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn histories(backend: Arc<dyn Backend>) -> RepositoryHistories {
        RepositoryHistories::new(backend, KeyLayout::new("ns."))
    }

    #[test]
    fn test_get_does_not_register() {
        let registry = histories(Arc::new(MemoryBackend::new()));
        let history = registry.get(RepositoryId(3));
        assert_eq!(history.scope(), Scope::Repository(RepositoryId(3)));
        assert!(registry.known().unwrap().is_empty());
    }

    #[test]
    fn test_registry_is_shared_through_backend() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let first = histories(Arc::clone(&backend));
        let second = histories(Arc::clone(&backend));

        first.get_or_create(RepositoryId(9)).unwrap();
        first.get_or_create(RepositoryId(2)).unwrap();
        first.get_or_create(RepositoryId(9)).unwrap();

        assert_eq!(
            second.known().unwrap(),
            vec![RepositoryId(2), RepositoryId(9)]
        );

        assert!(second.forget(RepositoryId(9)).unwrap());
        assert_eq!(first.known().unwrap(), vec![RepositoryId(2)]);
    }

    #[test]
    fn test_handles_are_cached() {
        let registry = histories(Arc::new(MemoryBackend::new()));
        let a = registry.get_or_create(RepositoryId(1)).unwrap();
        let b = registry.get(RepositoryId(1));
        assert!(Arc::ptr_eq(&a, &b));
    }
}
