//! Backend key layout.
//!
//! All keys live under the bus namespace:
//! - `{ns}global:*` / `{ns}repository:{id}:*` - one prefix per scope
//! - `{scope}:topics` - set of topics with stored messages
//! - `{scope}:topic:{topic}` - sorted set of envelopes by sequence id
//! - `{scope}:last_msg_id` / `{scope}:last_msg_id_sent` - scope watermarks
//! - `{ns}repository_index` - cross-scope index by sequence id
//! - `{ns}repositories` - set of repository ids with a history
//! - `{ns}lock:{name}` - lease backing a distributed lock

use crate::types::{RepositoryId, Scope};

/// Key builder for one bus namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyLayout {
    namespace: String,
}

impl KeyLayout {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn scope(&self, scope: Scope) -> ScopeKeys {
        let prefix = match scope {
            Scope::Global => format!("{}global", self.namespace),
            Scope::Repository(id) => format!("{}repository:{}", self.namespace, id),
        };
        ScopeKeys { prefix }
    }

    pub fn repository_index(&self) -> String {
        format!("{}repository_index", self.namespace)
    }

    pub fn repositories(&self) -> String {
        format!("{}repositories", self.namespace)
    }

    pub fn lock(&self, name: &str) -> String {
        format!("{}lock:{}", self.namespace, name)
    }
}

/// Keys of one scope's history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeKeys {
    prefix: String,
}

impl ScopeKeys {
    pub fn topics(&self) -> String {
        format!("{}:topics", self.prefix)
    }

    pub fn topic(&self, topic: &str) -> String {
        format!("{}:topic:{}", self.prefix, topic)
    }

    pub fn last_sequence_id(&self) -> String {
        format!("{}:last_msg_id", self.prefix)
    }

    pub fn last_forwarded_sequence_id(&self) -> String {
        format!("{}:last_msg_id_sent", self.prefix)
    }
}

/// Parse a member of the repositories set.
pub(crate) fn parse_repository_id(member: &str) -> Option<RepositoryId> {
    member.parse().ok().map(RepositoryId)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scopes_do_not_collide() {
        let layout = KeyLayout::new("ns.");
        let global = layout.scope(Scope::Global);
        let repo = layout.scope(Scope::Repository(RepositoryId(3)));

        assert_eq!(global.topic("ns.a"), "ns.global:topic:ns.a");
        assert_eq!(repo.topic("ns.a"), "ns.repository:3:topic:ns.a");
        assert_ne!(global.last_sequence_id(), repo.last_sequence_id());
    }

    #[test]
    fn test_parse_repository_id() {
        assert_eq!(parse_repository_id("12"), Some(RepositoryId(12)));
        assert_eq!(parse_repository_id("x"), None);
    }
}
