use std::hash::Hash;
use std::sync::Arc;

use compliance_contracts::{ClusterKey, ParentPolicyKey, PolicyKey};
use dashmap::DashMap;

/// Append-only map from a natural key to the surrogate key the store assigned.
///
/// Entries are never evicted or expired: a natural key always maps to the same
/// row, so a stale entry cannot exist.
#[derive(Clone)]
pub struct IdentityCache<K: Eq + Hash> {
    entries: Arc<DashMap<K, i64>>,
}

impl<K: Eq + Hash> Default for IdentityCache<K> {
    fn default() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }
}

impl<K: Eq + Hash> IdentityCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &K) -> Option<i64> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    /// Redundant inserts are harmless; racing inserts for one key carry the
    /// same store-assigned value, so the last write wins.
    pub fn insert(&self, key: K, surrogate_key: i64) {
        self.entries.insert(key, surrogate_key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One cache per entity kind. Cloning shares the underlying maps.
#[derive(Clone, Default)]
pub struct IdentityCaches {
    pub clusters: IdentityCache<ClusterKey>,
    pub parent_policies: IdentityCache<ParentPolicyKey>,
    pub policies: IdentityCache<PolicyKey>,
}

impl IdentityCaches {
    pub fn new() -> Self {
        Self::default()
    }
}
