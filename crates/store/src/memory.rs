//! In-process [`ComplianceStore`] used by tests and local runs without Postgres.
//!
//! Get-or-create holds one lock across the lookup and the insert, which gives
//! it the same atomicity as the Postgres upserts. Call counters let callers
//! observe how often the store was actually reached.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use compliance_contracts::{ClusterKey, EventDetails, ParentPolicyKey, PolicyKey};

use crate::{ComplianceStore, EventRecord, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub event_id: i64,
    pub cluster_id: i64,
    pub parent_policy_id: Option<i64>,
    pub policy_id: i64,
    pub event: EventDetails,
}

#[derive(Default)]
struct Tables {
    next_id: i64,
    clusters: HashMap<ClusterKey, (i64, Option<String>)>,
    parent_policies: HashMap<ParentPolicyKey, i64>,
    policies: HashMap<PolicyKey, (i64, String)>,
    events: Vec<StoredEvent>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    get_or_create_calls: AtomicUsize,
    spec_lookups: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn get_or_create_calls(&self) -> usize {
        self.get_or_create_calls.load(Ordering::SeqCst)
    }

    pub fn spec_lookups(&self) -> usize {
        self.spec_lookups.load(Ordering::SeqCst)
    }

    pub fn cluster_count(&self) -> usize {
        self.with_tables(|t| t.clusters.len())
    }

    pub fn cluster_name(&self, key: &ClusterKey) -> Option<String> {
        self.with_tables(|t| t.clusters.get(key).and_then(|(_, name)| name.clone()))
    }

    pub fn parent_policy_count(&self) -> usize {
        self.with_tables(|t| t.parent_policies.len())
    }

    pub fn policy_count(&self) -> usize {
        self.with_tables(|t| t.policies.len())
    }

    pub fn events(&self) -> Vec<StoredEvent> {
        self.with_tables(|t| t.events.clone())
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        let mut tables = self
            .tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut tables)
    }

    async fn enter(&self) -> Result<(), StoreError> {
        // Give concurrent callers a chance to interleave, as a network round-trip would.
        tokio::task::yield_now().await;
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ComplianceStore for MemoryStore {
    async fn get_or_create_cluster(
        &self,
        key: &ClusterKey,
        name: Option<&str>,
    ) -> Result<i64, StoreError> {
        self.enter().await?;
        self.get_or_create_calls.fetch_add(1, Ordering::SeqCst);

        Ok(self.with_tables(|t| {
            if let Some((id, stored_name)) = t.clusters.get_mut(key) {
                if let Some(name) = name {
                    *stored_name = Some(name.to_string());
                }
                return *id;
            }
            let id = t.allocate_id();
            t.clusters
                .insert(key.clone(), (id, name.map(|s| s.to_string())));
            id
        }))
    }

    async fn get_or_create_parent_policy(&self, key: &ParentPolicyKey) -> Result<i64, StoreError> {
        self.enter().await?;
        self.get_or_create_calls.fetch_add(1, Ordering::SeqCst);

        Ok(self.with_tables(|t| {
            if let Some(id) = t.parent_policies.get(key) {
                return *id;
            }
            let id = t.allocate_id();
            t.parent_policies.insert(key.clone(), id);
            id
        }))
    }

    async fn get_or_create_policy(&self, key: &PolicyKey, spec: &str) -> Result<i64, StoreError> {
        self.enter().await?;
        self.get_or_create_calls.fetch_add(1, Ordering::SeqCst);

        Ok(self.with_tables(|t| {
            if let Some((id, _)) = t.policies.get(key) {
                return *id;
            }
            let id = t.allocate_id();
            t.policies.insert(key.clone(), (id, spec.to_string()));
            id
        }))
    }

    async fn spec_by_hash(&self, spec_hash: &str) -> Result<Option<String>, StoreError> {
        self.enter().await?;
        self.spec_lookups.fetch_add(1, Ordering::SeqCst);

        Ok(self.with_tables(|t| {
            t.policies
                .iter()
                .find(|(key, _)| key.spec_hash == spec_hash)
                .map(|(_, (_, spec))| spec.clone())
        }))
    }

    async fn insert_event(&self, record: EventRecord<'_>) -> Result<i64, StoreError> {
        self.enter().await?;

        Ok(self.with_tables(|t| {
            let event_id = t.allocate_id();
            t.events.push(StoredEvent {
                event_id,
                cluster_id: record.cluster_id,
                parent_policy_id: record.parent_policy_id,
                policy_id: record.policy_id,
                event: record.event.clone(),
            });
            event_id
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.enter().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn cluster_key(identifier: &str) -> ClusterKey {
        ClusterKey {
            identifier: identifier.to_string(),
        }
    }

    #[tokio::test]
    async fn get_or_create_returns_existing_row() {
        let store = MemoryStore::new();

        let first = store
            .get_or_create_cluster(&cluster_key("c1"), None)
            .await
            .unwrap();
        let second = store
            .get_or_create_cluster(&cluster_key("c1"), Some("cluster one"))
            .await
            .unwrap();
        let other = store
            .get_or_create_cluster(&cluster_key("c2"), None)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(store.cluster_count(), 2);
        assert_eq!(store.get_or_create_calls(), 3);
        assert_eq!(
            store.cluster_name(&cluster_key("c1")).as_deref(),
            Some("cluster one")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_get_or_create_yields_one_row() {
        let store = Arc::new(MemoryStore::new());
        let key = PolicyKey {
            name: "p".to_string(),
            namespace: "ns".to_string(),
            spec_hash: "a".repeat(40),
        };

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.get_or_create_policy(&key, "{}").await.unwrap()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.policy_count(), 1);
    }

    #[tokio::test]
    async fn spec_by_hash_finds_stored_spec() {
        let store = MemoryStore::new();
        let key = PolicyKey {
            name: "p".to_string(),
            namespace: "ns".to_string(),
            spec_hash: "b".repeat(40),
        };
        assert_eq!(store.spec_by_hash(&key.spec_hash).await.unwrap(), None);

        store
            .get_or_create_policy(&key, r#"{"a":1}"#)
            .await
            .unwrap();
        assert_eq!(
            store.spec_by_hash(&key.spec_hash).await.unwrap().as_deref(),
            Some(r#"{"a":1}"#)
        );
        assert_eq!(store.spec_lookups(), 2);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let err = store.ping().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(
            store
                .get_or_create_cluster(&cluster_key("c1"), None)
                .await
                .is_err()
        );
        assert_eq!(store.cluster_count(), 0);
    }
}
