//! Natural key to surrogate key resolution.
//!
//! Each entity kind resolves the same way: derive the natural key, answer from
//! the identity cache when possible, otherwise ask the store to get-or-create
//! the row and remember the result. Concurrent first-use of one key is settled
//! by the store's atomic upsert, not by any lock in this process.

use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use compliance_contracts::canonical::{self, MalformedInputError};
use compliance_contracts::{Cluster, ClusterKey, ParentPolicy, ParentPolicyKey, Policy, PolicyKey};
use compliance_store::{ComplianceStore, StoreError};

use crate::identity_cache::{IdentityCache, IdentityCaches};

#[derive(Debug)]
pub enum ResolveError {
    MissingField(String),
    UnresolvableReference { spec_hash: String },
    MalformedInput(MalformedInputError),
    Store(StoreError),
}

impl ResolveError {
    /// Whether the caller can fix this by changing the request.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, ResolveError::Store(_))
    }
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::MissingField(field) => write!(f, "required field not provided: {}", field),
            ResolveError::UnresolvableReference { .. } => write!(
                f,
                "could not determine the spec from the provided spec hash; the spec is required in the request"
            ),
            ResolveError::MalformedInput(err) => write!(f, "{}", err),
            ResolveError::Store(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ResolveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResolveError::MalformedInput(err) => Some(err),
            ResolveError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ResolveError {
    fn from(value: StoreError) -> Self {
        ResolveError::Store(value)
    }
}

impl From<MalformedInputError> for ResolveError {
    fn from(value: MalformedInputError) -> Self {
        ResolveError::MalformedInput(value)
    }
}

/// A record that carries a natural key the store can turn into a surrogate key.
#[async_trait]
pub trait Resolvable: Sync {
    type Key: Clone + Eq + Hash + Send + Sync;

    const KIND: &'static str;

    fn derive_key(&self) -> Result<Self::Key, ResolveError>;

    fn cache(caches: &IdentityCaches) -> &IdentityCache<Self::Key>;

    async fn get_or_create(
        &self,
        key: &Self::Key,
        store: &dyn ComplianceStore,
    ) -> Result<i64, ResolveError>;
}

#[async_trait]
impl Resolvable for Cluster {
    type Key = ClusterKey;

    const KIND: &'static str = "cluster";

    fn derive_key(&self) -> Result<ClusterKey, ResolveError> {
        let key = Cluster::natural_key(self);
        if key.identifier.is_empty() {
            return Err(ResolveError::MissingField("cluster.identifier".to_string()));
        }
        Ok(key)
    }

    fn cache(caches: &IdentityCaches) -> &IdentityCache<ClusterKey> {
        &caches.clusters
    }

    async fn get_or_create(
        &self,
        key: &ClusterKey,
        store: &dyn ComplianceStore,
    ) -> Result<i64, ResolveError> {
        Ok(store.get_or_create_cluster(key, self.display_name()).await?)
    }
}

#[async_trait]
impl Resolvable for ParentPolicy {
    type Key = ParentPolicyKey;

    const KIND: &'static str = "parent_policy";

    fn derive_key(&self) -> Result<ParentPolicyKey, ResolveError> {
        let key = ParentPolicy::natural_key(self);
        if key.name.is_empty() {
            return Err(ResolveError::MissingField("parentPolicy.name".to_string()));
        }
        if key.namespace.is_empty() {
            return Err(ResolveError::MissingField(
                "parentPolicy.namespace".to_string(),
            ));
        }
        Ok(key)
    }

    fn cache(caches: &IdentityCaches) -> &IdentityCache<ParentPolicyKey> {
        &caches.parent_policies
    }

    async fn get_or_create(
        &self,
        key: &ParentPolicyKey,
        store: &dyn ComplianceStore,
    ) -> Result<i64, ResolveError> {
        Ok(store.get_or_create_parent_policy(key).await?)
    }
}

#[async_trait]
impl Resolvable for Policy {
    type Key = PolicyKey;

    const KIND: &'static str = "policy";

    /// Uses the supplied spec hash, or hashes the spec text when no hash was given.
    fn derive_key(&self) -> Result<PolicyKey, ResolveError> {
        let spec_hash = match (self.supplied_spec_hash(), self.spec_text()) {
            (Some(hash), _) => hash.to_string(),
            (None, Some(spec)) => canonical::hash_spec(spec)?,
            (None, None) => {
                return Err(ResolveError::MissingField(
                    "policy.spec or policy.specHash".to_string(),
                ));
            }
        };

        let name = self.name.trim();
        if name.is_empty() {
            return Err(ResolveError::MissingField("policy.name".to_string()));
        }
        let namespace = self.namespace.trim();
        if namespace.is_empty() {
            return Err(ResolveError::MissingField("policy.namespace".to_string()));
        }

        Ok(PolicyKey {
            name: name.to_string(),
            namespace: namespace.to_string(),
            spec_hash,
        })
    }

    fn cache(caches: &IdentityCaches) -> &IdentityCache<PolicyKey> {
        &caches.policies
    }

    async fn get_or_create(
        &self,
        key: &PolicyKey,
        store: &dyn ComplianceStore,
    ) -> Result<i64, ResolveError> {
        // The spec is stored as sent; its hash already covers the compact form.
        let spec = match self.spec_text() {
            Some(spec) => {
                canonical::canonicalize_spec(spec)?;
                spec.to_string()
            }
            None => store.spec_by_hash(&key.spec_hash).await?.ok_or_else(|| {
                ResolveError::UnresolvableReference {
                    spec_hash: key.spec_hash.clone(),
                }
            })?,
        };

        Ok(store.get_or_create_policy(key, &spec).await?)
    }
}

/// Resolves surrogate keys for all three entity kinds against one store and
/// one set of identity caches. Cloning shares both.
#[derive(Clone)]
pub struct Resolver {
    store: Arc<dyn ComplianceStore>,
    caches: IdentityCaches,
}

impl Resolver {
    pub fn new(store: Arc<dyn ComplianceStore>, caches: IdentityCaches) -> Self {
        Self { store, caches }
    }

    pub fn store(&self) -> &Arc<dyn ComplianceStore> {
        &self.store
    }

    pub fn caches(&self) -> &IdentityCaches {
        &self.caches
    }

    pub async fn resolve<R: Resolvable>(&self, record: &R) -> Result<i64, ResolveError> {
        let key = record.derive_key()?;
        let cache = R::cache(&self.caches);

        if let Some(surrogate_key) = cache.lookup(&key) {
            crate::metrics::observe_cache_lookup(R::KIND, true);
            return Ok(surrogate_key);
        }
        crate::metrics::observe_cache_lookup(R::KIND, false);

        let result = record.get_or_create(&key, self.store.as_ref()).await;
        crate::metrics::observe_get_or_create(R::KIND, result.is_ok());
        let surrogate_key = result?;

        tracing::debug!(kind = R::KIND, surrogate_key, "identity resolved from store");
        cache.insert(key, surrogate_key);

        Ok(surrogate_key)
    }
}

#[cfg(test)]
mod tests {
    use compliance_store::memory::MemoryStore;

    use super::*;

    fn resolver_with(store: Arc<MemoryStore>) -> Resolver {
        Resolver::new(store, IdentityCaches::new())
    }

    fn cluster(identifier: &str) -> Cluster {
        Cluster {
            identifier: identifier.to_string(),
            name: None,
        }
    }

    fn policy_with_spec(spec: &str) -> Policy {
        Policy {
            name: "p1".to_string(),
            namespace: "ns".to_string(),
            spec: Some(spec.to_string()),
            spec_hash: None,
        }
    }

    #[tokio::test]
    async fn second_resolution_is_served_from_cache() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver_with(store.clone());

        let first = resolver.resolve(&cluster("c1")).await.unwrap();
        let second = resolver.resolve(&cluster("c1")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.get_or_create_calls(), 1);
        assert_eq!(resolver.caches().clusters.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_use_agrees_on_one_key() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver_with(store.clone());

        let mut handles = Vec::new();
        for _ in 0..32 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move {
                resolver
                    .resolve(&policy_with_spec(r#"{"a":1}"#))
                    .await
                    .unwrap()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();

        assert_eq!(ids.len(), 1);
        assert_eq!(store.policy_count(), 1);
    }

    #[tokio::test]
    async fn hash_only_policy_requires_a_known_spec() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver_with(store.clone());
        let spec_hash = canonical::hash_spec(r#"{"a":1}"#).unwrap();

        let hash_only = Policy {
            spec: None,
            spec_hash: Some(spec_hash.clone()),
            ..policy_with_spec("")
        };

        let err = resolver.resolve(&hash_only).await.unwrap_err();
        assert!(matches!(err, ResolveError::UnresolvableReference { .. }));
        assert!(err.is_client_error());
        assert_eq!(store.policy_count(), 0);

        let with_spec = resolver
            .resolve(&policy_with_spec("{ \"a\": 1 }"))
            .await
            .unwrap();

        // A fresh cache forces the hash-only path through the store lookup.
        let cold = resolver_with(store.clone());
        let by_hash = cold.resolve(&hash_only).await.unwrap();
        assert_eq!(with_spec, by_hash);
        assert_eq!(store.spec_lookups(), 2);
        assert_eq!(store.policy_count(), 1);
    }

    #[tokio::test]
    async fn hash_only_policy_hits_cache_without_spec_lookup() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver_with(store.clone());

        let id = resolver
            .resolve(&policy_with_spec(r#"{"a":1}"#))
            .await
            .unwrap();
        let hash_only = Policy {
            spec: None,
            spec_hash: Some(canonical::hash_spec(r#"{"a":1}"#).unwrap()),
            ..policy_with_spec("")
        };

        assert_eq!(resolver.resolve(&hash_only).await.unwrap(), id);
        assert_eq!(store.spec_lookups(), 0);
        assert_eq!(store.get_or_create_calls(), 1);
    }

    #[tokio::test]
    async fn spec_is_stored_as_sent() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver_with(store.clone());
        let sent = "{ \"n\": 18446744073709551617, \"x\": 1e2 }";

        resolver.resolve(&policy_with_spec(sent)).await.unwrap();

        let spec_hash = canonical::hash_spec(sent).unwrap();
        assert_eq!(
            store.spec_by_hash(&spec_hash).await.unwrap().as_deref(),
            Some(sent)
        );
    }

    #[tokio::test]
    async fn policy_without_spec_or_hash_is_missing_a_field() {
        let resolver = resolver_with(Arc::new(MemoryStore::new()));
        let policy = Policy {
            spec: None,
            ..policy_with_spec("")
        };

        let err = resolver.resolve(&policy).await.unwrap_err();
        assert!(matches!(err, ResolveError::MissingField(_)));
    }

    #[tokio::test]
    async fn malformed_spec_is_a_client_error() {
        let resolver = resolver_with(Arc::new(MemoryStore::new()));
        let err = resolver
            .resolve(&policy_with_spec("{broken"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::MalformedInput(_)));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn parent_policy_label_order_does_not_create_new_rows() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver_with(store.clone());

        let a = ParentPolicy {
            name: "parent".to_string(),
            namespace: "ns".to_string(),
            categories: vec!["b".to_string(), "a".to_string()],
            controls: Vec::new(),
            standards: Vec::new(),
        };
        let b = ParentPolicy {
            categories: vec!["a".to_string(), "b".to_string()],
            ..a.clone()
        };

        assert_eq!(
            resolver.resolve(&a).await.unwrap(),
            resolver.resolve(&b).await.unwrap()
        );
        assert_eq!(store.parent_policy_count(), 1);
        assert_eq!(store.get_or_create_calls(), 1);
    }

    #[tokio::test]
    async fn store_failure_is_not_cached() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver_with(store.clone());

        store.set_unavailable(true);
        let err = resolver.resolve(&cluster("c1")).await.unwrap_err();
        assert!(!err.is_client_error());
        assert!(resolver.caches().clusters.is_empty());

        store.set_unavailable(false);
        resolver.resolve(&cluster("c1")).await.unwrap();
        assert_eq!(resolver.caches().clusters.len(), 1);
    }
}
