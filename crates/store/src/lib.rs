use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use compliance_contracts::{ClusterKey, EventDetails, ParentPolicyKey, PolicyKey};
use sqlx::Row;
use sqlx::postgres::PgPoolOptions;

pub mod memory;

#[derive(Debug)]
pub enum StoreError {
    Timeout,
    Sqlx(sqlx::Error),
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout => write!(f, "store operation timed out"),
            StoreError::Sqlx(err) => write!(f, "store sql error: {}", err),
            StoreError::Unavailable(reason) => write!(f, "store unavailable: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Sqlx(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Sqlx(value)
    }
}

/// Surrogate keys and event fields for one event row.
#[derive(Debug, Clone, Copy)]
pub struct EventRecord<'a> {
    pub cluster_id: i64,
    pub parent_policy_id: Option<i64>,
    pub policy_id: i64,
    pub event: &'a EventDetails,
}

/// The relational store behind the ingestion API.
///
/// Every `get_or_create_*` call must be a single atomic conditional write
/// keyed on the natural key: callers never serialize concurrent creators
/// themselves and rely on the store to hand all of them the same row.
#[async_trait]
pub trait ComplianceStore: Send + Sync {
    async fn get_or_create_cluster(
        &self,
        key: &ClusterKey,
        name: Option<&str>,
    ) -> Result<i64, StoreError>;

    async fn get_or_create_parent_policy(&self, key: &ParentPolicyKey) -> Result<i64, StoreError>;

    /// `spec` is the text as sent; `key.spec_hash` is the hash of its compact form.
    async fn get_or_create_policy(&self, key: &PolicyKey, spec: &str) -> Result<i64, StoreError>;

    /// Read-only lookup of any stored spec with this hash.
    async fn spec_by_hash(&self, spec_hash: &str) -> Result<Option<String>, StoreError>;

    async fn insert_event(&self, record: EventRecord<'_>) -> Result<i64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn close(&self) {}
}

#[derive(Clone)]
pub struct PgStore {
    pool: sqlx::PgPool,
    op_timeout: Duration,
}

impl PgStore {
    pub async fn connect(
        db_url: &str,
        max_connections: u32,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(db_url),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(Self { pool, op_timeout })
    }

    /// Builds the pool without opening a connection; connection failures
    /// surface on the first store call instead.
    pub fn connect_lazy(
        db_url: &str,
        max_connections: u32,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(db_url)?;

        Ok(Self { pool, op_timeout })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        max_connections: u32,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let store = Self::connect(db_url, max_connections, op_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        tracing::info!("store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, StoreError> {
        Ok(tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout)??)
    }
}

#[async_trait]
impl ComplianceStore for PgStore {
    async fn get_or_create_cluster(
        &self,
        key: &ClusterKey,
        name: Option<&str>,
    ) -> Result<i64, StoreError> {
        self.bounded(
            sqlx::query_scalar::<_, i64>(
                "INSERT INTO clusters (cluster_id, name) VALUES ($1, $2) ON CONFLICT (cluster_id) DO UPDATE SET name = COALESCE(EXCLUDED.name, clusters.name) RETURNING id",
            )
            .bind(&key.identifier)
            .bind(name)
            .fetch_one(&self.pool),
        )
        .await
    }

    async fn get_or_create_parent_policy(&self, key: &ParentPolicyKey) -> Result<i64, StoreError> {
        self.bounded(
            sqlx::query_scalar::<_, i64>(
                "INSERT INTO parent_policies (name, namespace, categories, controls, standards) VALUES ($1, $2, $3, $4, $5) ON CONFLICT (name, namespace, categories, controls, standards) DO UPDATE SET name = EXCLUDED.name RETURNING id",
            )
            .bind(&key.name)
            .bind(&key.namespace)
            .bind(&key.categories)
            .bind(&key.controls)
            .bind(&key.standards)
            .fetch_one(&self.pool),
        )
        .await
    }

    async fn get_or_create_policy(&self, key: &PolicyKey, spec: &str) -> Result<i64, StoreError> {
        self.bounded(
            sqlx::query_scalar::<_, i64>(
                "INSERT INTO policies (name, namespace, spec, spec_hash) VALUES ($1, $2, $3, $4) ON CONFLICT (name, namespace, spec_hash) DO UPDATE SET spec_hash = EXCLUDED.spec_hash RETURNING id",
            )
            .bind(&key.name)
            .bind(&key.namespace)
            .bind(spec)
            .bind(&key.spec_hash)
            .fetch_one(&self.pool),
        )
        .await
    }

    async fn spec_by_hash(&self, spec_hash: &str) -> Result<Option<String>, StoreError> {
        let row = self
            .bounded(
                sqlx::query("SELECT spec FROM policies WHERE spec_hash = $1 LIMIT 1")
                    .bind(spec_hash)
                    .fetch_optional(&self.pool),
            )
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get::<String, _>("spec")?)),
            None => Ok(None),
        }
    }

    async fn insert_event(&self, record: EventRecord<'_>) -> Result<i64, StoreError> {
        let event = record.event;

        self.bounded(
            sqlx::query_scalar::<_, i64>(
                "INSERT INTO compliance_events (cluster_id, parent_policy_id, policy_id, compliance, message, \"timestamp\", metadata, reported_by) VALUES ($1, $2, $3, $4, $5, $6::timestamptz, $7, $8) RETURNING id",
            )
            .bind(record.cluster_id)
            .bind(record.parent_policy_id)
            .bind(record.policy_id)
            .bind(event.compliance.map(|c| c.as_str()))
            .bind(event.message.as_deref())
            .bind(event.timestamp.as_deref())
            .bind(event.metadata.as_ref())
            .bind(event.reported_by.as_deref())
            .fetch_one(&self.pool),
        )
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.bounded(sqlx::query("SELECT 1").execute(&self.pool))
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
