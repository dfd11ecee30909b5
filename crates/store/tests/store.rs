use std::sync::Arc;
use std::time::Duration;

use compliance_contracts::{ClusterKey, Compliance, EventDetails, ParentPolicyKey, PolicyKey};
use compliance_store::{ComplianceStore, EventRecord, PgStore};
use sqlx::Row;

fn test_db_url() -> Option<String> {
    std::env::var("COMPLIANCE_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn schema_db_url(base: &str, schema: &str) -> String {
    let separator = if base.contains('?') { "&" } else { "?" };
    format!("{base}{separator}options=-csearch_path%3D{schema}")
}

struct TestSchema {
    admin: sqlx::PgPool,
    name: String,
    url: String,
}

impl TestSchema {
    async fn create(db_url: &str) -> Self {
        let name = format!("compliance_test_{}", ulid::Ulid::new()).to_lowercase();
        let admin = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(db_url)
            .await
            .expect("DB connect should succeed");

        sqlx::query(&format!("CREATE SCHEMA {}", name))
            .execute(&admin)
            .await
            .expect("create schema should succeed");

        let url = schema_db_url(db_url, &name);
        Self { admin, name, url }
    }

    async fn drop(self) {
        let _ = sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.name))
            .execute(&self.admin)
            .await;
        self.admin.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_use_creates_exactly_one_row() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping store test; set COMPLIANCE_TEST_DB_URL to enable");
        return;
    };

    let schema = TestSchema::create(&db_url).await;
    let store = Arc::new(
        PgStore::connect_and_migrate(&schema.url, 8, Duration::from_secs(2))
            .await
            .expect("store init should succeed"),
    );
    store.migrate().await.expect("migrations should be idempotent");

    let key = ClusterKey {
        identifier: "cluster-race".to_string(),
    };

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            store
                .get_or_create_cluster(&key, Some("race"))
                .await
                .expect("get_or_create should succeed")
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.expect("task should not panic"));
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 1, "all racers must see the same surrogate key");

    let row = sqlx::query("SELECT count(*) AS n FROM clusters WHERE cluster_id = $1")
        .bind(&key.identifier)
        .fetch_one(store.pool())
        .await
        .expect("count should succeed");
    let n: i64 = row.try_get("n").expect("count column");
    assert_eq!(n, 1);

    store.close().await;
    schema.drop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn policies_parents_and_events_round_trip() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping store test; set COMPLIANCE_TEST_DB_URL to enable");
        return;
    };

    let schema = TestSchema::create(&db_url).await;
    let store = PgStore::connect_and_migrate(&schema.url, 2, Duration::from_secs(2))
        .await
        .expect("store init should succeed");

    let spec = r#"{"a":1}"#;
    let spec_hash = compliance_contracts::canonical::hash_spec(spec).unwrap();
    assert_eq!(store.spec_by_hash(&spec_hash).await.unwrap(), None);

    let policy_key = PolicyKey {
        name: "p1".to_string(),
        namespace: "ns".to_string(),
        spec_hash: spec_hash.clone(),
    };
    let policy_id = store
        .get_or_create_policy(&policy_key, spec)
        .await
        .expect("policy insert should succeed");
    assert_eq!(
        store.get_or_create_policy(&policy_key, spec).await.unwrap(),
        policy_id
    );
    assert_eq!(
        store.spec_by_hash(&spec_hash).await.unwrap().as_deref(),
        Some(spec)
    );

    let parent_key = ParentPolicyKey {
        name: "parent".to_string(),
        namespace: "ns".to_string(),
        categories: vec!["CM Configuration Management".to_string()],
        controls: Vec::new(),
        standards: vec!["NIST SP 800-53".to_string()],
    };
    let parent_id = store.get_or_create_parent_policy(&parent_key).await.unwrap();
    assert_eq!(
        store.get_or_create_parent_policy(&parent_key).await.unwrap(),
        parent_id
    );

    let cluster_id = store
        .get_or_create_cluster(
            &ClusterKey {
                identifier: "c1".to_string(),
            },
            None,
        )
        .await
        .unwrap();

    let details = EventDetails {
        compliance: Some(Compliance::NonCompliant),
        message: Some("configmap missing".to_string()),
        timestamp: Some("2024-02-01T10:00:00Z".to_string()),
        metadata: Some(serde_json::json!({"k": "v"})),
        reported_by: Some("config-policy-controller".to_string()),
    };
    let event_id = store
        .insert_event(EventRecord {
            cluster_id,
            parent_policy_id: Some(parent_id),
            policy_id,
            event: &details,
        })
        .await
        .expect("event insert should succeed");

    let row = sqlx::query(
        "SELECT cluster_id, parent_policy_id, policy_id, compliance, metadata FROM compliance_events WHERE id = $1",
    )
    .bind(event_id)
    .fetch_one(store.pool())
    .await
    .expect("fetch event should succeed");

    assert_eq!(row.try_get::<i64, _>("cluster_id").unwrap(), cluster_id);
    assert_eq!(
        row.try_get::<Option<i64>, _>("parent_policy_id").unwrap(),
        Some(parent_id)
    );
    assert_eq!(row.try_get::<i64, _>("policy_id").unwrap(), policy_id);
    assert_eq!(
        row.try_get::<Option<String>, _>("compliance").unwrap().as_deref(),
        Some("NonCompliant")
    );
    assert_eq!(
        row.try_get::<Option<serde_json::Value>, _>("metadata").unwrap(),
        Some(serde_json::json!({"k": "v"}))
    );

    store.close().await;
    schema.drop().await;
}
