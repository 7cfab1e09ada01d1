#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use hyper::body::to_bytes;
use payments::{
    create_app, metrics::NoopRecorder, AppState, KeyScope, LedgerStore, RequestLimits, RetryPolicy,
};
use prometheus::Registry;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

/// A throwaway database with migrations applied
pub struct TestDb {
    pub store: LedgerStore,
    pub pool: PgPool,
    root_pool: PgPool,
    name: String,
}

fn database_url() -> String {
    dotenv::dotenv().ok();
    std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .expect("DATABASE_URL or TEST_DATABASE_URL must be set for tests")
}

/// Creates a fresh database for one test.
pub async fn test_db(key_scope: KeyScope) -> TestDb {
    let db_url = database_url();

    let (without_query, query) = match db_url.split_once('?') {
        Some((url, query)) => (url, Some(query)),
        None => (db_url.as_str(), None),
    };
    let base_url = without_query
        .rsplitn(2, '/')
        .nth(1)
        .expect("Invalid database URL format");

    let name = format!("test_{}", Uuid::new_v4().simple());
    let test_db_url = match query {
        Some(query) => format!("{base_url}/{name}?{query}"),
        None => format!("{base_url}/{name}"),
    };

    let root_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await
        .expect("Failed to connect to database");

    sqlx::query(&format!("CREATE DATABASE {name}"))
        .execute(&root_pool)
        .await
        .expect("Failed to create test database");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&test_db_url)
        .await
        .expect("Failed to connect to test database");

    let store = LedgerStore::new(
        pool.clone(),
        RetryPolicy::default(),
        Arc::new(NoopRecorder),
        key_scope,
    );
    store.migrate().await.expect("Failed to run migrations");

    TestDb {
        store,
        pool,
        root_pool,
        name,
    }
}

impl TestDb {
    /// Drops the test database.
    pub async fn teardown(self) {
        self.pool.close().await;

        sqlx::query("SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1")
            .bind(&self.name)
            .execute(&self.root_pool)
            .await
            .ok();

        sqlx::query(&format!("DROP DATABASE IF EXISTS {}", self.name))
            .execute(&self.root_pool)
            .await
            .ok();
    }

    pub fn app(&self) -> Router {
        app_for(self.store.clone(), RequestLimits::default())
    }

    pub fn app_with_limits(&self, limits: RequestLimits) -> Router {
        app_for(self.store.clone(), limits)
    }
}

pub fn app_for(store: LedgerStore, limits: RequestLimits) -> Router {
    create_app(AppState {
        store: Arc::new(store),
        registry: Registry::new(),
        shutdown: CancellationToken::new(),
        limits,
        version: "test".to_string(),
    })
}

/// An application whose pool never connects; only requests rejected before
/// touching storage may be sent to it.
pub fn offline_app() -> Router {
    offline_app_with(RequestLimits::default())
}

pub fn offline_app_with(limits: RequestLimits) -> Router {
    let pool = PgPoolOptions::new()
        .acquire_timeout(Duration::from_millis(200))
        .connect_lazy("postgres://localhost:1/offline")
        .expect("Failed to build lazy pool");
    let store = LedgerStore::new(
        pool,
        RetryPolicy {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
        },
        Arc::new(NoopRecorder),
        KeyScope::Global,
    );
    app_for(store, limits)
}

pub fn new_wallet() -> String {
    Uuid::new_v4().to_string()
}

/// Sends a GET request and returns the status and raw body
pub async fn get_raw(app: &Router, uri: &str, client: Option<i64>) -> (StatusCode, Vec<u8>) {
    let mut request = Request::builder().method("GET").uri(uri);
    if let Some(client) = client {
        request = request.header("x-client-id", client.to_string());
    }
    let response = app
        .clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body()).await.unwrap();
    (status, body.to_vec())
}

/// Sends a GET request and parses the JSON body
pub async fn get_json(app: &Router, uri: &str, client: Option<i64>) -> (StatusCode, serde_json::Value) {
    let (status, body) = get_raw(app, uri, client).await;
    let value = serde_json::from_slice(&body).unwrap_or_else(|e| {
        panic!(
            "Failed to parse response: {}. Body: {}",
            e,
            String::from_utf8_lossy(&body)
        )
    });
    (status, value)
}
