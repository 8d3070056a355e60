#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use deploygraph::memory::{MemoryCluster, MemoryStatusStore};
use deploygraph::{
    ClusterConnector, DeploymentGraph, DeploymentInputContext, DeploymentRecord, EngineConfig,
    StatusStore, TaskContext, TaskFn,
};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// Logs are captured per test and only shown for failing tests unless
/// running with `-- --nocapture`. Enable levels with `RUST_LOG=debug`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// In-memory store and cluster shared by the graphs of one test.
pub struct Harness {
    pub store: Arc<MemoryStatusStore>,
    pub cluster: Arc<MemoryCluster>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            store: Arc::new(MemoryStatusStore::new()),
            cluster: Arc::new(MemoryCluster::new()),
        }
    }

    pub fn connector(&self) -> Arc<dyn ClusterConnector> {
        Arc::new(Arc::clone(&self.cluster))
    }

    pub fn store(&self) -> Arc<dyn StatusStore> {
        self.store.clone()
    }

    pub async fn insert(&self, id: &str, input: serde_json::Value) {
        let mut record = DeploymentRecord::new(id, input.to_string().into_bytes());
        record.cloud_account_id = "acct-test".to_string();
        self.store.insert_deployment(record).await;
    }

    pub fn input(&self, id: &str, config: EngineConfig) -> DeploymentInputContext {
        DeploymentInputContext::new(id, self.store(), self.connector()).with_config(config)
    }

    /// Insert a record with an empty JSON object input and open a graph for it.
    pub async fn graph(&self, id: &str) -> DeploymentGraph {
        self.graph_with(id, EngineConfig::default()).await
    }

    pub async fn graph_with(&self, id: &str, config: EngineConfig) -> DeploymentGraph {
        self.insert(id, serde_json::json!({})).await;
        DeploymentGraph::new(self.input(id, config), "test-deployment")
            .await
            .expect("open graph")
    }
}

/// Task that returns `value`.
pub fn returns<T>(value: T) -> impl TaskFn<Output = T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    move |_ctx: TaskContext| {
        let value = value.clone();
        async move { Ok::<T, anyhow::Error>(value) }
    }
}

/// Task that fails with `message`.
pub fn fails<T>(message: &'static str) -> impl TaskFn<Output = T>
where
    T: Serialize + Send + Sync + 'static,
{
    move |_ctx: TaskContext| async move { Err::<T, anyhow::Error>(anyhow::anyhow!(message)) }
}

/// Task that returns `value` after `delay`.
pub fn returns_after<T>(value: T, delay: Duration) -> impl TaskFn<Output = T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    move |_ctx: TaskContext| {
        let value = value.clone();
        async move {
            tokio::time::sleep(delay).await;
            Ok::<T, anyhow::Error>(value)
        }
    }
}

/// Task that counts its invocations in `calls`, then returns `value`.
pub fn counted<T>(value: T, calls: Arc<AtomicUsize>) -> impl TaskFn<Output = T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    move |_ctx: TaskContext| {
        calls.fetch_add(1, Ordering::SeqCst);
        let value = value.clone();
        async move { Ok::<T, anyhow::Error>(value) }
    }
}

/// Task that fails with `message` after `delay`.
pub fn fails_after<T>(message: &'static str, delay: Duration) -> impl TaskFn<Output = T>
where
    T: Serialize + Send + Sync + 'static,
{
    move |_ctx: TaskContext| async move {
        tokio::time::sleep(delay).await;
        Err::<T, anyhow::Error>(anyhow::anyhow!(message))
    }
}
