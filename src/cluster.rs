//! Narrow view of the cluster API the engine and its task functions rely on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The (account, cluster) pair that scopes every cluster-side operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterIdentity {
    pub cloud_account_id: String,
    pub cluster_uuid: String,
}

impl ClusterIdentity {
    pub fn new(cloud_account_id: impl Into<String>, cluster_uuid: impl Into<String>) -> Self {
        Self {
            cloud_account_id: cloud_account_id.into(),
            cluster_uuid: cluster_uuid.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cloud_account_id.is_empty() && self.cluster_uuid.is_empty()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },
    #[error("Cluster unavailable: {0}")]
    Unavailable(String),
    #[error("Cluster operation {operation} failed: {message}")]
    Operation { operation: String, message: String },
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

/// What to install or upgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    pub release_name: String,
    pub chart_name: String,
    pub version: Option<String>,
    pub namespace: String,
    pub values_yaml: String,
    pub reuse_values: bool,
    pub force: bool,
    pub timeout: Duration,
}

impl ChartSpec {
    pub fn new(
        release_name: impl Into<String>,
        chart_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            release_name: release_name.into(),
            chart_name: chart_name.into(),
            version: None,
            namespace: namespace.into(),
            values_yaml: String::new(),
            reuse_values: false,
            force: false,
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRelease {
    pub name: String,
    pub namespace: String,
    pub revision: u32,
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create a namespace and return its final name.
    async fn create_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<String, ClusterError>;

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError>;

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, ClusterError>;

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<(), ClusterError>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Create a node group and return its id.
    async fn create_node_group(&self, name: &str, node_count: u32)
    -> Result<String, ClusterError>;

    async fn delete_node_group(&self, node_group_id: &str) -> Result<(), ClusterError>;

    async fn delete_cluster(&self) -> Result<(), ClusterError>;

    async fn install_or_upgrade_chart(&self, spec: &ChartSpec)
    -> Result<ChartRelease, ClusterError>;

    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<String, ClusterError>;
}

/// Builds a [`ClusterClient`] scoped to one cluster identity.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(
        &self,
        identity: &ClusterIdentity,
    ) -> Result<Arc<dyn ClusterClient>, ClusterError>;
}
