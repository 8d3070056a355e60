//! Persistence seam for task and deployment status.
//!
//! The engine never talks to a database directly. Every status write goes
//! through a [`StatusStore`], and every write is an upsert keyed by the task
//! or deployment id, so concurrent nodes may interleave writes freely.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::ClusterIdentity;
use crate::status::{ChangeIndicator, DeploymentStatus};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("No entry found for {kind} {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("Status store error: {0}")]
    Backend(String),
}

/// Deployment row as loaded by [`StatusStore::get_deployment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub change_indicator: ChangeIndicator,
    pub cloud_account_id: String,
    pub workspace_id: Option<String>,
    pub service_id: Option<String>,
    pub input_payload: Vec<u8>,
    pub output_payload: Option<Vec<u8>>,
    pub status: DeploymentStatus,
    pub status_message: Option<String>,
    pub error_message: Option<String>,
}

impl DeploymentRecord {
    pub fn new(id: impl Into<String>, input_payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            change_indicator: ChangeIndicator::Create,
            cloud_account_id: String::new(),
            workspace_id: None,
            service_id: None,
            input_payload,
            output_payload: None,
            status: DeploymentStatus::Pending,
            status_message: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub deployment_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskUpdate {
    WaitingForUpstream,
    Running {
        message: String,
    },
    UpstreamFailed {
        dependency: String,
        error: String,
    },
    Success {
        output: Vec<u8>,
    },
    Failed {
        message: String,
        error: String,
    },
}

impl TaskUpdate {
    pub fn label(&self) -> &'static str {
        match self {
            TaskUpdate::WaitingForUpstream => "waiting_for_upstream",
            TaskUpdate::Running { .. } => "running",
            TaskUpdate::UpstreamFailed { .. } => "upstream_failed",
            TaskUpdate::Success { .. } => "success",
            TaskUpdate::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeploymentUpdate {
    Running { message: String },
    Success { output: Vec<u8> },
    Failed { error: String },
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get_deployment(&self, id: &str) -> Result<DeploymentRecord, StoreError>;

    /// Resolve the cluster that hosts a workspace or a service.
    async fn lookup_cluster(
        &self,
        cloud_account_id: &str,
        workspace_id: Option<&str>,
        service_id: Option<&str>,
    ) -> Result<ClusterIdentity, StoreError>;

    async fn create_task_record(&self, record: &TaskRecord) -> Result<(), StoreError>;

    async fn update_task_status(&self, task_id: &str, update: TaskUpdate)
    -> Result<(), StoreError>;

    async fn update_deployment_status(
        &self,
        deployment_id: &str,
        update: DeploymentUpdate,
    ) -> Result<DeploymentRecord, StoreError>;
}
