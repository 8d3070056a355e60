//! What a task function sees while it runs.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cluster::{ClusterClient, ClusterIdentity};
use crate::config::EngineConfig;
use crate::merge::Merge;
use crate::status::TaskStatus;
use crate::store::StatusStore;
use crate::task::{TaskNode, TaskRef};
use crate::{DeployGraphError, Result};

/// Collaborators and identity shared by every node of one deployment.
///
/// Built once by `DeploymentGraph::new` and read-only afterwards.
pub struct ExecutionContext {
    deployment_id: String,
    deployment_name: String,
    raw_input: Arc<[u8]>,
    cluster_identity: ClusterIdentity,
    parent_deployment_id: Option<String>,
    workspace_id: Option<String>,
    service_id: Option<String>,
    config: Arc<EngineConfig>,
    store: Arc<dyn StatusStore>,
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        deployment_id: String,
        deployment_name: String,
        raw_input: Vec<u8>,
        cluster_identity: ClusterIdentity,
        parent_deployment_id: Option<String>,
        workspace_id: Option<String>,
        service_id: Option<String>,
        config: Arc<EngineConfig>,
        store: Arc<dyn StatusStore>,
    ) -> Self {
        Self {
            deployment_id,
            deployment_name,
            raw_input: raw_input.into(),
            cluster_identity,
            parent_deployment_id,
            workspace_id,
            service_id,
            config,
            store,
        }
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    pub fn deployment_name(&self) -> &str {
        &self.deployment_name
    }

    pub fn raw_input(&self) -> &[u8] {
        &self.raw_input
    }

    /// Decode the raw deployment input as JSON.
    pub fn input<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.raw_input).map_err(|e| {
            DeployGraphError::Validation(format!(
                "deployment {} input payload: {e}",
                self.deployment_id
            ))
        })
    }

    pub fn cluster_identity(&self) -> &ClusterIdentity {
        &self.cluster_identity
    }

    /// Set when this deployment runs inside another deployment.
    pub fn parent_deployment_id(&self) -> Option<&str> {
        self.parent_deployment_id.as_deref()
    }

    pub fn workspace_id(&self) -> Option<&str> {
        self.workspace_id.as_deref()
    }

    pub fn service_id(&self) -> Option<&str> {
        self.service_id.as_deref()
    }

    /// Last 20 characters of the deployment id, used to name resources.
    pub fn random_suffix(&self) -> &str {
        let id = self.deployment_id.as_str();
        let mut start = id.len().saturating_sub(20);
        while !id.is_char_boundary(start) {
            start += 1;
        }
        &id[start..]
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }
}

/// Registered nodes plus the name index, shared with running tasks.
pub(crate) struct NodeTable {
    nodes: Vec<Arc<TaskNode>>,
    index: HashMap<String, usize>,
}

impl NodeTable {
    pub(crate) fn new(nodes: Vec<Arc<TaskNode>>, index: HashMap<String, usize>) -> Self {
        Self { nodes, index }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Arc<TaskNode>> {
        self.index.get(name).and_then(|&i| self.nodes.get(i))
    }
}

/// Per-run resources: acquired when `run` starts, released when it returns.
pub(crate) struct RunContext {
    execution: Arc<ExecutionContext>,
    cluster: Arc<dyn ClusterClient>,
    nodes: NodeTable,
    cancel: CancellationToken,
}

impl RunContext {
    pub(crate) fn new(
        execution: Arc<ExecutionContext>,
        cluster: Arc<dyn ClusterClient>,
        nodes: NodeTable,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            execution,
            cluster,
            nodes,
            cancel,
        }
    }

    pub(crate) fn execution(&self) -> &ExecutionContext {
        &self.execution
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Handle passed to every task function.
///
/// Cheap to clone; everything behind it is shared with the rest of the run.
#[derive(Clone)]
pub struct TaskContext {
    run: Arc<RunContext>,
    task_id: String,
    task_name: String,
}

impl TaskContext {
    pub(crate) fn new(run: Arc<RunContext>, task_id: &str, task_name: &str) -> Self {
        Self {
            run,
            task_id: task_id.to_string(),
            task_name: task_name.to_string(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn execution(&self) -> &ExecutionContext {
        &self.run.execution
    }

    pub fn deployment_id(&self) -> &str {
        self.run.execution.deployment_id()
    }

    pub fn input<T: DeserializeOwned>(&self) -> Result<T> {
        self.run.execution.input()
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterClient> {
        &self.run.cluster
    }

    pub fn cluster_identity(&self) -> &ClusterIdentity {
        self.run.execution.cluster_identity()
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        self.run.execution.store()
    }

    pub fn config(&self) -> &EngineConfig {
        self.run.execution.config()
    }

    /// Fired when the run is cancelled; long task bodies should watch it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.run.cancel
    }

    /// Output of the named task.
    ///
    /// Only meaningful for a task declared as a dependency of the caller.
    /// Returns `None` for unknown names, for tasks that have not completed,
    /// and when the output is not a `T`.
    pub fn get_output<T: Clone + 'static>(&self, name: &str) -> Option<T> {
        let node = self.run.nodes.get(name)?;
        if node.status() != TaskStatus::Completed {
            debug!(
                task = %self.task_name,
                requested = %name,
                status = %node.status(),
                "requested output of a task that has not completed"
            );
            return None;
        }
        node.output::<T>()
    }

    pub fn output_of<T: Clone + 'static>(&self, task: &TaskRef<T>) -> Option<T> {
        self.get_output(task.name())
    }

    /// JSON encoding of the named task's output.
    pub fn output_json(&self, name: &str) -> Option<serde_json::Value> {
        let bytes = self.run.nodes.get(name)?.output_json()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Fold the outputs of several tasks in the given order.
    ///
    /// Tasks without an output are skipped; `None` when none produced one.
    pub fn merged_output<T: Merge + Clone + 'static>(&self, names: &[&str]) -> Option<T> {
        names
            .iter()
            .filter_map(|name| self.get_output::<T>(name))
            .reduce(|acc, next| acc.merged(next))
    }

    /// Persisted output of another deployment.
    pub async fn deployment_output(&self, deployment_id: &str) -> Result<Vec<u8>> {
        let record = self.store().get_deployment(deployment_id).await?;
        Ok(record.output_payload.unwrap_or_default())
    }
}
