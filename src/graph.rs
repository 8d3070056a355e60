use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cleanup::{CleanupCoordinator, CleanupParams};
use crate::cluster::{ClusterConnector, ClusterIdentity};
use crate::config::{EngineConfig, OutputRule};
use crate::context::{ExecutionContext, NodeTable, RunContext};
use crate::cycle_check::find_cycle;
use crate::status::{ChangeIndicator, DeploymentStatus, TaskStatus};
use crate::store::{DeploymentUpdate, StatusStore};
use crate::task::{TaskFn, TaskNode, TaskRef};
use crate::{DeployGraphError, Result, TaskFailure};

/// Everything needed to open a deployment graph for an existing record.
#[derive(Clone)]
pub struct DeploymentInputContext {
    pub id: String,
    pub store: Arc<dyn StatusStore>,
    pub connector: Arc<dyn ClusterConnector>,
    pub config: Arc<EngineConfig>,
    pub parent_deployment_id: Option<String>,
}

impl DeploymentInputContext {
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn StatusStore>,
        connector: Arc<dyn ClusterConnector>,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            connector,
            config: Arc::new(EngineConfig::default()),
            parent_deployment_id: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_parent(mut self, parent_deployment_id: impl Into<String>) -> Self {
        self.parent_deployment_id = Some(parent_deployment_id.into());
        self
    }
}

/// One execution of a set of dependent tasks for one deployment record.
///
/// Register tasks with [`add_task`](Self::add_task), then call
/// [`run`](Self::run) exactly once.
pub struct DeploymentGraph {
    id: String,
    name: String,
    nodes: Vec<Arc<TaskNode>>,
    name_index: HashMap<String, usize>,
    execution: Arc<ExecutionContext>,
    connector: Arc<dyn ClusterConnector>,
    output_task: Option<String>,
    status: DeploymentStatus,
    output: Option<Vec<u8>>,
    failures: Vec<TaskFailure>,
    error: Option<DeployGraphError>,
}

impl DeploymentGraph {
    /// Load the deployment record, mark it running and resolve its cluster.
    pub async fn new(input: DeploymentInputContext, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        input.config.validate()?;

        let record = input.store.get_deployment(&input.id).await?;
        input
            .store
            .update_deployment_status(
                &record.id,
                DeploymentUpdate::Running {
                    message: format!("Deployment: {name} in progress"),
                },
            )
            .await?;

        let workspace_id = record.workspace_id.clone().filter(|s| !s.is_empty());
        let service_id = record.service_id.clone().filter(|s| !s.is_empty());
        let needs_lookup = record.change_indicator != ChangeIndicator::Create
            || (workspace_id.is_some() && service_id.is_some());

        let cluster_identity = if needs_lookup {
            input
                .store
                .lookup_cluster(
                    &record.cloud_account_id,
                    workspace_id.as_deref(),
                    service_id.as_deref(),
                )
                .await?
        } else {
            ClusterIdentity::new(record.cloud_account_id.clone(), "")
        };

        info!(
            deployment = %record.id,
            name = %name,
            change = ?record.change_indicator,
            cluster = %cluster_identity.cluster_uuid,
            "opened deployment graph"
        );

        let output_task = match &input.config.output_rule {
            OutputRule::LastCompleted => None,
            OutputRule::Terminal(task) => Some(task.clone()),
        };

        let execution = ExecutionContext::new(
            record.id.clone(),
            name.clone(),
            record.input_payload,
            cluster_identity,
            input.parent_deployment_id,
            workspace_id,
            service_id,
            input.config,
            input.store,
        );

        Ok(Self {
            id: record.id,
            name,
            nodes: Vec::new(),
            name_index: HashMap::new(),
            execution: Arc::new(execution),
            connector: input.connector,
            output_task,
            status: DeploymentStatus::Pending,
            output: None,
            failures: Vec::new(),
            error: None,
        })
    }

    /// Register a node. A duplicate name is logged and the newer node wins the name.
    ///
    /// Dependencies already registered are bound to the node owning the name
    /// right now, so a later duplicate never rebinds them. Names registered
    /// later are resolved when the graph runs.
    pub fn add_node(&mut self, mut node: TaskNode) {
        let upstream = node
            .dependencies()
            .iter()
            .map(|dep| self.name_index.get(dep).copied())
            .collect();
        node.bind_upstream(upstream);

        if self.name_index.contains_key(node.name()) {
            warn!(
                deployment = %self.id,
                task = %node.name(),
                "task name already exists; later registration shadows it"
            );
        }
        self.name_index
            .insert(node.name().to_string(), self.nodes.len());
        self.nodes.push(Arc::new(node));
    }

    pub fn add_nodes(&mut self, nodes: impl IntoIterator<Item = TaskNode>) {
        for node in nodes {
            self.add_node(node);
        }
    }

    pub fn add_task<F: TaskFn>(
        &mut self,
        name: impl Into<String>,
        func: F,
        dependencies: &[&str],
    ) -> TaskRef<F::Output> {
        let name = name.into();
        self.add_node(TaskNode::new(name.clone(), func, dependencies));
        TaskRef::new(name)
    }

    pub fn add_task_with_timeout<F: TaskFn>(
        &mut self,
        name: impl Into<String>,
        func: F,
        dependencies: &[&str],
        timeout: Duration,
    ) -> TaskRef<F::Output> {
        let name = name.into();
        self.add_node(TaskNode::new(name.clone(), func, dependencies).with_timeout(timeout));
        TaskRef::new(name)
    }

    /// Report this task's output as the deployment output, whatever its position.
    pub fn set_output_task<T>(&mut self, task: &TaskRef<T>) {
        self.output_task = Some(task.name().to_string());
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> DeploymentStatus {
        self.status
    }

    pub fn execution(&self) -> &ExecutionContext {
        &self.execution
    }

    pub fn input<T: DeserializeOwned>(&self) -> Result<T> {
        self.execution.input()
    }

    pub fn nodes(&self) -> &[Arc<TaskNode>] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Arc<TaskNode>> {
        self.name_index.get(name).and_then(|&i| self.nodes.get(i))
    }

    /// Output of the named task; `None` if unknown or not completed.
    pub fn get_output<T: Clone + 'static>(&self, name: &str) -> Option<T> {
        let node = self.node(name)?;
        if node.status() != TaskStatus::Completed {
            return None;
        }
        node.output()
    }

    /// Aggregate output, available once the graph finished running.
    pub fn output(&self) -> Option<&[u8]> {
        self.output.as_deref()
    }

    pub fn failures(&self) -> &[TaskFailure] {
        &self.failures
    }

    /// All failure messages joined, as persisted with the deployment.
    pub fn error_message(&self) -> String {
        self.error
            .iter()
            .map(ToString::to_string)
            .chain(self.failures.iter().map(ToString::to_string))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The last completed node, in registration order.
    pub fn last_completed(&self) -> Option<&Arc<TaskNode>> {
        self.nodes
            .iter()
            .rev()
            .find(|n| n.status() == TaskStatus::Completed)
    }

    pub async fn run(&mut self) -> Result<Vec<u8>> {
        self.run_with_cancellation(CancellationToken::new()).await
    }

    /// Run every node to a terminal status.
    ///
    /// Cancelling `cancel` fails every node that has not started yet; nodes
    /// already running see the token through their context.
    pub async fn run_with_cancellation(&mut self, cancel: CancellationToken) -> Result<Vec<u8>> {
        if self.status != DeploymentStatus::Pending {
            return Err(DeployGraphError::AlreadyRun);
        }
        self.status = DeploymentStatus::InProgress;
        info!(deployment = %self.id, name = %self.name, tasks = self.nodes.len(), "running deployment");

        let deps = match self.resolve_dependencies() {
            Ok(deps) => deps,
            Err(e) => return Err(self.abort(e).await),
        };

        let cluster = match self
            .connector
            .connect(self.execution.cluster_identity())
            .await
        {
            Ok(client) => client,
            Err(e) => return Err(self.abort(e.into()).await),
        };

        let run = Arc::new(RunContext::new(
            Arc::clone(&self.execution),
            cluster,
            NodeTable::new(self.nodes.clone(), self.name_index.clone()),
            cancel,
        ));

        let handles: Vec<_> = self
            .nodes
            .iter()
            .zip(deps)
            .map(|(node, deps)| tokio::spawn(Arc::clone(node).execute(deps, Arc::clone(&run))))
            .collect();

        let mut last_completed = None;
        for node in &self.nodes {
            node.wait().await;
            match node.status() {
                TaskStatus::Completed => last_completed = node.output_json(),
                TaskStatus::Failed => self.failures.push(TaskFailure {
                    node: node.name().to_string(),
                    error: node.error().unwrap_or_else(|| DeployGraphError::NodeExecution {
                        node: node.name().to_string(),
                        message: "failed without an error".to_string(),
                    }),
                }),
                other => warn!(task = %node.name(), status = %other, "task signalled without terminal status"),
            }
        }

        if let Err(e) = try_join_all(handles).await {
            error!(deployment = %self.id, error = %e, "task worker did not shut down cleanly");
        }

        self.output = match &self.output_task {
            Some(name) => self.node(name).and_then(|n| n.output_json()),
            None => last_completed,
        };

        let store = self.execution.store();
        if self.failures.is_empty() {
            self.status = DeploymentStatus::Completed;
            info!(deployment = %self.id, name = %self.name, "deployment completed");
            let output = self.output.clone().unwrap_or_default();
            if let Err(e) = store
                .update_deployment_status(&self.id, DeploymentUpdate::Success { output })
                .await
            {
                warn!(deployment = %self.id, error = %e, "failed to persist deployment success");
            }
            Ok(self.output.clone().unwrap_or_default())
        } else {
            self.status = DeploymentStatus::Failed;
            let message = self.error_message();
            error!(deployment = %self.id, name = %self.name, error = %message, "deployment failed");
            if let Err(e) = store
                .update_deployment_status(&self.id, DeploymentUpdate::Failed { error: message })
                .await
            {
                warn!(deployment = %self.id, error = %e, "failed to persist deployment failure");
            }
            Err(DeployGraphError::DeploymentFailed {
                deployment: self.name.clone(),
                failures: self.failures.clone(),
            })
        }
    }

    /// Best-effort compensation after a failed run.
    pub async fn clean_up(&self, params: &CleanupParams) -> Result<()> {
        CleanupCoordinator::new(Arc::clone(&self.connector), Arc::clone(&self.execution))
            .clean_up(params)
            .await
    }

    fn resolve_dependencies(&self) -> Result<Vec<Vec<Arc<TaskNode>>>> {
        if let Some(name) = &self.output_task {
            if !self.name_index.contains_key(name) {
                return Err(DeployGraphError::Validation(format!(
                    "output task {name} is not registered"
                )));
            }
        }

        let bound = self
            .nodes
            .iter()
            .map(|node| {
                node.dependencies()
                    .iter()
                    .zip(node.upstream())
                    .map(|(dep, &slot)| {
                        slot.or_else(|| self.name_index.get(dep).copied())
                            .ok_or_else(|| DeployGraphError::UnknownDependency {
                                node: node.name().to_string(),
                                dependency: dep.clone(),
                            })
                    })
                    .collect::<Result<Vec<usize>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        let edges = bound
            .iter()
            .enumerate()
            .map(|(i, deps)| (i, deps.iter().copied()));
        if let Some(cycle) = find_cycle(edges) {
            let path = cycle
                .into_iter()
                .map(|i| self.nodes[i].name().to_string())
                .collect();
            return Err(DeployGraphError::CircularDependency(path));
        }

        Ok(bound
            .into_iter()
            .map(|deps| {
                deps.into_iter()
                    .map(|i| Arc::clone(&self.nodes[i]))
                    .collect()
            })
            .collect())
    }

    /// Fail the whole graph before any node executed.
    async fn abort(&mut self, err: DeployGraphError) -> DeployGraphError {
        error!(deployment = %self.id, error = %err, "deployment aborted before execution");
        self.status = DeploymentStatus::Failed;
        self.error = Some(err.clone());
        if let Err(e) = self
            .execution
            .store()
            .update_deployment_status(
                &self.id,
                DeploymentUpdate::Failed {
                    error: err.to_string(),
                },
            )
            .await
        {
            warn!(deployment = %self.id, error = %e, "failed to persist deployment failure");
        }
        debug!(deployment = %self.id, "no task was started");
        err
    }
}
