//! In-memory collaborators.
//!
//! [`MemoryStatusStore`] and [`MemoryCluster`] keep everything in process.
//! They back the test-suite and the demo, and make it possible to dry-run a
//! workflow without a database or a cluster. Both support failure injection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::cluster::{
    ChartRelease, ChartSpec, ClusterClient, ClusterConnector, ClusterError, ClusterIdentity,
};
use crate::status::DeploymentStatus;
use crate::store::{
    DeploymentRecord, DeploymentUpdate, StatusStore, StoreError, TaskRecord, TaskUpdate,
};

/// A task row: the record plus every status update, in arrival order.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub record: TaskRecord,
    pub updates: Vec<TaskUpdate>,
}

impl TaskRow {
    pub fn last_update(&self) -> Option<&TaskUpdate> {
        self.updates.last()
    }
}

#[derive(Default)]
pub struct MemoryStatusStore {
    deployments: RwLock<HashMap<String, DeploymentRecord>>,
    tasks: RwLock<HashMap<String, TaskRow>>,
    clusters: RwLock<HashMap<(Option<String>, Option<String>), ClusterIdentity>>,
    fail_task_writes: AtomicBool,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_deployment(&self, record: DeploymentRecord) {
        self.deployments
            .write()
            .await
            .insert(record.id.clone(), record);
    }

    pub async fn register_cluster(
        &self,
        workspace_id: Option<&str>,
        service_id: Option<&str>,
        identity: ClusterIdentity,
    ) {
        self.clusters.write().await.insert(
            (workspace_id.map(str::to_string), service_id.map(str::to_string)),
            identity,
        );
    }

    /// Make every task status write fail from now on.
    pub fn fail_task_writes(&self, fail: bool) {
        self.fail_task_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn deployment(&self, id: &str) -> Option<DeploymentRecord> {
        self.deployments.read().await.get(id).cloned()
    }

    pub async fn task_by_name(&self, deployment_id: &str, name: &str) -> Option<TaskRow> {
        self.tasks
            .read()
            .await
            .values()
            .find(|row| row.record.deployment_id == deployment_id && row.record.name == name)
            .cloned()
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    fn check_task_writes(&self) -> Result<(), StoreError> {
        if self.fail_task_writes.load(Ordering::SeqCst) {
            Err(StoreError::Backend("task writes disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn get_deployment(&self, id: &str) -> Result<DeploymentRecord, StoreError> {
        self.deployment(id).await.ok_or_else(|| StoreError::NotFound {
            kind: "deployment",
            id: id.to_string(),
        })
    }

    async fn lookup_cluster(
        &self,
        cloud_account_id: &str,
        workspace_id: Option<&str>,
        service_id: Option<&str>,
    ) -> Result<ClusterIdentity, StoreError> {
        let clusters = self.clusters.read().await;
        let key = (workspace_id.map(str::to_string), service_id.map(str::to_string));
        let by_workspace = (workspace_id.map(str::to_string), None);
        let by_service = (None, service_id.map(str::to_string));
        clusters
            .get(&key)
            .or_else(|| clusters.get(&by_workspace))
            .or_else(|| clusters.get(&by_service))
            .cloned()
            .map(|mut identity| {
                if identity.cloud_account_id.is_empty() {
                    identity.cloud_account_id = cloud_account_id.to_string();
                }
                identity
            })
            .ok_or_else(|| StoreError::NotFound {
                kind: "cluster",
                id: format!(
                    "workspace={} service={}",
                    workspace_id.unwrap_or_default(),
                    service_id.unwrap_or_default()
                ),
            })
    }

    async fn create_task_record(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.check_task_writes()?;
        self.tasks
            .write()
            .await
            .entry(record.id.clone())
            .and_modify(|row| row.record = record.clone())
            .or_insert_with(|| TaskRow {
                record: record.clone(),
                updates: Vec::new(),
            });
        Ok(())
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<(), StoreError> {
        self.check_task_writes()?;
        let mut tasks = self.tasks.write().await;
        let row = tasks.get_mut(task_id).ok_or_else(|| StoreError::NotFound {
            kind: "task",
            id: task_id.to_string(),
        })?;
        if row.updates.last() != Some(&update) {
            row.updates.push(update);
        }
        Ok(())
    }

    async fn update_deployment_status(
        &self,
        deployment_id: &str,
        update: DeploymentUpdate,
    ) -> Result<DeploymentRecord, StoreError> {
        let mut deployments = self.deployments.write().await;
        let record = deployments
            .get_mut(deployment_id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "deployment",
                id: deployment_id.to_string(),
            })?;
        match update {
            DeploymentUpdate::Running { message } => {
                record.status = DeploymentStatus::InProgress;
                record.status_message = Some(message);
            }
            DeploymentUpdate::Success { output } => {
                record.status = DeploymentStatus::Completed;
                record.status_message = Some("Deployment Completed".to_string());
                record.output_payload = Some(output);
                record.error_message = None;
            }
            DeploymentUpdate::Failed { error } => {
                record.status = DeploymentStatus::Failed;
                record.status_message = Some(format!("deployment failed with the error {error}"));
                record.error_message = Some(error);
            }
        }
        Ok(record.clone())
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    namespaces: HashSet<String>,
    secrets: HashMap<(String, String), BTreeMap<String, Vec<u8>>>,
    node_groups: HashMap<String, (String, u32)>,
    releases: HashMap<(String, String), ChartRelease>,
    deleted: bool,
}

/// One in-memory cluster that also acts as its own connector.
#[derive(Default)]
pub struct MemoryCluster {
    state: RwLock<ClusterState>,
    failing: RwLock<HashSet<String>>,
    connections: AtomicUsize,
    unreachable: AtomicBool,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call to `operation` (e.g. `"delete_namespace"`) fail.
    pub async fn fail_on(&self, operation: &str) {
        self.failing.write().await.insert(operation.to_string());
    }

    pub async fn recover(&self, operation: &str) {
        self.failing.write().await.remove(operation);
    }

    /// Make `connect` fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub async fn has_namespace(&self, name: &str) -> bool {
        self.state.read().await.namespaces.contains(name)
    }

    pub async fn has_secret(&self, namespace: &str, name: &str) -> bool {
        self.state
            .read()
            .await
            .secrets
            .contains_key(&(namespace.to_string(), name.to_string()))
    }

    pub async fn has_node_group(&self, id: &str) -> bool {
        self.state.read().await.node_groups.contains_key(id)
    }

    pub async fn release(&self, namespace: &str, name: &str) -> Option<ChartRelease> {
        self.state
            .read()
            .await
            .releases
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub async fn is_deleted(&self) -> bool {
        self.state.read().await.deleted
    }

    async fn check(&self, operation: &str) -> Result<(), ClusterError> {
        if self.failing.read().await.contains(operation) {
            return Err(ClusterError::Operation {
                operation: operation.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterConnector for Arc<MemoryCluster> {
    async fn connect(
        &self,
        identity: &ClusterIdentity,
    ) -> Result<Arc<dyn ClusterClient>, ClusterError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable(format!(
                "cluster {} is unreachable",
                identity.cluster_uuid
            )));
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(self) as Arc<dyn ClusterClient>)
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn create_namespace(
        &self,
        name: &str,
        _labels: &BTreeMap<String, String>,
    ) -> Result<String, ClusterError> {
        self.check("create_namespace").await?;
        let mut state = self.state.write().await;
        if !state.namespaces.insert(name.to_string()) {
            return Err(ClusterError::AlreadyExists {
                kind: "namespace",
                name: name.to_string(),
            });
        }
        Ok(name.to_string())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        self.check("delete_namespace").await?;
        let mut state = self.state.write().await;
        if !state.namespaces.remove(name) {
            return Err(ClusterError::NotFound {
                kind: "namespace",
                name: name.to_string(),
            });
        }
        state.secrets.retain(|(ns, _), _| ns != name);
        state.releases.retain(|(ns, _), _| ns != name);
        Ok(())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, ClusterError> {
        self.check("get_secret").await?;
        self.state
            .read()
            .await
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "secret",
                name: format!("{namespace}/{name}"),
            })
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<(), ClusterError> {
        self.check("create_secret").await?;
        self.state
            .write()
            .await
            .secrets
            .insert((namespace.to_string(), name.to_string()), data);
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.check("delete_secret").await?;
        self.state
            .write()
            .await
            .secrets
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound {
                kind: "secret",
                name: format!("{namespace}/{name}"),
            })
    }

    async fn create_node_group(
        &self,
        name: &str,
        node_count: u32,
    ) -> Result<String, ClusterError> {
        self.check("create_node_group").await?;
        let id = format!("ng-{}", Uuid::new_v4().simple());
        self.state
            .write()
            .await
            .node_groups
            .insert(id.clone(), (name.to_string(), node_count));
        Ok(id)
    }

    async fn delete_node_group(&self, node_group_id: &str) -> Result<(), ClusterError> {
        self.check("delete_node_group").await?;
        self.state
            .write()
            .await
            .node_groups
            .remove(node_group_id)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound {
                kind: "node group",
                name: node_group_id.to_string(),
            })
    }

    async fn delete_cluster(&self) -> Result<(), ClusterError> {
        self.check("delete_cluster").await?;
        let mut state = self.state.write().await;
        if state.deleted {
            return Err(ClusterError::NotFound {
                kind: "cluster",
                name: "memory".to_string(),
            });
        }
        *state = ClusterState {
            deleted: true,
            ..ClusterState::default()
        };
        Ok(())
    }

    async fn install_or_upgrade_chart(
        &self,
        spec: &ChartSpec,
    ) -> Result<ChartRelease, ClusterError> {
        self.check("install_or_upgrade_chart").await?;
        let mut state = self.state.write().await;
        if !state.namespaces.contains(&spec.namespace) {
            return Err(ClusterError::NotFound {
                kind: "namespace",
                name: spec.namespace.clone(),
            });
        }
        let key = (spec.namespace.clone(), spec.release_name.clone());
        let revision = state.releases.get(&key).map_or(1, |r| r.revision + 1);
        let release = ChartRelease {
            name: spec.release_name.clone(),
            namespace: spec.namespace.clone(),
            revision,
        };
        state.releases.insert(key, release.clone());
        Ok(release)
    }

    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<String, ClusterError> {
        self.check("exec_in_pod").await?;
        if !self.state.read().await.namespaces.contains(namespace) {
            return Err(ClusterError::NotFound {
                kind: "namespace",
                name: namespace.to_string(),
            });
        }
        Ok(format!("{pod}: {}", command.join(" ")))
    }
}
