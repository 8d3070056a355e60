//! Compensating deletes after a failed deployment run.
//!
//! Every delete is attempted independently and a resource that is already
//! gone counts as cleaned, so running cleanup twice is harmless. Nothing is
//! retried: if any delete fails the caller gets a `Cleanup` error asking for
//! manual action.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterConnector, ClusterError, ClusterIdentity};
use crate::context::ExecutionContext;
use crate::{CleanupFailure, DeployGraphError, Result};

/// Resources created before the failure, as far as the last completed task knew.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupParams {
    pub node_group_id: Option<String>,
    pub namespace: Option<String>,
    /// Cluster to clean up in; when absent or empty, the deployment's cluster.
    pub cluster: Option<ClusterIdentity>,
    /// Delete the whole cluster instead of individual resources.
    pub delete_cluster: bool,
}

impl CleanupParams {
    pub fn is_empty(&self) -> bool {
        self.node_group_id.as_deref().is_none_or(str::is_empty)
            && self.namespace.as_deref().is_none_or(str::is_empty)
            && !self.delete_cluster
    }
}

pub struct CleanupCoordinator {
    connector: Arc<dyn ClusterConnector>,
    execution: Arc<ExecutionContext>,
}

impl CleanupCoordinator {
    pub(crate) fn new(
        connector: Arc<dyn ClusterConnector>,
        execution: Arc<ExecutionContext>,
    ) -> Self {
        Self {
            connector,
            execution,
        }
    }

    pub async fn clean_up(&self, params: &CleanupParams) -> Result<()> {
        let exec = &self.execution;
        info!(deployment = %exec.deployment_id(), ?params, "cleaning up failed deployment");

        let identity = params
            .cluster
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| exec.cluster_identity().clone());
        let client = self.connector.connect(&identity).await?;
        let mut failures = Vec::new();

        if params.delete_cluster {
            record(
                format!("cluster {}", identity.cluster_uuid),
                client.delete_cluster().await,
                &mut failures,
            );
            return finish(exec, failures);
        }

        // Sub-deployments share their parent's namespace and node group.
        let owns_resources = exec.parent_deployment_id().is_none();

        if let Some(id) = params.node_group_id.as_deref().filter(|s| !s.is_empty()) {
            if owns_resources {
                record(
                    format!("node group {id}"),
                    client.delete_node_group(id).await,
                    &mut failures,
                );
            }
        }

        if let Some(ns) = params.namespace.as_deref().filter(|s| !s.is_empty()) {
            if owns_resources {
                record(
                    format!("namespace {ns}"),
                    client.delete_namespace(ns).await,
                    &mut failures,
                );
            }
        }

        let secret_ns = &exec.config().secret_namespace;
        record(
            format!("secret {secret_ns}/{}", exec.deployment_id()),
            client.delete_secret(secret_ns, exec.deployment_id()).await,
            &mut failures,
        );

        finish(exec, failures)
    }
}

fn record(
    resource: String,
    result: std::result::Result<(), ClusterError>,
    failures: &mut Vec<CleanupFailure>,
) {
    match result {
        Ok(()) => info!(%resource, "cleaned up"),
        Err(e) if e.is_not_found() => debug!(%resource, "already absent"),
        Err(error) => {
            warn!(%resource, %error, "cleanup failed");
            failures.push(CleanupFailure { resource, error });
        }
    }
}

fn finish(exec: &ExecutionContext, failures: Vec<CleanupFailure>) -> Result<()> {
    if failures.is_empty() {
        info!(deployment = %exec.deployment_id(), "cleanup finished");
        Ok(())
    } else {
        warn!(
            deployment = %exec.deployment_id(),
            failed = failures.len(),
            "cleanup incomplete; manual action needed"
        );
        Err(DeployGraphError::Cleanup { failures })
    }
}
