//! Top-level driver shared by the create/delete/resize/restart/upgrade flows.

use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::cleanup::CleanupParams;
use crate::graph::DeploymentGraph;
use crate::{DeployGraphError, Result};

/// Implemented by a workflow's task output type.
///
/// Tells the driver which resource id to hand back on success and which
/// resources to compensate for on failure.
pub trait CleanupHints: DeserializeOwned {
    fn resource_id(&self) -> String;

    fn cleanup_params(&self) -> CleanupParams;
}

/// Run `graph`; on success return the produced resource id.
///
/// On failure the output of the last completed task is decoded as `T`, the
/// resources it names are cleaned up, and the run error is returned. If the
/// cleanup itself fails, its error (asking for manual action) wins.
pub async fn run_with_cleanup<T: CleanupHints>(graph: &mut DeploymentGraph) -> Result<String> {
    let run_err = match graph.run().await {
        Ok(output) => {
            let out: T = serde_json::from_slice(&output).map_err(|e| {
                DeployGraphError::Validation(format!(
                    "deployment {} output payload: {e}",
                    graph.id()
                ))
            })?;
            let id = out.resource_id();
            info!(deployment = %graph.id(), resource = %id, "workflow finished");
            return Ok(id);
        }
        Err(e) => e,
    };

    let params = graph
        .last_completed()
        .and_then(|node| node.output_json())
        .and_then(|json| match serde_json::from_slice::<T>(&json) {
            Ok(out) => Some(out.cleanup_params()),
            Err(e) => {
                warn!(deployment = %graph.id(), error = %e, "cannot read cleanup hints from partial output");
                None
            }
        })
        .unwrap_or_default();

    match graph.clean_up(&params).await {
        Ok(()) => Err(run_err),
        Err(cleanup_err) => {
            warn!(deployment = %graph.id(), error = %run_err, "deployment failed and cleanup failed");
            Err(cleanup_err)
        }
    }
}
