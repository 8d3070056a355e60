pub mod cleanup;
pub mod cluster;
pub mod config;
pub mod context;
pub mod cycle_check;
pub mod graph;
pub mod logging;
pub mod memory;
pub mod merge;
pub mod signal;
pub mod status;
pub mod store;
pub mod task;
pub mod workflow;

pub use cleanup::{CleanupCoordinator, CleanupParams};
pub use cluster::{
    ChartRelease, ChartSpec, ClusterClient, ClusterConnector, ClusterError, ClusterIdentity,
};
pub use config::{EngineConfig, OutputRule};
pub use context::{ExecutionContext, TaskContext};
pub use cycle_check::find_cycle;
pub use graph::{DeploymentGraph, DeploymentInputContext};
pub use merge::Merge;
pub use signal::CompletionSignal;
pub use status::{ChangeIndicator, DeploymentStatus, TaskStatus};
pub use store::{
    DeploymentRecord, DeploymentUpdate, StatusStore, StoreError, TaskRecord, TaskUpdate,
};
pub use task::{TaskFn, TaskNode, TaskRef};
pub use workflow::{CleanupHints, run_with_cleanup};

use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = DeployGraphError> = std::result::Result<T, E>;

/// One failed node inside a deployment run.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub node: String,
    pub error: DeployGraphError,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.node, self.error)
    }
}

/// A compensating delete that could not be completed.
#[derive(Debug, Clone)]
pub struct CleanupFailure {
    pub resource: String,
    pub error: ClusterError,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.error)
    }
}

#[derive(Error, Debug, Clone)]
pub enum DeployGraphError {
    #[error("Invalid deployment input: {0}")]
    Validation(String),
    #[error("Task {node} failed: {message}")]
    NodeExecution { node: String, message: String },
    #[error("Task {node} cannot execute due to failed dependency {dependency}")]
    DependencyFailed { node: String, dependency: String },
    #[error("Task {node} was cancelled before it started")]
    Cancelled { node: String },
    #[error("Task {node} timed out after {after:?}")]
    Timeout { node: String, after: Duration },
    #[error("Failed to persist status: {0}")]
    Persistence(String),
    #[error("Circular dependency detected: {}", join_path(.0))]
    CircularDependency(Vec<String>),
    #[error("Task {node} depends on unknown task {dependency}")]
    UnknownDependency { node: String, dependency: String },
    #[error("Deployment graph has already been run")]
    AlreadyRun,
    #[error("Deployment {deployment} failed with the error {}", join_failures(.failures))]
    DeploymentFailed {
        deployment: String,
        failures: Vec<TaskFailure>,
    },
    #[error(
        "Error while cleaning up the failed deployment ({}). Manual action needed",
        join_cleanup(.failures)
    )]
    Cleanup { failures: Vec<CleanupFailure> },
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DeployGraphError {
    /// Task failures carried by a failed run, empty for any other error.
    pub fn failures(&self) -> &[TaskFailure] {
        match self {
            DeployGraphError::DeploymentFailed { failures, .. } => failures,
            _ => &[],
        }
    }
}

fn join_path(path: &[String]) -> String {
    path.join(" -> ")
}

fn join_failures(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_cleanup(failures: &[CleanupFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
