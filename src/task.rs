use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::{RunContext, TaskContext};
use crate::signal::CompletionSignal;
use crate::status::TaskStatus;
use crate::store::{DeploymentUpdate, StoreError, TaskRecord, TaskUpdate};
use crate::DeployGraphError;

/// The body of a task: an async transform over a [`TaskContext`].
///
/// Any `Fn(TaskContext) -> impl Future<Output = anyhow::Result<T>>` is a
/// `TaskFn`, so plain async functions can be registered directly.
pub trait TaskFn: Send + Sync + 'static {
    type Output: Serialize + Send + Sync + 'static;

    fn call(&self, ctx: TaskContext) -> BoxFuture<'static, anyhow::Result<Self::Output>>;
}

impl<F, Fut, T> TaskFn for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Serialize + Send + Sync + 'static,
{
    type Output = T;

    fn call(&self, ctx: TaskContext) -> BoxFuture<'static, anyhow::Result<T>> {
        Box::pin(self(ctx))
    }
}

/// A produced value, kept both as the typed value and as its JSON encoding.
#[derive(Clone)]
pub(crate) struct NodeValue {
    value: Arc<dyn Any + Send + Sync>,
    json: Vec<u8>,
}

impl NodeValue {
    fn new<T: Serialize + Send + Sync + 'static>(value: T) -> anyhow::Result<Self> {
        let json = serde_json::to_vec(&value)
            .map_err(|e| anyhow::anyhow!("serializing task output: {e}"))?;
        Ok(Self {
            value: Arc::new(value),
            json,
        })
    }
}

trait ErasedTask: Send + Sync {
    fn call(&self, ctx: TaskContext) -> BoxFuture<'static, anyhow::Result<NodeValue>>;
}

impl<F: TaskFn> ErasedTask for F {
    fn call(&self, ctx: TaskContext) -> BoxFuture<'static, anyhow::Result<NodeValue>> {
        let fut = TaskFn::call(self, ctx);
        Box::pin(async move { NodeValue::new(fut.await?) })
    }
}

/// Typed handle to a registered task.
///
/// Returned by `DeploymentGraph::add_task`; reading a dependency's output
/// through it is checked against the task's output type at compile time.
pub struct TaskRef<T> {
    name: String,
    _output: PhantomData<fn() -> T>,
}

impl<T> TaskRef<T> {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _output: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for TaskRef<T> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<T> fmt::Debug for TaskRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskRef").field(&self.name).finish()
    }
}

struct NodeState {
    status: TaskStatus,
    output: Option<NodeValue>,
    error: Option<DeployGraphError>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

/// A single step of a deployment.
pub struct TaskNode {
    id: String,
    name: String,
    func: Box<dyn ErasedTask>,
    dependencies: Vec<String>,
    /// Registration index of each dependency, bound when the node joined a
    /// graph. `None` for names not registered yet at that point.
    upstream: Vec<Option<usize>>,
    timeout: Option<Duration>,
    created_at: DateTime<Utc>,
    state: RwLock<NodeState>,
    signal: CompletionSignal,
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("status", &self.status())
            .finish()
    }
}

impl TaskNode {
    pub fn new<F: TaskFn>(name: impl Into<String>, func: F, dependencies: &[&str]) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            func: Box::new(func),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            upstream: Vec::new(),
            timeout: None,
            created_at: Utc::now(),
            state: RwLock::new(NodeState {
                status: TaskStatus::Pending,
                output: None,
                error: None,
                started_at: None,
                completed_at: None,
            }),
            signal: CompletionSignal::new(),
        }
    }

    /// Deadline for this task's function, overriding the engine default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub(crate) fn bind_upstream(&mut self, upstream: Vec<Option<usize>>) {
        self.upstream = upstream;
    }

    pub(crate) fn upstream(&self) -> &[Option<usize>] {
        &self.upstream
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.read_state().started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.read_state().completed_at
    }

    pub fn status(&self) -> TaskStatus {
        self.read_state().status
    }

    /// Set only once the node has failed.
    pub fn error(&self) -> Option<DeployGraphError> {
        self.read_state().error.clone()
    }

    pub fn error_message(&self) -> Option<String> {
        self.read_state().error.as_ref().map(ToString::to_string)
    }

    /// Typed output, `None` unless the node completed with a value of type `T`.
    pub fn output<T: Clone + 'static>(&self) -> Option<T> {
        let state = self.read_state();
        state.output.as_ref()?.value.downcast_ref::<T>().cloned()
    }

    /// JSON encoding of the output, `None` unless the node completed.
    pub fn output_json(&self) -> Option<Vec<u8>> {
        self.read_state().output.as_ref().map(|v| v.json.clone())
    }

    /// Wait until the node reaches a terminal status.
    pub async fn wait(&self) {
        self.signal.wait().await
    }

    fn read_state(&self) -> RwLockReadGuard<'_, NodeState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, NodeState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: TaskStatus, update: impl FnOnce(&mut NodeState)) -> bool {
        let mut state = self.write_state();
        if !state.status.can_transition_to(next) {
            warn!(
                task = %self.name,
                from = %state.status,
                to = %next,
                "ignoring illegal task status transition"
            );
            return false;
        }
        state.status = next;
        update(&mut state);
        true
    }

    fn mark_failed(&self, err: DeployGraphError) {
        self.transition(TaskStatus::Failed, |state| {
            state.error = Some(err);
            state.completed_at = Some(Utc::now());
        });
    }

    /// Drive this node to a terminal status. Runs at most once per node.
    pub(crate) async fn execute(self: Arc<Self>, deps: Vec<Arc<TaskNode>>, run: Arc<RunContext>) {
        if self.status() != TaskStatus::Pending || self.signal.is_fired() {
            debug!(task = %self.name, "task already executed; skipping");
            return;
        }

        let _settle = SettleOnDrop { node: &*self };
        let exec = run.execution();
        let store = exec.store();
        let deployment = exec.deployment_name();

        self.persist(
            "create task record",
            store
                .create_task_record(&TaskRecord {
                    id: self.id.clone(),
                    deployment_id: exec.deployment_id().to_string(),
                    name: self.name.clone(),
                    created_at: self.created_at,
                })
                .await,
        );
        self.persist(
            "mark waiting for upstream",
            store
                .update_task_status(&self.id, TaskUpdate::WaitingForUpstream)
                .await,
        );

        // Dependencies win over cancellation when both are ready, so a node
        // whose upstream failed always reports that dependency.
        let cancel = run.cancellation();
        let cancelled = tokio::select! {
            biased;
            _ = join_all(deps.iter().map(|d| d.wait())) => false,
            _ = cancel.cancelled() => true,
        };

        if let Some(failed) = deps.iter().find(|d| d.status() == TaskStatus::Failed) {
            let err = DeployGraphError::DependencyFailed {
                node: self.name.clone(),
                dependency: failed.name.clone(),
            };
            warn!(
                task = %self.name,
                deployment = %deployment,
                dependency = %failed.name,
                "cannot execute due to failed dependency"
            );
            self.mark_failed(err.clone());
            self.persist(
                "mark upstream failed",
                store
                    .update_task_status(
                        &self.id,
                        TaskUpdate::UpstreamFailed {
                            dependency: failed.name.clone(),
                            error: err.to_string(),
                        },
                    )
                    .await,
            );
            self.signal.fire();
            return;
        }

        if cancelled || cancel.is_cancelled() {
            let err = DeployGraphError::Cancelled {
                node: self.name.clone(),
            };
            info!(task = %self.name, deployment = %deployment, "task cancelled before start");
            self.mark_failed(err.clone());
            self.persist(
                "mark cancelled",
                store
                    .update_task_status(
                        &self.id,
                        TaskUpdate::Failed {
                            message: format!("Task {} cancelled", self.name),
                            error: err.to_string(),
                        },
                    )
                    .await,
            );
            self.signal.fire();
            return;
        }

        self.transition(TaskStatus::InProgress, |state| {
            state.started_at = Some(Utc::now());
        });
        self.persist(
            "mark running",
            store
                .update_task_status(
                    &self.id,
                    TaskUpdate::Running {
                        message: format!("Deployment task {} in progress", self.name),
                    },
                )
                .await,
        );
        if let Err(e) = store
            .update_deployment_status(
                exec.deployment_id(),
                DeploymentUpdate::Running {
                    message: format!("Deployment task {} in progress", self.name),
                },
            )
            .await
        {
            warn!(task = %self.name, error = %e, "failed to mark deployment running");
        }

        info!(task = %self.name, task_id = %self.id, deployment = %deployment, "task started");
        let timeout = self.timeout.or_else(|| exec.config().node_timeout());
        let ctx = TaskContext::new(Arc::clone(&run), &self.id, &self.name);

        match self.invoke(ctx, timeout).await {
            Ok(value) => {
                let json = value.json.clone();
                self.transition(TaskStatus::Completed, |state| {
                    state.output = Some(value);
                    state.completed_at = Some(Utc::now());
                });
                info!(task = %self.name, deployment = %deployment, "task completed");
                self.persist(
                    "mark success",
                    store
                        .update_task_status(&self.id, TaskUpdate::Success { output: json })
                        .await,
                );
                self.signal.fire();
            }
            Err(err) => {
                error!(
                    task = %self.name,
                    task_id = %self.id,
                    deployment = %deployment,
                    error = %err,
                    "task failed"
                );
                self.mark_failed(err.clone());
                self.persist(
                    "mark failed",
                    store
                        .update_task_status(
                            &self.id,
                            TaskUpdate::Failed {
                                message: format!("Deployment failed at the task {}", self.name),
                                error: err.to_string(),
                            },
                        )
                        .await,
                );
                self.signal.fire();
                if exec.config().cancel_on_failure {
                    debug!(task = %self.name, "cancelling tasks that have not started");
                    cancel.cancel();
                }
            }
        }
    }

    async fn invoke(
        &self,
        ctx: TaskContext,
        timeout: Option<Duration>,
    ) -> Result<NodeValue, DeployGraphError> {
        let call = AssertUnwindSafe(async { ErasedTask::call(&*self.func, ctx).await }).catch_unwind();

        let outcome = match timeout {
            Some(after) => match tokio::time::timeout(after, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(DeployGraphError::Timeout {
                        node: self.name.clone(),
                        after,
                    });
                }
            },
            None => call.await,
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(DeployGraphError::NodeExecution {
                node: self.name.clone(),
                message: format!("{e:#}"),
            }),
            Err(panic) => Err(DeployGraphError::NodeExecution {
                node: self.name.clone(),
                message: format!("panicked: {}", panic_message(panic.as_ref())),
            }),
        }
    }

    /// Status writes never change a node's result; a failed write is only logged.
    fn persist(&self, what: &str, result: Result<(), StoreError>) {
        if let Err(e) = result {
            warn!(
                task = %self.name,
                task_id = %self.id,
                error = %DeployGraphError::Persistence(e.to_string()),
                "failed to {what}"
            );
        }
    }
}

/// Settles a node whose worker stops early, so waiters are never stranded.
///
/// Covers a panic outside the task function, such as in a status store, and
/// the worker being aborted.
struct SettleOnDrop<'a> {
    node: &'a TaskNode,
}

impl Drop for SettleOnDrop<'_> {
    fn drop(&mut self) {
        if self.node.signal.is_fired() {
            return;
        }
        if !self.node.status().is_terminal() {
            error!(task = %self.node.name, "task worker stopped before the task settled");
            self.node.mark_failed(DeployGraphError::NodeExecution {
                node: self.node.name.clone(),
                message: "task worker stopped before the task settled".to_string(),
            });
        }
        self.node.signal.fire();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
