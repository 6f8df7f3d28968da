//! Update task lifecycle
//!
//! An [`UpdateTask`] is held by the UI side. Starting it spawns a background
//! worker that runs the task's [`Workflow`] with a [`TaskContext`]. The worker
//! is the only writer of the task state; the UI polls immutable
//! [`TaskSnapshot`]s once per frame or subscribes to changes.
//!
//! Lifecycle:
//! 1. `NotStarted` until [`UpdateTask::start`] claims the task
//! 2. `Running` while the workflow executes its phases
//! 3. `Done` or `Failed`, both terminal
//!
//! Dropping the `UpdateTask` cancels the worker. The workflow notices at its
//! next safe point (every poll and every sleep) and exits without touching
//! the state again.

use async_trait::async_trait;
use depthfw_core::{DeviceIdentity, ErrorKind};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::UpdateError;

/// Default interval between two probes of a bounded wait
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default hint appended to unknown failures
pub const DEFAULT_RECOVERY_HINT: &str = "Please reconnect the camera to exit recovery mode";

/// Status of an update task; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

/// Immutable view of a task handed to the UI
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub process_name: String,
    pub status: TaskStatus,
    /// Overall progress, 0..=100
    pub progress: f32,
    /// Append-only log, one line per entry, each terminated by `\n`
    pub log: String,
    pub last_error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub target_identity: Option<DeviceIdentity>,
}

impl TaskSnapshot {
    fn new(id: Uuid, process_name: &str) -> Self {
        Self {
            id,
            process_name: process_name.to_string(),
            status: TaskStatus::NotStarted,
            progress: 0.0,
            log: String::new(),
            last_error: None,
            error_kind: None,
            target_identity: None,
        }
    }

    pub fn started(&self) -> bool {
        self.status != TaskStatus::NotStarted
    }

    pub fn done(&self) -> bool {
        self.status == TaskStatus::Done
    }

    pub fn failed(&self) -> bool {
        self.status == TaskStatus::Failed
    }

    /// Log split into lines, without the trailing empty entry
    pub fn log_lines(&self) -> Vec<&str> {
        self.log.lines().collect()
    }
}

/// A unit of background work driven by an [`UpdateTask`]
///
/// `process_flow` must either finish with [`TaskContext::complete`] or
/// return an error; the runner turns every error into a terminal failure.
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Name used in log lines ("Started <name> process")
    fn process_name(&self) -> &str;

    /// Hint appended to unknown failures
    fn recovery_hint(&self) -> &str {
        DEFAULT_RECOVERY_HINT
    }

    /// Invoked once after the task failed
    fn cleanup(&self, _ctx: &TaskContext) {}

    async fn process_flow(&self, ctx: &TaskContext) -> Result<(), UpdateError>;
}

/// Worker-side handle to the task state, with cooperative cancellation
#[derive(Clone)]
pub struct TaskContext {
    id: Uuid,
    process_name: Arc<str>,
    recovery_hint: Arc<str>,
    state: Arc<watch::Sender<TaskSnapshot>>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl TaskContext {
    /// Apply a state change unless the run was cancelled
    ///
    /// The cancellation check happens under the state lock, so a reset on
    /// the UI side can never be overwritten by a stale worker.
    fn update(&self, modify: impl FnOnce(&mut TaskSnapshot) -> bool) -> bool {
        let cancel = &self.cancel;
        self.state.send_if_modified(|state| {
            if cancel.is_cancelled() {
                return false;
            }
            modify(state)
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn recovery_hint(&self) -> &str {
        &self.recovery_hint
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Append one line to the task log
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        let appended = self.update(|state| {
            state.log.push_str(&line);
            state.log.push('\n');
            true
        });
        if appended {
            info!(task = %self.id, "{}", line);
        }
    }

    /// Record a runtime failure; see [`TaskContext::fail_with`]
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.fail_with(ErrorKind::Runtime, message)
    }

    /// Record a terminal failure: progress back to 0, `ERROR:` log line
    ///
    /// Only the first failure of a run is kept; returns whether this call
    /// was the one recorded.
    pub fn fail_with(&self, kind: ErrorKind, message: impl Into<String>) -> bool {
        let message = message.into();
        let applied = self.update(|state| {
            if state.status.is_terminal() {
                return false;
            }
            state.last_error = Some(message.clone());
            state.error_kind = Some(kind);
            state.progress = 0.0;
            state.log.push_str("ERROR: ");
            state.log.push_str(&message);
            state.log.push('\n');
            state.status = TaskStatus::Failed;
            true
        });

        if applied {
            error!(task = %self.id, kind = %kind, "{}", message);
        } else {
            debug!(task = %self.id, "Ignoring failure on finished task: {}", message);
        }
        applied
    }

    /// Raise overall progress; lower values and finished tasks are ignored
    pub fn set_progress(&self, percent: f32) {
        if percent.is_nan() {
            return;
        }
        let percent = percent.clamp(0.0, 100.0);
        self.update(|state| {
            if state.status != TaskStatus::Running || percent <= state.progress {
                return false;
            }
            state.progress = percent;
            true
        });
    }

    /// Mark the run successful
    pub fn complete(&self) {
        let completed = self.update(|state| {
            if state.status != TaskStatus::Running {
                return false;
            }
            state.progress = 100.0;
            state.status = TaskStatus::Done;
            true
        });
        if completed {
            info!(task = %self.id, "{} process completed", self.process_name);
        }
    }

    pub fn set_target_identity(&self, identity: &DeviceIdentity) {
        self.update(|state| {
            state.target_identity = Some(identity.clone());
            true
        });
    }

    pub fn is_terminal(&self) -> bool {
        self.state.borrow().status.is_terminal()
    }

    /// Safe point: bail out once the holder has gone away
    pub fn ensure_active(&self) -> Result<(), UpdateError> {
        if self.cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        Ok(())
    }

    /// Sleep that wakes up early on cancellation
    pub async fn sleep(&self, duration: Duration) -> Result<(), UpdateError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(UpdateError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// UI-side holder of one update run
pub struct UpdateTask {
    id: Uuid,
    workflow: Arc<dyn Workflow>,
    state: Arc<watch::Sender<TaskSnapshot>>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl UpdateTask {
    pub fn new(workflow: impl Workflow) -> Self {
        Self::from_arc(Arc::new(workflow))
    }

    pub fn from_arc(workflow: Arc<dyn Workflow>) -> Self {
        let id = Uuid::new_v4();
        let (state, _) = watch::channel(TaskSnapshot::new(id, workflow.process_name()));
        Self {
            id,
            workflow,
            state: Arc::new(state),
            cancel: CancellationToken::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the interval between two probes of a bounded wait
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn process_name(&self) -> &str {
        self.workflow.process_name()
    }

    /// Spawn the background worker on the current tokio runtime
    ///
    /// Only the first call of a run spawns a worker; later calls return
    /// [`UpdateError::AlreadyStarted`] until the task is [reset](Self::reset).
    pub fn start(&self) -> Result<(), UpdateError> {
        let runtime = Handle::try_current().map_err(|_| UpdateError::NoRuntime)?;

        let claimed = self.state.send_if_modified(|state| {
            if state.status != TaskStatus::NotStarted {
                return false;
            }
            state.status = TaskStatus::Running;
            true
        });
        if !claimed {
            warn!(task = %self.id, "Ignoring start request, task already started");
            return Err(UpdateError::AlreadyStarted);
        }

        let ctx = self.context();
        ctx.log(format!("Started {} process", self.workflow.process_name()));

        runtime.spawn(run_worker(self.workflow.clone(), ctx));
        Ok(())
    }

    /// Return a finished task to `NotStarted` so it can run again from the
    /// beginning
    pub fn reset(&mut self) -> Result<(), UpdateError> {
        if self.status() == TaskStatus::Running {
            return Err(UpdateError::Busy);
        }

        // Silences a worker that is still unwinding after its terminal write
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.state
            .send_replace(TaskSnapshot::new(self.id, self.workflow.process_name()));
        debug!(task = %self.id, "Task reset");
        Ok(())
    }

    fn context(&self) -> TaskContext {
        TaskContext {
            id: self.id,
            process_name: Arc::from(self.workflow.process_name()),
            recovery_hint: Arc::from(self.workflow.recovery_hint()),
            state: self.state.clone(),
            cancel: self.cancel.child_token(),
            poll_interval: self.poll_interval,
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<TaskSnapshot> {
        self.state.subscribe()
    }

    pub fn status(&self) -> TaskStatus {
        self.state.borrow().status
    }

    pub fn progress(&self) -> f32 {
        self.state.borrow().progress
    }

    pub fn log(&self) -> String {
        self.state.borrow().log.clone()
    }

    pub fn started(&self) -> bool {
        self.state.borrow().started()
    }

    pub fn done(&self) -> bool {
        self.state.borrow().done()
    }

    pub fn failed(&self) -> bool {
        self.state.borrow().failed()
    }

    /// Failure message, only once the task has failed
    pub fn check_error(&self) -> Option<String> {
        let state = self.state.borrow();
        if state.failed() {
            state.last_error.clone()
        } else {
            None
        }
    }

    /// Wait until the run is done or failed
    ///
    /// A task that was never started returns its snapshot right away.
    pub async fn wait(&self) -> TaskSnapshot {
        let mut rx = self.subscribe();
        let snapshot = match rx
            .wait_for(|state| !state.started() || state.status.is_terminal())
            .await
        {
            Ok(state) => state.clone(),
            // The sender lives as long as `self`
            Err(_) => self.snapshot(),
        };
        snapshot
    }
}

#[cfg(test)]
impl UpdateTask {
    /// Claim the task without spawning a worker so a context can be driven
    /// directly
    pub(crate) fn claim_context(&self) -> TaskContext {
        self.state
            .send_modify(|state| state.status = TaskStatus::Running);
        self.context()
    }
}

impl Drop for UpdateTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Worker entry point; nothing escapes past this boundary
async fn run_worker(workflow: Arc<dyn Workflow>, ctx: TaskContext) {
    let flow = workflow.clone();
    let flow_ctx = ctx.clone();
    let outcome = tokio::spawn(async move { flow.process_flow(&flow_ctx).await }).await;

    match outcome {
        Ok(Ok(())) => {
            if !ctx.is_terminal()
                && ctx.fail(format!(
                    "{} process ended without reporting completion",
                    ctx.process_name()
                ))
            {
                workflow.cleanup(&ctx);
            }
        }
        Ok(Err(UpdateError::Cancelled)) => {
            debug!(task = %ctx.id(), "Worker exiting, task holder dropped");
        }
        Ok(Err(e)) => {
            let kind = e.kind();
            let message = match kind {
                ErrorKind::Unknown => unknown_failure_message(&ctx),
                _ => e.to_string(),
            };
            // A failure already recorded inside the flow keeps its message
            if ctx.fail_with(kind, message) {
                workflow.cleanup(&ctx);
            }
        }
        Err(join_error) if join_error.is_panic() => {
            if ctx.fail_with(ErrorKind::Unknown, unknown_failure_message(&ctx)) {
                workflow.cleanup(&ctx);
            }
        }
        Err(_) => {
            debug!(task = %ctx.id(), "Worker aborted by runtime shutdown");
        }
    }
}

fn unknown_failure_message(ctx: &TaskContext) -> String {
    format!(
        "Unknown error during {} process!\n{}",
        ctx.process_name(),
        ctx.recovery_hint()
    )
}
