//! In-process task registry with TTL eviction.
//!
//! The manager owns every [`TaskEntry`]; callers only ever see snapshots or
//! metadata. One `parking_lot::Mutex` over the map linearizes all status
//! transitions. Waiters block on a per-task `watch` channel carrying the final
//! [`TaskOutcome`], racing it against their timeout and manager shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::types::{
    ListTasksResult, TaskMetadata, TaskOutcome, TaskSnapshot, TaskStats, TaskStatus,
    duration_millis,
};
use crate::error::{McpError, Result};

/// Status message of a freshly created task.
pub const MSG_WORKING: &str = "Task is being processed";
/// Status message after completion.
pub const MSG_COMPLETED: &str = "Task completed successfully";
/// Status message after cancellation.
pub const MSG_CANCELED: &str = "Task was canceled";
/// Status message after cancellation by manager shutdown.
pub const MSG_SHUTDOWN: &str = "Task canceled: manager shutting down";

/// Page size used by `list_tasks` when no limit is given.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Configuration for a [`TaskManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskManagerConfig {
    /// TTL applied when the creator does not request one.
    pub default_ttl: Duration,
    /// Upper bound for requested TTLs.
    pub max_ttl: Duration,
    /// Polling interval suggested to clients.
    pub poll_interval: Duration,
    /// Period of the background sweep.
    pub cleanup_interval: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60 * 60),
            max_ttl: Duration::from_secs(24 * 60 * 60),
            poll_interval: Duration::from_millis(1000),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl TaskManagerConfig {
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl = ttl;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Effective TTL for a creation request.
    pub fn resolve_ttl(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(ttl) if !ttl.is_zero() => ttl.min(self.max_ttl),
            _ => self.default_ttl,
        }
    }
}

struct TaskEntry {
    id: String,
    status: TaskStatus,
    status_message: Option<String>,
    method: String,
    params: Option<Value>,
    created_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
    ttl: Duration,
    expires_at: Instant,
    result: Option<Value>,
    error: Option<String>,
    cancel: CancellationToken,
    done: watch::Sender<Option<TaskOutcome>>,
}

impl TaskEntry {
    fn touch(&mut self) {
        // Wall clocks can step backwards; keep the timestamp monotonic.
        self.last_updated_at = Utc::now().max(self.last_updated_at);
    }

    fn transition(&mut self, to: TaskStatus, message: Option<String>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(McpError::TaskTerminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        if !self.status.can_transition_to(to) {
            return Err(McpError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.status_message = message;
        self.touch();
        Ok(())
    }

    /// Move to a terminal state and release every waiter.
    fn finish(&mut self, outcome: TaskOutcome, message: Option<String>) -> Result<()> {
        self.transition(outcome.status(), message)?;
        match &outcome {
            TaskOutcome::Completed(value) => self.result = Some(value.clone()),
            TaskOutcome::Failed { message, .. } => self.error = Some(message.clone()),
            TaskOutcome::Canceled => self.cancel.cancel(),
        }
        self.done.send_replace(Some(outcome));
        Ok(())
    }

    fn expires_at_wall(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn metadata(&self, poll_interval: Duration) -> TaskMetadata {
        TaskMetadata {
            task_id: self.id.clone(),
            status: self.status,
            status_message: self.status_message.clone(),
            created_at: self.created_at,
            last_updated_at: self.last_updated_at,
            ttl: duration_millis(self.ttl),
            poll_interval: Some(duration_millis(poll_interval)),
        }
    }

    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            status: self.status,
            status_message: self.status_message.clone(),
            method: self.method.clone(),
            params: self.params.clone(),
            created_at: self.created_at,
            last_updated_at: self.last_updated_at,
            expires_at: self.expires_at_wall(),
            ttl: self.ttl,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

struct SweepHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

struct Inner {
    config: TaskManagerConfig,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<SweepHandle>>,
    sweeps: watch::Sender<u64>,
}

/// Registry of in-flight tasks.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("config", &self.inner.config)
            .field("tasks", &self.task_count())
            .finish()
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new(TaskManagerConfig::default())
    }
}

impl TaskManager {
    pub fn new(config: TaskManagerConfig) -> Self {
        let (sweeps, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                config,
                tasks: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                sweeper: Mutex::new(None),
                sweeps,
            }),
        }
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.inner.config
    }

    /// Suggested client polling interval.
    pub fn poll_interval(&self) -> Duration {
        self.inner.config.poll_interval
    }

    /// Whether `shutdown` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Register a new task in the `working` state.
    pub fn create_task(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        requested_ttl: Option<Duration>,
    ) -> Result<TaskHandle> {
        if self.is_shut_down() {
            return Err(McpError::Shutdown);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let ttl = self.inner.config.resolve_ttl(requested_ttl);
        let now = Utc::now();
        let cancel = self.inner.shutdown.child_token();
        let (done, _) = watch::channel(None);

        let entry = TaskEntry {
            id: id.clone(),
            status: TaskStatus::Working,
            status_message: Some(MSG_WORKING.to_string()),
            method: method.into(),
            params,
            created_at: now,
            last_updated_at: now,
            ttl,
            expires_at: deadline_after(ttl),
            result: None,
            error: None,
            cancel: cancel.clone(),
            done,
        };

        tracing::info!(task_id = %id, method = %entry.method, ttl_ms = duration_millis(ttl), "Task created");
        self.inner.tasks.lock().insert(id.clone(), entry);

        Ok(TaskHandle {
            id,
            manager: self.clone(),
            cancel,
        })
    }

    /// Snapshot of a task.
    pub fn get_task(&self, id: &str) -> Result<TaskSnapshot> {
        self.with_task(id, |entry| Ok(entry.snapshot()))
    }

    /// Wire metadata of a task.
    pub fn get_metadata(&self, id: &str) -> Result<TaskMetadata> {
        let poll = self.poll_interval();
        self.with_task(id, |entry| Ok(entry.metadata(poll)))
    }

    /// Block until the task is terminal, the timeout elapses, or the manager shuts down.
    ///
    /// Returns immediately for an already-terminal task.
    pub async fn wait_for_result(&self, id: &str, timeout: Duration) -> Result<Value> {
        let mut done = self.with_task(id, |entry| Ok(entry.done.subscribe()))?;

        let outcome = tokio::select! {
            biased;
            res = done.wait_for(Option::is_some) => match res {
                Ok(outcome) => (*outcome).clone(),
                // Sender dropped: the task was deleted or swept while we waited.
                Err(_) => None,
            },
            _ = self.inner.shutdown.cancelled() => return Err(McpError::Shutdown),
            _ = tokio::time::sleep(timeout) => {
                return Err(McpError::timeout(format!("task {id}")));
            }
        };

        match outcome {
            Some(outcome) => outcome.into_result(id),
            None => Err(McpError::TaskNotFound(id.to_string())),
        }
    }

    /// Cancel a non-terminal task and release its waiters.
    pub fn cancel_task(&self, id: &str) -> Result<TaskMetadata> {
        let poll = self.poll_interval();
        let meta = self.with_task_mut(id, |entry| {
            entry.finish(TaskOutcome::Canceled, Some(MSG_CANCELED.to_string()))?;
            Ok(entry.metadata(poll))
        })?;
        tracing::info!(task_id = %id, "Task canceled");
        Ok(meta)
    }

    /// Record a successful result.
    pub fn complete_task(&self, id: &str, result: Value) -> Result<()> {
        self.with_task_mut(id, |entry| {
            entry.finish(
                TaskOutcome::Completed(result),
                Some(MSG_COMPLETED.to_string()),
            )
        })?;
        tracing::debug!(task_id = %id, "Task completed");
        Ok(())
    }

    /// Record a failure. `tool_error` marks failures reported by a tool result
    /// rather than by the machinery running it.
    pub fn fail_task(&self, id: &str, message: impl Into<String>, tool_error: bool) -> Result<()> {
        let message = message.into();
        self.with_task_mut(id, |entry| {
            entry.finish(
                TaskOutcome::Failed {
                    message: message.clone(),
                    tool_error,
                },
                Some(message.clone()),
            )
        })?;
        tracing::debug!(task_id = %id, error = %message, "Task failed");
        Ok(())
    }

    /// Move between the non-terminal states (`working` and `input_required`).
    ///
    /// Terminal states are reached through `complete_task`, `fail_task` or
    /// `cancel_task`, which also publish the outcome.
    pub fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        message: Option<String>,
    ) -> Result<()> {
        self.with_task_mut(id, |entry| {
            if status.is_terminal() && !entry.status.is_terminal() {
                return Err(McpError::InvalidTransition {
                    id: entry.id.clone(),
                    from: entry.status,
                    to: status,
                });
            }
            entry.transition(status, message)
        })
    }

    /// One page of task metadata, ordered by creation time.
    ///
    /// The cursor is the decimal offset returned as `next_cursor` by the
    /// previous page. Pages are best effort when tasks come and go between calls.
    pub fn list_tasks(&self, cursor: Option<&str>, limit: Option<usize>) -> Result<ListTasksResult> {
        let offset = match cursor {
            Some(c) if !c.is_empty() => c
                .parse::<usize>()
                .map_err(|_| McpError::protocol(format!("invalid cursor: {c}")))?,
            _ => 0,
        };
        let limit = limit.filter(|l| *l > 0).unwrap_or(DEFAULT_PAGE_SIZE);
        let poll = self.poll_interval();

        let mut all: Vec<TaskMetadata> = {
            let tasks = self.inner.tasks.lock();
            tasks.values().map(|e| e.metadata(poll)).collect()
        };
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });

        let total = all.len();
        let tasks: Vec<_> = all.into_iter().skip(offset).take(limit).collect();
        let end = offset.saturating_add(tasks.len());
        let next_cursor = (end < total).then(|| end.to_string());

        Ok(ListTasksResult { tasks, next_cursor })
    }

    /// Remove a task regardless of its state. Returns whether it existed.
    pub fn delete_task(&self, id: &str) -> bool {
        let removed = self.inner.tasks.lock().remove(id);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::debug!(task_id = %id, "Task deleted");
                true
            }
            None => false,
        }
    }

    /// Remove every task whose TTL has elapsed, whatever its status.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<TaskEntry> = {
            let mut tasks = self.inner.tasks.lock();
            let ids: Vec<String> = tasks
                .values()
                .filter(|e| e.expires_at <= now)
                .map(|e| e.id.clone())
                .collect();
            ids.iter().filter_map(|id| tasks.remove(id)).collect()
        };

        for entry in &expired {
            entry.cancel.cancel();
            tracing::debug!(task_id = %entry.id, status = %entry.status, "Task expired");
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Swept expired tasks");
        }
        self.inner.sweeps.send_modify(|n| *n += 1);
        expired.len()
    }

    /// Counter bumped after every sweep pass.
    pub fn sweeps(&self) -> watch::Receiver<u64> {
        self.inner.sweeps.subscribe()
    }

    /// Start the periodic sweep. Does nothing when it is already running.
    pub fn start_sweeper(&self) {
        let mut slot = self.inner.sweeper.lock();
        if slot.is_some() || self.is_shut_down() {
            return;
        }

        let token = self.inner.shutdown.child_token();
        let interval = self.inner.config.cleanup_interval;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let stop = token.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        TaskManager { inner }.sweep_expired();
                    }
                }
            }
            tracing::debug!("Task sweeper stopped");
        });

        tracing::debug!(interval_secs = interval.as_secs(), "Task sweeper started");
        *slot = Some(SweepHandle { token, join });
    }

    /// Stop the periodic sweep and wait for it to exit.
    pub async fn stop_sweeper(&self) {
        let handle = self.inner.sweeper.lock().take();
        if let Some(SweepHandle { token, join }) = handle {
            token.cancel();
            if let Err(e) = join.await {
                tracing::warn!(error = %e, "Task sweeper ended abnormally");
            }
        }
    }

    /// Cancel every non-terminal task, release all waiters and stop the sweeper.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let canceled = {
            let mut tasks = self.inner.tasks.lock();
            tasks
                .values_mut()
                .filter(|e| !e.status.is_terminal())
                .filter_map(|e| {
                    e.finish(TaskOutcome::Canceled, Some(MSG_SHUTDOWN.to_string()))
                        .ok()
                })
                .count()
        };
        tracing::info!(canceled, "Task manager shut down");

        self.stop_sweeper().await;
    }

    /// Number of tracked tasks.
    pub fn task_count(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Task counts per status.
    pub fn stats(&self) -> TaskStats {
        let tasks = self.inner.tasks.lock();
        let mut stats = TaskStats::default();
        for entry in tasks.values() {
            stats.record(entry.status);
        }
        stats
    }

    fn with_task<T>(&self, id: &str, f: impl FnOnce(&TaskEntry) -> Result<T>) -> Result<T> {
        let tasks = self.inner.tasks.lock();
        let entry = tasks
            .get(id)
            .ok_or_else(|| McpError::TaskNotFound(id.to_string()))?;
        f(entry)
    }

    fn with_task_mut<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut TaskEntry) -> Result<T>,
    ) -> Result<T> {
        let mut tasks = self.inner.tasks.lock();
        let entry = tasks
            .get_mut(id)
            .ok_or_else(|| McpError::TaskNotFound(id.to_string()))?;
        f(entry)
    }
}

/// `now + ttl`, saturating at a century out for huge durations.
pub(crate) fn deadline_after(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 60 * 60))
}

/// Producer side of a task.
///
/// Returned by [`TaskManager::create_task`]; the code doing the work uses it to
/// observe cancellation and to report the outcome.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: String,
    manager: TaskManager,
    cancel: CancellationToken,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolves once the task is canceled, deleted, swept or the manager shuts down.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn metadata(&self) -> Result<TaskMetadata> {
        self.manager.get_metadata(&self.id)
    }

    pub fn complete(&self, result: Value) -> Result<()> {
        self.manager.complete_task(&self.id, result)
    }

    pub fn fail(&self, message: impl Into<String>, tool_error: bool) -> Result<()> {
        self.manager.fail_task(&self.id, message, tool_error)
    }

    /// Pause for caller input.
    pub fn require_input(&self, message: impl Into<String>) -> Result<()> {
        self.manager
            .update_status(&self.id, TaskStatus::InputRequired, Some(message.into()))
    }

    /// Resume after input was provided.
    pub fn resume(&self) -> Result<()> {
        self.manager.update_status(
            &self.id,
            TaskStatus::Working,
            Some(MSG_WORKING.to_string()),
        )
    }
}
