//! Lifecycle tracking for external calls, keyed by `(target id, task kind)`.
//!
//! [`TaskSupervisor::run`] does not queue or reject overlapping runs for the
//! same key: both results are returned to their callers and the key's status
//! follows the most recently started run (last write wins). Callers that need
//! exclusivity use [`TaskSupervisor::try_start`] or
//! [`TaskSupervisor::run_exclusive`].

use crate::core::error::{ErrorKind, ForgeError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    GenerateBatch,
    GenerateVariations,
    GenerateFoil,
    GenerateDossier,
    GenerateOriginStory,
    RefineImage,
    ConversationalEdit,
    SelectVoice,
    SynthesizeSpeech,
    SuggestScenes,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Idle,
    Pending,
    Succeeded,
    Failed(ErrorKind),
}

#[derive(Debug, Clone)]
struct TaskEntry {
    status: TaskStatus,
    /// Id of the most recently started run for this key.
    run_id: u64,
    in_flight: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTask {
    pub target_id: String,
    pub kind: TaskKind,
}

#[derive(Default)]
pub struct TaskSupervisor {
    tasks: Mutex<HashMap<(String, TaskKind), TaskEntry>>,
    next_run: AtomicU64,
}

/// One started run. Finishing it, or dropping it unfinished, settles the
/// key; a run dropped mid-flight is recorded as cancelled.
#[must_use = "a task left unused is recorded as cancelled when dropped"]
pub struct TaskGuard<'a> {
    supervisor: &'a TaskSupervisor,
    target_id: String,
    kind: TaskKind,
    run_id: u64,
    finished: bool,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<(String, TaskKind), TaskEntry>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self, target_id: &str, kind: TaskKind) -> TaskStatus {
        self.tasks()
            .get(&(target_id.to_string(), kind))
            .map(|entry| entry.status)
            .unwrap_or(TaskStatus::Idle)
    }

    pub fn is_busy(&self, target_id: &str, kind: TaskKind) -> bool {
        self.status(target_id, kind) == TaskStatus::Pending
    }

    /// Whether any kind of task is pending for `target_id`.
    pub fn is_target_busy(&self, target_id: &str) -> bool {
        self.tasks()
            .iter()
            .any(|((target, _), entry)| target == target_id && entry.status == TaskStatus::Pending)
    }

    pub fn active_tasks(&self) -> Vec<ActiveTask> {
        let mut active: Vec<ActiveTask> = self
            .tasks()
            .iter()
            .filter(|(_, entry)| entry.status == TaskStatus::Pending)
            .map(|((target_id, kind), _)| ActiveTask {
                target_id: target_id.clone(),
                kind: *kind,
            })
            .collect();
        active.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        active
    }

    /// Forgets finished entries for `target_id`, e.g. once a record is removed.
    pub fn clear_target(&self, target_id: &str) {
        self.tasks()
            .retain(|(target, _), entry| target != target_id || entry.in_flight > 0);
    }

    fn mark_pending(&self, tasks: &mut HashMap<(String, TaskKind), TaskEntry>, target_id: &str, kind: TaskKind) -> TaskGuard<'_> {
        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = tasks
            .entry((target_id.to_string(), kind))
            .or_insert(TaskEntry {
                status: TaskStatus::Idle,
                run_id,
                in_flight: 0,
            });
        if entry.status == TaskStatus::Pending {
            warn!(
                "{} for {} started while another run is pending; last write wins",
                kind, target_id
            );
        }
        entry.status = TaskStatus::Pending;
        entry.run_id = run_id;
        entry.in_flight += 1;
        debug!("{} for {} pending (run {})", kind, target_id, run_id);
        TaskGuard {
            supervisor: self,
            target_id: target_id.to_string(),
            kind,
            run_id,
            finished: false,
        }
    }

    /// Marks `(target_id, kind)` pending even if another run already is.
    pub fn start(&self, target_id: &str, kind: TaskKind) -> TaskGuard<'_> {
        let mut tasks = self.tasks();
        self.mark_pending(&mut tasks, target_id, kind)
    }

    /// Marks `(target_id, kind)` pending unless it already is. The check and
    /// the mark happen under one lock.
    pub fn try_start(&self, target_id: &str, kind: TaskKind) -> Result<TaskGuard<'_>, ForgeError> {
        let mut tasks = self.tasks();
        let busy = tasks
            .get(&(target_id.to_string(), kind))
            .is_some_and(|entry| entry.status == TaskStatus::Pending);
        if busy {
            return Err(ForgeError::contract(format!("{} for {} already in progress", kind, target_id)));
        }
        Ok(self.mark_pending(&mut tasks, target_id, kind))
    }

    fn finish(&self, target_id: &str, kind: TaskKind, run_id: u64, status: TaskStatus) {
        let mut tasks = self.tasks();
        if let Some(entry) = tasks.get_mut(&(target_id.to_string(), kind)) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            if entry.run_id == run_id {
                entry.status = status;
            } else {
                debug!("{} for {}: superseded run {} finished", kind, target_id, run_id);
            }
        }
    }

    /// Runs `operation` as the `(target_id, kind)` task.
    ///
    /// Failures are classified into [`ForgeError`]. Nothing is mutated here;
    /// applying the result or rolling back is up to the caller.
    pub async fn run<T, F, Fut>(&self, target_id: &str, kind: TaskKind, operation: F) -> Result<T, ForgeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.start(target_id, kind).run(operation).await
    }

    /// Like [`TaskSupervisor::run`], but refuses a pair that is already pending.
    pub async fn run_exclusive<T, F, Fut>(&self, target_id: &str, kind: TaskKind, operation: F) -> Result<T, ForgeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.try_start(target_id, kind)?.run(operation).await
    }
}

impl TaskGuard<'_> {
    fn settle(&mut self, status: TaskStatus) {
        if !self.finished {
            self.finished = true;
            self.supervisor
                .finish(&self.target_id, self.kind, self.run_id, status);
        }
    }

    /// Settles the task with `err` before the operation ever ran, e.g. when
    /// a precondition checked after starting fails. Returns `err`.
    pub fn fail(&mut self, err: ForgeError) -> ForgeError {
        self.settle(TaskStatus::Failed(err.kind()));
        err
    }

    pub async fn run<T, F, Fut>(mut self, operation: F) -> Result<T, ForgeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match operation().await {
            Ok(value) => {
                self.settle(TaskStatus::Succeeded);
                debug!("{} for {} succeeded", self.kind, self.target_id);
                Ok(value)
            }
            Err(e) => {
                let err = ForgeError::classify(&e);
                self.settle(TaskStatus::Failed(err.kind()));
                if err.kind() == ErrorKind::Cancelled {
                    info!("{} for {} cancelled", self.kind, self.target_id);
                } else {
                    warn!("{} for {} failed: {:#}", self.kind, self.target_id, e);
                }
                Err(err)
            }
        }
    }
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            info!("{} for {} dropped before finishing", self.kind, self.target_id);
            self.settle(TaskStatus::Failed(ErrorKind::Cancelled));
        }
    }
}
