//! Download task tracking.
//!
//! The [`ProgressTracker`] owns every task's state machine:
//!
//! ```text
//! Pending ──start──▶ Running ◀──start── Paused
//!    │                 │  └────pause────▶ │
//!    └──────── complete / cancel ─────────┴──▶ Completed | Failed | Cancelled
//! ```
//!
//! Terminal tasks ignore further mutation. A background sweep fails tasks
//! that stop reporting progress and evicts finished tasks after a retention
//! period.

mod task;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub use task::{ProgressSnapshot, TaskId, TaskStatus};

use task::DownloadTask;

use crate::worker::WorkerHandle;

pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_TRACKER_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProgressError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("cannot {action} task {task_id} while {from}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        action: &'static str,
    },
}

impl ProgressError {
    fn invalid(task: &DownloadTask, action: &'static str) -> Self {
        Self::InvalidTransition {
            task_id: task.id.clone(),
            from: task.status,
            action,
        }
    }
}

/// Result of a mutation that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The task is terminal or already in the requested state.
    Ignored,
}

/// Whether a task's output file can be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "lowercase")]
pub enum FileStatus {
    Ready(PathBuf),
    Pending,
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// Running tasks idle this long are failed as stalled; warnings are
    /// logged at one and two thirds of it.
    pub stall_timeout: Duration,
    /// How long terminal tasks stay queryable.
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            retention: DEFAULT_RETENTION,
            sweep_interval: DEFAULT_TRACKER_SWEEP_INTERVAL,
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub warned: usize,
    pub stalled: usize,
    pub evicted: usize,
}

#[derive(Debug, Default)]
pub struct ProgressTracker {
    config: TrackerConfig,
    tasks: DashMap<TaskId, DownloadTask>,
    sweeper: Mutex<Option<WorkerHandle>>,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tasks: DashMap::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Registers a Pending task.
    pub fn create(&self, total: u32) -> TaskId {
        let id = TaskId::generate();
        self.tasks
            .insert(id.clone(), DownloadTask::new(id.clone(), total, Instant::now()));
        debug!(task_id = %id, total, "task created");
        id
    }

    /// Pending or Paused to Running.
    ///
    /// # Errors
    ///
    /// [`ProgressError::TaskNotFound`] for an unknown id.
    pub fn start(&self, id: &TaskId) -> Result<Transition, ProgressError> {
        self.mutate(id, "start", |task, now| match task.status {
            TaskStatus::Pending | TaskStatus::Paused => {
                task.status = TaskStatus::Running;
                task.started_at.get_or_insert(now);
                task.touch(now);
                Ok(Transition::Applied)
            }
            _ => Ok(Transition::Ignored),
        })
    }

    /// Running to Paused.
    ///
    /// # Errors
    ///
    /// [`ProgressError::InvalidTransition`] while Pending.
    pub fn pause(&self, id: &TaskId) -> Result<Transition, ProgressError> {
        self.mutate(id, "pause", |task, _| match task.status {
            TaskStatus::Running => {
                task.status = TaskStatus::Paused;
                Ok(Transition::Applied)
            }
            TaskStatus::Pending => Err(ProgressError::invalid(task, "pause")),
            _ => Ok(Transition::Ignored),
        })
    }

    /// Sets the chapter count once the TOC is known.
    ///
    /// # Errors
    ///
    /// [`ProgressError::TaskNotFound`] for an unknown id.
    pub fn set_total(&self, id: &TaskId, total: u32) -> Result<Transition, ProgressError> {
        self.mutate(id, "set total of", |task, now| {
            task.total = total;
            task.completed = task.completed.min(total);
            task.failed = task.failed.min(total - task.completed);
            task.touch(now);
            Ok(Transition::Applied)
        })
    }

    /// Records progress. `completed` never moves backwards and `failed` is
    /// clamped so that `completed + failed <= total`.
    ///
    /// # Errors
    ///
    /// [`ProgressError::InvalidTransition`] while Pending.
    pub fn update_progress(
        &self,
        id: &TaskId,
        completed: u32,
        current: Option<String>,
        failed: u32,
    ) -> Result<Transition, ProgressError> {
        self.mutate(id, "update", |task, now| {
            if task.status == TaskStatus::Pending {
                return Err(ProgressError::invalid(task, "update"));
            }
            task.completed = task.completed.max(completed).min(task.total);
            task.failed = failed.min(task.total - task.completed);
            if current.is_some() {
                task.current_chapter = current;
            }
            task.touch(now);
            Ok(Transition::Applied)
        })
    }

    /// Marks a Running task as alive without changing its counters, for
    /// long waits between progress updates. Other states are left alone.
    ///
    /// # Errors
    ///
    /// [`ProgressError::TaskNotFound`] for an unknown id.
    pub fn heartbeat(&self, id: &TaskId) -> Result<Transition, ProgressError> {
        self.mutate(id, "heartbeat", |task, now| {
            if task.status != TaskStatus::Running {
                return Ok(Transition::Ignored);
            }
            task.touch(now);
            Ok(Transition::Applied)
        })
    }

    /// # Errors
    ///
    /// [`ProgressError::TaskNotFound`] for an unknown id.
    pub fn set_file_path(&self, id: &TaskId, path: PathBuf) -> Result<Transition, ProgressError> {
        self.mutate(id, "set file of", |task, now| {
            task.file_path = Some(path);
            task.touch(now);
            Ok(Transition::Applied)
        })
    }

    /// Ends a task as Completed or Failed. Idempotent: completing a
    /// terminal task is ignored.
    ///
    /// # Errors
    ///
    /// [`ProgressError::TaskNotFound`] for an unknown id.
    #[instrument(skip(self), fields(task_id = %id))]
    pub fn complete(&self, id: &TaskId, success: bool, error: Option<String>) -> Result<Transition, ProgressError> {
        self.mutate(id, "complete", |task, now| {
            if success {
                task.completed = task.completed.max(task.total.saturating_sub(task.failed));
                task.finish(TaskStatus::Completed, error, now);
                info!(completed = task.completed, failed = task.failed, "task completed");
            } else {
                task.finish(TaskStatus::Failed, error, now);
                warn!(error = task.error_message.as_deref().unwrap_or(""), "task failed");
            }
            Ok(Transition::Applied)
        })
    }

    /// Cancels a task. Work in flight finishes on its own; its later updates
    /// are ignored.
    ///
    /// # Errors
    ///
    /// [`ProgressError::TaskNotFound`] for an unknown id.
    pub fn cancel(&self, id: &TaskId) -> Result<Transition, ProgressError> {
        self.mutate(id, "cancel", |task, now| {
            task.finish(TaskStatus::Cancelled, Some("cancelled".to_string()), now);
            info!(task_id = %task.id, "task cancelled");
            Ok(Transition::Applied)
        })
    }

    /// # Errors
    ///
    /// [`ProgressError::TaskNotFound`] for an unknown id.
    pub fn snapshot(&self, id: &TaskId) -> Result<ProgressSnapshot, ProgressError> {
        self.tasks
            .get(id)
            .map(|task| task.snapshot(Instant::now()))
            .ok_or_else(|| ProgressError::TaskNotFound(id.clone()))
    }

    /// Snapshots of every tracked task, ordered by id.
    #[must_use]
    pub fn snapshots(&self) -> Vec<ProgressSnapshot> {
        let now = Instant::now();
        let mut all: Vec<ProgressSnapshot> = self.tasks.iter().map(|task| task.snapshot(now)).collect();
        all.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        all
    }

    /// # Errors
    ///
    /// [`ProgressError::TaskNotFound`] for an unknown id.
    pub fn file_status(&self, id: &TaskId) -> Result<FileStatus, ProgressError> {
        let task = self
            .tasks
            .get(id)
            .ok_or_else(|| ProgressError::TaskNotFound(id.clone()))?;
        Ok(match (task.status, &task.file_path) {
            (TaskStatus::Completed, Some(path)) => FileStatus::Ready(path.clone()),
            (TaskStatus::Failed | TaskStatus::Cancelled, _) => FileStatus::Failed(
                task.error_message
                    .clone()
                    .unwrap_or_else(|| task.status.to_string()),
            ),
            (TaskStatus::Completed, None) => FileStatus::Failed("no file was produced".to_string()),
            _ => FileStatus::Pending,
        })
    }

    /// True once a task is cancelled, and for ids no longer tracked, so
    /// workers stop either way.
    #[must_use]
    pub fn is_cancelled(&self, id: &TaskId) -> bool {
        self.tasks
            .get(id)
            .is_none_or(|task| task.status == TaskStatus::Cancelled)
    }

    /// True once a task has ended for any reason (completed, failed,
    /// stalled or cancelled) and for ids no longer tracked.
    #[must_use]
    pub fn is_stopped(&self, id: &TaskId) -> bool {
        self.tasks.get(id).is_none_or(|task| task.status.is_terminal())
    }

    #[must_use]
    pub fn is_paused(&self, id: &TaskId) -> bool {
        self.tasks
            .get(id)
            .is_some_and(|task| task.status == TaskStatus::Paused)
    }

    pub fn remove(&self, id: &TaskId) -> bool {
        self.tasks.remove(id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Escalates warnings for idle Running tasks, fails those idle past the
    /// stall timeout and evicts terminal tasks past retention.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let stall = self.config.stall_timeout;
        let mut report = SweepReport::default();

        for mut task in self.tasks.iter_mut() {
            if task.status != TaskStatus::Running {
                continue;
            }
            let idle = now.saturating_duration_since(task.last_heartbeat);
            if idle >= stall {
                let message = format!("stalled: no progress for {}s", idle.as_secs());
                warn!(task_id = %task.id, idle_secs = idle.as_secs(), "task stalled, failing it");
                task.finish(TaskStatus::Failed, Some(message), now);
                report.stalled += 1;
            } else if idle >= stall * 2 / 3 && task.stall_warnings < 2 {
                task.stall_warnings = 2;
                warn!(task_id = %task.id, idle_secs = idle.as_secs(), level = 2, "task may be stalled");
                report.warned += 1;
            } else if idle >= stall / 3 && task.stall_warnings < 1 {
                task.stall_warnings = 1;
                warn!(task_id = %task.id, idle_secs = idle.as_secs(), level = 1, "task may be stalled");
                report.warned += 1;
            }
        }

        let retention = self.config.retention;
        let before = self.tasks.len();
        self.tasks.retain(|_, task| {
            !(task.status.is_terminal()
                && task
                    .ended_at
                    .is_some_and(|ended| now.saturating_duration_since(ended) >= retention))
        });
        report.evicted = before.saturating_sub(self.tasks.len());
        if report.evicted > 0 {
            debug!(evicted = report.evicted, "finished tasks evicted");
        }
        report
    }

    /// Starts the periodic sweep. A second call is a no-op.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *slot = Some(WorkerHandle::spawn("progress-sweeper", self.config.sweep_interval, move || {
            let weak = weak.clone();
            async move {
                let Some(tracker) = weak.upgrade() else {
                    return false;
                };
                tracker.sweep();
                true
            }
        }));
    }

    pub async fn shutdown(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// Applies `change` to a non-terminal task; terminal tasks are left
    /// untouched.
    fn mutate<F>(&self, id: &TaskId, action: &'static str, change: F) -> Result<Transition, ProgressError>
    where
        F: FnOnce(&mut DownloadTask, Instant) -> Result<Transition, ProgressError>,
    {
        let mut task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| ProgressError::TaskNotFound(id.clone()))?;
        if task.status.is_terminal() {
            debug!(task_id = %id, status = %task.status, action, "ignoring update to finished task");
            return Ok(Transition::Ignored);
        }
        change(&mut task, Instant::now())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn running(tracker: &ProgressTracker, total: u32) -> TaskId {
        let id = tracker.create(total);
        tracker.start(&id).unwrap();
        id
    }

    #[test]
    fn test_unknown_task() {
        let tracker = ProgressTracker::default();
        let id = TaskId::from("missing");
        assert_eq!(tracker.start(&id), Err(ProgressError::TaskNotFound(id.clone())));
        assert!(tracker.snapshot(&id).is_err());
        assert!(tracker.is_cancelled(&id));
    }

    #[tokio::test]
    async fn test_completed_never_decreases_and_failed_is_clamped() {
        let tracker = ProgressTracker::default();
        let id = running(&tracker, 10);

        tracker.update_progress(&id, 5, Some("第5章".into()), 1).unwrap();
        tracker.update_progress(&id, 3, None, 2).unwrap();
        let snap = tracker.snapshot(&id).unwrap();
        assert_eq!(snap.completed_chapters, 5);
        assert_eq!(snap.failed_chapters, 2);
        assert_eq!(snap.current_chapter.as_deref(), Some("第5章"));

        tracker.update_progress(&id, 8, None, 9).unwrap();
        let snap = tracker.snapshot(&id).unwrap();
        assert_eq!(snap.completed_chapters + snap.failed_chapters, 10);
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let tracker = ProgressTracker::default();
        let id = running(&tracker, 4);
        tracker.update_progress(&id, 3, None, 1).unwrap();

        assert_eq!(
            tracker.complete(&id, true, Some("1 of 4 chapters failed".into())),
            Ok(Transition::Applied)
        );
        assert_eq!(tracker.complete(&id, false, Some("late".into())), Ok(Transition::Ignored));
        assert_eq!(tracker.update_progress(&id, 4, None, 0), Ok(Transition::Ignored));
        assert_eq!(tracker.cancel(&id), Ok(Transition::Ignored));

        let snap = tracker.snapshot(&id).unwrap();
        assert_eq!(snap.status, TaskStatus::Completed);
        assert!((snap.progress_percentage - 100.0).abs() < f64::EPSILON);
        assert_eq!(snap.error_message.as_deref(), Some("1 of 4 chapters failed"));
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let tracker = ProgressTracker::default();
        let id = tracker.create(3);
        assert!(matches!(
            tracker.pause(&id),
            Err(ProgressError::InvalidTransition { from: TaskStatus::Pending, .. })
        ));
        assert!(tracker.update_progress(&id, 1, None, 0).is_err());

        tracker.start(&id).unwrap();
        assert_eq!(tracker.pause(&id), Ok(Transition::Applied));
        assert_eq!(tracker.pause(&id), Ok(Transition::Ignored));
        assert_eq!(tracker.start(&id), Ok(Transition::Applied));
    }

    #[tokio::test]
    async fn test_file_status() {
        let tracker = ProgressTracker::default();
        let id = running(&tracker, 1);
        assert_eq!(tracker.file_status(&id), Ok(FileStatus::Pending));

        tracker.set_file_path(&id, PathBuf::from("/tmp/book.txt")).unwrap();
        tracker.complete(&id, true, None).unwrap();
        assert_eq!(tracker.file_status(&id), Ok(FileStatus::Ready(PathBuf::from("/tmp/book.txt"))));

        let failed = running(&tracker, 1);
        tracker.complete(&failed, false, Some("toc unavailable".into())).unwrap();
        assert_eq!(tracker.file_status(&failed), Ok(FileStatus::Failed("toc unavailable".into())));
    }

    #[tokio::test]
    async fn test_cancel_stops_workers() {
        let tracker = ProgressTracker::default();
        let id = running(&tracker, 5);
        assert!(!tracker.is_cancelled(&id));
        tracker.cancel(&id).unwrap();
        assert!(tracker.is_cancelled(&id));
        assert_eq!(tracker.snapshot(&id).unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_sweep_escalates_then_fails() {
        let tracker = ProgressTracker::new(TrackerConfig {
            stall_timeout: Duration::from_secs(90),
            ..TrackerConfig::default()
        });
        let id = running(&tracker, 5);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(tracker.sweep().warned, 1);
        assert_eq!(tracker.sweep().warned, 0);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(tracker.sweep().warned, 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(tracker.sweep().stalled, 1);
        let snap = tracker.snapshot(&id).unwrap();
        assert_eq!(snap.status, TaskStatus::Failed);
        assert!(snap.error_message.unwrap().starts_with("stalled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_resets_stall_clock() {
        let tracker = ProgressTracker::new(TrackerConfig {
            stall_timeout: Duration::from_secs(60),
            ..TrackerConfig::default()
        });
        let id = running(&tracker, 5);
        for completed in 1..=4 {
            tokio::time::advance(Duration::from_secs(50)).await;
            tracker.update_progress(&id, completed, None, 0).unwrap();
            assert_eq!(tracker.sweep(), SweepReport::default());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_running_task_alive() {
        let tracker = ProgressTracker::new(TrackerConfig {
            stall_timeout: Duration::from_secs(60),
            ..TrackerConfig::default()
        });
        let id = running(&tracker, 5);
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(50)).await;
            assert_eq!(tracker.heartbeat(&id), Ok(Transition::Applied));
            assert_eq!(tracker.sweep().stalled, 0);
        }
        let snap = tracker.snapshot(&id).unwrap();
        assert_eq!(snap.status, TaskStatus::Running);
        assert_eq!(snap.completed_chapters, 0);

        let pending = tracker.create(1);
        assert_eq!(tracker.heartbeat(&pending), Ok(Transition::Ignored));
    }

    #[tokio::test]
    async fn test_stopped_covers_every_terminal_state() {
        let tracker = ProgressTracker::default();
        let id = running(&tracker, 5);
        assert!(!tracker.is_stopped(&id));
        tracker.pause(&id).unwrap();
        assert!(tracker.is_paused(&id));
        assert!(!tracker.is_stopped(&id));
        tracker.start(&id).unwrap();
        assert!(!tracker.is_paused(&id));

        tracker.complete(&id, false, Some("stalled".into())).unwrap();
        assert!(tracker.is_stopped(&id));
        assert!(!tracker.is_cancelled(&id));
        assert!(tracker.is_stopped(&TaskId::from("missing")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_evicts_finished_tasks() {
        let tracker = ProgressTracker::new(TrackerConfig {
            retention: Duration::from_secs(60),
            ..TrackerConfig::default()
        });
        let done = running(&tracker, 1);
        tracker.complete(&done, true, None).unwrap();
        let active = running(&tracker, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(tracker.sweep().evicted, 1);
        assert!(tracker.snapshot(&done).is_err());
        assert!(tracker.snapshot(&active).is_ok());
    }
}
