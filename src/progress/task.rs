//! Download task state and its JSON snapshot.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Opaque id of a download task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// A fresh random id, e.g. `task-5f2c9a1e7b3d4c60`.
    #[must_use]
    pub fn generate() -> Self {
        let suffix: u64 = rand::thread_rng().r#gen();
        Self(format!("task-{suffix:016x}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for TaskId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses admit no further mutation.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable state of one task, owned by the tracker.
#[derive(Debug, Clone)]
pub(crate) struct DownloadTask {
    pub id: TaskId,
    pub status: TaskStatus,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub current_chapter: Option<String>,
    pub started_at: Option<Instant>,
    pub ended_at: Option<Instant>,
    pub file_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub last_heartbeat: Instant,
    /// Stall warnings issued since the last heartbeat (0, 1 or 2).
    pub stall_warnings: u8,
}

impl DownloadTask {
    pub fn new(id: TaskId, total: u32, now: Instant) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            total,
            completed: 0,
            failed: 0,
            current_chapter: None,
            started_at: None,
            ended_at: None,
            file_path: None,
            error_message: None,
            last_heartbeat: now,
            stall_warnings: 0,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_heartbeat = now;
        self.stall_warnings = 0;
    }

    pub fn finish(&mut self, status: TaskStatus, message: Option<String>, now: Instant) {
        self.status = status;
        self.ended_at = Some(now);
        if message.is_some() {
            self.error_message = message;
        }
        if status == TaskStatus::Completed {
            self.current_chapter = None;
        }
    }

    /// Percent of chapters processed; exactly 100 once completed.
    #[allow(clippy::cast_precision_loss)]
    pub fn percentage(&self) -> f64 {
        if self.status == TaskStatus::Completed {
            return 100.0;
        }
        if self.total == 0 {
            return 0.0;
        }
        let processed = f64::from(self.completed + self.failed);
        (processed / f64::from(self.total) * 100.0).min(100.0)
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        self.started_at
            .map(|started| self.ended_at.unwrap_or(now).saturating_duration_since(started))
            .unwrap_or_default()
    }

    pub fn snapshot(&self, now: Instant) -> ProgressSnapshot {
        let elapsed = self.elapsed(now);
        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 {
            f64::from(self.completed) / secs
        } else {
            0.0
        };
        let remaining = self.total.saturating_sub(self.completed + self.failed);
        let eta = (!self.status.is_terminal() && speed > 0.0)
            .then(|| Duration::from_secs_f64(f64::from(remaining) / speed));

        ProgressSnapshot {
            task_id: self.id.clone(),
            status: self.status,
            progress_percentage: self.percentage(),
            completed_chapters: self.completed,
            total_chapters: self.total,
            failed_chapters: self.failed,
            current_chapter: self.current_chapter.clone(),
            elapsed_time: millis(elapsed),
            estimated_remaining_time: eta.map(millis),
            average_speed: speed,
            error_message: self.error_message.clone(),
            file_path: self.file_path.clone(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Read-only view of a task. Times are milliseconds; speed is chapters per
/// second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress_percentage: f64,
    pub completed_chapters: u32,
    pub total_chapters: u32,
    pub failed_chapters: u32,
    pub current_chapter: Option<String>,
    pub elapsed_time: u64,
    pub estimated_remaining_time: Option<u64>,
    pub average_speed: f64,
    pub error_message: Option<String>,
    pub file_path: Option<PathBuf>,
}
