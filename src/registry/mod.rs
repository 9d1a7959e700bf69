//! In-memory registry of download tasks.
//!
//! Tracks one [`DownloadTask`] snapshot per task id behind a mutex. The
//! spawned download task is the single writer for its id; SSE readers poll
//! snapshots through [`TaskRegistry::get`]. Terminal entries are swept after
//! a TTL so the map cannot grow without bound.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::downloader::{Progress, TaskStatus};

/// Snapshot of one download task's state
#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    pub task_id: Uuid,
    pub url: String,
    pub status: TaskStatus,
    pub percentage: f64,
    pub message: Option<String>,
    pub rate: Option<String>,
    pub filename: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    terminal_at: Option<Instant>,
}

/// Registry of active and recently finished tasks
pub struct TaskRegistry {
    ttl: Duration,
    tasks: Mutex<HashMap<Uuid, DownloadTask>>,
}

impl TaskRegistry {
    /// `ttl` is how long terminal tasks stay queryable
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new pending task and return its id.
    ///
    /// Expired terminal entries are swept here, so the map is bounded by the
    /// rate of task creation.
    pub fn create(&self, url: &str) -> Uuid {
        let task_id = Uuid::new_v4();
        let task = DownloadTask {
            task_id,
            url: url.to_string(),
            status: TaskStatus::Pending,
            percentage: 0.0,
            message: None,
            rate: None,
            filename: None,
            error: None,
            created_at: Utc::now(),
            terminal_at: None,
        };

        let mut tasks = self.lock();
        let now = Instant::now();
        tasks.retain(|_, t| match t.terminal_at {
            Some(at) => now.duration_since(at) < self.ttl,
            None => true,
        });
        tasks.insert(task_id, task);
        task_id
    }

    /// Apply a progress event to a task. Unknown ids are ignored.
    pub fn update(&self, task_id: Uuid, progress: &Progress) {
        let mut tasks = self.lock();
        let Some(task) = tasks.get_mut(&task_id) else {
            debug!(%task_id, "Progress for unknown task dropped");
            return;
        };

        task.status = progress.status;
        task.percentage = progress.percentage;
        task.rate = progress.rate.clone();
        if progress.message.is_some() {
            task.message = progress.message.clone();
        }
        if progress.filename.is_some() {
            task.filename = progress.filename.clone();
        }
        if progress.status == TaskStatus::Error {
            task.error = progress.message.clone();
        }
        if progress.status.is_terminal() && task.terminal_at.is_none() {
            task.terminal_at = Some(Instant::now());
        }
    }

    /// Current snapshot of a task, if it exists and has not been swept
    pub fn get(&self, task_id: Uuid) -> Option<DownloadTask> {
        self.lock().get(&task_id).cloned()
    }

    /// Number of tracked tasks
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, DownloadTask>> {
        // lock poisoning only happens if a writer panicked; the map itself
        // stays usable
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(status: TaskStatus, percentage: f64) -> Progress {
        Progress {
            status,
            percentage,
            message: None,
            rate: None,
            filename: None,
        }
    }

    #[test]
    fn test_create_and_get() {
        let registry = TaskRegistry::new(Duration::from_secs(60));
        let id = registry.create("https://www.youtube.com/watch?v=dQw4w9WgXcQ");

        let task = registry.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.percentage, 0.0);
        assert_eq!(task.url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
    }

    #[test]
    fn test_update_moves_through_states() {
        let registry = TaskRegistry::new(Duration::from_secs(60));
        let id = registry.create("url");

        registry.update(id, &progress(TaskStatus::Downloading, 42.0));
        let task = registry.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Downloading);
        assert_eq!(task.percentage, 42.0);

        registry.update(
            id,
            &Progress {
                status: TaskStatus::Finished,
                percentage: 100.0,
                message: Some("Download completed".to_string()),
                rate: None,
                filename: Some("song.mp3".to_string()),
            },
        );
        let task = registry.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Finished);
        assert_eq!(task.filename.as_deref(), Some("song.mp3"));
        assert!(task.error.is_none());
    }

    #[test]
    fn test_error_event_sets_error_field() {
        let registry = TaskRegistry::new(Duration::from_secs(60));
        let id = registry.create("url");

        registry.update(
            id,
            &Progress {
                status: TaskStatus::Error,
                percentage: 0.0,
                message: Some("video is private".to_string()),
                rate: None,
                filename: None,
            },
        );
        let task = registry.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.error.as_deref(), Some("video is private"));
    }

    #[test]
    fn test_update_unknown_id_is_noop() {
        let registry = TaskRegistry::new(Duration::from_secs(60));
        registry.update(Uuid::new_v4(), &progress(TaskStatus::Downloading, 10.0));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_get_unknown_id() {
        let registry = TaskRegistry::new(Duration::from_secs(60));
        assert!(registry.get(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_terminal_tasks_swept_after_ttl() {
        let registry = TaskRegistry::new(Duration::from_millis(0));
        let done = registry.create("done-url");
        registry.update(done, &progress(TaskStatus::Finished, 100.0));

        let running = registry.create("running-url");
        registry.update(running, &progress(TaskStatus::Downloading, 50.0));

        // a later create sweeps the expired terminal entry but keeps the
        // running one
        let _ = registry.create("new-url");
        assert!(registry.get(done).is_none());
        assert!(registry.get(running).is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_non_terminal_tasks_never_swept() {
        let registry = TaskRegistry::new(Duration::from_millis(0));
        let id = registry.create("url");
        let _ = registry.create("another");
        assert!(registry.get(id).is_some());
    }
}
