//! Long-running jobs: live progress in memory, state transitions in the
//! job log.
//!
//! Progress is updated on every erase chunk and is NOT persisted. Only the
//! start and the outcome of each job are written to the database.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::auth::Caller;
use super::models::JobState;
use super::objects::ObjectPath;
use crate::db;
use crate::error::StorageError;

pub const FORMAT_ERASE: &str = "format-erase";
pub const FORMAT_MKFS: &str = "format-mkfs";
pub const ATA_SECURE_ERASE: &str = "ata-secure-erase";

#[derive(Debug, Default)]
struct Progress {
    bytes_done: AtomicU64,
    bytes_total: AtomicU64,
}

struct ActiveJob {
    operation: &'static str,
    object: ObjectPath,
    started_by: u32,
    started_at: DateTime<Utc>,
    progress: Arc<Progress>,
    cancel: CancellationToken,
}

/// Snapshot of a running job as reported to clients.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub operation: &'static str,
    pub object: ObjectPath,
    pub started_by: u32,
    pub started_at: DateTime<Utc>,
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Fraction in `0.0..=1.0`, absent when the size is unknown.
    pub progress: Option<f64>,
}

/// Thread-safe store of running jobs, shared through `AppContext`.
#[derive(Clone, Default)]
pub struct JobTracker {
    inner: Arc<RwLock<HashMap<String, ActiveJob>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job and record its start in the job log.
    pub async fn begin(
        &self,
        db: &Connection,
        operation: &'static str,
        object: &ObjectPath,
        caller: &Caller,
    ) -> JobHandle {
        let id = Uuid::now_v7().to_string();
        let progress = Arc::new(Progress::default());
        let cancel = CancellationToken::new();

        self.inner.write().await.insert(
            id.clone(),
            ActiveJob {
                operation,
                object: object.clone(),
                started_by: caller.uid,
                started_at: Utc::now(),
                progress: progress.clone(),
                cancel: cancel.clone(),
            },
        );

        if let Err(e) = db::jobs::create(
            db,
            id.clone(),
            operation.to_string(),
            object.to_string(),
            caller.uid,
        )
        .await
        {
            warn!(job_id = %id, error = %e, "Failed to record job start");
        }
        info!(job_id = %id, operation, object = %object, "Job started");

        JobHandle {
            id,
            tracker: self.clone(),
            db: db.clone(),
            progress,
            cancel,
        }
    }

    pub async fn get(&self, job_id: &str) -> Option<JobStatus> {
        let map = self.inner.read().await;
        map.get(job_id).map(|job| status_of(job_id, job))
    }

    pub async fn get_all(&self) -> Vec<JobStatus> {
        let map = self.inner.read().await;
        let mut jobs: Vec<JobStatus> = map.iter().map(|(id, job)| status_of(id, job)).collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub async fn active_count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Request cancellation. Returns false if no such job is running.
    pub async fn cancel(&self, job_id: &str) -> bool {
        match self.inner.read().await.get(job_id) {
            Some(job) => {
                info!(job_id, "Cancelling job");
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn remove(&self, job_id: &str) {
        self.inner.write().await.remove(job_id);
    }
}

fn status_of(id: &str, job: &ActiveJob) -> JobStatus {
    let bytes_done = job.progress.bytes_done.load(Ordering::Relaxed);
    let bytes_total = job.progress.bytes_total.load(Ordering::Relaxed);
    JobStatus {
        id: id.to_string(),
        operation: job.operation,
        object: job.object.clone(),
        started_by: job.started_by,
        started_at: job.started_at,
        bytes_done,
        bytes_total,
        progress: (bytes_total > 0).then(|| bytes_done as f64 / bytes_total as f64),
    }
}

/// Owned by the code running a job. Must be finished with [`JobHandle::finish`].
pub struct JobHandle {
    id: String,
    tracker: JobTracker,
    db: Connection,
    progress: Arc<Progress>,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A progress sink usable from a blocking thread.
    pub fn reporter(&self) -> ProgressReporter {
        ProgressReporter {
            progress: self.progress.clone(),
        }
    }

    /// Drop the job from the live set and record how it ended.
    pub async fn finish<T>(self, result: &Result<T, StorageError>) {
        let (state, description) = match result {
            Ok(_) => (JobState::Completed, None),
            Err(StorageError::Cancelled(msg)) => (JobState::Cancelled, Some(msg.clone())),
            Err(e) => (JobState::Failed, Some(e.to_string())),
        };
        self.tracker.remove(&self.id).await;
        if let Err(e) = db::jobs::update_status(&self.db, self.id.clone(), state, description).await
        {
            warn!(job_id = %self.id, error = %e, "Failed to record job outcome");
        }
        info!(job_id = %self.id, state = state.as_str(), "Job finished");
    }
}

#[derive(Clone)]
pub struct ProgressReporter {
    progress: Arc<Progress>,
}

impl ProgressReporter {
    pub fn set_total(&self, bytes: u64) {
        self.progress.bytes_total.store(bytes, Ordering::Relaxed);
    }

    pub fn set_done(&self, bytes: u64) {
        self.progress.bytes_done.store(bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_progress_until_finished() {
        let db = db::init_in_memory().await.unwrap();
        let tracker = JobTracker::new();
        let object = ObjectPath::block("sdb");

        let job = tracker
            .begin(&db, FORMAT_ERASE, &object, &Caller::root())
            .await;
        assert_eq!(tracker.active_count().await, 1);

        let reporter = job.reporter();
        reporter.set_total(1000);
        reporter.set_done(250);
        let status = tracker.get(job.id()).await.unwrap();
        assert_eq!(status.operation, FORMAT_ERASE);
        assert_eq!(status.progress, Some(0.25));

        let id = job.id().to_string();
        job.finish(&Ok::<(), StorageError>(())).await;
        assert_eq!(tracker.active_count().await, 0);
        assert!(tracker.get(&id).await.is_none());

        let record = db::jobs::get(&db, id).await.unwrap();
        assert_eq!(record.status, "Completed");
    }

    #[tokio::test]
    async fn cancel_trips_the_token() {
        let db = db::init_in_memory().await.unwrap();
        let tracker = JobTracker::new();
        let job = tracker
            .begin(&db, FORMAT_MKFS, &ObjectPath::block("sdb"), &Caller::root())
            .await;
        let token = job.cancel_token();

        assert!(tracker.cancel(job.id()).await);
        assert!(token.is_cancelled());
        assert!(!tracker.cancel("nope").await);

        let id = job.id().to_string();
        job.finish(&Err::<(), _>(StorageError::Cancelled("Job was canceled".into())))
            .await;
        assert_eq!(db::jobs::get(&db, id).await.unwrap().status, "Cancelled");
    }
}
