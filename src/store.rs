//! Durable job records.
//!
//! Attempts are append-only. `update_status` rewrites the job header
//! (status, counters, artifact, error) but never the recorded attempts, and
//! refuses to move a job out of a terminal status.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::StoreError;
use crate::state_machine::{Attempt, Job, JobStateError, JobStatus};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Appends one attempt. Sequence numbers must be consecutive.
    async fn append_attempt(&self, job_id: &str, attempt: &Attempt) -> Result<(), StoreError>;

    /// Persists the job header.
    async fn update_status(&self, job: &Job) -> Result<(), StoreError>;

    async fn read_job(&self, job_id: &str) -> Result<Job, StoreError>;

    /// All jobs, oldest first.
    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;
}

fn append(stored: &mut Job, attempt: &Attempt) -> Result<(), StoreError> {
    stored
        .push_attempt(attempt.clone())
        .map_err(|source| StoreError::InvalidUpdate {
            job_id: stored.id.clone(),
            source,
        })?;
    stored.iteration = stored.iteration.max(attempt.sequence);
    Ok(())
}

fn merge_header(stored: &mut Job, update: &Job) -> Result<(), StoreError> {
    if stored.status != update.status
        && (stored.status.is_terminal() || update.status == JobStatus::Queued)
    {
        return Err(StoreError::InvalidUpdate {
            job_id: stored.id.clone(),
            source: JobStateError::InvalidStatus {
                from: stored.status,
                to: update.status,
            },
        });
    }
    stored.status = update.status;
    stored.iteration = update.iteration;
    stored.infra_failures = update.infra_failures;
    stored.artifact = update.artifact.clone();
    stored.error = update.error.clone();
    stored.updated_at = update.updated_at;
    Ok(())
}

/// Non-durable store for tests and embedding.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id.clone()));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn append_attempt(&self, job_id: &str, attempt: &Attempt) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock();
        let stored = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        append(stored, attempt)
    }

    async fn update_status(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock();
        let stored = jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::NotFound(job.id.clone()))?;
        merge_header(stored, job)
    }

    async fn read_job(&self, job_id: &str) -> Result<Job, StoreError> {
        self.jobs
            .lock()
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.jobs.lock().values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}

/// One JSON file per job. Every write goes to a temp file that is synced and
/// then renamed over the previous version.
pub struct FileJobStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileJobStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !job_id.is_empty()
            && job_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        Ok(self.dir.join(format!("{job_id}.json")))
    }

    async fn load(&self, job_id: &str) -> Result<Job, StoreError> {
        let path = self.path_for(job_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(job_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write(&self, job: &Job) -> Result<(), StoreError> {
        let path = self.path_for(&job.id)?;
        let tmp = self.dir.join(format!(".{}.json.tmp", job.id));
        let bytes = serde_json::to_vec_pretty(job)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        debug!(job_id = %job.id, path = %path.display(), "job persisted");
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if tokio::fs::try_exists(self.path_for(&job.id)?).await? {
            return Err(StoreError::AlreadyExists(job.id.clone()));
        }
        self.write(job).await
    }

    async fn append_attempt(&self, job_id: &str, attempt: &Attempt) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut stored = self.load(job_id).await?;
        append(&mut stored, attempt)?;
        self.write(&stored).await
    }

    async fn update_status(&self, job: &Job) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut stored = self.load(&job.id).await?;
        merge_header(&mut stored, job)?;
        self.write(&stored).await
    }

    async fn read_job(&self, job_id: &str) -> Result<Job, StoreError> {
        self.load(job_id).await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            jobs.push(serde_json::from_slice::<Job>(&bytes)?);
        }
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}
