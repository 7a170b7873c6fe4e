//! Durable job progress and the registry that serializes updates to it.
//!
//! A processor writes its progress exactly once, at the end of its run. The
//! registry applies the write as a read-modify-write under a lock so that
//! processors finishing concurrently cannot lose each other's updates.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::spec::JobId;

/// Progress entry appended by one processor instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorProgress {
    pub processor_id: i32,
    pub sql_instance_id: i32,
    pub processor_row_count: u64,
    pub processor_span_count: u64,
    pub processor_concurrency: u64,
}

/// Job-wide progress: cumulative rows plus one entry per processor instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowLevelTtlProgress {
    pub job_row_count: u64,
    #[serde(default)]
    pub processor_progresses: Vec<ProcessorProgress>,
}

impl RowLevelTtlProgress {
    /// Append `entry` and add its rows to the job total.
    ///
    /// Returns false without changing anything when this processor instance
    /// has already recorded its progress.
    pub fn record_processor(&mut self, entry: ProcessorProgress) -> bool {
        let exists = self.processor_progresses.iter().any(|p| {
            p.processor_id == entry.processor_id && p.sql_instance_id == entry.sql_instance_id
        });
        if exists {
            return false;
        }
        self.job_row_count += entry.processor_row_count;
        self.processor_progresses.push(entry);
        true
    }
}

/// Persisted state of one TTL job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub progress: RowLevelTtlProgress,
}

impl JobRecord {
    pub fn new(job_id: JobId) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            created_at: now,
            updated_at: now,
            progress: RowLevelTtlProgress::default(),
        }
    }
}

/// Read-modify-write callback applied to a job's progress.
pub type ProgressMutator = Box<dyn FnOnce(&mut RowLevelTtlProgress) -> Result<()> + Send>;

/// Storage for job records.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Create the job record if it does not exist yet.
    async fn register_job(&self, job_id: JobId) -> Result<()>;

    async fn load_job(&self, job_id: JobId) -> Result<Option<JobRecord>>;

    /// Atomically apply `mutator` to the job's progress.
    ///
    /// If the mutator fails the stored record is left untouched.
    async fn update_progress(&self, job_id: JobId, mutator: ProgressMutator) -> Result<()>;

    async fn load_progress(&self, job_id: JobId) -> Result<Option<RowLevelTtlProgress>> {
        Ok(self.load_job(job_id).await?.map(|job| job.progress))
    }
}

fn apply(record: &JobRecord, mutator: ProgressMutator) -> Result<JobRecord> {
    let mut updated = record.clone();
    mutator(&mut updated.progress)?;
    updated.updated_at = Utc::now();
    Ok(updated)
}

/// Registry keeping job records in memory.
#[derive(Debug, Default)]
pub struct InMemoryJobRegistry {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRegistry for InMemoryJobRegistry {
    async fn register_job(&self, job_id: JobId) -> Result<()> {
        self.jobs
            .lock()
            .await
            .entry(job_id)
            .or_insert_with(|| JobRecord::new(job_id));
        Ok(())
    }

    async fn load_job(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.jobs.lock().await.get(&job_id).cloned())
    }

    async fn update_progress(&self, job_id: JobId, mutator: ProgressMutator) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let record = jobs
            .get(&job_id)
            .ok_or_else(|| anyhow!("job {job_id} not found"))?;
        let updated = apply(record, mutator)?;
        jobs.insert(job_id, updated);
        Ok(())
    }
}

/// Registry storing one JSON document per job under a directory.
///
/// Writes go through a temporary file in the same directory and are renamed
/// into place, so a crash never leaves a half-written record. Updates are
/// serialized within one registry only: at most one registry per directory
/// may write at a time, while any number may read.
#[derive(Debug)]
pub struct FileJobRegistry {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileJobRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn job_path(&self, job_id: JobId) -> PathBuf {
        self.dir.join(format!("job-{job_id}.json"))
    }

    async fn read(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        let path = self.job_path(job_id);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                let record = serde_json::from_slice(&data)
                    .with_context(|| format!("parse job record {}", path.display()))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read job record {}", path.display())),
        }
    }

    async fn write(&self, record: &JobRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create job registry dir {}", self.dir.display()))?;
        let data = serde_json::to_vec_pretty(record).context("serialize job record")?;
        let dir = self.dir.clone();
        let path = self.job_path(record.job_id);

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = tempfile::Builder::new()
                .prefix(".job-")
                .suffix(".tmp")
                .tempfile_in(&dir)
                .context("create temporary job record")?;
            tmp.write_all(&data).context("write temporary job record")?;
            tmp.as_file().sync_all().context("sync temporary job record")?;
            tmp.persist(&path)
                .with_context(|| format!("replace job record {}", path.display()))?;
            Ok(())
        })
        .await
        .context("job record writer panicked")?
    }
}

#[async_trait]
impl JobRegistry for FileJobRegistry {
    async fn register_job(&self, job_id: JobId) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.read(job_id).await?.is_none() {
            self.write(&JobRecord::new(job_id)).await?;
        }
        Ok(())
    }

    async fn load_job(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        let _guard = self.lock.lock().await;
        self.read(job_id).await
    }

    async fn update_progress(&self, job_id: JobId, mutator: ProgressMutator) -> Result<()> {
        let _guard = self.lock.lock().await;
        let record = self
            .read(job_id)
            .await?
            .ok_or_else(|| anyhow!("job {job_id} not found"))?;
        let updated = apply(&record, mutator)?;
        self.write(&updated).await
    }
}
