// Job queue client. `SpoolQueue` is a directory-backed queue:
//
//   <spool>/<queue>/*.json              pending jobs
//   <spool>/<queue>/processing/*.json   claimed by a worker
//   <spool>/<queue>/done/*.json         completed
//   <spool>/<queue>/failed/*.json       errored, with a sibling `.error` file
//   <spool>/cancel/<job id>             cancellation requests, picked up by heartbeats
//   <spool>/heartbeat.json              last heartbeat

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use executor_worker::Job;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait Queue: Send + Sync {
    /// Claim the next job from the first of `queues` that has one.
    async fn dequeue(
        &self,
        queues: &[String],
        extra_arguments: Option<&serde_json::Value>,
    ) -> Result<Option<Job>>;

    async fn mark_complete(&self, job: &Job) -> Result<()>;

    async fn mark_errored(&self, job: &Job, message: &str) -> Result<()>;

    /// Report in-flight jobs. Returns the ids of jobs that should be cancelled.
    async fn heartbeat(&self, job_ids: &[i64], metrics: &str) -> Result<Vec<i64>>;
}

pub struct SpoolQueue {
    root: PathBuf,
    claimed: Mutex<HashMap<i64, (String, PathBuf)>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Heartbeat<'a> {
    timestamp: chrono::DateTime<Utc>,
    job_ids: &'a [i64],
    metrics: &'a str,
}

impl SpoolQueue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            claimed: Mutex::new(HashMap::new()),
        }
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.root.join(queue)
    }

    async fn pending(&self, queue: &str) -> Result<Vec<PathBuf>> {
        let dir = self.queue_dir(queue);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("failed to list queue {dir:?}")),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Move `path` into `<queue>/<state>/`, returning the new location.
    async fn move_to(&self, queue: &str, path: &Path, state: &str) -> Result<PathBuf> {
        let dir = self.queue_dir(queue).join(state);
        tokio::fs::create_dir_all(&dir).await?;
        let file_name = path
            .file_name()
            .with_context(|| format!("{path:?} has no file name"))?;
        let target = dir.join(file_name);
        tokio::fs::rename(path, &target)
            .await
            .with_context(|| format!("failed to move {path:?} to {target:?}"))?;
        Ok(target)
    }

    fn take_claim(&self, job: &Job) -> Result<(String, PathBuf)> {
        self.claimed
            .lock()
            .remove(&job.id)
            .with_context(|| format!("job {} was not dequeued from this queue", job.id))
    }
}

#[async_trait]
impl Queue for SpoolQueue {
    async fn dequeue(
        &self,
        queues: &[String],
        _extra_arguments: Option<&serde_json::Value>,
    ) -> Result<Option<Job>> {
        for queue in queues {
            for path in self.pending(queue).await? {
                // Another worker may have claimed it first.
                let claimed = match self.move_to(queue, &path, "processing").await {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "job already claimed");
                        continue;
                    }
                };

                let raw = tokio::fs::read(&claimed).await?;
                let mut job: Job = match serde_json::from_slice(&raw) {
                    Ok(job) => job,
                    Err(e) => {
                        tracing::warn!(path = %claimed.display(), error = %e, "discarding malformed job");
                        let failed = self.move_to(queue, &claimed, "failed").await?;
                        tokio::fs::write(failed.with_extension("error"), e.to_string()).await?;
                        continue;
                    }
                };
                if job.queue.is_empty() {
                    job.queue = queue.clone();
                }

                tracing::info!(job_id = job.id, queue = %queue, "dequeued job");
                self.claimed.lock().insert(job.id, (queue.clone(), claimed));
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn mark_complete(&self, job: &Job) -> Result<()> {
        let (queue, path) = self.take_claim(job)?;
        self.move_to(&queue, &path, "done").await?;
        Ok(())
    }

    async fn mark_errored(&self, job: &Job, message: &str) -> Result<()> {
        let (queue, path) = self.take_claim(job)?;
        let failed = self.move_to(&queue, &path, "failed").await?;
        tokio::fs::write(failed.with_extension("error"), message)
            .await
            .context("failed to record job error")
    }

    async fn heartbeat(&self, job_ids: &[i64], metrics: &str) -> Result<Vec<i64>> {
        tokio::fs::create_dir_all(&self.root).await?;
        let heartbeat = Heartbeat {
            timestamp: Utc::now(),
            job_ids,
            metrics,
        };
        tokio::fs::write(self.root.join("heartbeat.json"), serde_json::to_vec_pretty(&heartbeat)?)
            .await
            .context("failed to write heartbeat")?;

        let cancel_dir = self.root.join("cancel");
        let mut cancelled = Vec::new();
        for id in job_ids {
            if tokio::fs::try_exists(cancel_dir.join(id.to_string()))
                .await
                .unwrap_or(false)
            {
                cancelled.push(*id);
            }
        }
        Ok(cancelled)
    }
}
