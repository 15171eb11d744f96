// Execution log persistence: one entry per command a job runs.
// Entries are created when a command starts and updated when it finishes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The record of one command's execution, already redacted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    pub key: String,
    pub command: Vec<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub out: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl ExecutionLogEntry {
    pub fn new(key: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            key: key.into(),
            command,
            start_time: Utc::now(),
            exit_code: None,
            out: String::new(),
            duration_ms: None,
        }
    }
}

/// Persistence sink for execution log entries.
#[async_trait]
pub trait ExecutionLogEntryStore: Send + Sync {
    /// Store a new entry for `job_id` and return its id.
    async fn add_execution_log_entry(&self, job_id: i64, entry: &ExecutionLogEntry) -> Result<i64>;

    /// Overwrite entry `entry_id` of `job_id`.
    async fn update_execution_log_entry(
        &self,
        job_id: i64,
        entry_id: i64,
        entry: &ExecutionLogEntry,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// FileLogStore
// ---------------------------------------------------------------------------

/// Writes each entry as a JSON document at `<root>/<job_id>/<entry_id>.json`.
pub struct FileLogStore {
    root: PathBuf,
    next_id: Mutex<BTreeMap<i64, i64>>,
}

impl FileLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next_id: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, job_id: i64, entry_id: i64) -> PathBuf {
        self.root
            .join(job_id.to_string())
            .join(format!("{entry_id}.json"))
    }

    async fn write(&self, job_id: i64, entry_id: i64, entry: &ExecutionLogEntry) -> Result<()> {
        let path = self.entry_path(job_id, entry_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create log directory {parent:?}"))?;
        }
        let json = serde_json::to_vec_pretty(entry)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("failed to write log entry {path:?}"))
    }
}

#[async_trait]
impl ExecutionLogEntryStore for FileLogStore {
    async fn add_execution_log_entry(&self, job_id: i64, entry: &ExecutionLogEntry) -> Result<i64> {
        let entry_id = {
            let mut next = self.next_id.lock();
            let id = next.entry(job_id).or_insert(0);
            *id += 1;
            *id
        };
        self.write(job_id, entry_id, entry).await?;
        Ok(entry_id)
    }

    async fn update_execution_log_entry(
        &self,
        job_id: i64,
        entry_id: i64,
        entry: &ExecutionLogEntry,
    ) -> Result<()> {
        if !self.entry_path(job_id, entry_id).exists() {
            anyhow::bail!("unknown log entry {entry_id} for job {job_id}");
        }
        self.write(job_id, entry_id, entry).await
    }
}

// ---------------------------------------------------------------------------
// MemoryLogStore
// ---------------------------------------------------------------------------

/// Keeps entries in memory. Used by dry runs and tests.
#[derive(Default)]
pub struct MemoryLogStore {
    entries: Mutex<BTreeMap<(i64, i64), ExecutionLogEntry>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries recorded for `job_id`, in creation order.
    pub fn entries(&self, job_id: i64) -> Vec<ExecutionLogEntry> {
        self.entries
            .lock()
            .range((job_id, i64::MIN)..=(job_id, i64::MAX))
            .map(|(_, e)| e.clone())
            .collect()
    }
}

#[async_trait]
impl ExecutionLogEntryStore for MemoryLogStore {
    async fn add_execution_log_entry(&self, job_id: i64, entry: &ExecutionLogEntry) -> Result<i64> {
        let mut entries = self.entries.lock();
        let entry_id = entries
            .range((job_id, i64::MIN)..=(job_id, i64::MAX))
            .next_back()
            .map(|((_, id), _)| id + 1)
            .unwrap_or(1);
        entries.insert((job_id, entry_id), entry.clone());
        Ok(entry_id)
    }

    async fn update_execution_log_entry(
        &self,
        job_id: i64,
        entry_id: i64,
        entry: &ExecutionLogEntry,
    ) -> Result<()> {
        match self.entries.lock().get_mut(&(job_id, entry_id)) {
            Some(existing) => {
                *existing = entry.clone();
                Ok(())
            }
            None => anyhow::bail!("unknown log entry {entry_id} for job {job_id}"),
        }
    }
}
