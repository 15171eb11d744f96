// Per-job command logger. Every command a job runs gets one execution log
// entry; output is redacted before it reaches the store.

use anyhow::Result;
use executor_common::{ErrorList, ExecutionLogEntry, ExecutionLogEntryStore, Redactor};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Owns the execution log of one job.
///
/// Store failures never abort the command being logged; they are kept and
/// surfaced once by [`JobLogger::flush`].
pub struct JobLogger {
    store: Arc<dyn ExecutionLogEntryStore>,
    job_id: i64,
    redactor: Redactor,
    errors: Arc<Mutex<Vec<anyhow::Error>>>,
}

impl JobLogger {
    pub fn new(store: Arc<dyn ExecutionLogEntryStore>, job_id: i64, redactor: Redactor) -> Self {
        Self {
            store,
            job_id,
            redactor,
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    /// Open a new entry for `key` running `command`.
    pub async fn log_entry(&self, key: &str, command: &[String]) -> LogEntry {
        let command: Vec<String> = command.iter().map(|c| self.redactor.redact(c)).collect();
        let entry = ExecutionLogEntry::new(key, command);

        let entry_id = match self.store.add_execution_log_entry(self.job_id, &entry).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(job_id = self.job_id, key, error = %e, "failed to create log entry");
                self.errors.lock().push(e.context(format!("failed to create log entry {key:?}")));
                None
            }
        };

        LogEntry {
            store: Arc::clone(&self.store),
            job_id: self.job_id,
            entry_id,
            redactor: self.redactor.clone(),
            errors: Arc::clone(&self.errors),
            started: Instant::now(),
            entry: Mutex::new(entry),
        }
    }

    /// Return every store failure recorded so far, and forget them.
    pub async fn flush(&self) -> Result<()> {
        let errors: Vec<_> = std::mem::take(&mut *self.errors.lock());
        let mut list = ErrorList::new();
        for err in errors {
            list.push(err);
        }
        list.into_result()
    }
}

/// One open execution log entry.
pub struct LogEntry {
    store: Arc<dyn ExecutionLogEntryStore>,
    job_id: i64,
    entry_id: Option<i64>,
    redactor: Redactor,
    errors: Arc<Mutex<Vec<anyhow::Error>>>,
    started: Instant,
    entry: Mutex<ExecutionLogEntry>,
}

impl LogEntry {
    /// Append one line of output.
    pub fn write_line(&self, line: &str) {
        let redacted = self.redactor.redact(line);
        let mut entry = self.entry.lock();
        entry.out.push_str(&redacted);
        entry.out.push('\n');
    }

    /// Record the exit code and elapsed time.
    pub fn finalize(&self, exit_code: i32) {
        let mut entry = self.entry.lock();
        entry.exit_code = Some(exit_code);
        entry.duration_ms = Some(self.started.elapsed().as_millis() as i64);
    }

    /// Persist the final state of the entry.
    pub async fn close(self) {
        let Some(entry_id) = self.entry_id else {
            return;
        };
        let entry = self.entry.into_inner();
        if let Err(e) = self
            .store
            .update_execution_log_entry(self.job_id, entry_id, &entry)
            .await
        {
            tracing::warn!(job_id = self.job_id, key = %entry.key, error = %e, "failed to update log entry");
            self.errors
                .lock()
                .push(e.context(format!("failed to update log entry {:?}", entry.key)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use executor_common::MemoryLogStore;
    use std::collections::HashMap;

    #[tokio::test]
    async fn entries_are_redacted_and_finalized() {
        let store = Arc::new(MemoryLogStore::new());
        let redactor = Redactor::from_maps([&HashMap::from([(
            "hunter2".to_string(),
            "PASSWORD".to_string(),
        )])]);
        let logger = JobLogger::new(store.clone(), 7, redactor);

        let entry = logger
            .log_entry("step.docker.0", &["login".to_string(), "--password=hunter2".to_string()])
            .await;
        entry.write_line("using hunter2");
        entry.finalize(0);
        entry.close().await;
        logger.flush().await.unwrap();

        let entries = store.entries(7);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].command, vec!["login", "--password=PASSWORD"]);
        assert_eq!(entries[0].out, "using PASSWORD\n");
        assert_eq!(entries[0].exit_code, Some(0));
        assert!(entries[0].duration_ms.is_some());
    }

    struct FailingStore;

    #[async_trait]
    impl ExecutionLogEntryStore for FailingStore {
        async fn add_execution_log_entry(&self, _: i64, _: &ExecutionLogEntry) -> Result<i64> {
            Ok(1)
        }

        async fn update_execution_log_entry(
            &self,
            _: i64,
            _: i64,
            _: &ExecutionLogEntry,
        ) -> Result<()> {
            anyhow::bail!("store unavailable")
        }
    }

    #[tokio::test]
    async fn store_failures_surface_on_flush_once() {
        let logger = JobLogger::new(Arc::new(FailingStore), 1, Redactor::new());
        let entry = logger.log_entry("k", &[]).await;
        entry.finalize(1);
        entry.close().await;

        let err = logger.flush().await.unwrap_err();
        assert!(format!("{err:#}").contains("store unavailable"));
        logger.flush().await.unwrap();
    }
}
