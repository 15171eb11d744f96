// Command specs and the process-backed command executor.

use anyhow::{Context, Result};
use async_trait::async_trait;
use executor_sdk::{ProcessInvoker, TraceWriter, TracingTraceWriter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::cmdlogger::JobLogger;

/// A single command to execute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    /// Stable identifier; also the execution log key.
    pub key: String,
    pub command: Vec<String>,
    /// Directory to run in. Relative paths are resolved by the runner.
    pub dir: PathBuf,
    /// `NAME=value` pairs.
    pub env: Vec<String>,
}

/// One unit of work handed to a runner: one or more commands plus the
/// container image and generated script they run with, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunnerSpec {
    pub command_specs: Vec<CommandSpec>,
    pub image: Option<String>,
    /// Script file name inside the workspace scripts directory.
    pub script_path: Option<String>,
}

impl RunnerSpec {
    pub fn single(command_spec: CommandSpec) -> Self {
        Self {
            command_specs: vec![command_spec],
            image: None,
            script_path: None,
        }
    }

    /// Key of the spec as a whole; the key of its first command.
    pub fn key(&self) -> &str {
        self.command_specs
            .first()
            .map(|c| c.key.as_str())
            .unwrap_or_default()
    }
}

/// Executes fully-resolved commands on the host, logging each one.
#[async_trait]
pub trait Command: Send + Sync {
    async fn run(&self, cancel: &CancellationToken, logger: &JobLogger, spec: &CommandSpec)
        -> Result<()>;
}

/// A non-zero exit of a logged command.
#[derive(Debug, thiserror::Error)]
#[error("command failed with exit code {0}")]
pub struct ExitCodeError(pub i32);

/// Reject specs that cannot be executed.
pub fn validate_command(spec: &CommandSpec) -> Result<()> {
    let Some(program) = spec.command.first() else {
        anyhow::bail!("command {:?} is empty", spec.key);
    };
    if program.trim().is_empty() {
        anyhow::bail!("command {:?} has an empty program", spec.key);
    }
    for pair in &spec.env {
        if !pair.contains('=') {
            anyhow::bail!("command {:?} has malformed environment entry {pair:?}", spec.key);
        }
    }
    Ok(())
}

/// [`Command`] that spawns host processes through [`ProcessInvoker`].
pub struct ProcessCommand {
    trace: Arc<dyn TraceWriter>,
}

impl ProcessCommand {
    pub fn new() -> Self {
        Self {
            trace: Arc::new(TracingTraceWriter::new("executor::command")),
        }
    }
}

impl Default for ProcessCommand {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Command for ProcessCommand {
    async fn run(
        &self,
        cancel: &CancellationToken,
        logger: &JobLogger,
        spec: &CommandSpec,
    ) -> Result<()> {
        validate_command(spec)?;

        let span = tracing::info_span!("command", job_id = logger.job_id(), key = %spec.key);
        async {
            let entry = Arc::new(logger.log_entry(&spec.key, &spec.command).await);

            let mut cmd = tokio::process::Command::new(&spec.command[0]);
            cmd.args(&spec.command[1..]);
            if !spec.dir.as_os_str().is_empty() {
                cmd.current_dir(&spec.dir);
            }
            for pair in &spec.env {
                if let Some((name, value)) = pair.split_once('=') {
                    cmd.env(name, value);
                }
            }

            let mut invoker = ProcessInvoker::new(Arc::clone(&self.trace));
            let mut output = invoker
                .take_output_receiver()
                .context("process output receiver already taken")?;
            let collector = {
                let entry = Arc::clone(&entry);
                tokio::spawn(async move {
                    while let Some(line) = output.recv().await {
                        entry.write_line(&line.text);
                    }
                })
            };

            let result = invoker.execute(cmd, false, cancel.clone()).await;
            drop(invoker);
            let _ = collector.await;

            let exit_code = match &result {
                Ok(code) => *code,
                Err(_) => -1,
            };
            entry.finalize(exit_code);
            match Arc::try_unwrap(entry) {
                Ok(entry) => entry.close().await,
                Err(_) => tracing::warn!("log entry still shared after command exit"),
            }

            let exit_code = result?;
            if exit_code != 0 {
                return Err(ExitCodeError(exit_code).into());
            }
            tracing::debug!("command succeeded");
            Ok(())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use executor_common::{MemoryLogStore, Redactor};

    fn spec(key: &str, command: &[&str]) -> CommandSpec {
        CommandSpec {
            key: key.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn validate_rejects_empty_and_malformed() {
        assert!(validate_command(&spec("k", &[])).is_err());
        assert!(validate_command(&spec("k", &[" "])).is_err());

        let mut bad_env = spec("k", &["ls"]);
        bad_env.env = vec!["NOVALUE".to_string()];
        assert!(validate_command(&bad_env).is_err());

        assert!(validate_command(&spec("k", &["ls", "-la"])).is_ok());
    }

    #[test]
    fn runner_spec_key_is_first_command_key() {
        let s = RunnerSpec {
            command_specs: vec![spec("step.shell.0", &["a"]), spec("other", &["b"])],
            ..Default::default()
        };
        assert_eq!(s.key(), "step.shell.0");
        assert_eq!(RunnerSpec::default().key(), "");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_command_logs_output_and_exit_code() {
        let store = Arc::new(MemoryLogStore::new());
        let logger = JobLogger::new(store.clone(), 3, Redactor::new());

        let mut s = spec("step.shell.0", &["sh", "-c", "echo $GREETING; exit 3"]);
        s.env = vec!["GREETING=hello".to_string()];

        let err = ProcessCommand::new()
            .run(&CancellationToken::new(), &logger, &s)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "command failed with exit code 3");

        let entries = store.entries(3);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "step.shell.0");
        assert_eq!(entries[0].out, "hello\n");
        assert_eq!(entries[0].exit_code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_command_succeeds_on_zero_exit() {
        let store = Arc::new(MemoryLogStore::new());
        let logger = JobLogger::new(store.clone(), 4, Redactor::new());
        ProcessCommand::new()
            .run(&CancellationToken::new(), &logger, &spec("k", &["true"]))
            .await
            .unwrap();
        assert_eq!(store.entries(4)[0].exit_code, Some(0));
    }
}
