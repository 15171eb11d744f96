// Runs step commands directly on the host, inside the workspace directory.

use anyhow::{Context, Result};
use async_trait::async_trait;
use executor_common::constants::workspace::SCRIPTS_DIR;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::{resolve_dir, Runner, RunnerOptions};
use crate::cmdlogger::JobLogger;
use crate::command::{Command, CommandSpec, RunnerSpec};

pub struct ShellRunner {
    command: Arc<dyn Command>,
    logger: Arc<JobLogger>,
    options: RunnerOptions,
    temp_dir: TempDir,
}

impl ShellRunner {
    pub fn new(command: Arc<dyn Command>, logger: Arc<JobLogger>, options: RunnerOptions) -> Result<Self> {
        let temp_dir = tempfile::Builder::new()
            .prefix("executor-shell-")
            .tempdir()
            .context("failed to create runner temp directory")?;
        Ok(Self {
            command,
            logger,
            options,
            temp_dir,
        })
    }

    /// Host command for one command of `spec`: the generated script when the
    /// spec carries one, the literal command otherwise.
    fn resolve(&self, spec: &RunnerSpec, command_spec: &CommandSpec) -> CommandSpec {
        let command = match &spec.script_path {
            Some(script) => vec![
                "/bin/sh".to_string(),
                self.options
                    .path
                    .join(SCRIPTS_DIR)
                    .join(script)
                    .to_string_lossy()
                    .to_string(),
            ],
            None => command_spec.command.clone(),
        };
        CommandSpec {
            key: command_spec.key.clone(),
            command,
            dir: resolve_dir(&self.options.path, &command_spec.dir),
            env: command_spec.env.clone(),
        }
    }
}

#[async_trait]
impl Runner for ShellRunner {
    async fn setup(&self, _cancel: &CancellationToken) -> Result<()> {
        tracing::debug!(name = %self.options.name, "shell runner ready");
        Ok(())
    }

    async fn run(&self, cancel: &CancellationToken, spec: &RunnerSpec) -> Result<()> {
        for command_spec in &spec.command_specs {
            let resolved = self.resolve(spec, command_spec);
            self.command.run(cancel, &self.logger, &resolved).await?;
        }
        Ok(())
    }

    async fn teardown(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    fn temp_dir(&self) -> &Path {
        self.temp_dir.path()
    }
}
