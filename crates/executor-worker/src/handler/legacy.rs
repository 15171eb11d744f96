// Legacy execution path: used for jobs with src-cli steps and when no runtime
// is configured. Builds its own workspace and runner and inlines step commands.

use anyhow::{Context, Result};
use async_trait::async_trait;
use executor_common::constants::keys::{LEGACY_DOCKER, LEGACY_SRC};
use executor_common::{Options, RuntimeName};
use executor_sdk::CmdRunner;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{finish, Handler};
use crate::cmdlogger::JobLogger;
use crate::command::{Command, CommandSpec, RunnerSpec};
use crate::files::Store;
use crate::job::{step_name, CliStep, DockerStep, Job};
use crate::runner::{self, Runner, RunnerOptions};
use crate::runtime::step_key;
use crate::vm_names::new_vm_name;
use crate::workspace::{Workspace, WorkspacePreparer};

/// Workspace and runner construction for the legacy path.
#[async_trait]
pub trait LegacyBackend: Send + Sync {
    async fn prepare_workspace(
        &self,
        cancel: &CancellationToken,
        logger: &JobLogger,
        job: &Job,
    ) -> Result<Box<dyn Workspace>>;

    /// Construct a runner. The caller sets it up.
    fn new_runner(&self, logger: Arc<JobLogger>, options: RunnerOptions) -> Result<Box<dyn Runner>>;
}

/// Runs on Firecracker when it is enabled, on the local docker daemon otherwise.
pub struct HostLegacyBackend {
    options: Arc<Options>,
    command: Arc<dyn Command>,
    cmd_runner: Arc<dyn CmdRunner>,
    files: Arc<dyn Store>,
}

impl HostLegacyBackend {
    pub fn new(
        options: Arc<Options>,
        command: Arc<dyn Command>,
        cmd_runner: Arc<dyn CmdRunner>,
        files: Arc<dyn Store>,
    ) -> Self {
        Self {
            options,
            command,
            cmd_runner,
            files,
        }
    }

    fn backend(&self) -> RuntimeName {
        if self.options.firecracker.enabled {
            RuntimeName::Firecracker
        } else {
            RuntimeName::Docker
        }
    }
}

#[async_trait]
impl LegacyBackend for HostLegacyBackend {
    async fn prepare_workspace(
        &self,
        cancel: &CancellationToken,
        logger: &JobLogger,
        job: &Job,
    ) -> Result<Box<dyn Workspace>> {
        let root = self.options.workspace_root();
        let preparer = WorkspacePreparer {
            root: &root,
            git_endpoint: self.options.git_endpoint.as_deref(),
            command: self.command.as_ref(),
            files: self.files.as_ref(),
        };
        Ok(Box::new(preparer.prepare(cancel, logger, job).await?))
    }

    fn new_runner(&self, logger: Arc<JobLogger>, options: RunnerOptions) -> Result<Box<dyn Runner>> {
        let backend = self.backend();
        let binary = match backend {
            RuntimeName::Firecracker => "ignite",
            _ => "docker",
        };
        let path = self
            .cmd_runner
            .look_path(binary)
            .with_context(|| format!("{binary} is required for the {backend} backend"))?;
        tracing::debug!(binary = %path.display(), "found backend binary");

        runner::new_runner(
            backend,
            Arc::clone(&self.command),
            Arc::clone(&self.cmd_runner),
            logger,
            &self.options.firecracker,
            options,
        )
    }
}

/// Key of legacy docker step `index`: `step.docker.<Key|index>`.
pub fn docker_step_key(step: &DockerStep, index: usize) -> String {
    step_key(LEGACY_DOCKER, &step_name(step.key.as_deref(), index))
}

/// Key of legacy src-cli step `index`: `step.src.<Key|index>`.
pub fn src_step_key(step: &CliStep, index: usize) -> String {
    step_key(LEGACY_SRC, &step_name(step.key.as_deref(), index))
}

fn docker_step_specs(job: &Job, workspace: &dyn Workspace) -> Vec<RunnerSpec> {
    job.docker_steps
        .iter()
        .enumerate()
        .map(|(index, step)| RunnerSpec {
            command_specs: vec![CommandSpec {
                key: docker_step_key(step, index),
                command: Vec::new(),
                dir: PathBuf::from(&step.dir),
                env: step.env.clone(),
            }],
            image: Some(step.image.clone()),
            script_path: workspace.script_filenames().get(index).cloned(),
        })
        .collect()
}

fn src_step_specs(job: &Job) -> Vec<RunnerSpec> {
    job.cli_steps
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let mut command = vec!["src".to_string()];
            command.extend(step.commands.iter().cloned());
            RunnerSpec::single(CommandSpec {
                key: src_step_key(step, index),
                command,
                dir: PathBuf::from(&step.dir),
                env: step.env.clone(),
            })
        })
        .collect()
}

impl Handler {
    pub(super) async fn run_legacy(
        &self,
        cancel: &CancellationToken,
        logger: &Arc<JobLogger>,
        job: &Job,
    ) -> Result<()> {
        let workspace = self
            .legacy
            .prepare_workspace(cancel, logger, job)
            .await
            .context("failed to prepare workspace")?;

        let outcome = AssertUnwindSafe(self.run_legacy_in_workspace(
            cancel,
            logger,
            job,
            workspace.as_ref(),
        ))
        .catch_unwind()
        .await;

        let removed = workspace
            .remove(self.options.firecracker.keep_workspaces)
            .await
            .context("failed to remove workspace");
        finish(outcome, removed)
    }

    async fn run_legacy_in_workspace(
        &self,
        cancel: &CancellationToken,
        logger: &Arc<JobLogger>,
        job: &Job,
        workspace: &dyn Workspace,
    ) -> Result<()> {
        let reservation = self.vm_names.reserve(new_vm_name(&self.options.vm_prefix));

        let runner = self
            .legacy
            .new_runner(
                Arc::clone(logger),
                RunnerOptions {
                    name: reservation.name().to_string(),
                    path: workspace.path().to_path_buf(),
                    working_directory: workspace.working_directory().to_path_buf(),
                    docker_auth_config: job.docker_auth_config.clone(),
                },
            )
            .context("failed to create runner")?;

        runner
            .setup(cancel)
            .await
            .context("failed to set up environment")?;

        let outcome = AssertUnwindSafe(run_legacy_steps(cancel, job, workspace, runner.as_ref()))
            .catch_unwind()
            .await;

        let torn_down = runner
            .teardown(&CancellationToken::new())
            .await
            .context("failed to tear down runner");
        drop(reservation);
        finish(outcome, torn_down)
    }
}

async fn run_legacy_steps(
    cancel: &CancellationToken,
    job: &Job,
    workspace: &dyn Workspace,
    runner: &dyn Runner,
) -> Result<()> {
    for spec in docker_step_specs(job, workspace) {
        tracing::info!(key = spec.key(), "running docker step");
        runner
            .run(cancel, &spec)
            .await
            .context("failed to perform docker step")?;
    }

    for spec in src_step_specs(job) {
        tracing::info!(key = spec.key(), "running src-cli step");
        runner
            .run(cancel, &spec)
            .await
            .context("failed to perform src-cli step")?;
    }

    Ok(())
}
