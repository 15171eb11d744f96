// Job orchestration. One `Handler` is shared by every worker task of the pool;
// `handle` drives a single job from workspace creation to teardown.

mod legacy;

pub use legacy::{docker_step_key, src_step_key, HostLegacyBackend, LegacyBackend};

use anyhow::{Context, Result};
use executor_common::errors::combine;
use executor_common::{ExecutionLogEntryStore, Options, Redactor};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cmdlogger::JobLogger;
use crate::command::RunnerSpec;
use crate::ignite::EnvironmentInventory;
use crate::job::Job;
use crate::runner::{Runner, RunnerOptions};
use crate::runtime::Runtime;
use crate::skip::{clear_skip_marker, take_skip_marker, SkipError, SkipState};
use crate::telemetry::JobTelemetry;
use crate::vm_names::{new_vm_name, VmNameSet};
use crate::workspace::Workspace;

/// Which orchestration strategy a job goes through.
enum ExecutionPath<'a> {
    Runtime(&'a Arc<dyn Runtime>),
    Legacy,
}

pub struct Handler {
    pub(crate) options: Arc<Options>,
    runtime: Option<Arc<dyn Runtime>>,
    legacy: Arc<dyn LegacyBackend>,
    pub(crate) inventory: Arc<dyn EnvironmentInventory>,
    vm_names: Arc<VmNameSet>,
    log_store: Arc<dyn ExecutionLogEntryStore>,
}

impl Handler {
    pub fn new(
        options: Arc<Options>,
        vm_names: Arc<VmNameSet>,
        log_store: Arc<dyn ExecutionLogEntryStore>,
        inventory: Arc<dyn EnvironmentInventory>,
        legacy: Arc<dyn LegacyBackend>,
    ) -> Self {
        Self {
            options,
            runtime: None,
            legacy,
            inventory,
            vm_names,
            log_store,
        }
    }

    /// Route jobs without CLI steps through `runtime`.
    pub fn with_runtime(mut self, runtime: Option<Arc<dyn Runtime>>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn vm_names(&self) -> &Arc<VmNameSet> {
        &self.vm_names
    }

    /// Run `job` to completion.
    ///
    /// The job's log is flushed on every exit, including a panic in a step,
    /// and a flush failure is reported alongside any earlier error.
    pub async fn handle(&self, cancel: &CancellationToken, job: &Job) -> Result<()> {
        let started = Instant::now();
        let redactor = Redactor::from_maps([&self.options.redacted_values, &job.redacted_values]);
        let logger = Arc::new(JobLogger::new(Arc::clone(&self.log_store), job.id, redactor));

        let path = self.select_path(job);
        let runtime_name = match &path {
            ExecutionPath::Runtime(runtime) => runtime.name().to_string(),
            ExecutionPath::Legacy => "legacy".to_string(),
        };
        tracing::info!(job_id = job.id, repository = %job.repository_name, path = %runtime_name, "handling job");

        let outcome = AssertUnwindSafe(async {
            match path {
                ExecutionPath::Runtime(runtime) => self.run_with_runtime(cancel, &logger, runtime, job).await,
                ExecutionPath::Legacy => self.run_legacy(cancel, &logger, job).await,
            }
        })
        .catch_unwind()
        .await;

        let flushed = logger.flush().await.context("failed to flush log entries");

        let result = match outcome {
            Ok(result) => combine(result, flushed),
            Err(panic) => {
                if let Err(e) = flushed {
                    tracing::error!(job_id = job.id, "failed to flush log entries: {e:#}");
                }
                std::panic::resume_unwind(panic);
            }
        };

        JobTelemetry::new(job, &runtime_name, started.elapsed(), result.is_ok()).emit();
        result
    }

    fn select_path(&self, job: &Job) -> ExecutionPath<'_> {
        match &self.runtime {
            Some(runtime) if !job.has_cli_steps() => ExecutionPath::Runtime(runtime),
            _ => ExecutionPath::Legacy,
        }
    }

    async fn run_with_runtime(
        &self,
        cancel: &CancellationToken,
        logger: &Arc<JobLogger>,
        runtime: &Arc<dyn Runtime>,
        job: &Job,
    ) -> Result<()> {
        let workspace = runtime
            .prepare_workspace(cancel, logger, job)
            .await
            .context("failed to prepare workspace")?;

        let outcome = AssertUnwindSafe(self.run_in_workspace(
            cancel,
            logger,
            runtime,
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

    async fn run_in_workspace(
        &self,
        cancel: &CancellationToken,
        logger: &Arc<JobLogger>,
        runtime: &Arc<dyn Runtime>,
        job: &Job,
        workspace: &dyn Workspace,
    ) -> Result<()> {
        let reservation = self.vm_names.reserve(new_vm_name(&self.options.vm_prefix));

        let runner = runtime
            .new_runner(
                cancel,
                Arc::clone(logger),
                RunnerOptions {
                    name: reservation.name().to_string(),
                    path: workspace.path().to_path_buf(),
                    working_directory: workspace.working_directory().to_path_buf(),
                    docker_auth_config: job.docker_auth_config.clone(),
                },
            )
            .await
            .context("failed to create runner")?;

        let outcome =
            AssertUnwindSafe(self.run_plan(cancel, runtime, job, workspace, runner.as_ref()))
                .catch_unwind()
                .await;

        let torn_down = runner
            .teardown(&CancellationToken::new())
            .await
            .context("failed to tear down runner");
        drop(reservation);
        finish(outcome, torn_down)
    }

    async fn run_plan(
        &self,
        cancel: &CancellationToken,
        runtime: &Arc<dyn Runtime>,
        job: &Job,
        workspace: &dyn Workspace,
        runner: &dyn Runner,
    ) -> Result<()> {
        let mut job = job.clone();
        if job.queue.is_empty() {
            job.queue = self.options.queues().into_iter().next().unwrap_or_default();
        }

        let specs = runtime
            .new_runner_specs(workspace, &job)
            .context("failed to build runner specs")?;

        run_specs(cancel, runtime.as_ref(), workspace, runner, &specs).await
    }
}

/// Combine the outcome of a unit of work with its cleanup. A panic is resumed
/// once cleanup has run; a cleanup error is then only logged.
fn finish(
    outcome: std::thread::Result<Result<()>>,
    cleanup: Result<()>,
) -> Result<()> {
    match outcome {
        Ok(result) => combine(result, cleanup),
        Err(panic) => {
            if let Err(e) = cleanup {
                tracing::error!("cleanup after panic failed: {e:#}");
            }
            std::panic::resume_unwind(panic)
        }
    }
}

/// Run `specs` in order, honouring skip markers left by pre-steps.
pub(crate) async fn run_specs(
    cancel: &CancellationToken,
    runtime: &dyn Runtime,
    workspace: &dyn Workspace,
    runner: &dyn Runner,
    specs: &[RunnerSpec],
) -> Result<()> {
    let mut skip = SkipState::NotSkipping;

    for (index, spec) in specs.iter().enumerate() {
        let key = spec.key();
        if !skip.should_run(key) {
            tracing::info!(key, "skipping step");
            continue;
        }

        let pre_step = runtime.is_pre_step_key(key);
        if pre_step {
            clear_skip_marker(workspace.working_directory()).await?;
        }

        runner
            .run(cancel, spec)
            .await
            .with_context(|| format!("running command {key:?}"))?;

        if !pre_step {
            continue;
        }
        let Some(next) = take_skip_marker(workspace.working_directory()).await? else {
            continue;
        };

        let target = runtime.step_key(&next);
        if !specs[index + 1..].iter().any(|s| s.key() == target) {
            return Err(SkipError::UnknownTarget {
                pre_step: key.to_string(),
                target,
            }
            .into());
        }
        tracing::info!(pre_step = key, target = %target, "pre-step requested skip");
        skip = SkipState::SkippingUntil(target);
    }

    Ok(())
}
