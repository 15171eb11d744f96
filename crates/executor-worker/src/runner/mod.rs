// Runners: an execution environment that has been set up once and then runs
// runner specs until it is torn down.

mod docker;
mod firecracker;
mod shell;

pub use docker::{docker_run_args, DockerRunner};
pub use firecracker::{FirecrackerRunner, IGNITE_WORKSPACE_MOUNT};
pub use shell::ShellRunner;

use anyhow::Result;
use async_trait::async_trait;
use executor_common::{FirecrackerOptions, RuntimeName};
use executor_sdk::CmdRunner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cmdlogger::JobLogger;
use crate::command::{Command, RunnerSpec};
use crate::job::DockerAuthConfig;

/// A prepared execution environment.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Bring the environment up. Called at most once, before any `run`.
    async fn setup(&self, cancel: &CancellationToken) -> Result<()>;

    /// Run every command of `spec`, stopping at the first failure.
    async fn run(&self, cancel: &CancellationToken, spec: &RunnerSpec) -> Result<()>;

    /// Release the environment. Callers pass a fresh token so teardown is
    /// never cut short by the job's own cancellation.
    async fn teardown(&self, cancel: &CancellationToken) -> Result<()>;

    /// Scratch directory owned by the runner, removed together with it.
    fn temp_dir(&self) -> &Path;
}

/// Per-job parameters of a runner.
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    /// Name of the environment; doubles as the VM name for Firecracker.
    pub name: String,
    /// Workspace root on the host.
    pub path: PathBuf,
    /// Working directory on the host; pre-step markers are read from here.
    pub working_directory: PathBuf,
    pub docker_auth_config: DockerAuthConfig,
}

/// Build (but do not set up) a runner for `runtime`.
pub fn new_runner(
    runtime: RuntimeName,
    command: Arc<dyn Command>,
    cmd_runner: Arc<dyn CmdRunner>,
    logger: Arc<JobLogger>,
    firecracker: &FirecrackerOptions,
    options: RunnerOptions,
) -> Result<Box<dyn Runner>> {
    let runner: Box<dyn Runner> = match runtime {
        RuntimeName::Shell => Box::new(ShellRunner::new(command, logger, options)?),
        RuntimeName::Docker => Box::new(DockerRunner::new(command, logger, options)?),
        RuntimeName::Firecracker => Box::new(FirecrackerRunner::new(
            command,
            cmd_runner,
            logger,
            firecracker.clone(),
            options,
        )?),
    };
    Ok(runner)
}

/// Resolve a step directory against `base`; empty means `base` itself.
pub(crate) fn resolve_dir(base: &Path, dir: &Path) -> PathBuf {
    if dir.as_os_str().is_empty() {
        base.to_path_buf()
    } else {
        base.join(dir)
    }
}

/// Join path segments with `/` regardless of host separator; used for paths
/// inside containers and VMs.
pub(crate) fn guest_path(base: &str, dir: &Path) -> String {
    let dir = dir.to_string_lossy();
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), dir)
    }
}
