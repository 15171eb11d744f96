// Runtime: the backend a job is built for. Knows how to prepare a workspace,
// construct a runner and turn the job's steps into a command plan.

use anyhow::Result;
use async_trait::async_trait;
use executor_common::constants::keys::{PRE_STEP_PREFIX, STEP_PREFIX};
use executor_common::errors::append;
use executor_common::{Options, RuntimeName};
use executor_sdk::CmdRunner;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cmdlogger::JobLogger;
use crate::command::{Command, CommandSpec, RunnerSpec};
use crate::files::Store;
use crate::job::{step_name, Job};
use crate::runner::{self, Runner, RunnerOptions};
use crate::workspace::{Workspace, WorkspacePreparer};

/// Environment variable carrying the queue name into every step.
pub const QUEUE_ENV: &str = "EXECUTOR_QUEUE_NAME";

#[async_trait]
pub trait Runtime: Send + Sync {
    fn name(&self) -> RuntimeName;

    async fn prepare_workspace(
        &self,
        cancel: &CancellationToken,
        logger: &JobLogger,
        job: &Job,
    ) -> Result<Box<dyn Workspace>>;

    /// Construct and set up a runner. The returned runner is ready to run specs.
    async fn new_runner(
        &self,
        cancel: &CancellationToken,
        logger: Arc<JobLogger>,
        options: RunnerOptions,
    ) -> Result<Box<dyn Runner>>;

    fn new_runner_specs(&self, workspace: &dyn Workspace, job: &Job) -> Result<Vec<RunnerSpec>>;

    /// Whether `key` names a pre-step of this runtime.
    fn is_pre_step_key(&self, key: &str) -> bool {
        is_pre_step_key(self.name().as_str(), key)
    }

    /// Key of the step named `name` in plans built by this runtime.
    fn step_key(&self, name: &str) -> String {
        step_key(self.name().as_str(), name)
    }
}

/// `step.<runtime>.<name>`.
pub fn step_key(runtime: &str, name: &str) -> String {
    format!("{STEP_PREFIX}.{runtime}.{name}")
}

pub fn is_pre_step_key(runtime: &str, key: &str) -> bool {
    key.strip_prefix(STEP_PREFIX)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|rest| rest.strip_prefix(runtime))
        .and_then(|rest| rest.strip_prefix('.'))
        .is_some_and(|name| name.starts_with(PRE_STEP_PREFIX))
}

/// The one [`Runtime`] implementation; behaviour differs only by backend variant.
pub struct StandardRuntime {
    name: RuntimeName,
    options: Arc<Options>,
    command: Arc<dyn Command>,
    cmd_runner: Arc<dyn CmdRunner>,
    files: Arc<dyn Store>,
}

impl StandardRuntime {
    pub fn new(
        name: RuntimeName,
        options: Arc<Options>,
        command: Arc<dyn Command>,
        cmd_runner: Arc<dyn CmdRunner>,
        files: Arc<dyn Store>,
    ) -> Self {
        Self {
            name,
            options,
            command,
            cmd_runner,
            files,
        }
    }
}

/// Runtime selected by configuration, or `None` when only the legacy path is available.
pub fn new_runtime(
    options: Arc<Options>,
    command: Arc<dyn Command>,
    cmd_runner: Arc<dyn CmdRunner>,
    files: Arc<dyn Store>,
) -> Option<Arc<dyn Runtime>> {
    let name = options.runtime?;
    tracing::info!(runtime = %name, "using runtime");
    Some(Arc::new(StandardRuntime::new(
        name, options, command, cmd_runner, files,
    )))
}

#[async_trait]
impl Runtime for StandardRuntime {
    fn name(&self) -> RuntimeName {
        self.name
    }

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
        let workspace = preparer.prepare(cancel, logger, job).await?;
        Ok(Box::new(workspace))
    }

    async fn new_runner(
        &self,
        cancel: &CancellationToken,
        logger: Arc<JobLogger>,
        options: RunnerOptions,
    ) -> Result<Box<dyn Runner>> {
        let runner = runner::new_runner(
            self.name,
            Arc::clone(&self.command),
            Arc::clone(&self.cmd_runner),
            logger,
            &self.options.firecracker,
            options,
        )?;

        if let Err(e) = runner.setup(cancel).await {
            let err = e.context("setting up runner");
            return Err(match runner.teardown(&CancellationToken::new()).await {
                Ok(()) => err,
                Err(teardown) => append(Some(err), teardown.context("failed to tear down runner")),
            });
        }
        Ok(runner)
    }

    fn new_runner_specs(&self, workspace: &dyn Workspace, job: &Job) -> Result<Vec<RunnerSpec>> {
        let scripts = workspace.script_filenames();
        if scripts.len() != job.docker_steps.len() {
            anyhow::bail!(
                "workspace has {} scripts for {} steps",
                scripts.len(),
                job.docker_steps.len()
            );
        }

        let specs = job
            .docker_steps
            .iter()
            .zip(scripts)
            .enumerate()
            .map(|(index, (step, script))| {
                let mut env = step.env.clone();
                if !job.queue.is_empty() {
                    env.push(format!("{QUEUE_ENV}={}", job.queue));
                }
                RunnerSpec {
                    command_specs: vec![CommandSpec {
                        key: self.step_key(&step_name(step.key.as_deref(), index)),
                        command: Vec::new(),
                        dir: PathBuf::from(&step.dir),
                        env,
                    }],
                    image: Some(step.image.clone()),
                    script_path: Some(script.clone()),
                }
            })
            .collect();
        Ok(specs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::LocalFilesStore;
    use crate::job::DockerStep;
    use crate::workspace::DirectoryWorkspace;
    use executor_common::{MemoryLogStore, Redactor};
    use executor_sdk::RealCmdRunner;
    use parking_lot::Mutex;

    fn runtime(name: RuntimeName) -> StandardRuntime {
        StandardRuntime::new(
            name,
            Arc::new(Options::default()),
            Arc::new(crate::command::ProcessCommand::new()),
            Arc::new(RealCmdRunner),
            Arc::new(LocalFilesStore::new("/nonexistent")),
        )
    }

    #[test]
    fn pre_step_keys_are_scoped_to_the_runtime() {
        assert!(is_pre_step_key("docker", "step.docker.pre-index"));
        assert!(!is_pre_step_key("docker", "step.docker.index"));
        assert!(!is_pre_step_key("docker", "step.shell.pre-index"));
        assert!(!is_pre_step_key("docker", "pre-index"));
        assert_eq!(step_key("firecracker", "3"), "step.firecracker.3");
    }

    #[test]
    fn specs_follow_docker_steps() {
        let job = Job {
            queue: "codeintel".to_string(),
            docker_steps: vec![
                DockerStep {
                    key: Some("pre-check".to_string()),
                    image: "alpine".to_string(),
                    dir: "sub".to_string(),
                    env: vec!["A=1".to_string()],
                    ..Default::default()
                },
                DockerStep {
                    image: "indexer".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let workspace = DirectoryWorkspace::new(
            PathBuf::from("/ws"),
            PathBuf::from("/ws"),
            vec!["a.sh".to_string(), "b.sh".to_string()],
        );

        let rt = runtime(RuntimeName::Docker);
        let specs = rt.new_runner_specs(&workspace, &job).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].key(), "step.docker.pre-check");
        assert_eq!(specs[1].key(), "step.docker.1");
        assert_eq!(specs[0].image.as_deref(), Some("alpine"));
        assert_eq!(specs[1].script_path.as_deref(), Some("b.sh"));
        assert_eq!(
            specs[0].command_specs[0].env,
            vec!["A=1", "EXECUTOR_QUEUE_NAME=codeintel"]
        );
        assert!(rt.is_pre_step_key(specs[0].key()));
        assert!(!rt.is_pre_step_key(specs[1].key()));
    }

    #[test]
    fn mismatched_scripts_are_rejected() {
        let job = Job {
            docker_steps: vec![DockerStep::default()],
            ..Default::default()
        };
        let workspace = DirectoryWorkspace::new(PathBuf::from("/ws"), PathBuf::from("/ws"), Vec::new());
        assert!(runtime(RuntimeName::Shell)
            .new_runner_specs(&workspace, &job)
            .is_err());
    }

    struct FailingCommand(Mutex<Vec<String>>);

    #[async_trait]
    impl Command for FailingCommand {
        async fn run(&self, _cancel: &CancellationToken, _logger: &JobLogger, spec: &CommandSpec) -> Result<()> {
            self.0.lock().push(spec.key.clone());
            anyhow::bail!("{} exploded", spec.key)
        }
    }

    #[tokio::test]
    async fn setup_and_teardown_failures_are_both_reported() {
        let command = Arc::new(FailingCommand(Mutex::new(Vec::new())));
        let rt = StandardRuntime::new(
            RuntimeName::Firecracker,
            Arc::new(Options::default()),
            command.clone(),
            Arc::new(RealCmdRunner),
            Arc::new(LocalFilesStore::new("/nonexistent")),
        );
        let logger = Arc::new(JobLogger::new(Arc::new(MemoryLogStore::new()), 1, Redactor::new()));

        let err = match rt
            .new_runner(
                &CancellationToken::new(),
                logger,
                RunnerOptions {
                    name: "executor-abc".to_string(),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(_) => panic!("setup should fail"),
            Err(err) => err,
        };

        let message = format!("{err:#}");
        assert!(message.contains("setting up runner"), "{message}");
        assert!(message.contains("setup.firecracker.start exploded"), "{message}");
        assert!(
            message.contains("failed to tear down runner: failed to remove firecracker vm"),
            "{message}"
        );
        assert_eq!(
            *command.0.lock(),
            vec!["setup.firecracker.start", "teardown.firecracker.remove"]
        );
    }

    #[test]
    fn runtime_follows_configuration() {
        let deps = || -> (Arc<dyn Command>, Arc<dyn CmdRunner>, Arc<dyn Store>) {
            (
                Arc::new(crate::command::ProcessCommand::new()),
                Arc::new(RealCmdRunner),
                Arc::new(LocalFilesStore::new("/nonexistent")),
            )
        };

        let (c, r, f) = deps();
        assert!(new_runtime(Arc::new(Options::default()), c, r, f).is_none());

        let (c, r, f) = deps();
        let options = Options {
            runtime: Some(RuntimeName::Shell),
            ..Default::default()
        };
        let rt = new_runtime(Arc::new(options), c, r, f).unwrap();
        assert_eq!(rt.name(), RuntimeName::Shell);
    }
}
