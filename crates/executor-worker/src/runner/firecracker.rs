// Runs steps inside a Firecracker micro-VM managed by ignite. The workspace is
// copied into the guest at start; image steps run through the guest's docker.

use anyhow::{Context, Result};
use async_trait::async_trait;
use executor_common::constants::workspace::{MARKER_DIR, SKIP_FILE};
use executor_common::FirecrackerOptions;
use executor_sdk::CmdRunner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::{docker_run_args, guest_path, Runner, RunnerOptions};
use crate::cmdlogger::JobLogger;
use crate::command::{Command, CommandSpec, RunnerSpec};

/// Where the workspace lives inside the guest.
pub const IGNITE_WORKSPACE_MOUNT: &str = "/work";

/// Guest directory the docker CLI config is copied to.
const GUEST_DOCKER_CONFIG_DIR: &str = "/etc/docker/cli";

pub struct FirecrackerRunner {
    command: Arc<dyn Command>,
    cmd_runner: Arc<dyn CmdRunner>,
    logger: Arc<JobLogger>,
    firecracker: FirecrackerOptions,
    options: RunnerOptions,
    temp_dir: TempDir,
}

impl FirecrackerRunner {
    pub fn new(
        command: Arc<dyn Command>,
        cmd_runner: Arc<dyn CmdRunner>,
        logger: Arc<JobLogger>,
        firecracker: FirecrackerOptions,
        options: RunnerOptions,
    ) -> Result<Self> {
        let temp_dir = tempfile::Builder::new()
            .prefix("executor-firecracker-")
            .tempdir()
            .context("failed to create runner temp directory")?;
        Ok(Self {
            command,
            cmd_runner,
            logger,
            firecracker,
            options,
            temp_dir,
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// `ignite run` invocation starting the VM with the workspace copied in.
    pub fn start_args(&self) -> Vec<String> {
        let fc = &self.firecracker;
        let mut args: Vec<String> = [
            "ignite",
            "run",
            "--runtime",
            "docker",
            "--network-plugin",
            "cni",
            "--ssh",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.extend([
            "--cpus".to_string(),
            fc.num_cpus.to_string(),
            "--memory".to_string(),
            fc.memory.clone(),
            "--size".to_string(),
            fc.disk_space.clone(),
            "--kernel-image".to_string(),
            fc.kernel_image.clone(),
            "--copy-files".to_string(),
            format!(
                "{}:{}",
                self.options.path.to_string_lossy(),
                IGNITE_WORKSPACE_MOUNT
            ),
        ]);

        if !self.options.docker_auth_config.is_empty() {
            args.push("--copy-files".to_string());
            args.push(format!(
                "{}:{}/config.json",
                self.temp_dir.path().join("config.json").to_string_lossy(),
                GUEST_DOCKER_CONFIG_DIR
            ));
        }

        args.push("--name".to_string());
        args.push(self.options.name.clone());
        args.push(fc.image.clone());
        args
    }

    /// Wrap one command of `spec` in `ignite exec`.
    pub fn exec_args(&self, spec: &RunnerSpec, command_spec: &CommandSpec) -> Vec<String> {
        let mut args = vec![
            "ignite".to_string(),
            "exec".to_string(),
            self.options.name.clone(),
            "--".to_string(),
        ];

        match (&spec.image, &spec.script_path) {
            (Some(image), Some(script)) => {
                let config_dir = (!self.options.docker_auth_config.is_empty())
                    .then(|| Path::new(GUEST_DOCKER_CONFIG_DIR));
                args.extend(docker_run_args(
                    IGNITE_WORKSPACE_MOUNT,
                    image,
                    script,
                    command_spec,
                    config_dir,
                ));
            }
            _ => {
                let dir = guest_path(IGNITE_WORKSPACE_MOUNT, &command_spec.dir);
                let mut line = format!("cd {} &&", shell_quote(&dir));
                for pair in &command_spec.env {
                    line.push(' ');
                    line.push_str(&shell_quote(pair));
                }
                for arg in &command_spec.command {
                    line.push(' ');
                    line.push_str(&shell_quote(arg));
                }
                args.push(line);
            }
        }
        args
    }

    /// Move a skip marker written inside the guest to the host workspace. The
    /// guest copy is deleted so later steps never see it again.
    async fn sync_markers(&self, cancel: &CancellationToken) {
        let Ok(relative) = self.options.working_directory.strip_prefix(&self.options.path) else {
            return;
        };
        let marker = relative.join(MARKER_DIR).join(SKIP_FILE);
        let host_path = self.options.working_directory.join(MARKER_DIR).join(SKIP_FILE);
        if let Some(parent) = host_path.parent() {
            if tokio::fs::create_dir_all(parent).await.is_err() {
                return;
            }
        }

        let guest_marker = guest_path(IGNITE_WORKSPACE_MOUNT, &marker);
        let args = vec![
            "cp".to_string(),
            format!("{}:{}", self.options.name, guest_marker),
            host_path.to_string_lossy().to_string(),
        ];
        if let Err(e) = self.cmd_runner.combined_output(cancel, "ignite", &args).await {
            tracing::trace!(vm = %self.options.name, error = %e, "no marker to copy back");
            return;
        }

        let args = vec![
            "exec".to_string(),
            self.options.name.clone(),
            "--".to_string(),
            format!("rm -f {}", shell_quote(&guest_marker)),
        ];
        if let Err(e) = self.cmd_runner.combined_output(cancel, "ignite", &args).await {
            tracing::warn!(vm = %self.options.name, error = %e, "failed to remove skip marker in guest");
        }
    }
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

#[async_trait]
impl Runner for FirecrackerRunner {
    async fn setup(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.options.docker_auth_config.is_empty() {
            let path = self.temp_dir.path().join("config.json");
            let config = serde_json::to_vec(&self.options.docker_auth_config)?;
            tokio::fs::write(&path, config)
                .await
                .with_context(|| format!("failed to write docker config {path:?}"))?;
        }

        let spec = CommandSpec {
            key: "setup.firecracker.start".to_string(),
            command: self.start_args(),
            dir: PathBuf::new(),
            env: Vec::new(),
        };
        self.command
            .run(cancel, &self.logger, &spec)
            .await
            .context("failed to start firecracker vm")
    }

    async fn run(&self, cancel: &CancellationToken, spec: &RunnerSpec) -> Result<()> {
        for command_spec in &spec.command_specs {
            let resolved = CommandSpec {
                key: command_spec.key.clone(),
                command: self.exec_args(spec, command_spec),
                dir: PathBuf::new(),
                env: Vec::new(),
            };
            self.command.run(cancel, &self.logger, &resolved).await?;
        }
        self.sync_markers(cancel).await;
        Ok(())
    }

    async fn teardown(&self, cancel: &CancellationToken) -> Result<()> {
        let spec = CommandSpec {
            key: "teardown.firecracker.remove".to_string(),
            command: vec![
                "ignite".to_string(),
                "rm".to_string(),
                "-f".to_string(),
                self.options.name.clone(),
            ],
            dir: PathBuf::new(),
            env: Vec::new(),
        };
        self.command
            .run(cancel, &self.logger, &spec)
            .await
            .context("failed to remove firecracker vm")
    }

    fn temp_dir(&self) -> &Path {
        self.temp_dir.path()
    }
}
