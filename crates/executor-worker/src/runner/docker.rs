// Runs image steps in throwaway containers with the workspace mounted at /data.

use anyhow::{Context, Result};
use async_trait::async_trait;
use executor_common::constants::workspace::{CONTAINER_MOUNT, SCRIPTS_DIR};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::{guest_path, resolve_dir, Runner, RunnerOptions};
use crate::cmdlogger::JobLogger;
use crate::command::{Command, CommandSpec, RunnerSpec};

pub struct DockerRunner {
    command: Arc<dyn Command>,
    logger: Arc<JobLogger>,
    options: RunnerOptions,
    temp_dir: TempDir,
}

impl DockerRunner {
    pub fn new(command: Arc<dyn Command>, logger: Arc<JobLogger>, options: RunnerOptions) -> Result<Self> {
        let temp_dir = tempfile::Builder::new()
            .prefix("executor-docker-")
            .tempdir()
            .context("failed to create runner temp directory")?;
        Ok(Self {
            command,
            logger,
            options,
            temp_dir,
        })
    }

    fn config_dir(&self) -> Option<&Path> {
        if self.options.docker_auth_config.is_empty() {
            None
        } else {
            Some(self.temp_dir.path())
        }
    }

    fn resolve(&self, spec: &RunnerSpec, command_spec: &CommandSpec) -> CommandSpec {
        match (&spec.image, &spec.script_path) {
            (Some(image), Some(script)) => CommandSpec {
                key: command_spec.key.clone(),
                command: docker_run_args(
                    &self.options.path.to_string_lossy(),
                    image,
                    script,
                    command_spec,
                    self.config_dir(),
                ),
                dir: self.options.path.clone(),
                env: Vec::new(),
            },
            _ => CommandSpec {
                key: command_spec.key.clone(),
                command: command_spec.command.clone(),
                dir: resolve_dir(&self.options.path, &command_spec.dir),
                env: command_spec.env.clone(),
            },
        }
    }
}

/// `docker run` invocation executing `script` from the mounted workspace.
///
/// `mount_source` is the workspace path as seen by the docker daemon.
pub fn docker_run_args(
    mount_source: &str,
    image: &str,
    script: &str,
    spec: &CommandSpec,
    config_dir: Option<&Path>,
) -> Vec<String> {
    let mut args = vec!["docker".to_string()];

    // Global flags precede the subcommand.
    if let Some(dir) = config_dir {
        args.push("--config".to_string());
        args.push(dir.to_string_lossy().to_string());
    }

    args.push("run".to_string());
    args.push("--rm".to_string());

    args.push("-v".to_string());
    args.push(format!("{mount_source}:{CONTAINER_MOUNT}"));

    args.push("-w".to_string());
    args.push(guest_path(CONTAINER_MOUNT, &spec.dir));

    for pair in &spec.env {
        args.push("-e".to_string());
        args.push(pair.clone());
    }

    args.push("--entrypoint".to_string());
    args.push("/bin/sh".to_string());

    args.push(image.to_string());
    args.push(format!("{CONTAINER_MOUNT}/{SCRIPTS_DIR}/{script}"));
    args
}

#[async_trait]
impl Runner for DockerRunner {
    async fn setup(&self, _cancel: &CancellationToken) -> Result<()> {
        if let Some(dir) = self.config_dir() {
            let config = serde_json::to_vec(&self.options.docker_auth_config)?;
            let path = dir.join("config.json");
            tokio::fs::write(&path, config)
                .await
                .with_context(|| format!("failed to write docker config {path:?}"))?;
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DockerAuthConfig, DockerAuthConfigAuth};
    use executor_common::{MemoryLogStore, Redactor};
    use std::collections::HashMap;
    use std::path::PathBuf;

    #[test]
    fn run_args_mount_workspace_and_pass_env() {
        let spec = CommandSpec {
            key: "step.docker.0".to_string(),
            dir: PathBuf::from("sub/dir"),
            env: vec!["A=1".to_string(), "B=2".to_string()],
            ..Default::default()
        };
        let args = docker_run_args("/ws", "alpine:3", "s.sh", &spec, Some(Path::new("/tmp/cfg")));
        assert_eq!(
            args,
            vec![
                "docker", "--config", "/tmp/cfg", "run", "--rm", "-v", "/ws:/data", "-w",
                "/data/sub/dir", "-e", "A=1", "-e", "B=2", "--entrypoint", "/bin/sh", "alpine:3",
                "/data/.executor-scripts/s.sh",
            ]
        );
    }

    #[tokio::test]
    async fn setup_writes_auth_config_only_when_present() {
        let logger = Arc::new(JobLogger::new(Arc::new(MemoryLogStore::new()), 1, Redactor::new()));
        let command: Arc<dyn Command> = Arc::new(crate::command::ProcessCommand::new());

        let plain = DockerRunner::new(command.clone(), logger.clone(), RunnerOptions::default()).unwrap();
        plain.setup(&CancellationToken::new()).await.unwrap();
        assert!(!plain.temp_dir().join("config.json").exists());

        let options = RunnerOptions {
            docker_auth_config: DockerAuthConfig {
                auths: HashMap::from([(
                    "registry.example.com".to_string(),
                    DockerAuthConfigAuth {
                        auth: "dXNlcjpwYXNz".to_string(),
                    },
                )]),
            },
            ..Default::default()
        };
        let authed = DockerRunner::new(command, logger, options).unwrap();
        authed.setup(&CancellationToken::new()).await.unwrap();
        let written = std::fs::read_to_string(authed.temp_dir().join("config.json")).unwrap();
        assert!(written.contains("registry.example.com"));
        assert!(written.contains("dXNlcjpwYXNz"));
    }
}
