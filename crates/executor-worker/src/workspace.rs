// Job workspaces: a host directory holding the cloned repository, staged
// virtual machine files and the generated step scripts.

use anyhow::{Context, Result};
use async_trait::async_trait;
use executor_common::constants::workspace::SCRIPTS_DIR;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::cmdlogger::JobLogger;
use crate::command::{Command, CommandSpec};
use crate::files::{self, Store};
use crate::job::{DockerStep, Job};

/// The filesystem a job's steps operate on.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Root of the workspace on the host.
    fn path(&self) -> &Path;

    /// Directory steps start in and pre-steps write markers into.
    fn working_directory(&self) -> &Path;

    /// Generated script file names, one per docker step, in step order.
    fn script_filenames(&self) -> &[String];

    /// Delete the workspace unless `keep` is set.
    async fn remove(&self, keep: bool) -> Result<()>;
}

/// A workspace backed by a plain host directory.
#[derive(Debug)]
pub struct DirectoryWorkspace {
    path: PathBuf,
    working_directory: PathBuf,
    script_filenames: Vec<String>,
}

impl DirectoryWorkspace {
    pub fn new(path: PathBuf, working_directory: PathBuf, script_filenames: Vec<String>) -> Self {
        Self {
            path,
            working_directory,
            script_filenames,
        }
    }
}

#[async_trait]
impl Workspace for DirectoryWorkspace {
    fn path(&self) -> &Path {
        &self.path
    }

    fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    fn script_filenames(&self) -> &[String] {
        &self.script_filenames
    }

    async fn remove(&self, keep: bool) -> Result<()> {
        if keep {
            tracing::info!(path = %self.path.display(), "preserving workspace");
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove workspace {:?}", self.path)),
        }
    }
}

/// Everything needed to materialise a workspace for a job.
pub struct WorkspacePreparer<'a> {
    pub root: &'a Path,
    pub git_endpoint: Option<&'a str>,
    pub command: &'a dyn Command,
    pub files: &'a dyn Store,
}

impl WorkspacePreparer<'_> {
    /// Create the workspace directory, clone the repository, stage files and
    /// write step scripts. The directory is removed again if any stage fails.
    pub async fn prepare(
        &self,
        cancel: &CancellationToken,
        logger: &JobLogger,
        job: &Job,
    ) -> Result<DirectoryWorkspace> {
        let path = self
            .root
            .join(format!("workspace-{}-{}", job.id, uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("failed to create workspace directory {path:?}"))?;

        match self.populate(cancel, logger, job, &path).await {
            Ok(workspace) => Ok(workspace),
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&path).await {
                    tracing::warn!(path = %path.display(), error = %cleanup, "failed to remove partial workspace");
                }
                Err(e)
            }
        }
    }

    async fn populate(
        &self,
        cancel: &CancellationToken,
        logger: &JobLogger,
        job: &Job,
        path: &Path,
    ) -> Result<DirectoryWorkspace> {
        let working_directory = if job.repository_directory.is_empty() {
            path.to_path_buf()
        } else {
            let dir = Path::new(&job.repository_directory);
            if !files::is_contained(dir) {
                anyhow::bail!("repository directory {dir:?} escapes the workspace");
            }
            path.join(dir)
        };

        if !job.repository_name.is_empty() {
            tokio::fs::create_dir_all(&working_directory).await?;
            self.clone_repository(cancel, logger, job, &working_directory)
                .await
                .context("failed to clone repository")?;
        }

        self.stage_files(job, path)
            .await
            .context("failed to write virtual machine files")?;

        let script_filenames = write_scripts(job, path)
            .await
            .context("failed to write step scripts")?;

        Ok(DirectoryWorkspace::new(
            path.to_path_buf(),
            working_directory,
            script_filenames,
        ))
    }

    async fn clone_repository(
        &self,
        cancel: &CancellationToken,
        logger: &JobLogger,
        job: &Job,
        dir: &Path,
    ) -> Result<()> {
        let remote = match self.git_endpoint {
            Some(endpoint) if !endpoint.is_empty() => {
                format!("{}/{}", endpoint.trim_end_matches('/'), job.repository_name)
            }
            _ => job.repository_name.clone(),
        };

        let commit = if job.commit.is_empty() { "HEAD" } else { job.commit.as_str() };
        let steps: [(&str, Vec<&str>); 4] = [
            ("setup.git.init", vec!["init"]),
            ("setup.git.add-remote", vec!["remote", "add", "origin", remote.as_str()]),
            ("setup.git.fetch", vec!["fetch", "--depth", "1", "--no-tags", "origin", commit]),
            ("setup.git.checkout", vec!["checkout", "--quiet", "FETCH_HEAD"]),
        ];

        for (key, args) in steps {
            let mut command = vec!["git".to_string()];
            command.extend(args.into_iter().map(str::to_string));
            let spec = CommandSpec {
                key: key.to_string(),
                command,
                dir: dir.to_path_buf(),
                env: vec!["GIT_TERMINAL_PROMPT=0".to_string()],
            };
            self.command.run(cancel, logger, &spec).await?;
        }
        Ok(())
    }

    async fn stage_files(&self, job: &Job, root: &Path) -> Result<()> {
        for (relative, file) in &job.virtual_machine_files {
            let relative_path = Path::new(relative);
            if !files::is_contained(relative_path) {
                anyhow::bail!("virtual machine file {relative:?} escapes the workspace");
            }

            let content = match (&file.content, &file.bucket, &file.key) {
                (Some(content), _, _) => content.clone().into_bytes(),
                (None, Some(bucket), Some(key)) => self.files.get(job, bucket, key).await?,
                _ => anyhow::bail!("virtual machine file {relative:?} has neither content nor object key"),
            };

            let target = root.join(relative_path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, content)
                .await
                .with_context(|| format!("failed to write {target:?}"))?;
        }
        Ok(())
    }
}

/// File name of the script generated for docker step `index`.
pub fn script_filename(job: &Job, index: usize) -> String {
    format!(
        "{}.{}_{}@{}.sh",
        job.id,
        index,
        job.repository_name.replace('/', "_"),
        job.commit
    )
}

/// Script body for a docker step: the step's commands, stopping at the first failure.
pub fn build_script(step: &DockerStep) -> String {
    let mut script = String::from("#!/bin/sh\nset -e\n");
    for command in &step.commands {
        script.push_str(command);
        script.push('\n');
    }
    script
}

async fn write_scripts(job: &Job, root: &Path) -> Result<Vec<String>> {
    if job.docker_steps.is_empty() {
        return Ok(Vec::new());
    }

    let scripts_dir = root.join(SCRIPTS_DIR);
    tokio::fs::create_dir_all(&scripts_dir).await?;

    let mut names = Vec::with_capacity(job.docker_steps.len());
    for (index, step) in job.docker_steps.iter().enumerate() {
        let name = script_filename(job, index);
        let path = scripts_dir.join(&name);
        tokio::fs::write(&path, build_script(step)).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
        }
        names.push(name);
    }
    Ok(names)
}
