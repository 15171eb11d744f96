// Thin seam over host process execution so that callers probing the host
// (backend introspection, tool discovery) can be exercised without spawning.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Host process execution used by the admission gate, the janitor and the
/// backends that need to probe the machine.
#[async_trait]
pub trait CmdRunner: Send + Sync {
    /// Run `name args..` and return stdout and stderr interleaved.
    ///
    /// A non-zero exit status is an error carrying the captured output.
    async fn combined_output(
        &self,
        cancel: &CancellationToken,
        name: &str,
        args: &[String],
    ) -> Result<Vec<u8>>;

    /// Build (but do not spawn) a command.
    fn command(&self, name: &str, args: &[String]) -> Command;

    /// Locate an executable on `PATH`.
    fn look_path(&self, name: &str) -> Result<PathBuf>;

    /// Stat a path on the host.
    fn stat(&self, path: &Path) -> std::io::Result<std::fs::Metadata>;
}

/// [`CmdRunner`] backed by the real host.
#[derive(Debug, Clone, Default)]
pub struct RealCmdRunner;

#[async_trait]
impl CmdRunner for RealCmdRunner {
    async fn combined_output(
        &self,
        cancel: &CancellationToken,
        name: &str,
        args: &[String],
    ) -> Result<Vec<u8>> {
        let mut cmd = self.command(name, args);
        cmd.kill_on_drop(true);

        let output = tokio::select! {
            output = cmd.output() => output.with_context(|| format!("failed to run '{name}'"))?,
            _ = cancel.cancelled() => anyhow::bail!("'{name}' was cancelled"),
        };

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);

        if !output.status.success() {
            anyhow::bail!(
                "'{} {}' failed with {}: {}",
                name,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&combined).trim()
            );
        }

        Ok(combined)
    }

    fn command(&self, name: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(name);
        cmd.args(args);
        cmd
    }

    fn look_path(&self, name: &str) -> Result<PathBuf> {
        which::which(name).with_context(|| {
            format!("{name}: command not found. Make sure '{name}' is installed and on PATH")
        })
    }

    fn stat(&self, path: &Path) -> std::io::Result<std::fs::Metadata> {
        std::fs::metadata(path)
    }
}
