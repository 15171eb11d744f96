// Introspection of live Firecracker environments through the ignite CLI.

use anyhow::{Context, Result};
use async_trait::async_trait;
use executor_sdk::CmdRunner;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Backend view of the environments this worker instance has created.
#[async_trait]
pub trait EnvironmentInventory: Send + Sync {
    /// Map of environment name to backend id for environments named `<prefix>-*`.
    /// Stopped environments are included when `all` is set.
    async fn active_environments(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
        all: bool,
    ) -> Result<BTreeMap<String, String>>;

    /// Force-remove an environment.
    async fn remove_environment(&self, cancel: &CancellationToken, name: &str) -> Result<()>;
}

/// [`EnvironmentInventory`] backed by `ignite ps` / `ignite rm`.
pub struct IgniteInventory {
    cmd_runner: Arc<dyn CmdRunner>,
}

impl IgniteInventory {
    pub fn new(cmd_runner: Arc<dyn CmdRunner>) -> Self {
        Self { cmd_runner }
    }
}

#[async_trait]
impl EnvironmentInventory for IgniteInventory {
    async fn active_environments(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
        all: bool,
    ) -> Result<BTreeMap<String, String>> {
        let mut args = vec![
            "ps".to_string(),
            "-t".to_string(),
            "{{ .Name }}:{{ .UID }}".to_string(),
            "-f".to_string(),
            format!("{{{{.ObjectMeta.Name}}}}=~{prefix}-"),
        ];
        if all {
            args.push("-a".to_string());
        }

        let output = self
            .cmd_runner
            .combined_output(cancel, "ignite", &args)
            .await
            .context("failed to list firecracker vms")?;
        Ok(parse_ignite_list(&String::from_utf8_lossy(&output)))
    }

    async fn remove_environment(&self, cancel: &CancellationToken, name: &str) -> Result<()> {
        let args = vec!["rm".to_string(), "-f".to_string(), name.to_string()];
        self.cmd_runner
            .combined_output(cancel, "ignite", &args)
            .await
            .with_context(|| format!("failed to remove vm {name}"))?;
        Ok(())
    }
}

/// Parse `name:uid` lines; malformed lines are ignored.
pub fn parse_ignite_list(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .map(str::trim)
        .filter_map(|line| line.split_once(':'))
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, uid)| (name.to_string(), uid.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCmdRunner;

    #[test]
    fn parses_name_uid_lines() {
        let parsed = parse_ignite_list("foo:bar\n\nfaz:baz\ngarbage\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["foo"], "bar");
        assert_eq!(parsed["faz"], "baz");
    }

    #[tokio::test]
    async fn lists_with_prefix_filter() {
        let runner = Arc::new(FakeCmdRunner::ok("executor-1:abc\n"));
        let inventory = IgniteInventory::new(runner.clone());
        let envs = inventory
            .active_environments(&CancellationToken::new(), "executor", true)
            .await
            .unwrap();
        assert_eq!(envs.len(), 1);

        let calls = runner.calls.lock();
        assert_eq!(calls[0].0, "ignite");
        assert!(calls[0].1.contains(&"{{.ObjectMeta.Name}}=~executor-".to_string()));
        assert_eq!(calls[0].1.last().map(String::as_str), Some("-a"));
    }

    #[tokio::test]
    async fn removal_errors_carry_name() {
        let inventory = IgniteInventory::new(Arc::new(FakeCmdRunner::failing("no such vm")));
        let err = inventory
            .remove_environment(&CancellationToken::new(), "executor-9")
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("executor-9"));
    }
}
