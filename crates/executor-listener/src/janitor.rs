// Background reaper for Firecracker VMs that carry this instance's prefix but
// belong to no job in flight (left behind by a crash or a failed teardown).

use anyhow::Result;
use executor_common::ErrorList;
use executor_worker::{EnvironmentInventory, VmNameSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct Janitor {
    inventory: Arc<dyn EnvironmentInventory>,
    vm_names: Arc<VmNameSet>,
    prefix: String,
    interval: Duration,
}

impl Janitor {
    pub fn new(
        inventory: Arc<dyn EnvironmentInventory>,
        vm_names: Arc<VmNameSet>,
        prefix: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            inventory,
            vm_names,
            prefix: prefix.into(),
            interval,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            match self.reap(&shutdown).await {
                Ok(removed) if !removed.is_empty() => {
                    tracing::info!(count = removed.len(), vms = ?removed, "removed orphaned vms");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("janitor pass failed: {e:#}"),
            }
        }
    }

    /// Remove every prefixed VM, running or stopped, not reserved by a job.
    pub async fn reap(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let environments = self
            .inventory
            .active_environments(cancel, &self.prefix, true)
            .await?;

        let mut removed = Vec::new();
        let mut errors = ErrorList::new();
        for name in environments.keys() {
            // Reserved names belong to running jobs; their own teardown removes them.
            if self.vm_names.contains(name) {
                continue;
            }
            match self.inventory.remove_environment(cancel, name).await {
                Ok(()) => removed.push(name.clone()),
                Err(e) => errors.push(e),
            }
        }

        errors.into_result()?;
        Ok(removed)
    }
}
