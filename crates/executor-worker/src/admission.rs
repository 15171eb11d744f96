// Admission gate consulted before every dequeue attempt.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::handler::Handler;

/// Outcome of [`Handler::pre_dequeue`].
#[derive(Debug, Clone, PartialEq)]
pub struct PreDequeue {
    pub dequeueable: bool,
    /// Extra arguments forwarded to the dequeue request.
    pub extra_arguments: Option<serde_json::Value>,
}

impl PreDequeue {
    fn dequeueable(dequeueable: bool) -> Self {
        Self {
            dequeueable,
            extra_arguments: None,
        }
    }
}

impl Handler {
    /// Decide whether this instance may take another job.
    ///
    /// With Firecracker enabled, every live VM carrying our prefix counts
    /// against `NumHandlers`. Seeing as many VMs as handlers while about to
    /// dequeue means one of them is orphaned and must be reaped first.
    /// A failed backend query is returned as an error; callers treat it as
    /// not dequeueable.
    pub async fn pre_dequeue(&self, cancel: &CancellationToken) -> Result<PreDequeue> {
        if !self.options.firecracker.enabled {
            return Ok(PreDequeue::dequeueable(true));
        }

        let live = self
            .inventory
            .active_environments(cancel, &self.options.vm_prefix, false)
            .await?;

        if live.len() < self.options.num_handlers {
            return Ok(PreDequeue::dequeueable(true));
        }

        tracing::warn!(
            live = live.len(),
            num_handlers = self.options.num_handlers,
            "not dequeueing: found orphaned vm",
        );
        Ok(PreDequeue::dequeueable(false))
    }
}
