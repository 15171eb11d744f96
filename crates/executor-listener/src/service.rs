// Assembles the executor from its settings and runs it until shutdown.

use anyhow::{Context, Result};
use executor_common::{FileLogStore, Options};
use executor_sdk::{CmdRunner, RealCmdRunner};
use executor_worker::files::LocalFilesStore;
use executor_worker::{
    new_runtime, Command, EnvironmentInventory, Handler, HostLegacyBackend, IgniteInventory,
    ProcessCommand, VmNameSet,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::heartbeat::{Heartbeater, NodeMetrics};
use crate::janitor::Janitor;
use crate::pool::{PoolOptions, WorkerPool};
use crate::queue::{Queue, SpoolQueue};

/// Run the worker pool with its heartbeat and janitor until `shutdown`
/// fires, or in `once` mode until the pool drains.
pub async fn run(options: Options, once: bool, shutdown: CancellationToken) -> Result<()> {
    let options = Arc::new(options);

    let cmd_runner: Arc<dyn CmdRunner> = Arc::new(RealCmdRunner);
    let command: Arc<dyn Command> = Arc::new(ProcessCommand::new());
    let files = Arc::new(LocalFilesStore::new(&options.files_directory));
    let log_store = Arc::new(FileLogStore::new(&options.log_directory));
    let inventory: Arc<dyn EnvironmentInventory> = Arc::new(IgniteInventory::new(Arc::clone(&cmd_runner)));
    let vm_names = Arc::new(VmNameSet::new());

    let legacy = Arc::new(HostLegacyBackend::new(
        Arc::clone(&options),
        Arc::clone(&command),
        Arc::clone(&cmd_runner),
        files.clone(),
    ));
    let runtime = new_runtime(
        Arc::clone(&options),
        Arc::clone(&command),
        Arc::clone(&cmd_runner),
        files,
    );
    let handler = Arc::new(
        Handler::new(
            Arc::clone(&options),
            Arc::clone(&vm_names),
            log_store,
            Arc::clone(&inventory),
            legacy,
        )
        .with_runtime(runtime),
    );

    let queue: Arc<dyn Queue> = Arc::new(SpoolQueue::new(&options.spool_directory));
    let pool = Arc::new(WorkerPool::new(
        handler,
        Arc::clone(&queue),
        PoolOptions::from_options(&options, once),
    ));

    // Background tasks stop with the pool even when the pool drains on its own.
    let background = shutdown.child_token();
    let mut tasks = Vec::new();

    let metrics = NodeMetrics::new(&options).context("failed to configure node metrics")?;
    let heartbeater = Heartbeater::new(
        Arc::clone(&queue),
        pool.running().clone(),
        metrics,
        options.heartbeat_interval(),
    );
    {
        let token = background.clone();
        tasks.push(tokio::spawn(async move { heartbeater.run(token).await }));
    }

    if options.firecracker.enabled {
        if let Some(interval) = options.janitor_interval() {
            let janitor = Janitor::new(inventory, vm_names, options.vm_prefix.clone(), interval);
            let token = background.clone();
            tasks.push(tokio::spawn(async move { janitor.run(token).await }));
        }
    }

    tracing::info!(
        queues = ?options.queues(),
        num_handlers = options.num_handlers,
        once,
        "executor started"
    );

    pool.run(shutdown).await;

    background.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("background task failed: {e}");
        }
    }

    tracing::info!("executor stopped");
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
pub fn install_signal_handlers(shutdown: &CancellationToken) {
    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("ctrl-c received, shutting down");
                token.cancel();
            }
            Err(e) => tracing::error!("failed to listen for ctrl-c: {e}"),
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let token = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    tracing::info!("SIGTERM received, shutting down");
                    token.cancel();
                }
                Err(e) => tracing::error!("failed to listen for SIGTERM: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use executor_common::RuntimeName;
    use std::time::Duration;

    #[tokio::test]
    async fn once_mode_drains_an_empty_spool() {
        let dir = tempfile::tempdir().unwrap();
        let options = Options {
            queue_name: Some("batches".to_string()),
            runtime: Some(RuntimeName::Shell),
            spool_directory: dir.path().join("spool"),
            log_directory: dir.path().join("logs"),
            files_directory: dir.path().join("files"),
            workspace_root: Some(dir.path().join("work")),
            ..Default::default()
        };

        tokio::time::timeout(
            Duration::from_secs(10),
            run(options, true, CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let options = Options {
            queue_name: Some("batches".to_string()),
            spool_directory: dir.path().join("spool"),
            log_directory: dir.path().join("logs"),
            ..Default::default()
        };
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(10), run(options, false, shutdown))
            .await
            .unwrap()
            .unwrap();
    }
}
