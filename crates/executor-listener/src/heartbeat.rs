// Periodic heartbeat: reports in-flight job ids plus scraped node metrics to
// the queue, and cancels the jobs the queue says are no longer wanted.

use anyhow::{Context, Result};
use executor_common::Options;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::pool::RunningJobs;
use crate::queue::Queue;

const SCRAPE_TIMEOUT: Duration = Duration::from_secs(5);

/// Scrapes Prometheus node exporters and concatenates their text exposition.
pub struct NodeMetrics {
    client: Client,
    endpoints: Vec<(&'static str, Url)>,
}

impl NodeMetrics {
    pub fn new(options: &Options) -> Result<Self> {
        let mut endpoints = Vec::new();
        for (source, raw) in [
            ("node", &options.node_exporter_url),
            ("docker-registry", &options.docker_registry_node_exporter_url),
        ] {
            if let Some(raw) = raw {
                let url = Url::parse(raw).with_context(|| format!("invalid {source} exporter url {raw:?}"))?;
                endpoints.push((source, url));
            }
        }

        let client = Client::builder()
            .timeout(SCRAPE_TIMEOUT)
            .user_agent(concat!("executor/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build metrics client")?;

        Ok(Self { client, endpoints })
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Scrape every exporter. Unreachable exporters are skipped with a warning.
    pub async fn gather(&self) -> String {
        let mut out = String::new();
        for (source, url) in &self.endpoints {
            match self.scrape(url).await {
                Ok(body) => {
                    out.push_str(&format!("# source: {source}\n"));
                    out.push_str(&body);
                    if !body.ends_with('\n') {
                        out.push('\n');
                    }
                }
                Err(e) => tracing::warn!(source, url = %url, "failed to scrape metrics: {e:#}"),
            }
        }
        out
    }

    async fn scrape(&self, url: &Url) -> Result<String> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

pub struct Heartbeater {
    queue: Arc<dyn Queue>,
    running: RunningJobs,
    metrics: NodeMetrics,
    interval: Duration,
}

impl Heartbeater {
    pub fn new(queue: Arc<dyn Queue>, running: RunningJobs, metrics: NodeMetrics, interval: Duration) -> Self {
        Self {
            queue,
            running,
            metrics,
            interval,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.beat().await {
                        tracing::warn!("heartbeat failed: {e:#}");
                    }
                }
            }
        }
    }

    /// Send one heartbeat. Returns the ids of the jobs it cancelled.
    pub async fn beat(&self) -> Result<Vec<i64>> {
        let ids = self.running.ids();
        let metrics = self.metrics.gather().await;
        let requested = self
            .queue
            .heartbeat(&ids, &metrics)
            .await
            .context("failed to send heartbeat")?;

        let mut cancelled = Vec::new();
        for id in requested {
            if self.running.cancel(id) {
                tracing::info!(job_id = id, "job cancelled by queue");
                cancelled.push(id);
            }
        }
        Ok(cancelled)
    }
}
