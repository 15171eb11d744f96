// ConfigurationStore: loads the executor settings file once at startup,
// applies `EXECUTOR_*` environment overrides and validates the result.

use crate::constants::env as env_keys;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Which execution backend builds workspaces, runners and command plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeName {
    Shell,
    Docker,
    Firecracker,
}

impl RuntimeName {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeName::Shell => "shell",
            RuntimeName::Docker => "docker",
            RuntimeName::Firecracker => "firecracker",
        }
    }
}

impl fmt::Display for RuntimeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RuntimeName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shell" => Ok(RuntimeName::Shell),
            "docker" => Ok(RuntimeName::Docker),
            "firecracker" => Ok(RuntimeName::Firecracker),
            other => Err(ConfigError::UnknownRuntime(other.to_string())),
        }
    }
}

/// Isolation backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FirecrackerOptions {
    /// Whether jobs run inside micro-VMs.
    pub enabled: bool,
    /// Keep workspaces on disk after the job exits (debugging aid).
    pub keep_workspaces: bool,
    #[serde(rename = "NumCPUs")]
    pub num_cpus: u32,
    /// Memory per VM, e.g. `12G`.
    pub memory: String,
    /// Disk per VM, e.g. `20G`.
    pub disk_space: String,
    /// Base image the VM boots.
    pub image: String,
    /// Kernel image the VM boots.
    pub kernel_image: String,
}

impl Default for FirecrackerOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            keep_workspaces: false,
            num_cpus: 4,
            memory: "12G".to_string(),
            disk_space: "20G".to_string(),
            image: "executor-vm:latest".to_string(),
            kernel_image: "ignite-kernel:5.10.135-amd64".to_string(),
        }
    }
}

/// Process-wide executor configuration. Read-only once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Options {
    /// Prefix of every environment name this instance creates.
    #[serde(rename = "VMPrefix")]
    pub vm_prefix: String,

    /// Single queue to pull from. Mutually exclusive with `queue_names`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,

    /// Several queues to pull from. Mutually exclusive with `queue_name`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub queue_names: Vec<String>,

    /// Number of jobs handled concurrently.
    #[serde(alias = "MaximumNumJobs")]
    pub num_handlers: usize,

    /// Seconds between dequeue attempts when idle or refused.
    pub poll_interval: u64,

    /// Seconds between heartbeats.
    pub heartbeat_interval: u64,

    /// Upper bound on a single job's runtime, in seconds.
    pub maximum_runtime_per_job: u64,

    /// Seconds between orphan sweeps. Zero disables the janitor.
    pub janitor_interval: u64,

    /// Backend for the runtime-driven path. `None` forces the legacy path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeName>,

    pub firecracker: FirecrackerOptions,

    /// Worker-level `secret → replacement` pairs applied to every job's output.
    pub redacted_values: HashMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_exporter_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_registry_node_exporter_url: Option<String>,

    /// Root of the local spool queue.
    pub spool_directory: PathBuf,

    /// Where execution log entries are persisted.
    pub log_directory: PathBuf,

    /// Root of the artifact store used while preparing workspaces.
    pub files_directory: PathBuf,

    /// Parent directory of job workspaces. Defaults to the system temp dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,

    /// Base URL repositories are cloned from (`<GitEndpoint>/<RepositoryName>`).
    /// When unset the repository name is used as the remote verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_endpoint: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            vm_prefix: "executor".to_string(),
            queue_name: None,
            queue_names: Vec::new(),
            num_handlers: 1,
            poll_interval: 1,
            heartbeat_interval: 5,
            maximum_runtime_per_job: 30 * 60,
            janitor_interval: 30,
            runtime: None,
            firecracker: FirecrackerOptions::default(),
            redacted_values: HashMap::new(),
            node_exporter_url: None,
            docker_registry_node_exporter_url: None,
            spool_directory: PathBuf::from("spool"),
            log_directory: PathBuf::from("logs"),
            files_directory: PathBuf::from("files"),
            workspace_root: None,
            git_endpoint: None,
        }
    }
}

impl Options {
    /// The queues this instance dequeues from, in priority order.
    pub fn queues(&self) -> Vec<String> {
        match &self.queue_name {
            Some(name) => vec![name.clone()],
            None => self.queue_names.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval.max(1))
    }

    pub fn maximum_runtime_per_job(&self) -> Duration {
        Duration::from_secs(self.maximum_runtime_per_job)
    }

    pub fn janitor_interval(&self) -> Option<Duration> {
        (self.janitor_interval > 0).then(|| Duration::from_secs(self.janitor_interval))
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Apply `EXECUTOR_*` overrides from `lookup` (usually the process environment).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(env_keys::VM_PREFIX) {
            self.vm_prefix = v;
        }
        if let Some(v) = lookup(env_keys::QUEUE_NAME) {
            self.queue_name = Some(v).filter(|v| !v.is_empty());
        }
        if let Some(v) = lookup(env_keys::QUEUE_NAMES) {
            self.queue_names = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup(env_keys::MAXIMUM_NUM_JOBS) {
            self.num_handlers = v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: env_keys::MAXIMUM_NUM_JOBS,
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup(env_keys::USE_FIRECRACKER) {
            self.firecracker.enabled = parse_bool(env_keys::USE_FIRECRACKER, &v)?;
        }
        if let Some(v) = lookup(env_keys::KEEP_WORKSPACES) {
            self.firecracker.keep_workspaces = parse_bool(env_keys::KEEP_WORKSPACES, &v)?;
        }
        if let Some(v) = lookup(env_keys::RUNTIME) {
            self.runtime = if v.trim().is_empty() { None } else { Some(v.parse()?) };
        }
        Ok(())
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vm_prefix.is_empty() {
            return Err(ConfigError::Missing("VMPrefix"));
        }
        match (&self.queue_name, self.queue_names.is_empty()) {
            (Some(_), false) => return Err(ConfigError::ConflictingQueues),
            (None, true) => return Err(ConfigError::Missing("QueueName or QueueNames")),
            _ => {}
        }
        if self.num_handlers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "NumHandlers",
                value: "0".to_string(),
            });
        }
        if self.firecracker.enabled && self.runtime.is_some_and(|r| r != RuntimeName::Firecracker) {
            return Err(ConfigError::RuntimeMismatch(self.runtime.unwrap_or(RuntimeName::Firecracker)));
        }
        for (key, value) in [
            ("NodeExporterUrl", &self.node_exporter_url),
            ("DockerRegistryNodeExporterUrl", &self.docker_registry_node_exporter_url),
        ] {
            if let Some(value) = value {
                url::Url::parse(value).map_err(|_| ConfigError::InvalidValue {
                    key,
                    value: value.clone(),
                })?;
            }
        }
        Ok(())
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

/// Configuration validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("QueueName and QueueNames are mutually exclusive")]
    ConflictingQueues,
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("unknown runtime {0:?}")]
    UnknownRuntime(String),
    #[error("runtime {0} cannot be combined with the firecracker backend")]
    RuntimeMismatch(RuntimeName),
}

// ---------------------------------------------------------------------------
// ConfigurationStore
// ---------------------------------------------------------------------------

/// Loads [`Options`] from a JSON settings file.
pub struct ConfigurationStore {
    config_file_path: PathBuf,
}

impl ConfigurationStore {
    pub fn new(config_file_path: impl Into<PathBuf>) -> Self {
        Self {
            config_file_path: config_file_path.into(),
        }
    }

    pub fn config_file_path(&self) -> &Path {
        &self.config_file_path
    }

    /// Whether the settings file exists.
    pub fn is_configured(&self) -> bool {
        self.config_file_path.exists()
    }

    /// Read, override from the process environment, and validate.
    pub fn load(&self) -> Result<Options> {
        self.load_with_env(|key| std::env::var(key).ok())
    }

    pub fn load_with_env<F>(&self, lookup: F) -> Result<Options>
    where
        F: Fn(&str) -> Option<String>,
    {
        let json = fs::read_to_string(&self.config_file_path).with_context(|| {
            format!("failed to read settings from {:?}", self.config_file_path)
        })?;

        let mut options: Options =
            serde_json::from_str(&json).context("failed to deserialize executor settings")?;

        options.apply_env(lookup)?;
        options.validate()?;

        tracing::info!(
            path = %self.config_file_path.display(),
            queues = ?options.queues(),
            num_handlers = options.num_handlers,
            runtime = ?options.runtime,
            firecracker = options.firecracker.enabled,
            "loaded executor settings"
        );

        Ok(options)
    }

    /// Write `options` back to disk (used by `executor init`).
    pub fn save(&self, options: &Options) -> Result<()> {
        let json = serde_json::to_string_pretty(options)?;
        fs::write(&self.config_file_path, json).with_context(|| {
            format!("failed to write settings to {:?}", self.config_file_path)
        })?;
        Ok(())
    }
}
