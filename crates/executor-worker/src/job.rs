// Job payload as dequeued from a queue. Immutable once dequeued; one
// orchestration run owns it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A build/index job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Job {
    pub id: i64,
    /// Identifier of the record the job was created for (upload, changeset spec, ...).
    pub record_id: i64,
    pub repository_name: String,
    /// Sub-directory of the workspace the repository is cloned into.
    pub repository_directory: String,
    pub commit: String,
    /// Files staged into the workspace before any step runs, keyed by relative path.
    pub virtual_machine_files: HashMap<String, VirtualMachineFile>,
    pub docker_steps: Vec<DockerStep>,
    pub cli_steps: Vec<CliStep>,
    /// Job-level `secret → replacement` pairs, merged with the worker's own.
    pub redacted_values: HashMap<String, String>,
    pub docker_auth_config: DockerAuthConfig,
    /// Queue the job was dequeued from.
    pub queue: String,
}

impl Job {
    /// Jobs carrying src-cli steps still go through the legacy path.
    pub fn has_cli_steps(&self) -> bool {
        !self.cli_steps.is_empty()
    }
}

/// A step run inside a container image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DockerStep {
    /// Optional stable name; the step's index is used when absent.
    pub key: Option<String>,
    pub image: String,
    pub commands: Vec<String>,
    pub dir: String,
    /// `NAME=value` pairs.
    pub env: Vec<String>,
}

/// A src-cli invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CliStep {
    pub key: Option<String>,
    pub commands: Vec<String>,
    pub dir: String,
    pub env: Vec<String>,
}

/// A file materialised in the workspace, either inline or from the artifact store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualMachineFile {
    pub content: Option<String>,
    pub bucket: Option<String>,
    pub key: Option<String>,
}

/// Registry credentials, serialised verbatim as a docker `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerAuthConfig {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub auths: HashMap<String, DockerAuthConfigAuth>,
}

impl DockerAuthConfig {
    pub fn is_empty(&self) -> bool {
        self.auths.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerAuthConfigAuth {
    pub auth: String,
}

/// Step name used in keys: the declared key, or the index when none is declared.
pub fn step_name(key: Option<&str>, index: usize) -> String {
    match key {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => index.to_string(),
    }
}
