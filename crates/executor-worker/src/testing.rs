// Hand-written doubles for the runtime, runner, workspace and inventory seams.

use anyhow::Result;
use async_trait::async_trait;
use executor_common::constants::workspace::{MARKER_DIR, SKIP_FILE};
use executor_common::RuntimeName;
use executor_sdk::CmdRunner;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cmdlogger::JobLogger;
use crate::command::{CommandSpec, RunnerSpec};
use crate::handler::LegacyBackend;
use crate::ignite::EnvironmentInventory;
use crate::job::Job;
use crate::runner::{Runner, RunnerOptions};
use crate::runtime::Runtime;
use crate::vm_names::VmNameSet;
use crate::workspace::Workspace;

/// Call counts shared by every double of one test.
#[derive(Debug, Default)]
pub struct Calls {
    pub prepare_workspace: usize,
    pub new_runner: usize,
    pub new_runner_specs: usize,
    pub setup: usize,
    pub runs: Vec<String>,
    pub teardown: usize,
    pub teardown_cancelled: bool,
    pub remove: usize,
    pub vm_names: Vec<String>,
    pub vm_name_reserved: Vec<bool>,
    pub queue_at_plan: Option<String>,
}

pub type SharedCalls = Arc<Mutex<Calls>>;

pub struct MockWorkspace {
    pub dir: PathBuf,
    pub scripts: Vec<String>,
    pub calls: SharedCalls,
}

#[async_trait]
impl Workspace for MockWorkspace {
    fn path(&self) -> &Path {
        &self.dir
    }

    fn working_directory(&self) -> &Path {
        &self.dir
    }

    fn script_filenames(&self) -> &[String] {
        &self.scripts
    }

    async fn remove(&self, _keep: bool) -> Result<()> {
        self.calls.lock().remove += 1;
        Ok(())
    }
}

/// Behaviour knobs of [`MockRunner`].
#[derive(Debug, Clone, Default)]
pub struct RunnerScript {
    /// Fail when running the spec with this key.
    pub fail_on: Option<(String, String)>,
    pub fail_setup: Option<String>,
    pub fail_teardown: Option<String>,
    /// After running the spec keyed by the map key, write a skip marker naming the value.
    pub markers: HashMap<String, String>,
    /// Panic when running the spec with this key.
    pub panic_on: Option<String>,
}

pub struct MockRunner {
    pub dir: PathBuf,
    pub script: RunnerScript,
    pub calls: SharedCalls,
}

#[async_trait]
impl Runner for MockRunner {
    async fn setup(&self, _cancel: &CancellationToken) -> Result<()> {
        self.calls.lock().setup += 1;
        match &self.script.fail_setup {
            Some(message) => Err(anyhow::anyhow!(message.clone())),
            None => Ok(()),
        }
    }

    async fn run(&self, _cancel: &CancellationToken, spec: &RunnerSpec) -> Result<()> {
        let key = spec.key().to_string();
        self.calls.lock().runs.push(key.clone());

        if self.script.panic_on.as_deref() == Some(key.as_str()) {
            panic!("runner exploded on {key}");
        }
        if let Some((fail_key, message)) = &self.script.fail_on {
            if *fail_key == key {
                return Err(anyhow::anyhow!(message.clone()));
            }
        }
        if let Some(next) = self.script.markers.get(&key) {
            let dir = self.dir.join(MARKER_DIR);
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join(SKIP_FILE), format!(r#"{{"nextStep":"{next}"}}"#))?;
        }
        Ok(())
    }

    async fn teardown(&self, cancel: &CancellationToken) -> Result<()> {
        let mut calls = self.calls.lock();
        calls.teardown += 1;
        calls.teardown_cancelled = cancel.is_cancelled();
        match &self.script.fail_teardown {
            Some(message) => Err(anyhow::anyhow!(message.clone())),
            None => Ok(()),
        }
    }

    fn temp_dir(&self) -> &Path {
        &self.dir
    }
}

pub struct MockRuntime {
    pub dir: PathBuf,
    pub specs: Vec<RunnerSpec>,
    pub runner: RunnerScript,
    pub fail_prepare: Option<String>,
    pub fail_new_runner: Option<String>,
    pub vm_names: Option<Arc<VmNameSet>>,
    pub calls: SharedCalls,
}

impl MockRuntime {
    pub fn new(dir: &Path, specs: Vec<RunnerSpec>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            specs,
            runner: RunnerScript::default(),
            fail_prepare: None,
            fail_new_runner: None,
            vm_names: None,
            calls: SharedCalls::default(),
        }
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    fn name(&self) -> RuntimeName {
        RuntimeName::Shell
    }

    async fn prepare_workspace(
        &self,
        _cancel: &CancellationToken,
        _logger: &JobLogger,
        _job: &Job,
    ) -> Result<Box<dyn Workspace>> {
        self.calls.lock().prepare_workspace += 1;
        if let Some(message) = &self.fail_prepare {
            anyhow::bail!(message.clone());
        }
        Ok(Box::new(MockWorkspace {
            dir: self.dir.clone(),
            scripts: Vec::new(),
            calls: Arc::clone(&self.calls),
        }))
    }

    async fn new_runner(
        &self,
        _cancel: &CancellationToken,
        _logger: Arc<JobLogger>,
        options: RunnerOptions,
    ) -> Result<Box<dyn Runner>> {
        {
            let mut calls = self.calls.lock();
            calls.new_runner += 1;
            let reserved = self
                .vm_names
                .as_ref()
                .is_some_and(|set| set.contains(&options.name));
            calls.vm_name_reserved.push(reserved);
            calls.vm_names.push(options.name.clone());
        }
        if let Some(message) = &self.fail_new_runner {
            anyhow::bail!(message.clone());
        }
        Ok(Box::new(MockRunner {
            dir: self.dir.clone(),
            script: self.runner.clone(),
            calls: Arc::clone(&self.calls),
        }))
    }

    fn new_runner_specs(&self, _workspace: &dyn Workspace, job: &Job) -> Result<Vec<RunnerSpec>> {
        let mut calls = self.calls.lock();
        calls.new_runner_specs += 1;
        calls.queue_at_plan = Some(job.queue.clone());
        Ok(self.specs.clone())
    }
}

pub struct MockLegacyBackend {
    pub dir: PathBuf,
    pub runner: RunnerScript,
    pub vm_names: Option<Arc<VmNameSet>>,
    pub calls: SharedCalls,
}

#[async_trait]
impl LegacyBackend for MockLegacyBackend {
    async fn prepare_workspace(
        &self,
        _cancel: &CancellationToken,
        _logger: &JobLogger,
        job: &Job,
    ) -> Result<Box<dyn Workspace>> {
        self.calls.lock().prepare_workspace += 1;
        Ok(Box::new(MockWorkspace {
            dir: self.dir.clone(),
            scripts: (0..job.docker_steps.len()).map(|i| format!("{i}.sh")).collect(),
            calls: Arc::clone(&self.calls),
        }))
    }

    fn new_runner(&self, _logger: Arc<JobLogger>, options: RunnerOptions) -> Result<Box<dyn Runner>> {
        {
            let mut calls = self.calls.lock();
            calls.new_runner += 1;
            let reserved = self
                .vm_names
                .as_ref()
                .is_some_and(|set| set.contains(&options.name));
            calls.vm_name_reserved.push(reserved);
            calls.vm_names.push(options.name);
        }
        Ok(Box::new(MockRunner {
            dir: self.dir.clone(),
            script: self.runner.clone(),
            calls: Arc::clone(&self.calls),
        }))
    }
}

pub struct MockInventory {
    pub result: std::result::Result<BTreeMap<String, String>, String>,
    pub calls: Mutex<usize>,
    pub removed: Mutex<Vec<String>>,
}

impl MockInventory {
    pub fn with(names: &[(&str, &str)]) -> Self {
        Self {
            result: Ok(names
                .iter()
                .map(|(n, u)| (n.to_string(), u.to_string()))
                .collect()),
            calls: Mutex::new(0),
            removed: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            calls: Mutex::new(0),
            removed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EnvironmentInventory for MockInventory {
    async fn active_environments(
        &self,
        _cancel: &CancellationToken,
        _prefix: &str,
        _all: bool,
    ) -> Result<BTreeMap<String, String>> {
        *self.calls.lock() += 1;
        self.result.clone().map_err(|m| anyhow::anyhow!(m))
    }

    async fn remove_environment(&self, _cancel: &CancellationToken, name: &str) -> Result<()> {
        self.removed.lock().push(name.to_string());
        Ok(())
    }
}

/// Scripted [`CmdRunner`] recording every invocation.
pub struct FakeCmdRunner {
    pub output: std::result::Result<String, String>,
    pub calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeCmdRunner {
    pub fn ok(output: &str) -> Self {
        Self {
            output: Ok(output.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            output: Err(message.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl CmdRunner for FakeCmdRunner {
    async fn combined_output(
        &self,
        _cancel: &CancellationToken,
        name: &str,
        args: &[String],
    ) -> Result<Vec<u8>> {
        self.calls.lock().push((name.to_string(), args.to_vec()));
        match &self.output {
            Ok(out) => Ok(out.clone().into_bytes()),
            Err(message) => Err(anyhow::anyhow!(message.clone())),
        }
    }

    fn command(&self, name: &str, args: &[String]) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(name);
        cmd.args(args);
        cmd
    }

    fn look_path(&self, name: &str) -> Result<PathBuf> {
        Ok(PathBuf::from("/usr/bin").join(name))
    }

    fn stat(&self, path: &Path) -> std::io::Result<std::fs::Metadata> {
        std::fs::metadata(path)
    }
}

/// A single-command runner spec keyed `key`.
pub fn spec(key: &str) -> RunnerSpec {
    RunnerSpec::single(CommandSpec {
        key: key.to_string(),
        command: vec!["true".to_string()],
        ..Default::default()
    })
}
