// Constants shared across the executor crates.

/// Environment variables that override settings-file values.
pub mod env {
    pub const VM_PREFIX: &str = "EXECUTOR_VM_PREFIX";
    pub const QUEUE_NAME: &str = "EXECUTOR_QUEUE_NAME";
    pub const QUEUE_NAMES: &str = "EXECUTOR_QUEUE_NAMES";
    pub const MAXIMUM_NUM_JOBS: &str = "EXECUTOR_MAXIMUM_NUM_JOBS";
    pub const USE_FIRECRACKER: &str = "EXECUTOR_USE_FIRECRACKER";
    pub const KEEP_WORKSPACES: &str = "EXECUTOR_KEEP_WORKSPACES";
    pub const RUNTIME: &str = "EXECUTOR_RUNTIME";
    pub const LOG_FORMAT: &str = "EXECUTOR_LOG_FORMAT";
}

/// Command keys used in execution logs and for skip matching.
pub mod keys {
    /// Prefix of every step key: `step.<runtime>.<name>`.
    pub const STEP_PREFIX: &str = "step";
    /// Runtime segment of legacy docker step keys.
    pub const LEGACY_DOCKER: &str = "docker";
    /// Runtime segment of legacy src-cli step keys.
    pub const LEGACY_SRC: &str = "src";
    /// Declared step keys starting with this are pre-steps.
    pub const PRE_STEP_PREFIX: &str = "pre-";
}

/// Layout of files the executor places inside a workspace.
pub mod workspace {
    /// Directory (relative to the workspace root) holding generated step scripts.
    pub const SCRIPTS_DIR: &str = ".executor-scripts";
    /// Directory (relative to the working directory) pre-steps write markers into.
    pub const MARKER_DIR: &str = ".executor";
    /// File name of the skip marker inside [`MARKER_DIR`].
    pub const SKIP_FILE: &str = "skip.json";
    /// Mount point of the workspace inside containers and VMs.
    pub const CONTAINER_MOUNT: &str = "/data";
}

/// Process exit codes of the `executor` binary.
pub mod return_code {
    pub const SUCCESS: i32 = 0;
    pub const TERMINATED_ERROR: i32 = 1;
    pub const CONFIGURATION_ERROR: i32 = 2;
}
