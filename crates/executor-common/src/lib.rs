// executor-common: Shared infrastructure for the job executor.
// This crate has no dependency on other executor crates; it holds
// configuration, redaction, error accumulation and execution-log persistence.

pub mod config_store;
pub mod constants;
pub mod errors;
pub mod logging;
pub mod redaction;
pub mod tracing;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use config_store::{ConfigError, ConfigurationStore, FirecrackerOptions, Options, RuntimeName};
pub use errors::ErrorList;
pub use logging::{ExecutionLogEntry, ExecutionLogEntryStore, FileLogStore, MemoryLogStore};
pub use redaction::Redactor;
pub use crate::tracing::LogFormat;
