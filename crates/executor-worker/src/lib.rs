// executor-worker: Job orchestration for the executor.
// Depends on `executor-sdk` and `executor-common`.
//
// Architecture:
//   Handler::pre_dequeue → admission gate over live environments
//   Handler::handle → runtime path (Runtime → Workspace → Runner → plan)
//                   → legacy path (LegacyBackend, docker then src-cli steps)

pub mod admission;
pub mod cmdlogger;
pub mod command;
pub mod files;
pub mod handler;
pub mod ignite;
pub mod job;
pub mod runner;
pub mod runtime;
pub mod skip;
pub mod telemetry;
pub mod vm_names;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use admission::PreDequeue;
pub use cmdlogger::{JobLogger, LogEntry};
pub use command::{Command, CommandSpec, ProcessCommand, RunnerSpec};
pub use handler::{Handler, HostLegacyBackend, LegacyBackend};
pub use ignite::{EnvironmentInventory, IgniteInventory};
pub use job::Job;
pub use runtime::{new_runtime, Runtime, StandardRuntime};
pub use vm_names::VmNameSet;
