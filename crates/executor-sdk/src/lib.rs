// executor-sdk: Foundation layer for the job executor.
// This crate has ZERO dependencies on other executor crates and provides
// the process execution primitives used throughout the executor.

pub mod cmd_runner;
pub mod process_invoker;
pub mod trace;

pub use cmd_runner::{CmdRunner, RealCmdRunner};
pub use process_invoker::{
    OutputLine, OutputStream, ProcessExitCodeError, ProcessInvoker,
};
pub use trace::{NullTraceWriter, TraceWriter, TracingTraceWriter};
