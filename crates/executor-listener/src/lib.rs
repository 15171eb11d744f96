// executor-listener: Process entry point of the job executor.
// Depends on `executor-sdk`, `executor-common` and `executor-worker`.
//
// Architecture:
//   main → service::run → WorkerPool (NumHandlers workers)
//                       → Heartbeater (in-flight ids + node metrics)
//                       → Janitor (orphaned Firecracker VMs)
//   worker: Handler::pre_dequeue → Queue::dequeue → Handler::handle → mark_complete / mark_errored

pub mod error_throttler;
pub mod heartbeat;
pub mod janitor;
pub mod pool;
pub mod queue;
pub mod service;

pub use error_throttler::ErrorThrottler;
pub use pool::{JobHandler, PoolOptions, RunningJobs, WorkerPool};
pub use queue::{Queue, SpoolQueue};
