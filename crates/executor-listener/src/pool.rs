// Worker pool: `NumHandlers` tasks, each looping admission → dequeue → handle.

use anyhow::Result;
use async_trait::async_trait;
use executor_common::Options;
use executor_worker::{Handler, Job, PreDequeue};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error_throttler::ErrorThrottler;
use crate::queue::Queue;

/// What the pool needs from the job handler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn pre_dequeue(&self, cancel: &CancellationToken) -> Result<PreDequeue>;
    async fn handle(&self, cancel: &CancellationToken, job: &Job) -> Result<()>;
}

#[async_trait]
impl JobHandler for Handler {
    async fn pre_dequeue(&self, cancel: &CancellationToken) -> Result<PreDequeue> {
        Handler::pre_dequeue(self, cancel).await
    }

    async fn handle(&self, cancel: &CancellationToken, job: &Job) -> Result<()> {
        Handler::handle(self, cancel, job).await
    }
}

/// Cancellation tokens of the jobs currently being handled, keyed by job id.
#[derive(Clone, Default)]
pub struct RunningJobs(Arc<Mutex<HashMap<i64, CancellationToken>>>);

impl RunningJobs {
    /// Register a job and return its token, a child of `parent`.
    pub fn insert(&self, id: i64, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.0.lock().insert(id, token.clone());
        token
    }

    pub fn remove(&self, id: i64) {
        self.0.lock().remove(&id);
    }

    pub fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<_> = self.0.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Cancel a running job. Returns `false` if it is not running here.
    pub fn cancel(&self, id: i64) -> bool {
        match self.0.lock().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub queues: Vec<String>,
    pub num_handlers: usize,
    pub poll_interval: Duration,
    pub maximum_runtime_per_job: Duration,
    /// Stop each worker after one job, or as soon as the queue is empty.
    pub once: bool,
}

impl PoolOptions {
    pub fn from_options(options: &Options, once: bool) -> Self {
        Self {
            queues: options.queues(),
            num_handlers: options.num_handlers.max(1),
            poll_interval: options.poll_interval(),
            maximum_runtime_per_job: options.maximum_runtime_per_job(),
            once,
        }
    }
}

pub struct WorkerPool {
    handler: Arc<dyn JobHandler>,
    queue: Arc<dyn Queue>,
    options: PoolOptions,
    running: RunningJobs,
}

impl WorkerPool {
    pub fn new(handler: Arc<dyn JobHandler>, queue: Arc<dyn Queue>, options: PoolOptions) -> Self {
        Self {
            handler,
            queue,
            options,
            running: RunningJobs::default(),
        }
    }

    pub fn running(&self) -> &RunningJobs {
        &self.running
    }

    /// Run until `shutdown` fires (or, in once mode, until every worker is done).
    /// Jobs in flight at shutdown are cancelled and torn down before this returns.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut workers = JoinSet::new();
        for worker in 0..self.options.num_handlers {
            let pool = Arc::clone(&self);
            let shutdown = shutdown.clone();
            workers.spawn(async move { pool.worker_loop(worker, shutdown).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!("worker task failed: {e}");
            }
        }
    }

    async fn worker_loop(&self, worker: usize, shutdown: CancellationToken) {
        let mut throttler = ErrorThrottler::new();
        tracing::debug!(worker, "worker started");

        while !shutdown.is_cancelled() {
            let admission = match self.handler.pre_dequeue(&shutdown).await {
                Ok(admission) => admission,
                Err(e) => {
                    tracing::warn!(worker, "failed to check capacity: {e:#}");
                    if !throttler.increment_and_wait(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            if !admission.dequeueable {
                if !self.idle(&shutdown).await {
                    break;
                }
                continue;
            }

            let job = match self
                .queue
                .dequeue(&self.options.queues, admission.extra_arguments.as_ref())
                .await
            {
                Ok(Some(job)) => job,
                Ok(None) => {
                    if self.options.once || !self.idle(&shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!(worker, "failed to dequeue: {e:#}");
                    if !throttler.increment_and_wait(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            throttler.reset();
            self.process(&shutdown, job).await;

            if self.options.once {
                break;
            }
        }

        tracing::debug!(worker, "worker stopped");
    }

    /// Wait one poll interval. Returns `false` on shutdown.
    async fn idle(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.options.poll_interval) => true,
            _ = shutdown.cancelled() => false,
        }
    }

    /// Handle one job under a deadline and report the outcome to the queue.
    pub async fn process(&self, shutdown: &CancellationToken, job: Job) {
        let token = self.running.insert(job.id, shutdown);

        // Cancelling rather than dropping the future lets teardown run.
        let deadline = {
            let token = token.clone();
            let limit = self.options.maximum_runtime_per_job;
            let job_id = job.id;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        tracing::warn!(job_id, "job exceeded maximum runtime of {}s", limit.as_secs());
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        };

        let outcome = AssertUnwindSafe(self.handler.handle(&token, &job))
            .catch_unwind()
            .await;

        deadline.abort();
        self.running.remove(job.id);

        let reported = match outcome {
            Ok(Ok(())) => {
                tracing::info!(job_id = job.id, "job completed");
                self.queue.mark_complete(&job).await
            }
            Ok(Err(e)) => {
                let message = format!("{e:#}");
                tracing::warn!(job_id = job.id, "job failed: {message}");
                self.queue.mark_errored(&job, &message).await
            }
            Err(_) => {
                tracing::error!(job_id = job.id, "job handler panicked");
                self.queue.mark_errored(&job, "job handler panicked").await
            }
        };
        if let Err(e) = reported {
            tracing::error!(job_id = job.id, "failed to report job outcome: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeQueue {
        pending: Mutex<Vec<Job>>,
        dequeues: AtomicUsize,
        completed: Mutex<Vec<i64>>,
        errored: Mutex<Vec<(i64, String)>>,
    }

    impl FakeQueue {
        fn with_jobs(ids: &[i64]) -> Self {
            let queue = Self::default();
            *queue.pending.lock() = ids
                .iter()
                .rev()
                .map(|&id| Job {
                    id,
                    ..Default::default()
                })
                .collect();
            queue
        }
    }

    #[async_trait]
    impl Queue for FakeQueue {
        async fn dequeue(&self, _: &[String], _: Option<&serde_json::Value>) -> Result<Option<Job>> {
            self.dequeues.fetch_add(1, Ordering::SeqCst);
            Ok(self.pending.lock().pop())
        }
        async fn mark_complete(&self, job: &Job) -> Result<()> {
            self.completed.lock().push(job.id);
            Ok(())
        }
        async fn mark_errored(&self, job: &Job, message: &str) -> Result<()> {
            self.errored.lock().push((job.id, message.to_string()));
            Ok(())
        }
        async fn heartbeat(&self, _: &[i64], _: &str) -> Result<Vec<i64>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FakeHandler {
        closed: bool,
        /// Job ids that fail, that panic, and that block until cancelled.
        fail: Vec<i64>,
        panic: Vec<i64>,
        block: Vec<i64>,
        handled: Mutex<Vec<i64>>,
        admissions: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for FakeHandler {
        async fn pre_dequeue(&self, _: &CancellationToken) -> Result<PreDequeue> {
            self.admissions.fetch_add(1, Ordering::SeqCst);
            Ok(PreDequeue {
                dequeueable: !self.closed,
                extra_arguments: None,
            })
        }

        async fn handle(&self, cancel: &CancellationToken, job: &Job) -> Result<()> {
            self.handled.lock().push(job.id);
            if self.panic.contains(&job.id) {
                panic!("boom");
            }
            if self.block.contains(&job.id) {
                cancel.cancelled().await;
                anyhow::bail!("job {} was cancelled", job.id);
            }
            if self.fail.contains(&job.id) {
                anyhow::bail!("running command \"step.shell.0\": exit status 1");
            }
            Ok(())
        }
    }

    fn options(once: bool) -> PoolOptions {
        PoolOptions {
            queues: vec!["batches".to_string()],
            num_handlers: 1,
            poll_interval: Duration::from_millis(10),
            maximum_runtime_per_job: Duration::from_secs(60),
            once,
        }
    }

    #[tokio::test]
    async fn once_mode_handles_a_single_job() {
        let queue = Arc::new(FakeQueue::with_jobs(&[1, 2]));
        let handler = Arc::new(FakeHandler::default());
        let pool = Arc::new(WorkerPool::new(handler.clone(), queue.clone(), options(true)));

        pool.run(CancellationToken::new()).await;

        assert_eq!(*handler.handled.lock(), vec![1]);
        assert_eq!(*queue.completed.lock(), vec![1]);
        assert_eq!(queue.pending.lock().len(), 1);
    }

    #[tokio::test]
    async fn once_mode_stops_on_empty_queue() {
        let queue = Arc::new(FakeQueue::default());
        let handler = Arc::new(FakeHandler::default());
        let pool = Arc::new(WorkerPool::new(handler.clone(), queue.clone(), options(true)));

        pool.run(CancellationToken::new()).await;
        assert_eq!(queue.dequeues.load(Ordering::SeqCst), 1);
        assert!(handler.handled.lock().is_empty());
    }

    #[tokio::test]
    async fn failures_and_panics_are_reported() {
        let queue = Arc::new(FakeQueue::with_jobs(&[1, 2, 3]));
        let handler = Arc::new(FakeHandler {
            fail: vec![2],
            panic: vec![3],
            ..Default::default()
        });
        let pool = WorkerPool::new(handler, queue.clone(), options(false));
        let shutdown = CancellationToken::new();

        for _ in 0..3 {
            let job = queue.dequeue(&[], None).await.unwrap().unwrap();
            pool.process(&shutdown, job).await;
        }

        assert_eq!(*queue.completed.lock(), vec![1]);
        let errored = queue.errored.lock();
        assert_eq!(errored[0], (2, "running command \"step.shell.0\": exit status 1".to_string()));
        assert_eq!(errored[1], (3, "job handler panicked".to_string()));
        assert!(pool.running().ids().is_empty());
    }

    #[tokio::test]
    async fn closed_admission_never_dequeues() {
        let queue = Arc::new(FakeQueue::with_jobs(&[1]));
        let handler = Arc::new(FakeHandler {
            closed: true,
            ..Default::default()
        });
        let pool = Arc::new(WorkerPool::new(handler.clone(), queue.clone(), options(false)));
        let shutdown = CancellationToken::new();

        let run = tokio::spawn(Arc::clone(&pool).run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        run.await.unwrap();

        assert!(handler.admissions.load(Ordering::SeqCst) >= 1);
        assert_eq!(queue.dequeues.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_are_cancelled_at_the_deadline() {
        let queue = Arc::new(FakeQueue::default());
        let handler = Arc::new(FakeHandler {
            block: vec![7],
            ..Default::default()
        });
        let mut opts = options(false);
        opts.maximum_runtime_per_job = Duration::from_secs(5);
        let pool = WorkerPool::new(handler, queue.clone(), opts);

        pool.process(&CancellationToken::new(), Job { id: 7, ..Default::default() }).await;

        assert_eq!(queue.errored.lock()[0], (7, "job 7 was cancelled".to_string()));
    }

    #[tokio::test]
    async fn running_jobs_can_be_cancelled_by_id() {
        let running = RunningJobs::default();
        let parent = CancellationToken::new();
        let token = running.insert(3, &parent);

        assert_eq!(running.ids(), vec![3]);
        assert!(!running.cancel(4));
        assert!(running.cancel(3));
        assert!(token.is_cancelled());
        assert!(!parent.is_cancelled());

        running.remove(3);
        assert!(running.ids().is_empty());
    }
}
