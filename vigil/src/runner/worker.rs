use super::events::{EventEmitter, JobEvent, Lifecycle};
use super::job_router::{RunnerError, RunnerRouter};
use crate::core::job_processor::{JobError, JobProcessor};
use crate::core::queue::{Queue, QueueError};
use crate::core::store::JobStore;
use crate::core::{Duration, Utc};
use bincode::{Decode, Encode};
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub const JITTER_INTERVAL_MS: [i64; 10] = [0, 1, 1, 2, 3, 5, 8, 13, 21, 34];

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// How long to wait before polling again after finding the queue empty. Default: 5 seconds.
    pub interval: Duration,
    /// How long a claimed job may run before the watchdog considers it abandoned.
    /// Default: 10 minutes.
    pub claim_timeout: Duration,
    /// Polling loops per queue, i.e. how many jobs of one queue may run at once. Default: 1.
    pub concurrency: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::seconds(5),
            claim_timeout: Duration::minutes(10),
            concurrency: 1,
        }
    }
}

impl WorkerOptions {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// A bridge between job processors and queues.
///
/// ## Implementation
///
/// For every owned queue the worker spawns `concurrency` polling loops. Each loop:
///
/// - Claims the oldest eligible job of any registered type
/// - Runs its processor and records the outcome on the job
/// - Claims again right away, or sleeps for the interval plus random jitter if the queue was empty
///
/// Events are broadcast to [`subscribe`](Worker::subscribe)rs. Nothing is emitted once
/// [`stop`](Worker::stop) has been called.
///
/// Dropping a running worker aborts its polling loops, jobs that were in flight are left for the
/// watchdog. Use `stop` to shut down cleanly.
///
/// ## Examples
/// See `vigil-sqlite-bench` for examples.
pub struct Worker<S>
where
    S: JobStore,
{
    queues: Vec<Queue<S>>,
    router: RunnerRouter,
    options: WorkerOptions,
    shutdown: CancellationToken,
    events: EventEmitter,
    tasks: JoinSet<()>,
    lifecycle: Lifecycle,
}

impl<S> Worker<S>
where
    S: JobStore + 'static,
{
    /// Create a new worker polling `queues`.
    pub fn new(queues: Vec<Queue<S>>, options: WorkerOptions) -> Self {
        Self::with_router(queues, RunnerRouter::default(), options)
    }

    /// Create a new worker from queues and an already populated router.
    pub fn with_router(queues: Vec<Queue<S>>, router: RunnerRouter, options: WorkerOptions) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            queues,
            router,
            options,
            events: EventEmitter::new(shutdown.clone()),
            shutdown,
            tasks: JoinSet::new(),
            lifecycle: Lifecycle::Created,
        }
    }

    /// Register a job processor. Only possible before the worker is started.
    pub fn register<J>(&mut self, job: J) -> Result<&mut Self, RunnerError>
    where
        J: JobProcessor + 'static,
        J::Payload: Decode + Encode,
        J::Output: Encode,
        J::Error: Into<JobError>,
    {
        if self.lifecycle != Lifecycle::Created {
            return Err(RunnerError::AlreadyStarted);
        }
        self.router.add_job_handler(job);
        Ok(self)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Spawn polling loops onto the current tokio runtime.
    pub fn start(&mut self) -> Result<(), RunnerError> {
        if self.lifecycle != Lifecycle::Created {
            return Err(RunnerError::AlreadyStarted);
        }
        if self.router.is_empty() {
            return Err(RunnerError::NoHandlers);
        }
        let interval = self
            .options
            .interval
            .to_std()
            .ok()
            .filter(|i| !i.is_zero())
            .ok_or(QueueError::InvalidInterval(self.options.interval))?;
        let claim_timeout = self.options.claim_timeout;
        if claim_timeout <= Duration::zero() || Utc::now().checked_add_signed(claim_timeout).is_none() {
            return Err(QueueError::InvalidDuration(claim_timeout).into());
        }

        let router = Arc::new(std::mem::take(&mut self.router));
        let job_types = Arc::new(router.types());
        tracing::info!(
            queues = self.queues.len(),
            concurrency = self.options.concurrency,
            job_types = ?job_types,
            "Starting worker"
        );

        for queue in &self.queues {
            for _ in 0..self.options.concurrency.max(1) {
                let poller = Poller {
                    queue: queue.clone(),
                    router: router.clone(),
                    job_types: job_types.clone(),
                    interval,
                    claim_timeout: self.options.claim_timeout,
                    shutdown: self.shutdown.clone(),
                    events: self.events.clone(),
                };
                self.tasks.spawn(poller.run());
            }
        }
        self.lifecycle = Lifecycle::Running;
        Ok(())
    }

    /// Stop claiming new jobs and wait until every job in flight has its outcome recorded.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Polling loop crashed: {}", e);
            }
        }
        self.lifecycle = Lifecycle::Stopped;
        tracing::info!("Worker stopped");
    }
}

struct Poller<S> {
    queue: Queue<S>,
    router: Arc<RunnerRouter>,
    job_types: Arc<Vec<&'static str>>,
    interval: std::time::Duration,
    claim_timeout: Duration,
    shutdown: CancellationToken,
    events: EventEmitter,
}

impl<S> Poller<S>
where
    S: JobStore + 'static,
{
    async fn run(self) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let claimed = self.queue.claim(&self.job_types, self.claim_timeout).await;
            let backoff = match claimed {
                Ok(Some(handle)) => {
                    // Whatever got claimed is processed, even if a stop came in meanwhile.
                    match self.router.process(handle, self.shutdown.clone()).await {
                        Ok(processed) => {
                            self.events.emit(processed);
                            false
                        }
                        Err(e) => {
                            self.events.emit(e);
                            true
                        }
                    }
                }
                Ok(None) => true,
                Err(e) => {
                    self.events.emit(RunnerError::from(e));
                    true
                }
            };
            if backoff && !self.sleep(self.interval + get_random_jitter()).await {
                break;
            }
        }
        tracing::debug!(queue = self.queue.name(), "Polling loop finished");
    }

    /// Returns `false` when interrupted by shutdown.
    async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.shutdown.cancelled() => false,
        }
    }
}

fn get_random_jitter() -> std::time::Duration {
    JITTER_INTERVAL_MS
        .choose(&mut rand::thread_rng())
        .map(|ms| std::time::Duration::from_millis(*ms as u64))
        .unwrap_or_else(|| std::time::Duration::from_millis(5)) // Always takes a happy path technically
}
