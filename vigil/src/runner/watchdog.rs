use super::events::{EventEmitter, JobEvent, Lifecycle};
use super::job_router::RunnerError;
use crate::core::job_processor::JobError;
use crate::core::queue::{Queue, QueueError};
use crate::core::store::JobStore;
use crate::core::{Duration, Utc};
use rand::Rng;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct WatchDogOptions {
    /// Pause between sweeps once no abandoned job is left. Default: 60 seconds.
    pub interval: Duration,
    /// Extra time a job gets past its claim timeout. Default: 10 seconds.
    pub grace_period: Duration,
}

impl Default for WatchDogOptions {
    fn default() -> Self {
        Self {
            interval: Duration::seconds(60),
            grace_period: Duration::seconds(10),
        }
    }
}

impl WatchDogOptions {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

/// Recovers jobs whose worker went away mid-flight.
///
/// A job counts as abandoned once it's been `dequeued` past its claim timeout plus the grace
/// period. The watchdog takes such jobs over one at a time and fails them with
/// [`JobError::TimedOut`], which either requeues them or fails them for good depending on their
/// attempts. Abandoned jobs are drained back to back, the interval only applies once none are
/// left.
///
/// The first sweep happens after a random delay within one interval, so that many watchdogs
/// started together don't sweep in lockstep.
pub struct WatchDog<S>
where
    S: JobStore,
{
    queue: Queue<S>,
    options: WatchDogOptions,
    shutdown: CancellationToken,
    events: EventEmitter,
    lifecycle: Lifecycle,
}

impl<S> WatchDog<S>
where
    S: JobStore + 'static,
{
    pub fn new(queue: Queue<S>, options: WatchDogOptions) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            queue,
            options,
            events: EventEmitter::new(shutdown.clone()),
            shutdown,
            lifecycle: Lifecycle::Created,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Spawn the sweeping loop onto the current tokio runtime.
    pub fn start(&mut self) -> Result<(), RunnerError> {
        if self.lifecycle != Lifecycle::Created {
            return Err(RunnerError::AlreadyStarted);
        }
        let interval = self
            .options
            .interval
            .to_std()
            .ok()
            .filter(|i| !i.is_zero())
            .ok_or(QueueError::InvalidInterval(self.options.interval))?;
        let grace_period = self.options.grace_period;
        if grace_period < Duration::zero() || Utc::now().checked_sub_signed(grace_period).is_none() {
            return Err(QueueError::InvalidDuration(grace_period).into());
        }
        let initial_delay = rand::thread_rng().gen_range(std::time::Duration::ZERO..interval);

        let sweeper = Sweeper {
            queue: self.queue.clone(),
            interval,
            grace_period: self.options.grace_period,
            shutdown: self.shutdown.clone(),
            events: self.events.clone(),
        };
        tracing::info!(
            queue = self.queue.name(),
            initial_delay_ms = initial_delay.as_millis() as u64,
            "Starting watchdog"
        );
        tokio::spawn(sweeper.run(initial_delay));
        self.lifecycle = Lifecycle::Running;
        Ok(())
    }

    /// Stop sweeping. Returns right away, a sweep in progress finishes on its own.
    pub fn stop(&mut self) {
        self.shutdown.cancel();
        self.lifecycle = Lifecycle::Stopped;
    }
}

impl<S: JobStore> Drop for WatchDog<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Sweeper<S> {
    queue: Queue<S>,
    interval: std::time::Duration,
    grace_period: Duration,
    shutdown: CancellationToken,
    events: EventEmitter,
}

impl<S> Sweeper<S>
where
    S: JobStore + 'static,
{
    async fn run(self, initial_delay: std::time::Duration) {
        if !self.sleep(initial_delay).await {
            return;
        }
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.recover_one().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => self.events.emit(RunnerError::from(e)),
            }
            if !self.sleep(self.interval).await {
                break;
            }
        }
        tracing::debug!(queue = self.queue.name(), "Watchdog finished");
    }

    /// Returns whether an abandoned job was found.
    async fn recover_one(&self) -> Result<bool, QueueError> {
        let Some(handle) = self.queue.reclaim(self.grace_period).await? else {
            return Ok(false);
        };
        tracing::warn!(
            jid = %handle.id().to_string(),
            job_type = handle.job_type(),
            "Recovering abandoned job"
        );
        let document = handle.fail(JobError::TimedOut).await?;
        self.events.emit(JobEvent::TimedOut(document));
        Ok(true)
    }

    async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.shutdown.cancelled() => false,
        }
    }
}
