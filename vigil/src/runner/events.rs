use super::job_router::{Processed, RunnerError};
use crate::core::job::JobDocument;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// How many events a slow subscriber may fall behind before it starts losing them.
pub const EVENT_CAPACITY: usize = 1024;

/// Notifications emitted by workers and watchdogs.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// Job completed successfully.
    Completed(JobDocument),
    /// Job failed. `status` tells whether it was put back into the queue or failed for good.
    Failed(JobDocument),
    /// Watchdog took over an abandoned job and failed it.
    TimedOut(JobDocument),
    /// Polling hit an error. Polling continues.
    Error(Arc<RunnerError>),
}

impl From<Processed> for JobEvent {
    fn from(processed: Processed) -> Self {
        match processed {
            Processed::Completed(doc) => JobEvent::Completed(doc),
            Processed::Failed(doc) => JobEvent::Failed(doc),
        }
    }
}

impl From<RunnerError> for JobEvent {
    fn from(error: RunnerError) -> Self {
        JobEvent::Error(Arc::new(error))
    }
}

/// Broadcasts events until the owner is stopped. Nothing is emitted after that.
#[derive(Clone)]
pub(crate) struct EventEmitter {
    tx: broadcast::Sender<JobEvent>,
    shutdown: CancellationToken,
}

impl EventEmitter {
    pub(crate) fn new(shutdown: CancellationToken) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx, shutdown }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: impl Into<JobEvent>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let event = event.into();
        if let JobEvent::Error(e) = &event {
            tracing::error!("Encountered error while polling: {}", e);
        }
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

/// Lifecycle shared by workers and watchdogs. Stopped instances can't be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    Stopped,
}
