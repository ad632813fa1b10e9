#![doc = include_str!("../README.md")]

pub mod core;

/// Default implementation of workers and watchdogs.
#[cfg(feature = "runner")]
pub mod runner {
    pub mod events;
    pub mod job_router;
    pub mod watchdog;
    pub mod worker;
    pub mod wrapped_job;
}

/// Re-exports to simplify importing this crate types.
pub mod prelude {
    pub use super::core::{
        job::{Attempts, DelayStrategy, JobDocument, JobStatus},
        job_handle::JobHandle,
        job_processor::{JobError, JobProcessor},
        memory_store::InMemoryStore,
        queue::{EnqueueOptions, Queue, QueueError},
        store::{JobStore, StoreError},
        CancellationToken, Duration, Xid,
    };
    #[cfg(feature = "runner")]
    pub use super::runner::{
        events::{JobEvent, Lifecycle},
        job_router::{RunnerError, RunnerRouter},
        watchdog::{WatchDog, WatchDogOptions},
        worker::{Worker, WorkerOptions},
    };
    pub use bincode::{Decode, Encode};
}
