use super::wrapped_job::{BoxedJobHandler, WrappedJobHandler};
use crate::core::job::JobDocument;
use crate::core::job_handle::JobHandle;
use crate::core::job_processor::{JobError, JobProcessor};
use crate::core::queue::QueueError;
use crate::core::store::JobStore;
use crate::core::Xid;
use bincode::{Decode, Encode};
use bytes::Bytes;
use std::collections::HashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// A job processor router. Matches job type to job processor implementation.
/// This type requires that your jobs implement `Encode` + `Decode` from bincode trait. Those traits are re-exported in prelude.
///
/// ## Example
/// ```rust
/// use vigil::prelude::{JobProcessor, RunnerRouter, Encode, Decode, Xid, CancellationToken};
/// use async_trait::async_trait;
/// struct MyJob;
/// #[derive(Encode, Decode)]
/// struct MyJobPayload(u8, String);
///
/// #[async_trait::async_trait]
/// impl JobProcessor for MyJob {
///     type Payload = MyJobPayload;
///     type Output = ();
///     type Error = anyhow::Error;
///
///     fn name() -> &'static str {
///         "my_job"
///     }
///
///     async fn handle(&self, jid: Xid, payload: Self::Payload, _: CancellationToken) -> Result<(), Self::Error> {
///         // ..do work
///         Ok(())
///     }
/// }
///
/// let router = {
///     let mut r = RunnerRouter::default();
///     r.add_job_handler(MyJob);
///     r
/// };
///
///```
#[derive(Default)]
pub struct RunnerRouter {
    jobs: HashMap<&'static str, BoxedJobHandler>,
}

/// Recorded result of processing a single job.
#[derive(Debug, Clone)]
pub enum Processed {
    Completed(JobDocument),
    /// Either put back into the queue for another attempt or failed for good, see `status`.
    Failed(JobDocument),
}

impl RunnerRouter {
    /// Register a job handler with the router. If job by that name already present, the first
    /// registration wins.
    pub fn add_job_handler<J>(&mut self, job: J)
    where
        J: JobProcessor + 'static,
        J::Payload: Decode + Encode,
        J::Output: Encode,
        J::Error: Into<JobError>,
    {
        let name = J::name();
        let boxed = WrappedJobHandler::new(job).boxed();
        self.jobs.entry(name).or_insert(boxed);
    }

    /// Registered job types, sorted by name.
    pub fn types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.jobs.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Process job handle. This function is responsible for job lifecycle: run the handler, then
    /// record success or failure through the handle. If you're implementing your own worker,
    /// then this is what you should use to process a job that is already claimed from the
    /// queue. In all other cases, you shouldn't use this function directly.
    ///
    /// Handler errors never surface here, they are recorded on the job. Only failures to record
    /// the outcome are returned.
    #[instrument(skip_all, err, fields(job_type = %job_handle.job_type(), jid = %job_handle.id().to_string(), status = %job_handle.status()))]
    pub async fn process<S: JobStore>(
        &self,
        job_handle: JobHandle<S>,
        cancellation_token: CancellationToken,
    ) -> Result<Processed, RunnerError> {
        let result = match self.jobs.get(job_handle.job_type()) {
            Some(r) => {
                handle_until_shutdown(
                    r,
                    job_handle.id(),
                    job_handle.payload(),
                    cancellation_token,
                )
                .await
            }
            None => Err(JobError::UnknownJobType(job_handle.job_type().to_string())),
        };

        match result {
            Ok(output) => Ok(Processed::Completed(job_handle.complete(output).await?)),
            Err(e) => {
                tracing::error!("Error during job processing: {}", e);
                let document = job_handle.fail(e).await?;
                if document.status.is_terminal() {
                    tracing::warn!("Job {} failed permanently", document.id.to_string());
                }
                Ok(Processed::Failed(document))
            }
        }
    }
}

/// Run the handler. Once `cancellation_token` fires the handler gets its shutdown timeout to
/// finish before it is abandoned.
async fn handle_until_shutdown(
    handler: &BoxedJobHandler,
    jid: Xid,
    payload: Bytes,
    cancellation_token: CancellationToken,
) -> Result<Bytes, JobError> {
    let shutdown_timeout = handler.shutdown_timeout();
    let deadline = async {
        cancellation_token.cancelled().await;
        tokio::time::sleep(shutdown_timeout).await;
    };
    tokio::select! {
        result = handler.handle(jid, payload, cancellation_token.clone()) => result,
        _ = deadline => Err(JobError::ShutdownTimeout(shutdown_timeout)),
    }
}

/// Errors returned by the runner.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Runner has already been started")]
    AlreadyStarted,
    #[error("Runner has no job handlers registered")]
    NoHandlers,
    #[error(transparent)]
    QueueError(#[from] QueueError),
}
