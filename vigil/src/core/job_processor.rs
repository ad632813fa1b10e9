use crate::core::Xid;
use async_trait::async_trait;
use std::convert::Infallible;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A job-handler interface. Your Payload should implement `bincode::{Decode, Encode}` and your
/// Output `bincode::Encode` if you're planning to use it with the worker from this crate.
///
/// ## Example
/// ```rust
/// use vigil::prelude::{JobProcessor, Encode, Decode, Xid, CancellationToken};
/// use async_trait::async_trait;
/// struct SendEmail;
///
/// impl SendEmail {
///     async fn send(&self, to: &str) -> anyhow::Result<u64> {
///         // ..do some work
///         Ok(to.len() as u64)
///     }
/// }
///
/// #[derive(Encode, Decode)]
/// struct SendEmailPayload {
///     to: String,
/// }
///
/// #[async_trait::async_trait]
/// impl JobProcessor for SendEmail {
///     type Payload = SendEmailPayload;
///     type Output = u64;
///     type Error = anyhow::Error;
///
///     fn name() -> &'static str {
///         "send_email"
///     }
///
///     async fn handle(&self, jid: Xid, payload: Self::Payload, cancellation_token: CancellationToken) -> Result<u64, Self::Error> {
///         tokio::select! {
///             result = self.send(&payload.to) => { result }
///             _ = cancellation_token.cancelled() => { anyhow::bail!("worker is shutting down") }
///         }
///     }
/// }
/// ```
/// ## Services
/// If your job processor requires external services (i.e. database client, REST client, etc.), add
/// them directly as your struct fields.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// What is the input to this handler. If you want to use `RunnerRouter`, then this must implement `bincode::Decode` and `bincode::Encode`.
    type Payload: Send;
    /// What is stored as the job result on success. Must implement `bincode::Encode` to be used with `RunnerRouter`.
    type Output: Send;
    /// What error is returned
    type Error: Send;
    /// Run the job, passing payload to it. Returning an error sends the job down the retry path.
    /// The `cancellation_token` is cancelled once the worker is asked to stop. In-flight jobs
    /// are allowed to finish, but only within `shutdown_timeout`.
    async fn handle(
        &self,
        jid: Xid,
        payload: Self::Payload,
        cancellation_token: CancellationToken,
    ) -> Result<Self::Output, Self::Error>;

    /// How long to wait after a stop request before the job is failed with `ShutdownTimeout`.
    fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(30)
    }

    /// Job type, used to differentiate between different jobs in the queue.
    fn name() -> &'static str
    where
        Self: Sized;
}

/// Error types returned by job processor that wraps your job processor.
#[derive(Error, Debug)]
pub enum JobError {
    /// Encountered an error when tried to deserialize payload.
    #[error("Failed to deserialize job payload")]
    DecodeError {
        #[from]
        source: bincode::error::DecodeError,
    },

    /// Encountered an error when tried to serialize job output.
    #[error("Failed to serialize job output")]
    EncodeError {
        #[from]
        source: bincode::error::EncodeError,
    },

    #[error("Job failed to complete within the shutdown timeout of {0:#?}")]
    ShutdownTimeout(std::time::Duration),

    /// Owning worker did not report back before the claim timed out.
    #[error("Timed out")]
    TimedOut,

    #[error("No handler registered for job type: {0}")]
    UnknownJobType(String),

    /// Error originated in inner-job implementation
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<Infallible> for JobError {
    fn from(_: Infallible) -> Self {
        unreachable!();
    }
}
