use bincode::Encode;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

use crate::core::job::{Attempts, JobDocument, JobStatus};
use crate::core::job_handle::JobHandle;
use crate::core::job_processor::JobProcessor;
use crate::core::store::{JobFilter, JobStore, JobUpdate, Set, SortKey, StoreError};
use crate::core::{new_xid, Bytes, DateTime, Duration, Utc, Xid};

/// Per-job settings given at enqueue time.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Retry policy. Without it the job gets exactly one attempt.
    pub attempts: Option<Attempts>,
    /// Earliest instant the job may be claimed. Defaults to now.
    pub run_at: Option<DateTime>,
}

impl EnqueueOptions {
    pub fn attempts(mut self, attempts: Attempts) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn run_at(mut self, run_at: DateTime) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

/// A named queue of jobs living in a shared store. Responsible for pushing jobs into the store
/// and atomically pulling them out of it.
///
/// Cloning is cheap, clones share the store.
pub struct Queue<S> {
    name: String,
    store: Arc<S>,
    bincode_config: bincode::config::Configuration,
}

impl<S> Clone for Queue<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            store: self.store.clone(),
            bincode_config: self.bincode_config,
        }
    }
}

impl<S> Queue<S>
where
    S: JobStore,
{
    pub fn new(name: impl Into<String>, store: S) -> Self {
        Self::with_store(name, Arc::new(store))
    }

    /// Create a queue on top of a store that is already shared with other queues.
    pub fn with_store(name: impl Into<String>, store: Arc<S>) -> Self {
        Self {
            name: name.into(),
            store,
            bincode_config: bincode::config::standard(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Encode `payload` and add a job for processor `J`.
    pub async fn enqueue<J>(
        &self,
        payload: J::Payload,
        options: EnqueueOptions,
    ) -> Result<JobDocument, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Encode,
    {
        let payload = bincode::encode_to_vec(&payload, self.bincode_config)?;
        self.enqueue_raw(J::name(), payload.into(), options).await
    }

    /// Add a job that becomes claimable at `run_at`.
    pub async fn enqueue_at<J>(
        &self,
        payload: J::Payload,
        run_at: DateTime,
        options: EnqueueOptions,
    ) -> Result<JobDocument, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Encode,
    {
        self.enqueue::<J>(payload, options.run_at(run_at)).await
    }

    /// Add a job that becomes claimable after `delay`.
    pub async fn enqueue_in<J>(
        &self,
        payload: J::Payload,
        delay: Duration,
        options: EnqueueOptions,
    ) -> Result<JobDocument, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Encode,
    {
        let run_at = Utc::now()
            .checked_add_signed(delay)
            .ok_or(QueueError::InvalidDuration(delay))?;
        self.enqueue_at::<J>(payload, run_at, options).await
    }

    /// Add a job with an already encoded payload.
    #[instrument(skip_all, err, fields(queue = %self.name, job_type = %job_type, payload_size = payload.len()))]
    pub async fn enqueue_raw(
        &self,
        job_type: &str,
        payload: Bytes,
        options: EnqueueOptions,
    ) -> Result<JobDocument, QueueError> {
        let document = JobDocument::new(
            self.name.as_str(),
            job_type,
            payload,
            options.attempts,
            options.run_at,
        );
        Ok(self.store.insert(document).await?)
    }

    /// Claim the oldest eligible job of one of `job_types`. The job moves to `dequeued` and is
    /// considered abandoned once `claim_timeout` passes. Never waits, `Ok(None)` if there is
    /// nothing to do.
    pub async fn claim(
        &self,
        job_types: &[&str],
        claim_timeout: Duration,
    ) -> Result<Option<JobHandle<S>>, QueueError> {
        self.claim_with_instant(job_types, claim_timeout, Utc::now())
            .await
    }

    #[instrument(skip_all, err, fields(queue = %self.name))]
    pub async fn claim_with_instant(
        &self,
        job_types: &[&str],
        claim_timeout: Duration,
        now: DateTime,
    ) -> Result<Option<JobHandle<S>>, QueueError> {
        let timeout_at = now
            .checked_add_signed(claim_timeout)
            .ok_or(QueueError::InvalidDuration(claim_timeout))?;
        let filter = JobFilter {
            queue: Some(self.name.clone()),
            status: Some(JobStatus::Queued),
            job_types: Some(job_types.iter().map(|t| t.to_string()).collect()),
            eligible_by: Some(now),
            ..Default::default()
        };
        let update = JobUpdate::new()
            .set(Set::Status(JobStatus::Dequeued))
            .set(Set::TimeoutAt(Some(timeout_at)))
            .set(Set::ClaimToken(Some(new_xid())));
        let document = self
            .store
            .find_and_modify(&filter, SortKey::CreatedAt, &update)
            .await?;
        Ok(document.map(|doc| JobHandle::new(self.store.clone(), doc)))
    }

    /// Take over the job that has been `dequeued` for the longest past its timeout plus
    /// `grace_period`. The job moves to `timedout` so that no other watchdog picks it up, the
    /// caller is expected to fail it.
    ///
    /// A job counts as abandoned once `timeout_at + grace_period` has passed, i.e. the grace
    /// period extends the timeout. It never shortens it.
    ///
    /// Reclaiming stamps `timeout_at` with the reclaim instant. A `timedout` job whose
    /// reclaimer went away before failing it is reclaimed again once the grace period passes.
    pub async fn reclaim(&self, grace_period: Duration) -> Result<Option<JobHandle<S>>, QueueError> {
        self.reclaim_with_instant(grace_period, Utc::now()).await
    }

    #[instrument(skip_all, err, fields(queue = %self.name))]
    pub async fn reclaim_with_instant(
        &self,
        grace_period: Duration,
        now: DateTime,
    ) -> Result<Option<JobHandle<S>>, QueueError> {
        let abandoned_before = now
            .checked_sub_signed(grace_period)
            .ok_or(QueueError::InvalidDuration(grace_period))?;
        let update = JobUpdate::new()
            .set(Set::Status(JobStatus::TimedOut))
            .set(Set::TimeoutAt(Some(now)))
            .set(Set::ClaimToken(Some(new_xid())));
        // Stuck reclaims first, they have been waiting longer.
        for status in [JobStatus::TimedOut, JobStatus::Dequeued] {
            let filter = JobFilter {
                queue: Some(self.name.clone()),
                status: Some(status),
                timed_out_before: Some(abandoned_before),
                ..Default::default()
            };
            let document = self
                .store
                .find_and_modify(&filter, SortKey::TimeoutAt, &update)
                .await?;
            if let Some(doc) = document {
                return Ok(Some(JobHandle::new(self.store.clone(), doc)));
            }
        }
        Ok(None)
    }

    /// Read the current state of a job.
    pub async fn job(&self, id: Xid) -> Result<Option<JobDocument>, QueueError> {
        Ok(self.store.get(id).await?)
    }
}

/// Errors related to queue operation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum QueueError {
    /// Encountered an error when tried to serialize payload.
    #[error("Failed to serialize job payload")]
    EncodeError {
        #[from]
        source: bincode::error::EncodeError,
    },
    /// Encountered an error when tried to deserialize payload.
    #[error("Failed to deserialize job payload")]
    DecodeError {
        #[from]
        source: bincode::error::DecodeError,
    },
    #[error("Interval must be greater than zero: {0:?}")]
    InvalidInterval(Duration),
    #[error("Duration is out of range: {0:?}")]
    InvalidDuration(Duration),
    #[error("Job {jid} can't move from {from} to {to}")]
    InvalidTransition {
        jid: Xid,
        from: JobStatus,
        to: JobStatus,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::DelayStrategy;
    use crate::core::memory_store::InMemoryStore;
    use crate::core::CancellationToken;
    use async_trait::async_trait;
    use bincode::Decode;
    use std::convert::Infallible;

    #[derive(Encode, Decode, PartialEq, Clone, Debug, Default)]
    struct Payload {
        n: u32,
    }

    struct Email;

    #[async_trait]
    impl JobProcessor for Email {
        type Payload = Payload;
        type Output = ();
        type Error = Infallible;

        async fn handle(
            &self,
            _jid: Xid,
            _payload: Self::Payload,
            _cancellation_token: CancellationToken,
        ) -> Result<(), Self::Error> {
            Ok(())
        }

        fn name() -> &'static str {
            "email"
        }
    }

    fn queue() -> Queue<InMemoryStore> {
        Queue::new("default", InMemoryStore::new())
    }

    fn timeout() -> Duration {
        Duration::seconds(30)
    }

    #[tokio::test]
    async fn enqueue_defaults() {
        let queue = queue();
        let doc = queue
            .enqueue::<Email>(Payload::default(), EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(doc.status, JobStatus::Queued);
        assert_eq!(doc.queue, "default");
        assert_eq!(doc.job_type, "email");
        assert!(doc.attempts.is_none());
        assert!(doc.timeout_at.is_none());
        assert!(doc.eligible_at <= Utc::now());

        let stored = queue.job(doc.id).await.unwrap().unwrap();
        assert_eq!(stored, doc);
    }

    #[tokio::test]
    async fn enqueue_initializes_attempts() {
        let queue = queue();
        let mut attempts = Attempts::new(4)
            .with_delay_ms(25)
            .with_strategy(DelayStrategy::Exponential);
        attempts.attempts_left = 1;
        let doc = queue
            .enqueue::<Email>(Payload::default(), EnqueueOptions::default().attempts(attempts))
            .await
            .unwrap();
        let attempts = doc.attempts.unwrap();
        assert_eq!(attempts.count, 4);
        assert_eq!(attempts.attempts_left, 4);
        assert_eq!(attempts.delay_ms, 25);
        assert_eq!(attempts.delay_strategy, DelayStrategy::Exponential);
    }

    #[tokio::test]
    async fn claim_smoke_test() {
        let queue = queue();

        // If there are no jobs, this should return Ok(None);
        assert!(queue.claim(&["email"], timeout()).await.unwrap().is_none());

        let doc = queue
            .enqueue::<Email>(Payload { n: 7 }, EnqueueOptions::default())
            .await
            .unwrap();

        let handle = queue.claim(&["email"], timeout()).await.unwrap().unwrap();
        assert_eq!(handle.id(), doc.id);
        assert_eq!(handle.status(), JobStatus::Dequeued);
        assert!(handle.document().timeout_at.is_some());
        assert!(handle.document().claim_token.is_some());

        // Second time claim should not return anything
        assert!(queue.claim(&["email"], timeout()).await.unwrap().is_none());

        let done = handle.complete(Bytes::from_static(b"ok")).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result, Some(Bytes::from_static(b"ok")));
        assert!(done.timeout_at.is_none());
        assert!(queue.claim(&["email"], timeout()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_is_fifo_and_filters_types() {
        let queue = queue();
        let first = queue
            .enqueue_raw("email", Bytes::new(), EnqueueOptions::default())
            .await
            .unwrap();
        let other = queue
            .enqueue_raw("sms", Bytes::new(), EnqueueOptions::default())
            .await
            .unwrap();
        let second = queue
            .enqueue_raw("email", Bytes::new(), EnqueueOptions::default())
            .await
            .unwrap();

        let a = queue.claim(&["email"], timeout()).await.unwrap().unwrap();
        let b = queue.claim(&["email"], timeout()).await.unwrap().unwrap();
        assert_eq!(a.id(), first.id);
        assert_eq!(b.id(), second.id);
        assert!(queue.claim(&["email"], timeout()).await.unwrap().is_none());

        let c = queue.claim(&["email", "sms"], timeout()).await.unwrap().unwrap();
        assert_eq!(c.id(), other.id);
    }

    #[tokio::test]
    async fn queues_sharing_a_store_are_isolated() {
        let store = Arc::new(InMemoryStore::new());
        let emails = Queue::with_store("emails", store.clone());
        let reports = Queue::with_store("reports", store);
        emails
            .enqueue_raw("email", Bytes::new(), EnqueueOptions::default())
            .await
            .unwrap();
        assert!(reports.claim(&["email"], timeout()).await.unwrap().is_none());
        assert!(emails.claim(&["email"], timeout()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delayed_jobs_are_not_claimed_early() {
        let queue = queue();
        let doc = queue
            .enqueue_in::<Email>(Payload::default(), Duration::hours(1), EnqueueOptions::default())
            .await
            .unwrap();
        assert!(queue.claim(&["email"], timeout()).await.unwrap().is_none());

        let later = Utc::now() + Duration::hours(1) + Duration::minutes(1);
        let handle = queue
            .claim_with_instant(&["email"], timeout(), later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.id(), doc.id);
    }

    #[tokio::test]
    async fn concurrent_claims_have_a_single_winner() {
        let queue = queue();
        queue
            .enqueue_raw("email", Bytes::new(), EnqueueOptions::default())
            .await
            .unwrap();

        let claims = (0..32).map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim(&["email"], timeout()).await })
        });
        let results = futures::future::join_all(claims).await;
        let winners = results
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .filter(Option::is_some)
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn failing_without_attempts_is_terminal() {
        let queue = queue();
        queue
            .enqueue_raw("email", Bytes::new(), EnqueueOptions::default())
            .await
            .unwrap();
        let handle = queue.claim(&["email"], timeout()).await.unwrap().unwrap();
        let doc = handle.fail("boom").await.unwrap();
        assert_eq!(doc.status, JobStatus::Failed);
        assert_eq!(doc.error.as_deref(), Some("boom"));
        assert!(doc.attempts.is_none());
        assert!(queue.claim(&["email"], timeout()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failing_with_attempts_requeues_after_delay() {
        let queue = queue();
        let attempts = Attempts::new(2).with_delay_ms(60_000);
        queue
            .enqueue_raw("email", Bytes::new(), EnqueueOptions::default().attempts(attempts))
            .await
            .unwrap();
        let handle = queue.claim(&["email"], timeout()).await.unwrap().unwrap();
        let doc = handle.fail("try again").await.unwrap();
        assert_eq!(doc.status, JobStatus::Queued);
        assert_eq!(doc.attempts.unwrap().attempts_left, 1);
        assert!(doc.claim_token.is_none());
        assert!(doc.eligible_at > Utc::now() + Duration::seconds(50));

        // Not eligible until the delay passed
        assert!(queue.claim(&["email"], timeout()).await.unwrap().is_none());
        let later = Utc::now() + Duration::minutes(2);
        let handle = queue
            .claim_with_instant(&["email"], timeout(), later)
            .await
            .unwrap()
            .unwrap();
        let doc = handle.fail("again").await.unwrap();
        assert_eq!(doc.status, JobStatus::Failed);
        assert_eq!(doc.attempts.unwrap().attempts_left, 0);
    }

    #[tokio::test]
    async fn reclaim_respects_grace_period() {
        let queue = queue();
        let doc = queue
            .enqueue_raw("email", Bytes::new(), EnqueueOptions::default())
            .await
            .unwrap();
        let _abandoned = queue
            .claim(&["email"], Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();

        // Timeout not reached yet
        assert!(queue.reclaim(Duration::seconds(10)).await.unwrap().is_none());

        // Timeout passed, but still within grace period
        let soon = Utc::now() + Duration::seconds(5);
        assert!(queue
            .reclaim_with_instant(Duration::seconds(10), soon)
            .await
            .unwrap()
            .is_none());

        let later = Utc::now() + Duration::seconds(12);
        let handle = queue
            .reclaim_with_instant(Duration::seconds(10), later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.id(), doc.id);
        assert_eq!(handle.status(), JobStatus::TimedOut);

        // Already taken over
        assert!(queue
            .reclaim_with_instant(Duration::seconds(10), later)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn stale_holder_cannot_complete_reclaimed_job() {
        let queue = queue();
        queue
            .enqueue_raw("email", Bytes::new(), EnqueueOptions::default())
            .await
            .unwrap();
        let stale = queue
            .claim(&["email"], Duration::milliseconds(-1))
            .await
            .unwrap()
            .unwrap();
        let watchdog = queue.reclaim(Duration::zero()).await.unwrap().unwrap();

        let err = stale.complete(Bytes::new()).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: JobStatus::Dequeued,
                to: JobStatus::Completed,
                ..
            }
        ));

        let doc = watchdog.fail("Timed out").await.unwrap();
        assert_eq!(doc.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn reclaimed_job_cannot_complete() {
        let queue = queue();
        queue
            .enqueue_raw("email", Bytes::new(), EnqueueOptions::default())
            .await
            .unwrap();
        let _stale = queue
            .claim(&["email"], Duration::milliseconds(-1))
            .await
            .unwrap()
            .unwrap();
        let handle = queue.reclaim(Duration::zero()).await.unwrap().unwrap();
        let id = handle.id();
        let err = handle.complete(Bytes::new()).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));

        // Stored document was not touched
        let doc = queue.job(id).await.unwrap().unwrap();
        assert_eq!(doc.status, JobStatus::TimedOut);
    }

    #[tokio::test]
    async fn out_of_range_durations_are_errors() {
        let queue = queue();
        queue
            .enqueue_raw("email", Bytes::new(), EnqueueOptions::default())
            .await
            .unwrap();
        let err = queue
            .claim(&["email"], Duration::max_value())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidDuration(_)));
        let err = queue.reclaim(Duration::max_value()).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidDuration(_)));
        let err = queue
            .enqueue_in::<Email>(Payload::default(), Duration::max_value(), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidDuration(_)));

        // Nothing was claimed
        assert!(queue.claim(&["email"], timeout()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stuck_reclaim_is_reclaimed_after_grace_period() {
        let queue = queue();
        let doc = queue
            .enqueue_raw("email", Bytes::new(), EnqueueOptions::default())
            .await
            .unwrap();
        queue
            .claim(&["email"], Duration::milliseconds(-1))
            .await
            .unwrap()
            .unwrap();
        let now = Utc::now();
        // Reclaimer goes away without failing the job.
        let lost = queue
            .reclaim_with_instant(Duration::zero(), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lost.document().timeout_at, Some(now));

        let grace = Duration::seconds(10);
        assert!(queue
            .reclaim_with_instant(grace, now + Duration::seconds(5))
            .await
            .unwrap()
            .is_none());
        let handle = queue
            .reclaim_with_instant(grace, now + Duration::seconds(11))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.id(), doc.id);
        assert_eq!(handle.status(), JobStatus::TimedOut);
        assert_ne!(handle.document().claim_token, lost.document().claim_token);

        let err = lost.fail("Timed out").await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        let failed = handle.fail("Timed out").await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
    }
}
