use crate::core::job::{eligible_after, Attempts, FailureDecision, JobDocument, JobStatus};
use crate::core::queue::QueueError;
use crate::core::store::{JobFilter, JobStore, JobUpdate, Set, SortKey};
use crate::core::{Bytes, Utc, Xid};
use std::fmt::Display;
use std::sync::Arc;
use tracing::instrument;

/// Exclusive hold on a claimed (`dequeued`) or reclaimed (`timedout`) job. The only way to move
/// such a job forward. Both transitions consume the handle.
///
/// Every write is conditional on the status and claim token observed at claim time. If someone
/// else moved the job in the meantime the write matches nothing and `InvalidTransition` is
/// returned, leaving the stored document untouched.
#[derive(Debug)]
pub struct JobHandle<S> {
    store: Arc<S>,
    document: JobDocument,
}

impl<S> JobHandle<S>
where
    S: JobStore,
{
    pub(crate) fn new(store: Arc<S>, document: JobDocument) -> Self {
        Self { store, document }
    }

    pub fn id(&self) -> Xid {
        self.document.id
    }

    pub fn job_type(&self) -> &str {
        &self.document.job_type
    }

    pub fn payload(&self) -> Bytes {
        self.document.payload.clone()
    }

    pub fn status(&self) -> JobStatus {
        self.document.status
    }

    pub fn attempts(&self) -> Option<Attempts> {
        self.document.attempts
    }

    /// Document as it was returned by the claim.
    pub fn document(&self) -> &JobDocument {
        &self.document
    }

    /// Mark the job as completed successfully, storing `result`.
    #[instrument(skip_all, err, fields(jid = %self.document.id, job_type = %self.document.job_type))]
    pub async fn complete(self, result: Bytes) -> Result<JobDocument, QueueError> {
        self.ensure_transition(JobStatus::Completed)?;
        let update = JobUpdate::new()
            .set(Set::Status(JobStatus::Completed))
            .set(Set::Result(Some(result)))
            .set(Set::TimeoutAt(None))
            .set(Set::ClaimToken(None));
        self.write(update, JobStatus::Completed).await
    }

    /// Mark the job as failed. Depending on the attempts left, the job either goes back into the
    /// queue, becoming claimable once the backoff delay has passed, or is failed for good.
    #[instrument(skip_all, err, fields(jid = %self.document.id, job_type = %self.document.job_type, %error))]
    pub async fn fail<E: Display>(self, error: E) -> Result<JobDocument, QueueError> {
        let error = error.to_string();
        let (to, update) = match self.document.failure_decision() {
            FailureDecision::Retry { attempts, delay } => {
                self.ensure_transition(JobStatus::Queued)?;
                tracing::debug!(
                    attempts_left = attempts.attempts_left,
                    delay_ms = delay.num_milliseconds(),
                    "Retrying job"
                );
                let eligible_at = eligible_after(Utc::now(), delay)
                    .ok_or(QueueError::InvalidDuration(delay))?;
                let update = JobUpdate::new()
                    .set(Set::Status(JobStatus::Queued))
                    .set(Set::Attempts(Some(attempts)))
                    .set(Set::EligibleAt(eligible_at));
                (JobStatus::Queued, update)
            }
            FailureDecision::Fail { attempts } => {
                self.ensure_transition(JobStatus::Failed)?;
                tracing::warn!("Job has no attempts left");
                let update = JobUpdate::new()
                    .set(Set::Status(JobStatus::Failed))
                    .set(Set::Attempts(attempts));
                (JobStatus::Failed, update)
            }
        };
        let update = update
            .set(Set::Error(Some(error)))
            .set(Set::TimeoutAt(None))
            .set(Set::ClaimToken(None));
        self.write(update, to).await
    }

    fn ensure_transition(&self, to: JobStatus) -> Result<(), QueueError> {
        if self.document.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(self.invalid_transition(to))
        }
    }

    fn invalid_transition(&self, to: JobStatus) -> QueueError {
        QueueError::InvalidTransition {
            jid: self.document.id,
            from: self.document.status,
            to,
        }
    }

    async fn write(&self, update: JobUpdate, to: JobStatus) -> Result<JobDocument, QueueError> {
        let filter = JobFilter {
            id: Some(self.document.id),
            status: Some(self.document.status),
            claim_token: self.document.claim_token,
            ..Default::default()
        };
        self.store
            .find_and_modify(&filter, SortKey::CreatedAt, &update)
            .await?
            .ok_or_else(|| self.invalid_transition(to))
    }
}
