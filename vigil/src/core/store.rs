use crate::core::job::{Attempts, JobDocument, JobStatus};
use crate::core::{Bytes, DateTime, Xid};
use async_trait::async_trait;
use thiserror::Error;

/// Persistence backend shared by queues, workers and watchdogs. For an example implementation
/// look at `vigil_sqlite` crate.
///
/// ### Atomicity
///
/// `find_and_modify` is the only primitive used for claiming jobs. Implementations must apply
/// the filter, pick the first match in sort order and write the update as one atomic step
/// relative to every other caller, including callers in other processes.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new document.
    async fn insert(&self, document: JobDocument) -> Result<JobDocument, StoreError>;

    /// Atomically update the first document matching `filter` in `sort` order and return the
    /// document as it is after the update. `Ok(None)` when nothing matched.
    async fn find_and_modify(
        &self,
        filter: &JobFilter,
        sort: SortKey,
        update: &JobUpdate,
    ) -> Result<Option<JobDocument>, StoreError>;

    /// Read a document by id.
    async fn get(&self, id: Xid) -> Result<Option<JobDocument>, StoreError>;
}

/// Conjunction of conditions. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub id: Option<Xid>,
    pub queue: Option<String>,
    pub status: Option<JobStatus>,
    pub job_types: Option<Vec<String>>,
    pub claim_token: Option<Xid>,
    /// `eligible_at <= instant`
    pub eligible_by: Option<DateTime>,
    /// `timeout_at < instant`
    pub timed_out_before: Option<DateTime>,
}

impl JobFilter {
    pub fn matches(&self, doc: &JobDocument) -> bool {
        if self.id.map_or(false, |id| id != doc.id) {
            return false;
        }
        if self.queue.as_ref().map_or(false, |q| *q != doc.queue) {
            return false;
        }
        if self.status.map_or(false, |s| s != doc.status) {
            return false;
        }
        if let Some(types) = &self.job_types {
            if !types.iter().any(|t| *t == doc.job_type) {
                return false;
            }
        }
        if let Some(token) = self.claim_token {
            if doc.claim_token != Some(token) {
                return false;
            }
        }
        if self.eligible_by.map_or(false, |at| doc.eligible_at > at) {
            return false;
        }
        if let Some(before) = self.timed_out_before {
            match doc.timeout_at {
                Some(timeout_at) if timeout_at < before => {}
                _ => return false,
            }
        }
        true
    }
}

/// Ascending sort key used to pick among multiple matches. Ties are broken by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    CreatedAt,
    TimeoutAt,
}

/// Single field assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum Set {
    Status(JobStatus),
    Attempts(Option<Attempts>),
    TimeoutAt(Option<DateTime>),
    EligibleAt(DateTime),
    ClaimToken(Option<Xid>),
    Error(Option<String>),
    Result(Option<Bytes>),
}

/// Ordered list of assignments applied to the matched document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub sets: Vec<Set>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, set: Set) -> Self {
        self.sets.push(set);
        self
    }

    pub fn apply(&self, doc: &mut JobDocument) {
        for set in &self.sets {
            match set {
                Set::Status(status) => doc.status = *status,
                Set::Attempts(attempts) => doc.attempts = *attempts,
                Set::TimeoutAt(at) => doc.timeout_at = *at,
                Set::EligibleAt(at) => doc.eligible_at = *at,
                Set::ClaimToken(token) => doc.claim_token = *token,
                Set::Error(error) => doc.error = error.clone(),
                Set::Result(result) => doc.result = result.clone(),
            }
        }
    }
}

/// Errors related to store communication.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    #[error("Store lock is poisoned")]
    Poisoned,
    #[error("Corrupted document {id}: {reason}")]
    Corrupted { id: String, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Duration, Utc};

    fn document() -> JobDocument {
        JobDocument::new("default", "email", Bytes::new(), None, None)
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(JobFilter::default().matches(&document()));
    }

    #[test]
    fn filter_on_types_and_status() {
        let doc = document();
        let filter = JobFilter {
            status: Some(JobStatus::Queued),
            job_types: Some(vec!["sms".into(), "email".into()]),
            ..Default::default()
        };
        assert!(filter.matches(&doc));

        let filter = JobFilter {
            job_types: Some(vec!["sms".into()]),
            ..Default::default()
        };
        assert!(!filter.matches(&doc));

        let filter = JobFilter {
            status: Some(JobStatus::Dequeued),
            ..Default::default()
        };
        assert!(!filter.matches(&doc));
    }

    #[test]
    fn filter_on_eligibility() {
        let mut doc = document();
        doc.eligible_at = Utc::now() + Duration::minutes(1);
        let filter = JobFilter {
            eligible_by: Some(Utc::now()),
            ..Default::default()
        };
        assert!(!filter.matches(&doc));

        doc.eligible_at = Utc::now() - Duration::minutes(1);
        assert!(filter.matches(&doc));
    }

    #[test]
    fn timeout_filter_skips_unclaimed_documents() {
        let mut doc = document();
        let filter = JobFilter {
            timed_out_before: Some(Utc::now()),
            ..Default::default()
        };
        assert!(!filter.matches(&doc));

        doc.timeout_at = Some(Utc::now() - Duration::seconds(1));
        assert!(filter.matches(&doc));
    }

    #[test]
    fn claim_token_must_match() {
        let mut doc = document();
        let token = crate::core::new_xid();
        let filter = JobFilter {
            claim_token: Some(token),
            ..Default::default()
        };
        assert!(!filter.matches(&doc));
        doc.claim_token = Some(token);
        assert!(filter.matches(&doc));
    }

    #[test]
    fn update_applies_in_order() {
        let mut doc = document();
        JobUpdate::new()
            .set(Set::Status(JobStatus::Dequeued))
            .set(Set::Error(Some("first".into())))
            .set(Set::Error(Some("second".into())))
            .apply(&mut doc);
        assert_eq!(doc.status, JobStatus::Dequeued);
        assert_eq!(doc.error.as_deref(), Some("second"));
    }
}
