use crate::core::{new_xid, Bytes, DateTime, Duration, Utc, Xid};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Upper bound for a single retry delay. Exponential backoff saturates here.
pub const MAX_RETRY_DELAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Lifecycle status of a job.
///
/// `Queued` is the initial state, `Completed` and `Failed` are terminal. `Dequeued` and
/// `TimedOut` are held by exactly one claimant at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Queued,
    Dequeued,
    TimedOut,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Dequeued => "dequeued",
            JobStatus::TimedOut => "timedout",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the status graph has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Dequeued)
                | (Dequeued, Completed)
                | (Dequeued, Queued)
                | (Dequeued, Failed)
                | (Dequeued, TimedOut)
                | (TimedOut, Queued)
                | (TimedOut, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown value: {0}")]
pub struct UnknownVariant(pub String);

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "dequeued" => Ok(JobStatus::Dequeued),
            "timedout" => Ok(JobStatus::TimedOut),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// How the retry delay grows with every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DelayStrategy {
    /// Same delay before every retry.
    #[default]
    Linear,
    /// `delay_ms * 2^(failure - 1)`.
    Exponential,
}

impl DelayStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelayStrategy::Linear => "linear",
            DelayStrategy::Exponential => "exponential",
        }
    }

    /// Delay in milliseconds after the `failure_no`-th failure (1-based).
    pub fn delay_ms(&self, base_ms: u64, failure_no: u32) -> u64 {
        let delay = match self {
            DelayStrategy::Linear => base_ms,
            DelayStrategy::Exponential => {
                let exp = failure_no.max(1) - 1;
                let pow2 = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);
                base_ms.saturating_mul(pow2)
            }
        };
        delay.min(MAX_RETRY_DELAY_MS)
    }
}

impl FromStr for DelayStrategy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(DelayStrategy::Linear),
            "exponential" => Ok(DelayStrategy::Exponential),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Retry policy and progress of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempts {
    /// Total attempts allowed.
    pub count: u32,
    /// Attempts that are still left.
    pub attempts_left: u32,
    /// Base delay between attempts.
    pub delay_ms: u64,
    pub delay_strategy: DelayStrategy,
}

impl Attempts {
    /// Allow `count` attempts with no delay between them.
    pub fn new(count: u32) -> Self {
        Self {
            count,
            attempts_left: count,
            delay_ms: 0,
            delay_strategy: DelayStrategy::Linear,
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_strategy(mut self, delay_strategy: DelayStrategy) -> Self {
        self.delay_strategy = delay_strategy;
        self
    }
}

/// A job as it is persisted in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDocument {
    pub id: Xid,
    pub queue: String,
    pub job_type: String,
    pub payload: Bytes,
    pub status: JobStatus,
    pub attempts: Option<Attempts>,
    /// Set when the job is claimed. After this the owning worker is presumed dead.
    pub timeout_at: Option<DateTime>,
    /// Claim never returns the job before this instant.
    pub eligible_at: DateTime,
    /// Written by every claim and reclaim, required by the holder's follow-up writes.
    pub claim_token: Option<Xid>,
    pub created_at: DateTime,
    pub error: Option<String>,
    pub result: Option<Bytes>,
}

impl JobDocument {
    /// Fresh `queued` document.
    pub fn new(
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: Bytes,
        attempts: Option<Attempts>,
        eligible_at: Option<DateTime>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_xid(),
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            status: JobStatus::Queued,
            attempts: attempts.map(|a| Attempts {
                attempts_left: a.count,
                ..a
            }),
            timeout_at: None,
            eligible_at: eligible_at
                .or_else(|| eligible_after(now, Duration::zero()))
                .unwrap_or(now),
            claim_token: None,
            created_at: now,
            error: None,
            result: None,
        }
    }

    /// Decide what happens to this job if it fails now.
    pub fn failure_decision(&self) -> FailureDecision {
        let Some(attempts) = self.attempts else {
            return FailureDecision::Fail { attempts: None };
        };
        let attempts_left = attempts.attempts_left.saturating_sub(1);
        let next = Attempts {
            attempts_left,
            ..attempts
        };
        if attempts_left == 0 {
            return FailureDecision::Fail {
                attempts: Some(next),
            };
        }

        let failure_no = attempts.count.saturating_sub(attempts_left).max(1);
        let delay_ms = attempts
            .delay_strategy
            .delay_ms(attempts.delay_ms, failure_no);
        FailureDecision::Retry {
            attempts: next,
            delay: Duration::milliseconds(delay_ms as i64),
        }
    }
}

/// First whole millisecond at which a job that became claimable at `from`, plus `delay`, may be
/// claimed. A zero delay rounds down so the job is claimable right away, anything else rounds up
/// so that a millisecond-precision store never hands it out early.
pub fn eligible_after(from: DateTime, delay: Duration) -> Option<DateTime> {
    let sub_millis = Duration::nanoseconds((from.timestamp_subsec_nanos() % 1_000_000) as i64);
    let floor = from.checked_sub_signed(sub_millis)?;
    if delay <= Duration::zero() {
        return Some(floor);
    }
    let start = if sub_millis == Duration::zero() {
        floor
    } else {
        floor.checked_add_signed(Duration::milliseconds(1))?
    };
    start.checked_add_signed(delay)
}

/// Outcome of the retry/backoff decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    /// Put the job back into the queue once `delay` has passed.
    Retry { attempts: Attempts, delay: Duration },
    /// No attempts left, the job is failed for good.
    Fail { attempts: Option<Attempts> },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(attempts: Option<Attempts>) -> JobDocument {
        JobDocument::new("default", "test_job", Bytes::new(), attempts, None)
    }

    #[test]
    fn single_attempt_fails_immediately() {
        let doc = document(None);
        assert_eq!(
            doc.failure_decision(),
            FailureDecision::Fail { attempts: None }
        );
    }

    #[test]
    fn linear_retries_until_exhausted() {
        let mut doc = document(Some(Attempts::new(3).with_delay_ms(50)));
        let mut delays = vec![];
        loop {
            match doc.failure_decision() {
                FailureDecision::Retry { attempts, delay } => {
                    delays.push(delay.num_milliseconds());
                    doc.attempts = Some(attempts);
                }
                FailureDecision::Fail { attempts } => {
                    let attempts = attempts.unwrap();
                    assert_eq!(attempts.attempts_left, 0);
                    assert_eq!(attempts.count, 3);
                    break;
                }
            }
        }
        assert_eq!(delays, vec![50, 50]);
    }

    #[test]
    fn exponential_doubles_per_failure() {
        let attempts = Attempts::new(5)
            .with_delay_ms(10)
            .with_strategy(DelayStrategy::Exponential);
        let mut doc = document(Some(attempts));
        let mut delays = vec![];
        while let FailureDecision::Retry { attempts, delay } = doc.failure_decision() {
            delays.push(delay.num_milliseconds());
            doc.attempts = Some(attempts);
        }
        assert_eq!(delays, vec![10, 20, 40, 80]);
    }

    #[test]
    fn exhausted_attempts_never_go_negative() {
        let mut doc = document(Some(Attempts::new(2)));
        doc.attempts = Some(Attempts {
            attempts_left: 0,
            ..Attempts::new(2)
        });
        match doc.failure_decision() {
            FailureDecision::Fail { attempts } => assert_eq!(attempts.unwrap().attempts_left, 0),
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn exponential_delay_saturates() {
        let delay = DelayStrategy::Exponential.delay_ms(1_000, 200);
        assert_eq!(delay, MAX_RETRY_DELAY_MS);
    }

    #[test]
    fn status_graph_only_moves_forward() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Dequeued));
        assert!(Dequeued.can_transition_to(TimedOut));
        assert!(TimedOut.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Queued));
        assert!(!Failed.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!TimedOut.can_transition_to(Completed));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Queued,
            JobStatus::Dequeued,
            JobStatus::TimedOut,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status, status.as_str().parse().unwrap());
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn eligibility_lands_on_whole_milliseconds() {
        use chrono::TimeZone;
        let base = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let failed_at = base + Duration::microseconds(400);

        assert_eq!(eligible_after(failed_at, Duration::zero()), Some(base));
        assert_eq!(
            eligible_after(failed_at, Duration::milliseconds(50)),
            Some(base + Duration::milliseconds(51))
        );
        assert_eq!(
            eligible_after(base, Duration::milliseconds(50)),
            Some(base + Duration::milliseconds(50))
        );
        assert!(eligible_after(failed_at, Duration::max_value()).is_none());

        let doc = document(None);
        assert_eq!(doc.eligible_at.timestamp_subsec_nanos() % 1_000_000, 0);
        assert!(doc.eligible_at <= doc.created_at);
    }
}
