use crate::types::{to_millis, to_millis_ceil, JobRow};
use anyhow::Context;
use async_trait::async_trait;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use tracing::instrument;
use vigil::core::job::JobDocument;
use vigil::core::store::{JobFilter, JobStore, JobUpdate, Set, SortKey, StoreError};
use vigil::core::Xid;

/// An implementation of the JobStore backed by SQLite.
///
/// Claims are a single `UPDATE ... RETURNING` statement, so they are atomic across every
/// connection and process sharing the database file.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    #[instrument(skip_all, err, fields(jid = %document.id.to_string(), job_type = %document.job_type))]
    async fn insert(&self, document: JobDocument) -> Result<JobDocument, StoreError> {
        let attempts = document.attempts;
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO vigil_jobs (jid,queue,job_type,payload,status,attempts_count,attempts_left,\
             delay_ms,delay_strategy,timeout_at,eligible_at,claim_token,created_at,error,result) ",
        );
        builder.push_values(std::iter::once(&document), |mut row, doc| {
            row.push_bind(doc.id.to_string())
                .push_bind(doc.queue.clone())
                .push_bind(doc.job_type.clone())
                .push_bind(doc.payload.to_vec())
                .push_bind(doc.status.as_str())
                .push_bind(attempts.map(|a| a.count as i64))
                .push_bind(attempts.map(|a| a.attempts_left as i64))
                .push_bind(attempts.map(|a| a.delay_ms as i64))
                .push_bind(attempts.map(|a| a.delay_strategy.as_str()))
                .push_bind(doc.timeout_at.map(to_millis))
                .push_bind(to_millis_ceil(doc.eligible_at))
                .push_bind(doc.claim_token.map(|t| t.to_string()))
                .push_bind(to_millis(doc.created_at))
                .push_bind(doc.error.clone())
                .push_bind(doc.result.as_ref().map(|r| r.to_vec()));
        });
        builder.push(" RETURNING *");
        let row = builder
            .build()
            .try_map(|row| JobRow::from_row(&row))
            .fetch_one(&self.pool)
            .await
            .context("Failed to add job to the queue")?;
        Ok(row.0)
    }

    #[instrument(skip_all, err, fields(sort = ?sort))]
    async fn find_and_modify(
        &self,
        filter: &JobFilter,
        sort: SortKey,
        update: &JobUpdate,
    ) -> Result<Option<JobDocument>, StoreError> {
        if update.sets.is_empty() {
            // Nothing to write, still pick the first match.
            let mut builder = QueryBuilder::new("SELECT * FROM vigil_jobs WHERE ");
            push_filter(&mut builder, filter);
            push_order(&mut builder, sort);
            builder.push(" LIMIT 1");
            let row = builder
                .build()
                .try_map(|row| JobRow::from_row(&row))
                .fetch_optional(&self.pool)
                .await
                .context("Failed to look up a job")?;
            return Ok(row.map(|r| r.0));
        }

        let mut builder = QueryBuilder::new("UPDATE vigil_jobs SET ");
        push_sets(&mut builder, update);
        // Filter is repeated outside the subquery so the row is re-checked at write time.
        builder.push(" WHERE jid = (SELECT jid FROM vigil_jobs WHERE ");
        push_filter(&mut builder, filter);
        push_order(&mut builder, sort);
        builder.push(" LIMIT 1) AND ");
        push_filter(&mut builder, filter);
        builder.push(" RETURNING *");

        let row = builder
            .build()
            .try_map(|row| JobRow::from_row(&row))
            .fetch_optional(&self.pool)
            .await
            .context("Failed to modify a job")?;
        Ok(row.map(|r| r.0))
    }

    #[instrument(skip_all, err, fields(jid = %id.to_string()))]
    async fn get(&self, id: Xid) -> Result<Option<JobDocument>, StoreError> {
        let row = sqlx::query("SELECT * FROM vigil_jobs WHERE jid = ?1")
            .bind(id.to_string())
            .try_map(|row| JobRow::from_row(&row))
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch a job")?;
        Ok(row.map(|r| r.0))
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &JobFilter) {
    builder.push("1=1");
    if let Some(id) = filter.id {
        builder.push(" AND jid = ").push_bind(id.to_string());
    }
    if let Some(queue) = &filter.queue {
        builder.push(" AND queue = ").push_bind(queue.clone());
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(job_types) = &filter.job_types {
        if job_types.is_empty() {
            builder.push(" AND 1=0");
        } else {
            builder.push(" AND job_type IN (");
            {
                let mut separated = builder.separated(",");
                for job_type in job_types {
                    separated.push_bind(job_type.clone());
                }
            }
            builder.push(")");
        }
    }
    if let Some(token) = filter.claim_token {
        builder
            .push(" AND claim_token = ")
            .push_bind(token.to_string());
    }
    if let Some(at) = filter.eligible_by {
        builder.push(" AND eligible_at <= ").push_bind(to_millis(at));
    }
    if let Some(before) = filter.timed_out_before {
        builder
            .push(" AND timeout_at IS NOT NULL AND timeout_at < ")
            .push_bind(to_millis(before));
    }
}

fn push_order(builder: &mut QueryBuilder<'_, Sqlite>, sort: SortKey) {
    // xid text sorts the same way as its bytes
    match sort {
        SortKey::CreatedAt => builder.push(" ORDER BY created_at, jid"),
        SortKey::TimeoutAt => builder.push(" ORDER BY timeout_at, jid"),
    };
}

fn push_sets(builder: &mut QueryBuilder<'_, Sqlite>, update: &JobUpdate) {
    let mut separated = builder.separated(", ");
    for set in &update.sets {
        match set {
            Set::Status(status) => {
                separated.push("status = ").push_bind_unseparated(status.as_str());
            }
            Set::Attempts(attempts) => {
                separated
                    .push("attempts_count = ")
                    .push_bind_unseparated(attempts.map(|a| a.count as i64));
                separated
                    .push("attempts_left = ")
                    .push_bind_unseparated(attempts.map(|a| a.attempts_left as i64));
                separated
                    .push("delay_ms = ")
                    .push_bind_unseparated(attempts.map(|a| a.delay_ms as i64));
                separated
                    .push("delay_strategy = ")
                    .push_bind_unseparated(attempts.map(|a| a.delay_strategy.as_str()));
            }
            Set::TimeoutAt(at) => {
                separated
                    .push("timeout_at = ")
                    .push_bind_unseparated(at.map(to_millis));
            }
            Set::EligibleAt(at) => {
                separated
                    .push("eligible_at = ")
                    .push_bind_unseparated(to_millis_ceil(*at));
            }
            Set::ClaimToken(token) => {
                separated
                    .push("claim_token = ")
                    .push_bind_unseparated(token.map(|t| t.to_string()));
            }
            Set::Error(error) => {
                separated
                    .push("error = ")
                    .push_bind_unseparated(error.clone());
            }
            Set::Result(result) => {
                separated
                    .push("result = ")
                    .push_bind_unseparated(result.as_ref().map(|r| r.to_vec()));
            }
        }
    }
}
