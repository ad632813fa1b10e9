use sqlx::sqlite::SqliteRow;
use sqlx::{Error, FromRow, Row};
use std::str::FromStr;
use sqlx::types::chrono::TimeZone;
use vigil::core::job::{Attempts, DelayStrategy, JobDocument, JobStatus};
use vigil::core::{Bytes, DateTime, Utc, Xid};

/// Row of `vigil_jobs` decoded into a document.
#[derive(Debug)]
pub(crate) struct JobRow(pub JobDocument);

pub(crate) fn to_millis(at: DateTime) -> i64 {
    at.timestamp_millis()
}

/// Rounds up, so that a stored "not before" instant is never earlier than the real one.
pub(crate) fn to_millis_ceil(at: DateTime) -> i64 {
    let millis = at.timestamp_millis();
    if at.timestamp_subsec_nanos() % 1_000_000 == 0 {
        millis
    } else {
        millis + 1
    }
}

fn from_millis(column: &str, millis: i64) -> Result<DateTime, Error> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| Error::ColumnDecode {
            index: column.to_string(),
            source: format!("{} is not a valid timestamp", millis).into(),
        })
}

fn decode<T, E>(column: &str, value: &str) -> Result<T, Error>
where
    T: FromStr<Err = E>,
    E: std::error::Error + Send + Sync + 'static,
{
    T::from_str(value).map_err(|e| Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

impl<'r> FromRow<'r, SqliteRow> for JobRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, Error> {
        let jid = row
            .try_get("jid")
            .map(Xid::from_str)?
            .map_err(|xid_err| Error::Decode(Box::new(xid_err)))?;
        let claim_token = row
            .try_get::<Option<String>, _>("claim_token")?
            .map(|token| Xid::from_str(&token))
            .transpose()
            .map_err(|xid_err| Error::Decode(Box::new(xid_err)))?;
        let status: String = row.try_get("status")?;

        // Either all attempt columns are set or none.
        let attempts = match row.try_get::<Option<i64>, _>("attempts_count")? {
            Some(count) => {
                let strategy: String = row.try_get("delay_strategy")?;
                Some(Attempts {
                    count: count as u32,
                    attempts_left: row.try_get::<i64, _>("attempts_left")? as u32,
                    delay_ms: row.try_get::<i64, _>("delay_ms")? as u64,
                    delay_strategy: decode::<DelayStrategy, _>("delay_strategy", &strategy)?,
                })
            }
            None => None,
        };
        let timeout_at = row
            .try_get::<Option<i64>, _>("timeout_at")?
            .map(|millis| from_millis("timeout_at", millis))
            .transpose()?;

        Ok(Self(JobDocument {
            id: jid,
            queue: row.try_get("queue")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get::<Vec<u8>, _>("payload").map(Bytes::from)?,
            status: decode::<JobStatus, _>("status", &status)?,
            attempts,
            timeout_at,
            eligible_at: from_millis("eligible_at", row.try_get("eligible_at")?)?,
            claim_token,
            created_at: from_millis("created_at", row.try_get("created_at")?)?,
            error: row.try_get("error")?,
            result: row
                .try_get::<Option<Vec<u8>>, _>("result")?
                .map(Bytes::from),
        }))
    }
}
