use chrono::{NaiveDateTime, TimeZone};
use jobrow::core::record::JobRecord;
use jobrow::core::{DateTime, JobId, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Error, FromRow, Row};

/// Timestamps are stored as fixed-width UTC text, so comparing them as strings compares instants.
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub(crate) const COLUMNS: [&str; 11] = [
    "job_id",
    "job_class",
    "arguments",
    "queue_name",
    "priority",
    "executions",
    "exception_executions",
    "enqueued_at",
    "scheduled_at",
    "locale",
    "timezone",
];

pub(crate) fn encode_timestamp(at: DateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn decode_timestamp(raw: &str) -> Result<DateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).map(|naive| Utc.from_utc_datetime(&naive))
}

#[derive(Debug)]
pub(crate) struct RecordRow(pub JobRecord);

impl<'r> FromRow<'r, SqliteRow> for RecordRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, Error> {
        let timestamp = |column: &str, raw: &str| {
            decode_timestamp(raw).map_err(|e| Error::ColumnDecode {
                index: column.to_string(),
                source: Box::new(e),
            })
        };

        let job_id: String = row.try_get("job_id")?;
        let enqueued_at: String = row.try_get("enqueued_at")?;
        let scheduled_at = row
            .try_get::<Option<String>, _>("scheduled_at")?
            .map(|raw| timestamp("scheduled_at", &raw))
            .transpose()?;

        Ok(Self(JobRecord {
            job_id: JobId::from(job_id),
            job_class: row.try_get("job_class")?,
            arguments: row.try_get("arguments")?,
            queue_name: row.try_get("queue_name")?,
            priority: row.try_get("priority")?,
            executions: row.try_get("executions")?,
            exception_executions: row.try_get("exception_executions")?,
            enqueued_at: timestamp("enqueued_at", &enqueued_at)?,
            scheduled_at,
            locale: row.try_get("locale")?,
            timezone: row.try_get("timezone")?,
        }))
    }
}
