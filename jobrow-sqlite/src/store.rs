use crate::schema::{schema_sql, validate_table_name};
use crate::types::{encode_timestamp, RecordRow, COLUMNS};
use anyhow::Context;
use async_trait::async_trait;
use jobrow::core::codec::CodecError;
use jobrow::core::config::QueueConfig;
use jobrow::core::ordering::Order;
use jobrow::core::record::JobRecord;
use jobrow::core::store::{Claim, JobFilter, Query, QueueSwap, RecordStore, StoreError};
use jobrow::core::{DateTime, JobId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, FromRow, QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::instrument;

pub const DEFAULT_TABLE_NAME: &str = "jobs";

/// Priority nulls last, then schedule nulls last, then enqueue time and id.
const READY_ORDER: &str = "CASE WHEN priority IS NULL THEN 1 ELSE 0 END, priority, \
     CASE WHEN scheduled_at IS NULL THEN 1 ELSE 0 END, scheduled_at, enqueued_at, job_id";

/// An implementation of the RecordStore backed by SQLite.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    table: String,
}

impl SqliteStore {
    /// Store using the `jobs` table created by [`MIGRATOR`](crate::MIGRATOR).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            table: DEFAULT_TABLE_NAME.to_string(),
        }
    }

    /// Store using a custom table. The table must have the layout [`schema_sql`] creates.
    pub fn with_table(pool: SqlitePool, table: impl Into<String>) -> Result<Self, StoreError> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { pool, table })
    }

    /// Store using the table named by `config.table_name`.
    pub fn from_config(pool: SqlitePool, config: &QueueConfig) -> Result<Self, StoreError> {
        Self::with_table(pool, config.table_name.clone())
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create this store's table and indexes if they don't exist yet.
    #[instrument(skip_all, err, fields(table = %self.table))]
    pub async fn create_table(&self) -> Result<(), StoreError> {
        let sql = schema_sql(&self.table)?;
        self.pool
            .execute(sql.as_str())
            .await
            .context("Failed to create job table")?;
        Ok(())
    }

    fn select(&self, columns: &str) -> QueryBuilder<'static, Sqlite> {
        QueryBuilder::new(format!("SELECT {} FROM {}", columns, self.table))
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    #[instrument(skip_all, err, fields(job_id = %job_id))]
    async fn find_by_job_id(&self, job_id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        let sql = format!("SELECT * FROM {} WHERE job_id = ?1", self.table);
        let row = sqlx::query(&sql)
            .bind(job_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to find job record")?;
        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip_all, err, fields(job_id = %record.job_id, job_class = %record.job_class))]
    async fn create(&self, record: &JobRecord) -> Result<JobRecord, StoreError> {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            self.table,
            COLUMNS.join(", ")
        );
        let result = sqlx::query(&sql)
            .bind(record.job_id.as_str())
            .bind(&record.job_class)
            .bind(&record.arguments)
            .bind(&record.queue_name)
            .bind(record.priority)
            .bind(record.executions)
            .bind(&record.exception_executions)
            .bind(encode_timestamp(record.enqueued_at))
            .bind(record.scheduled_at.map(encode_timestamp))
            .bind(&record.locale)
            .bind(&record.timezone)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(record.clone()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::DuplicateKey(record.job_id.clone()))
            }
            Err(e) => Err(anyhow::Error::from(e)
                .context("Failed to create job record")
                .into()),
        }
    }

    #[instrument(skip_all, err, fields(job_id = %record.job_id, job_class = %record.job_class))]
    async fn update(&self, record: &JobRecord) -> Result<JobRecord, StoreError> {
        let sql = format!(
            "UPDATE {} SET job_class = ?2, arguments = ?3, queue_name = ?4, priority = ?5, \
             executions = ?6, exception_executions = ?7, enqueued_at = ?8, scheduled_at = ?9, \
             locale = ?10, timezone = ?11 WHERE job_id = ?1",
            self.table
        );
        let updated = sqlx::query(&sql)
            .bind(record.job_id.as_str())
            .bind(&record.job_class)
            .bind(&record.arguments)
            .bind(&record.queue_name)
            .bind(record.priority)
            .bind(record.executions)
            .bind(&record.exception_executions)
            .bind(encode_timestamp(record.enqueued_at))
            .bind(record.scheduled_at.map(encode_timestamp))
            .bind(&record.locale)
            .bind(&record.timezone)
            .execute(&self.pool)
            .await
            .context("Failed to update job record")?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(record.job_id.clone()));
        }
        Ok(record.clone())
    }

    #[instrument(skip_all, err, fields(job_id = %job_id))]
    async fn delete(&self, job_id: &JobId) -> Result<(), StoreError> {
        let sql = format!("DELETE FROM {} WHERE job_id = ?1", self.table);
        sqlx::query(&sql)
            .bind(job_id.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to delete job record")?;
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn delete_where(&self, filter: &JobFilter, now: DateTime) -> Result<u64, StoreError> {
        let mut builder = QueryBuilder::new(format!("DELETE FROM {}", self.table));
        push_filter(&mut builder, filter, now);
        let deleted = builder
            .build()
            .execute(&self.pool)
            .await
            .context("Failed to delete job records")?
            .rows_affected();
        Ok(deleted)
    }

    #[instrument(skip_all, err)]
    async fn count_at(&self, filter: &JobFilter, now: DateTime) -> Result<u64, StoreError> {
        let mut builder = self.select("COUNT(*)");
        push_filter(&mut builder, filter, now);
        let count: i64 = builder
            .build()
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get(0))
            .context("Failed to count job records")?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    #[instrument(skip_all, err, fields(order = ?query.effective_order(), limit = ?query.limit))]
    async fn query_at(&self, query: &Query, now: DateTime) -> Result<Vec<JobRecord>, StoreError> {
        let mut builder = self.select("*");
        push_filter(&mut builder, &query.filter, now);
        push_order(&mut builder, query.effective_order(), now);
        push_page(&mut builder, query);
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to query job records")?;
        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip_all, err, fields(job_id = %swap.job_id, to = %swap.to_queue))]
    async fn swap_queue(&self, swap: &QueueSwap) -> Result<Claim, StoreError> {
        let sql = format!(
            "UPDATE {} SET queue_name = ?1, scheduled_at = ?2 \
             WHERE job_id = ?3 AND queue_name = ?4",
            self.table
        );
        let updated = sqlx::query(&sql)
            .bind(&swap.to_queue)
            .bind(swap.scheduled_at.map(encode_timestamp))
            .bind(swap.job_id.as_str())
            .bind(&swap.from_queue)
            .execute(&self.pool)
            .await
            .context("Failed to swap job queue")?
            .rows_affected();
        Ok(if updated == 1 { Claim::Claimed } else { Claim::Lost })
    }
}

fn decode_row(row: &SqliteRow) -> Result<JobRecord, StoreError> {
    match RecordRow::from_row(row) {
        Ok(RecordRow(record)) => Ok(record),
        Err(sqlx::Error::ColumnDecode { index, source }) => {
            let field = COLUMNS
                .iter()
                .copied()
                .find(|column| *column == index)
                .unwrap_or("record");
            Err(CodecError::invalid(field, source).into())
        }
        Err(e) => Err(anyhow::Error::from(e)
            .context("Failed to decode job record")
            .into()),
    }
}

fn push_filter(builder: &mut QueryBuilder<'static, Sqlite>, filter: &JobFilter, now: DateTime) {
    builder.push(" WHERE 1 = 1");
    if let Some(job_id) = &filter.job_id {
        builder.push(" AND job_id = ").push_bind(job_id.to_string());
    }
    push_any_of(builder, "job_class", &filter.job_classes);
    push_any_of(builder, "queue_name", &filter.queue_names);
    if filter.due {
        builder
            .push(" AND (scheduled_at IS NULL OR scheduled_at <= ")
            .push_bind(encode_timestamp(now))
            .push(")");
    }
    if let Some(prefix) = &filter.exclude_queue_prefix {
        // instr is case sensitive, unlike LIKE.
        builder
            .push(" AND instr(queue_name, ")
            .push_bind(prefix.clone())
            .push(") <> 1");
    }
}

fn push_any_of(builder: &mut QueryBuilder<'static, Sqlite>, column: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    builder.push(format!(" AND {column} IN ("));
    {
        let mut separated = builder.separated(", ");
        for value in values {
            separated.push_bind(value.clone());
        }
    }
    builder.push(")");
}

fn push_order(builder: &mut QueryBuilder<'static, Sqlite>, order: Order, now: DateTime) {
    match order {
        Order::Implicit => {
            builder.push(" ORDER BY enqueued_at, job_id");
        }
        Order::Ready => {
            builder.push(" ORDER BY ").push(READY_ORDER);
        }
        Order::ByDueDate => {
            builder
                .push(" ORDER BY CASE WHEN scheduled_at IS NULL OR scheduled_at <= ")
                .push_bind(encode_timestamp(now))
                .push(" THEN 0 ELSE 1 END, ")
                .push(READY_ORDER);
        }
    }
}

fn push_page(builder: &mut QueryBuilder<'static, Sqlite>, query: &Query) {
    let to_i64 = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
    match (query.limit, query.offset) {
        (None, None) => {}
        (limit, offset) => {
            // SQLite needs a LIMIT for OFFSET; -1 means no limit.
            builder
                .push(" LIMIT ")
                .push_bind(limit.map_or(-1, to_i64))
                .push(" OFFSET ")
                .push_bind(offset.map_or(0, to_i64));
        }
    }
}
