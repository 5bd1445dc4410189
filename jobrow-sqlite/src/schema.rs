//! DDL for job tables.
//!
//! [`MIGRATOR`](crate::MIGRATOR) creates the default `jobs` table. Stores using a custom table
//! create it with [`schema_sql`] or [`SqliteStore::create_table`](crate::SqliteStore::create_table).
use jobrow::core::store::StoreError;

/// Table names are interpolated into SQL, so only plain identifiers are accepted.
pub fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let mut chars = table.chars();
    let valid = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Invalid table name: {table:?}").into())
    }
}

/// `CREATE TABLE` and index statements for a job table named `table`.
pub fn schema_sql(table: &str) -> Result<String, StoreError> {
    validate_table_name(table)?;
    Ok(format!(
        r#"CREATE TABLE IF NOT EXISTS {table} (
    job_id TEXT PRIMARY KEY NOT NULL,
    job_class TEXT NOT NULL,
    arguments TEXT NOT NULL,
    queue_name TEXT NOT NULL,
    priority INTEGER,
    executions INTEGER NOT NULL DEFAULT 0,
    exception_executions TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    scheduled_at TEXT,
    locale TEXT NOT NULL,
    timezone TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS {table}_enqueued_at ON {table} (enqueued_at);
CREATE INDEX IF NOT EXISTS {table}_scheduled_at ON {table} (scheduled_at);
CREATE INDEX IF NOT EXISTS {table}_priority_scheduled_at_enqueued_at ON {table} (priority, scheduled_at, enqueued_at);
"#
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_non_identifiers() {
        assert!(validate_table_name("jobs").is_ok());
        assert!(validate_table_name("_my_jobs2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("2jobs").is_err());
        assert!(validate_table_name("jobs; DROP TABLE jobs").is_err());
    }

    #[test]
    fn schema_uses_the_table_name() {
        let sql = schema_sql("my_jobs").unwrap();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS my_jobs ("));
        assert!(sql.contains("ON my_jobs (priority, scheduled_at, enqueued_at)"));
    }
}
