use sqlx::SqlitePool;

/// Table definitions for the two keyed usage collections.
///
/// The primary keys carry the upsert identity: `date` for daily rows and
/// `(date, hour)` for hourly rows. Dates are ISO `YYYY-MM-DD` text.
pub const DDL_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS daily_usage (
        date TEXT PRIMARY KEY,
        usage_kwh REAL NOT NULL CHECK (usage_kwh >= 0),
        fetched_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS hourly_usage (
        date TEXT NOT NULL,
        hour INTEGER NOT NULL CHECK (hour BETWEEN 0 AND 23),
        usage_kwh REAL NOT NULL CHECK (usage_kwh >= 0),
        fetched_at TEXT NOT NULL,
        PRIMARY KEY (date, hour)
    )
    "#,
];

/// Create the usage tables if they do not exist yet.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for ddl in DDL_STATEMENTS {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}
