use std::{path::Path, time::Duration};

use futures::{Stream, StreamExt};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    QueryBuilder, Sqlite, SqliteConnection, SqlitePool,
};
use usage_client::{db::ensure_schema, UsageRecord};

use crate::pipeline::{PipelineError, Sink};

/// Wait this long on a locked database before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Rows per INSERT statement, well below SQLite's bind parameter limit.
const ROWS_PER_STATEMENT: usize = 200;

/// Idempotent store for usage records.
///
/// Every call to [`upsert`](Self::upsert) is one transaction: daily rows are
/// keyed by `date`, hourly rows by `(date, hour)`, and a conflicting row is
/// overwritten with the incoming values.
#[derive(Clone)]
pub struct SqliteUsageStore {
    pool: SqlitePool,
}

impl SqliteUsageStore {
    pub async fn connect(path: &Path) -> Result<Self, PipelineError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| PipelineError::PersistenceFailure(format!("failed to open {}: {e}", path.display())))?;

        tracing::info!(path = %path.display(), "usage store opened");
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, PipelineError> {
        ensure_schema(&pool)
            .await
            .map_err(|e| PipelineError::PersistenceFailure(format!("schema setup failed: {e}")))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or overwrite `records` atomically. Returns the number of rows
    /// submitted, not the number that actually changed.
    pub async fn upsert(&self, records: &[UsageRecord]) -> Result<usize, PipelineError> {
        if records.is_empty() {
            return Ok(0);
        }

        let (hourly, daily): (Vec<&UsageRecord>, Vec<&UsageRecord>) =
            records.iter().partition(|r| r.hour.is_some());

        let started = std::time::Instant::now();
        let mut tx = self.pool.begin().await.map_err(persistence)?;

        match write_rows(&mut tx, &daily, &hourly).await {
            Ok(()) => tx.commit().await.map_err(persistence)?,
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    tracing::error!(error = %rb, "usage store rollback failed");
                }
                metrics::counter!("harvest_store_errors_total").increment(1);
                tracing::error!(error = %e, rows = records.len(), "usage upsert rolled back");
                return Err(persistence(e));
            }
        }

        metrics::counter!("harvest_records_upserted_total").increment(records.len() as u64);
        metrics::histogram!("harvest_upsert_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(daily = daily.len(), hourly = hourly.len(), "usage records upserted");

        Ok(records.len())
    }
}

fn persistence(e: sqlx::Error) -> PipelineError {
    PipelineError::PersistenceFailure(e.to_string())
}

async fn write_rows(
    conn: &mut SqliteConnection,
    daily: &[&UsageRecord],
    hourly: &[&UsageRecord],
) -> Result<(), sqlx::Error> {
    for chunk in daily.chunks(ROWS_PER_STATEMENT) {
        let mut builder = QueryBuilder::<Sqlite>::new("INSERT INTO daily_usage (date, usage_kwh, fetched_at) ");
        builder.push_values(chunk, |mut b, r| {
            b.push_bind(r.date).push_bind(r.usage_kwh).push_bind(r.fetched_at);
        });
        builder.push(
            " ON CONFLICT(date) DO UPDATE SET usage_kwh = excluded.usage_kwh, fetched_at = excluded.fetched_at",
        );
        builder.build().execute(&mut *conn).await?;
    }

    for chunk in hourly.chunks(ROWS_PER_STATEMENT) {
        let mut builder =
            QueryBuilder::<Sqlite>::new("INSERT INTO hourly_usage (date, hour, usage_kwh, fetched_at) ");
        builder.push_values(chunk, |mut b, r| {
            b.push_bind(r.date)
                .push_bind(r.hour.map(i64::from))
                .push_bind(r.usage_kwh)
                .push_bind(r.fetched_at);
        });
        builder.push(
            " ON CONFLICT(date, hour) DO UPDATE SET usage_kwh = excluded.usage_kwh, fetched_at = excluded.fetched_at",
        );
        builder.build().execute(&mut *conn).await?;
    }

    Ok(())
}

#[async_trait::async_trait]
impl Sink for SqliteUsageStore {
    async fn run<S>(&self, input: S) -> Result<usize, PipelineError>
    where
        S: Stream<Item = UsageRecord> + Send + Unpin + 'static,
    {
        // One run is one batch; the whole set commits or none of it does.
        let batch: Vec<UsageRecord> = input.collect().await;
        self.upsert(&batch).await
    }
}
