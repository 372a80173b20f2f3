use anyhow::Result;
use sqlx::SqlitePool;
use time::{Date, OffsetDateTime};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DailyUsageRow {
    pub date: Date,
    pub usage_kwh: f64,
    pub fetched_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HourlyUsageRow {
    pub date: Date,
    pub hour: i64,
    pub usage_kwh: f64,
    pub fetched_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub daily: i64,
    pub hourly: i64,
}

/// Daily usage for dates in `[start, end)`, oldest first.
pub async fn daily_usage_between(
    pool: &SqlitePool,
    start: Date,
    end: Date,
) -> Result<Vec<DailyUsageRow>> {
    let rows = sqlx::query_as::<_, DailyUsageRow>(
        r#"
        SELECT date, usage_kwh, fetched_at
        FROM daily_usage
        WHERE date >= ?1
          AND date <  ?2
        ORDER BY date
        "#,
    )
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// The hourly profile stored for a single day, ordered by hour.
pub async fn hourly_usage_for_date(pool: &SqlitePool, date: Date) -> Result<Vec<HourlyUsageRow>> {
    let rows = sqlx::query_as::<_, HourlyUsageRow>(
        r#"
        SELECT date, hour, usage_kwh, fetched_at
        FROM hourly_usage
        WHERE date = ?1
        ORDER BY hour
        "#,
    )
    .bind(date)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn row_counts(pool: &SqlitePool) -> Result<RowCounts> {
    let (daily,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM daily_usage")
        .fetch_one(pool)
        .await?;
    let (hourly,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM hourly_usage")
        .fetch_one(pool)
        .await?;

    Ok(RowCounts { daily, hourly })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ensure_schema;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use time::macros::{date, datetime};

    async fn test_pool(dir: &tempfile::TempDir) -> SqlitePool {
        let opts = SqliteConnectOptions::new()
            .filename(dir.path().join("usage.db"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .unwrap();
        ensure_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn daily_range_is_half_open_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let fetched = datetime!(2025-09-02 08:00 UTC);

        for (d, kwh) in [
            (date!(2025 - 09 - 01), 3.0),
            (date!(2025 - 08 - 30), 1.0),
            (date!(2025 - 08 - 31), 2.0),
        ] {
            sqlx::query("INSERT INTO daily_usage (date, usage_kwh, fetched_at) VALUES (?1, ?2, ?3)")
                .bind(d)
                .bind(kwh)
                .bind(fetched)
                .execute(&pool)
                .await
                .unwrap();
        }

        let rows = daily_usage_between(&pool, date!(2025 - 08 - 30), date!(2025 - 09 - 01))
            .await
            .unwrap();
        let dates: Vec<Date> = rows.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![date!(2025 - 08 - 30), date!(2025 - 08 - 31)]);
        assert_eq!(rows[1].usage_kwh, 2.0);
    }

    #[tokio::test]
    async fn hourly_rows_come_back_ordered_by_hour() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let fetched = datetime!(2025-09-02 08:00 UTC);

        for hour in [23_i64, 0, 12] {
            sqlx::query(
                "INSERT INTO hourly_usage (date, hour, usage_kwh, fetched_at) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(date!(2025 - 09 - 01))
            .bind(hour)
            .bind(0.5)
            .bind(fetched)
            .execute(&pool)
            .await
            .unwrap();
        }

        let rows = hourly_usage_for_date(&pool, date!(2025 - 09 - 01)).await.unwrap();
        let hours: Vec<i64> = rows.iter().map(|r| r.hour).collect();
        assert_eq!(hours, vec![0, 12, 23]);

        let counts = row_counts(&pool).await.unwrap();
        assert_eq!(counts, RowCounts { daily: 0, hourly: 3 });
    }

    #[tokio::test]
    async fn schema_rejects_negative_usage() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;

        let res = sqlx::query("INSERT INTO daily_usage (date, usage_kwh, fetched_at) VALUES (?1, ?2, ?3)")
            .bind(date!(2025 - 09 - 01))
            .bind(-1.0)
            .bind(datetime!(2025-09-02 08:00 UTC))
            .execute(&pool)
            .await;
        assert!(res.is_err());
    }
}
