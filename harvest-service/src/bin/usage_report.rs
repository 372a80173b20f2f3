use anyhow::Result;
use harvest_service::{config::AppConfig, observability, sinks::SqliteUsageStore};
use time::{Date, Duration, OffsetDateTime};
use usage_client::db::usage_queries::{daily_usage_between, row_counts};

const DEFAULT_DAYS: i64 = 14;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing()?;

    let days = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse::<i64>()
            .ok()
            .filter(|d| *d > 0)
            .ok_or_else(|| anyhow::anyhow!("usage: usage_report [days], got '{arg}'"))?,
        None => DEFAULT_DAYS,
    };

    let cfg = AppConfig::load()?;
    let store = SqliteUsageStore::connect(&cfg.store.path).await?;

    let today = OffsetDateTime::now_utc().to_offset(cfg.utc_offset()?).date();
    let (start, end) = report_window(today, days)?;

    let rows = daily_usage_between(store.pool(), start, end).await?;
    println!("daily usage {start} .. {today} ({} days with data)", rows.len());
    let mut total = 0.0;
    for row in &rows {
        total += row.usage_kwh;
        println!("{}  {:>8.2} kWh  (fetched {})", row.date, row.usage_kwh, row.fetched_at);
    }
    println!("total {total:.2} kWh");

    let counts = row_counts(store.pool()).await?;
    println!("stored rows: daily={} hourly={}", counts.daily, counts.hourly);
    Ok(())
}

/// Half-open `[start, end)` covering the `days` days up to and including `today`.
fn report_window(today: Date, days: i64) -> Result<(Date, Date)> {
    let end = today.next_day().unwrap_or(today);
    let start = days
        .checked_mul(86_400)
        .map(Duration::seconds)
        .and_then(|span| end.checked_sub(span))
        .ok_or_else(|| anyhow::anyhow!("{days} days reaches before the earliest representable date"))?;
    Ok((start, end))
}
