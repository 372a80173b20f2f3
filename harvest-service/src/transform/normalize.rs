use time::{Date, Month, OffsetDateTime};
use usage_client::domain::{UsageRecord, HOURS_PER_DAY};

use super::payload::{DailySeries, HourlySeries};

/// Resolve the year of a `month/day` chart label relative to the fetch date.
///
/// Labels in the current month belong to the current year, earlier months to
/// the next year, later months to the previous year. August labels seen in
/// September always belong to the current year.
pub fn infer_year(label_month: u8, today: Date) -> i32 {
    let current_year = today.year();
    let current_month = u8::from(today.month());

    if current_month == 9 && label_month == 8 {
        return current_year;
    }

    if label_month < current_month {
        current_year + 1
    } else if label_month > current_month {
        current_year - 1
    } else {
        current_year
    }
}

/// Split a `"8/20"` style label into `(month, day)`.
pub fn parse_month_day(label: &str) -> Option<(u8, u8)> {
    let (month, day) = label.trim().split_once('/')?;
    Some((month.trim().parse().ok()?, day.trim().parse().ok()?))
}

fn resolve_label(label: &str, today: Date) -> Option<Date> {
    let (month, day) = parse_month_day(label)?;
    let month = Month::try_from(month).ok()?;
    Date::from_calendar_date(infer_year(u8::from(month), today), month, day).ok()
}

/// Lazily turn a daily chart into records. `now` must already be expressed in
/// the portal's local offset; its date drives year inference.
pub fn normalize_daily(
    series: DailySeries,
    now: OffsetDateTime,
) -> impl Iterator<Item = UsageRecord> + Send + 'static {
    let today = now.date();

    series
        .labels
        .into_iter()
        .zip(series.values)
        .filter_map(move |(label, value)| {
            let usage_kwh = value?;
            match resolve_label(&label, today) {
                Some(date) => Some(UsageRecord::daily(date, usage_kwh, now)),
                None => {
                    tracing::warn!(label = %label, "skipping daily value with unparseable date label");
                    None
                }
            }
        })
}

/// Lazily turn an hourly chart into records attributed to `target`.
pub fn normalize_hourly(
    series: HourlySeries,
    target: Date,
    now: OffsetDateTime,
) -> impl Iterator<Item = UsageRecord> + Send + 'static {
    series
        .values
        .into_iter()
        .enumerate()
        .filter_map(move |(idx, value)| {
            let usage_kwh = value?;
            let hour = match u8::try_from(idx) {
                Ok(h) if h < HOURS_PER_DAY => h,
                _ => {
                    tracing::warn!(position = idx, "ignoring hourly value beyond hour 23");
                    return None;
                }
            };
            UsageRecord::hourly(target, hour, usage_kwh, now).ok()
        })
}
