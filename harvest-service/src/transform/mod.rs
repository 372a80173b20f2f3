pub mod normalize;
pub mod payload;

pub use normalize::{infer_year, normalize_daily, normalize_hourly};
pub use payload::{DailySeries, HourlySeries, RawPayload};

use time::macros::date;
use usage_client::domain::UsageRecord;

use crate::pipeline::PipelineError;

/// Pure validation of a `UsageRecord`.
///
/// Rules:
/// - usage_kwh must be finite and non-negative.
/// - date must be within a broad sanity window [2000-01-01, 2100-01-01).
pub fn validate_usage(record: UsageRecord) -> Result<UsageRecord, PipelineError> {
    if !record.usage_kwh.is_finite() || record.usage_kwh < 0.0 {
        return Err(PipelineError::Validation(format!(
            "usage_kwh must be non-negative, got {}",
            record.usage_kwh
        )));
    }

    let min_date = date!(2000 - 01 - 01);
    let max_date = date!(2100 - 01 - 01);

    if record.date < min_date || record.date >= max_date {
        return Err(PipelineError::Validation("date out of allowed range".to_string()));
    }

    Ok(record)
}

/// Drop records that fail [`validate_usage`], counting and logging each one.
pub fn accept_valid<I>(records: I) -> impl Iterator<Item = UsageRecord>
where
    I: Iterator<Item = UsageRecord>,
{
    records.filter_map(|record| {
        let (date, hour) = (record.date, record.hour);
        match validate_usage(record) {
            Ok(r) => Some(r),
            Err(e) => {
                metrics::counter!("validation_usage_rejected_total").increment(1);
                tracing::warn!(error = %e, %date, ?hour, "rejecting usage record");
                None
            }
        }
    })
}
