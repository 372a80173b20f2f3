use std::fmt;

use time::{Date, OffsetDateTime};

/// Hours per day covered by an hourly series.
pub const HOURS_PER_DAY: u8 = 24;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("hour {0} is outside 0..=23")]
    InvalidHour(u8),
}

/// Resolution of a usage record. Daily rows are keyed by date, hourly rows by
/// (date, hour).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Granularity {
    Daily,
    Hourly,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Hourly => "hourly",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized usage reading. `hour` is `None` for daily readings.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub date: Date,
    pub hour: Option<u8>,
    pub usage_kwh: f64,
    pub fetched_at: OffsetDateTime,
}

impl UsageRecord {
    pub fn daily(date: Date, usage_kwh: f64, fetched_at: OffsetDateTime) -> Self {
        Self {
            date,
            hour: None,
            usage_kwh,
            fetched_at,
        }
    }

    pub fn hourly(
        date: Date,
        hour: u8,
        usage_kwh: f64,
        fetched_at: OffsetDateTime,
    ) -> Result<Self, RecordError> {
        if hour >= HOURS_PER_DAY {
            return Err(RecordError::InvalidHour(hour));
        }

        Ok(Self {
            date,
            hour: Some(hour),
            usage_kwh,
            fetched_at,
        })
    }

    pub fn granularity(&self) -> Granularity {
        match self.hour {
            Some(_) => Granularity::Hourly,
            None => Granularity::Daily,
        }
    }
}
