mod usage_record;

pub use usage_record::{Granularity, RecordError, UsageRecord, HOURS_PER_DAY};
