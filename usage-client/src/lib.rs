pub mod db;
pub mod domain;

pub use domain::{Granularity, UsageRecord};
