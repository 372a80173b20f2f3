pub mod alert;
pub mod auth;
pub mod config;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod portal;
pub mod session;
pub mod sinks;
pub mod transform;

pub use pipeline::{HarvestPipeline, PipelineError, RunMode, RunReport};
