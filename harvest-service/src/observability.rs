use tracing_subscriber::{filter::Directive, EnvFilter};

const DEFAULT_DIRECTIVES: [&str; 2] = ["harvest_service=info", "usage_client=info"];

/// Install the global fmt subscriber. `RUST_LOG` adds to the defaults.
pub fn init_tracing() -> anyhow::Result<()> {
    let filter = DEFAULT_DIRECTIVES
        .iter()
        .map(|d| d.parse::<Directive>())
        .try_fold(EnvFilter::from_default_env(), |filter, directive| {
            directive.map(|d| filter.add_directive(d))
        })?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
