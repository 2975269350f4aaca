//! Tracing setup shared by the gtstore binaries.
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Installs the global subscriber: `RUST_LOG`-style filtering with an `info`
/// default, plain fmt output.
pub fn init() {
    let level_filter_layer = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("info"));

    Registry::default()
        .with(level_filter_layer)
        .with(fmt::layer())
        .init();
}
