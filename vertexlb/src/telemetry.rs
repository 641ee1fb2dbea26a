//! Tracing initialization.
//!
//! Sets up `tracing-subscriber` with an environment filter (`RUST_LOG`) and a
//! console fmt layer. Safe to call more than once; repeat initialization is
//! ignored so tests can share a process.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_telemetry() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
