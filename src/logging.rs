//! Tracing setup for processes embedding this crate's `live` endpoint.
//!
//! Grounded on the `tracing_subscriber::fmt` + `EnvFilter` bootstrap the
//! teacher's binaries use; exposed here as a library function since this
//! crate no longer ships its own binary entry point.

use tracing_subscriber::EnvFilter;

/// Initialize a stderr-writing `tracing` subscriber honoring `RUST_LOG`,
/// defaulting to `info` when unset. Intended to be called once, near the
/// start of a host process's `main`.
pub fn init() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
