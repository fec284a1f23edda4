//! Logging prelude module for convenient access to tracing macros.
//!
//! ```ignore
//! use crate::logging::*;
//!
//! debug!("dir {} has no files", dir_id);
//! warn!("skipping {}: {}", path.display(), err);
//! ```

pub use tracing::{debug, error, info, warn};

/// Initialize the tracing subscriber with environment filter support.
///
/// Logs at INFO level and above by default. Control the level with `RUST_LOG`:
///
/// ```bash
/// RUST_LOG=debug sfsync index ./drive
/// RUST_LOG=sfsync::monitor=trace,sfsync::batch=debug sfsync watch ./drive
/// ```
///
/// Only the binary calls this; the library never installs a subscriber.
pub fn init_tracing() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.with_writer(std::io::stderr)
		.init();
}

// vim: ts=4
