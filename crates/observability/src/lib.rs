//! Process-wide tracing setup for the bridge binary.

pub mod subscriber;

pub use subscriber::{LogFormat, LogSettings};

/// Initialize tracing from `RUST_LOG` / `LOG_FORMAT`.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    subscriber::init(&LogSettings::from_env());
}
