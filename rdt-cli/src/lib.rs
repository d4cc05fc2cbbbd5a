//! RDT CLI Library
//!
//! Shared functionality for the RDT command-line tools.

pub mod config;
pub mod stats;

pub use config::{Config, ConfigError, FeedbackKind, PayloadKind, ReceiverConfig, SenderConfig};
pub use stats::{display_compact_stats, display_session_stats, format_bytes, format_rate};

/// Install the `tracing` subscriber shared by the binaries
///
/// `RUST_LOG` wins when set; otherwise `verbose` selects debug over info.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
