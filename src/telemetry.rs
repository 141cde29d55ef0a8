//! Tracing setup for hosts and tests.
//!
//! The library itself only emits events through `tracing` macros and never
//! installs a subscriber; embedding processes call `init` (or `try_init`
//! when another subscriber may already be registered, e.g. in tests).

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Install a formatting subscriber filtered by verbosity, overridable via
/// the `LOG` environment variable.
pub fn init(verbosity: u8) {
    try_init(verbosity);
}

/// Like `init`, but returns whether this call installed the subscriber.
pub fn try_init(verbosity: u8) -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var("LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}
