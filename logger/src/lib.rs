//! Logging setup shared by peerlink binaries and tests.
//!
//! Every entry point goes through `env_logger::Builder::try_init`, so calling
//! any of them more than once (for example from every test in a binary) is
//! harmless: only the first call installs a logger.

use log::LevelFilter;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

/// Install a logger that honours `RUST_LOG`, falling back to [`DEFAULT_FILTER`].
pub fn setup() {
    setup_with_default(DEFAULT_FILTER);
}

/// Install a logger that honours `RUST_LOG`, falling back to `filter`.
pub fn setup_with_default(filter: &str) {
    let env = env_logger::Env::default().default_filter_or(filter);
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}

/// Install a test logger at `level` whose output is captured by the test
/// harness.
pub fn setup_for_tests(level: LevelFilter) {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(level)
        .try_init();
}
