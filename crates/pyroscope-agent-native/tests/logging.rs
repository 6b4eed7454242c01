//! Global logging setup
//!
//! Runs in its own test binary: installing the global subscriber is a one-shot,
//! process-wide operation.

use pyroscope_agent_native::logger::initialize_logging;

#[test]
fn test_log_records_follow_host_severity() {
    assert!(initialize_logging(40));
    // Later calls report the subscriber installed by the first one.
    assert!(initialize_logging(10));

    if std::env::var_os("RUST_LOG").is_none() {
        assert_eq!(log::max_level(), log::LevelFilter::Warn);
        assert!(!log::log_enabled!(log::Level::Info));
    }
    log::warn!("forwarded from the log crate");
}
