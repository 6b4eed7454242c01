//! Shared helpers for integration tests

pub mod mocks;

use pyroscope_agent_native::config::{resolve, Config, RawConfig};

/// Resolves a configuration with only the application name set.
#[allow(dead_code)]
pub fn config_named(name: &str) -> Config {
    resolve(&RawConfig {
        application_name: Some(name.to_string()),
        ..RawConfig::default()
    })
}
