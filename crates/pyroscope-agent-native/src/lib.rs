//! # Pyroscope Agent Native
//!
//! This crate provides the embeddable core of a continuous-profiling agent. It runs
//! inside a host process (typically a Ruby or Python interpreter loaded through the C
//! ABI) and owns everything between the host's call sites and the native sampler:
//!
//! - **Agent lifecycle**: a single process-wide agent with `initialize`, `reconfigure`
//!   and `stop` transitions
//! - **Tag-scoped context**: a concurrent tag store keyed by execution context, plus
//!   RAII scope guards that remove their tags on every exit path
//! - **Configuration resolution**: lenient, never-failing normalization of user input
//!   into an immutable [`config::Config`]
//! - **Fork handling**: deciding whether a forked child keeps profiling
//!
//! ## Architecture
//!
//! The library is organized into several key modules:
//! - [`config`]: Raw configuration, defaults, environment overrides and the resolver
//! - [`tags`]: Tag store, execution context providers, scope guards, tag encodings
//! - [`agent`]: Agent state machine and the [`agent::Sampler`] boundary
//! - [`fork`]: Fork detection and the restart-or-inert decision for child processes
//! - [`logger`]: Logging initialization from a severity ordinal and the log formatter
//! - [`ffi`]: Foreign Function Interface for C/Ruby/Python bindings
//!
//! The sampler itself (stack walking, symbolization, profile encoding, transport) is
//! not part of this crate. It plugs in through the [`agent::Sampler`] trait and reads
//! tags through [`tags::TagStore::snapshot`].

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_copy_implementations)]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
// Allow use of the `coverage_nightly` attribute for code coverage
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

/// Agent lifecycle management and the native sampler boundary
pub mod agent;

/// Configuration management - environment variables, caller input, and defaults
pub mod config;

/// Foreign Function Interface (FFI) for C, Ruby, Python, and other language bindings
pub mod ffi;

/// Fork detection and child-process activation policy
pub mod fork;

/// Logging infrastructure and tracing setup
pub mod logger;

/// Tag store, execution contexts, and scope guards
pub mod tags;

/// Crate version reported to host bindings.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build timestamp (set at compile time).
///
/// This timestamp is injected at build time via the `BUILD_TIMESTAMP` environment
/// variable set in `build.rs`.
///
/// # Format
/// The timestamp is in ISO 8601 format: `YYYY-MM-DDTHH:MM:SSZ`
pub const BUILD_TIMESTAMP: &str = env!("BUILD_TIMESTAMP");

/// Returns the crate version string.
#[must_use]
pub fn version() -> &'static str {
    AGENT_VERSION
}

/// Logs build information (version and timestamp) at INFO level.
///
/// Called by the agent the first time it starts, once logging is initialized.
///
/// # Example
/// ```no_run
/// use pyroscope_agent_native::log_build_info;
///
/// pyroscope_agent_native::logger::initialize_logging(30);
/// log_build_info(); // Logs: "pyroscope-agent-native version: 0.1.0, built: 2024-01-15T10:30:00Z"
/// ```
pub fn log_build_info() {
    tracing::info!(
        "pyroscope-agent-native version: {}, built: {}",
        AGENT_VERSION,
        BUILD_TIMESTAMP
    );
}
