//! Boundary to the native sampler and transport.
//!
//! Stack walking, symbolization, profile encoding and upload all live behind this
//! trait. The agent only tells the sampler when to start and stop; while running, the
//! sampler reads tags itself through [`TagStore::snapshot`] for every context it samples.

use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::tags::TagStore;

/// The native sampling + transport collaborator.
///
/// Implementations must not panic and must not block indefinitely. Failures are
/// reported through the returned flag; the agent logs them and never retries on its
/// own.
pub trait Sampler: Send + Sync {
    /// Initializes sampling and transport for `config`. Returns false on failure.
    fn start(&self, config: &Config, tags: Arc<TagStore>) -> bool;

    /// Flushes buffered samples and tears sampling down. Returns false on failure.
    fn stop(&self) -> bool;

    /// Called in a forked child before any restart decision. The child inherits the
    /// sampler's memory but none of its threads; implementations reset whatever state
    /// refers to them.
    fn reset_after_fork(&self) {}
}

/// Sampler used until a native one is registered. Accepts every call and samples
/// nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSampler;

impl Sampler for NoopSampler {
    fn start(&self, config: &Config, _tags: Arc<TagStore>) -> bool {
        debug!(
            application_name = %config.application_name,
            "No native sampler registered, profiling is disabled"
        );
        true
    }

    fn stop(&self) -> bool {
        true
    }
}
