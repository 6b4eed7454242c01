//! The process-wide agent.
//!
//! Host bindings talk to the agent through free C functions, so something has to own
//! "the" agent. This module holds it, created lazily with a [`NoopSampler`] until the
//! native sampler is registered.
//!
//! Replacing the sampler builds a new [`Agent`] around the *same* tag store, so tags a
//! host added before registration are kept.

use std::sync::{Arc, PoisonError, RwLock};

use lazy_static::lazy_static;
use tracing::debug;

use crate::agent::{Agent, AgentError, AgentState, NoopSampler, Sampler};
use crate::tags::TagStore;

lazy_static! {
    static ref GLOBAL_AGENT: RwLock<Arc<Agent>> =
        RwLock::new(Arc::new(Agent::new(Arc::new(NoopSampler))));
}

/// Returns the process-wide agent.
#[must_use]
pub fn agent() -> Arc<Agent> {
    Arc::clone(&GLOBAL_AGENT.read().unwrap_or_else(PoisonError::into_inner))
}

/// Tag store of the process-wide agent.
#[must_use]
pub fn tag_store() -> Arc<TagStore> {
    Arc::clone(agent().tags())
}

/// Installs the native sampler used by the process-wide agent.
///
/// Fails with [`AgentError::AlreadyRunning`] while the current agent is running; stop it
/// first.
pub fn register_sampler(sampler: Arc<dyn Sampler>) -> Result<(), AgentError> {
    let mut current = GLOBAL_AGENT
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    if current.state() == AgentState::Running {
        return Err(AgentError::AlreadyRunning);
    }

    let tags = Arc::clone(current.tags());
    *current = Arc::new(Agent::with_tag_store(sampler, tags));
    debug!("Registered native sampler");
    Ok(())
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tags::ExecutionContextId;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_register_sampler_keeps_tags() {
        let context = ExecutionContextId::new(u64::MAX - 1);
        tag_store().add_tag(context, "kept", "yes").expect("valid tag");

        register_sampler(Arc::new(NoopSampler)).expect("not running");
        assert_eq!(tag_store().snapshot(context).len(), 1);
        tag_store().clear_context(context);
    }

    #[test]
    #[serial]
    fn test_register_sampler_refused_while_running() {
        register_sampler(Arc::new(NoopSampler)).expect("not running");
        let running = agent();
        running.initialize(Config::default()).expect("start");

        assert!(matches!(
            register_sampler(Arc::new(NoopSampler)),
            Err(AgentError::AlreadyRunning)
        ));

        running.stop().expect("stop");
        register_sampler(Arc::new(NoopSampler)).expect("stopped");
    }
}
