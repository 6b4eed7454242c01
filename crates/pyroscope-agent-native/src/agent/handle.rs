//! Agent handle implementation.
//!
//! The [`Agent`] owns the sampler, the tag store and the lifecycle state machine that
//! ties them together.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError, RwLock, Weak};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::agent::sampler::Sampler;
use crate::config::Config;
use crate::fork::{decide, ForkAction, ForkBoundary, ForkObserver};
use crate::tags::{Tag, TagError, TagStore};

/// Id of the agent currently holding the process-wide running slot, 0 when none.
static RUNNING_AGENT: AtomicU64 = AtomicU64::new(0);

static NEXT_AGENT_ID: AtomicU64 = AtomicU64::new(1);

static BUILD_INFO: Once = Once::new();

/// Lifecycle states of an [`Agent`].
///
/// ```text
/// Uninitialized ──initialize──▶ Configured ──sampler started──▶ Running ──stop──▶ Stopped
///                                                                  ▲                  │
///                                                                  └────initialize────┘
/// ```
///
/// An agent never goes back to `Uninitialized`. A sampler that fails to start leaves the
/// agent where it was (`Configured` or `Stopped`). Reconfiguring a running agent keeps
/// it `Running` from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum AgentState {
    Uninitialized = 0,
    /// A configuration was resolved but the sampler is not (yet) running.
    Configured = 1,
    Running = 2,
    Stopped = 3,
}

impl AgentState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => AgentState::Configured,
            2 => AgentState::Running,
            3 => AgentState::Stopped,
            _ => AgentState::Uninitialized,
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Uninitialized => "uninitialized",
            AgentState::Configured => "configured",
            AgentState::Running => "running",
            AgentState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during agent operations
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Another agent is already running in this process")]
    AlreadyRunning,

    #[error("Agent is not running (state: {0})")]
    NotRunning(AgentState),

    #[error("Startup error: {0}")]
    StartupError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Tag error: {0}")]
    TagError(#[from] TagError),
}

/// The profiling agent: sampler, tag store and lifecycle.
///
/// ## Concurrency
///
/// - `initialize`, `reconfigure`, `stop` and fork handling are serialized by a single
///   transition lock. Only one of them runs at a time.
/// - The current state and configuration are published separately, so [`Agent::state`],
///   [`Agent::config`] and every tag operation on [`Agent::tags`] stay lock-free with
///   respect to transitions.
/// - At most one agent per process is `Running`. Starting a second one fails with
///   [`AgentError::AlreadyRunning`].
///
/// ## Forks
///
/// Every public entry point, including the tag store's own operations, applies the
/// fork decision first when called in a child that has not handled its fork yet.
pub struct Agent {
    core: Arc<AgentCore>,
}

struct AgentCore {
    /// Identifies this agent in the process-wide running slot.
    id: u64,

    /// The native sampler/transport collaborator.
    sampler: Arc<dyn Sampler>,

    /// Tag store shared with the sampler. Outlives restarts and reconfigurations.
    tags: Arc<TagStore>,

    /// Detects forks so the child can decide whether to keep profiling.
    fork: ForkBoundary,

    /// Serializes lifecycle transitions.
    transition: Mutex<()>,

    /// Published [`AgentState`], readable without the transition lock.
    state: AtomicU8,

    /// Published configuration. `None` until the first successful start.
    config: RwLock<Option<Arc<Config>>>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.core.id)
            .field("state", &self.core.current_state())
            .field("config", &self.core.config())
            .finish_non_exhaustive()
    }
}

fn config_tags(config: &Config) -> Vec<Tag> {
    config
        .tags
        .iter()
        .map(|(k, v)| Tag::new(k.clone(), v.clone()))
        .filter(|tag| match tag.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!("Ignoring configured tag: {}", e);
                false
            }
        })
        .collect()
}

impl Agent {
    /// Creates an agent with its own, empty tag store.
    #[must_use]
    pub fn new(sampler: Arc<dyn Sampler>) -> Self {
        Self::with_tag_store(sampler, Arc::new(TagStore::new()))
    }

    /// Creates an agent around an existing tag store. The store reports forks to this
    /// agent from now on.
    #[must_use]
    pub fn with_tag_store(sampler: Arc<dyn Sampler>, tags: Arc<TagStore>) -> Self {
        ForkBoundary::install();
        let core = Arc::new(AgentCore {
            id: NEXT_AGENT_ID.fetch_add(1, Ordering::Relaxed),
            sampler,
            tags,
            fork: ForkBoundary::new(),
            transition: Mutex::new(()),
            state: AtomicU8::new(AgentState::Uninitialized as u8),
            config: RwLock::new(None),
        });
        let observer: Weak<AgentCore> = Arc::downgrade(&core);
        core.tags.set_fork_observer(observer);
        Agent { core }
    }

    #[must_use]
    pub fn state(&self) -> AgentState {
        self.core.handle_fork();
        self.core.current_state()
    }

    /// Configuration of the last successful start or reconfiguration, if any.
    #[must_use]
    pub fn config(&self) -> Option<Arc<Config>> {
        self.core.config()
    }

    #[must_use]
    pub fn tags(&self) -> &Arc<TagStore> {
        self.core.handle_fork();
        &self.core.tags
    }

    /// Starts the agent with `config`.
    ///
    /// - Already running with an equal configuration: no-op success.
    /// - Running with a different configuration: the sampler is stopped (flushing what
    ///   it buffered) and restarted with the new configuration under the transition
    ///   lock. The agent stays `Running` throughout unless the restart fails, in which
    ///   case it ends `Stopped`.
    /// - Not running: the sampler is started.
    ///
    /// A failed start leaves [`Agent::config`] at the previously applied configuration.
    pub fn initialize(&self, config: Config) -> Result<(), AgentError> {
        self.core.initialize(config)
    }

    /// Applies a new configuration, starting the agent if it is not running.
    pub fn reconfigure(&self, config: Config) -> Result<(), AgentError> {
        info!("Reconfiguring agent");
        self.core.initialize(config)
    }

    /// Flushes and stops the sampler. Stopping an already stopped agent succeeds.
    ///
    /// The agent ends `Stopped` even when the sampler reports a failed flush; the error
    /// is returned so the caller can log it.
    pub fn stop(&self) -> Result<(), AgentError> {
        self.core.stop()
    }

    /// Applies the fork decision if this process is a child that has not handled its
    /// fork yet. Returns the action taken, or `None` when there was no new fork or the
    /// agent was not running in the parent.
    pub fn handle_fork(&self) -> Option<ForkAction> {
        self.core.handle_fork()
    }
}

impl ForkObserver for AgentCore {
    fn on_fork(&self) {
        self.handle_fork();
    }
}

impl AgentCore {
    fn current_state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn config(&self) -> Option<Arc<Config>> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn initialize(&self, config: Config) -> Result<(), AgentError> {
        self.handle_fork();
        let _transition = self.lock_transition();

        match self.current_state() {
            AgentState::Running => {
                if self.config().as_deref() == Some(&config) {
                    debug!("Agent already running with an identical configuration");
                    return Ok(());
                }
                self.swap_locked(config)
            }
            state => self.start_locked(state, config),
        }
    }

    fn stop(&self) -> Result<(), AgentError> {
        self.handle_fork();
        let _transition = self.lock_transition();

        match self.current_state() {
            AgentState::Running => {
                let flushed = self.sampler.stop();
                self.retire_locked();

                if flushed {
                    info!("Agent stopped");
                    Ok(())
                } else {
                    Err(AgentError::ShutdownError(
                        "sampler failed to flush and stop".to_string(),
                    ))
                }
            }
            AgentState::Stopped => {
                debug!("Agent already stopped");
                Ok(())
            }
            state => Err(AgentError::NotRunning(state)),
        }
    }

    fn handle_fork(&self) -> Option<ForkAction> {
        if !self.fork.on_child() {
            return None;
        }

        let _transition = self.lock_transition();
        self.sampler.reset_after_fork();

        let state = self.current_state();
        if state != AgentState::Running {
            debug!(state = %state, "Forked child has no running agent to handle");
            return None;
        }
        let config = self.config()?;

        let action = decide(config.detect_subprocesses);
        match action {
            ForkAction::Restart => {
                if self.sampler.start(&config, Arc::clone(&self.tags)) {
                    info!("Restarted profiling in forked child");
                } else {
                    error!("Failed to restart profiling in forked child");
                    self.retire_locked();
                }
            }
            ForkAction::Inert => {
                debug!("Forked child is not profiled (detect_subprocesses is off)");
                self.retire_locked();
            }
        }
        Some(action)
    }

    fn start_locked(&self, from: AgentState, config: Config) -> Result<(), AgentError> {
        self.claim()?;

        if from == AgentState::Uninitialized {
            self.publish_state(AgentState::Configured);
        }

        BUILD_INFO.call_once(crate::log_build_info);
        if let Ok(summary) = serde_json::to_string(&config) {
            debug!("Starting agent with config {}", summary);
        }

        let initial = config_tags(&config);
        self.tags.replace_global_tags(&[], &initial)?;

        if !self.sampler.start(&config, Arc::clone(&self.tags)) {
            self.tags.replace_global_tags(&initial, &[])?;
            self.release();
            error!("Sampler failed to start");
            return Err(AgentError::StartupError(
                "sampler failed to start".to_string(),
            ));
        }

        info!(
            application_name = %config.application_name,
            server_address = %config.server_address,
            sample_rate = config.sample_rate,
            "Agent started"
        );
        self.publish_config(Arc::new(config));
        self.publish_state(AgentState::Running);
        Ok(())
    }

    fn swap_locked(&self, config: Config) -> Result<(), AgentError> {
        let previous = self.config();
        if !self.sampler.stop() {
            warn!("Sampler failed to flush before reconfiguration");
        }

        let old_tags = previous.as_deref().map(config_tags).unwrap_or_default();
        let new_tags = config_tags(&config);
        self.tags.replace_global_tags(&old_tags, &new_tags)?;

        if !self.sampler.start(&config, Arc::clone(&self.tags)) {
            self.tags.replace_global_tags(&new_tags, &[])?;
            self.publish_state(AgentState::Stopped);
            self.release();
            error!("Sampler failed to restart with the new configuration");
            return Err(AgentError::StartupError(
                "sampler failed to restart with the new configuration".to_string(),
            ));
        }

        self.publish_config(Arc::new(config));
        info!("Agent reconfigured");
        Ok(())
    }

    /// Takes a running agent to `Stopped`: configured global tags come off, the running
    /// slot is released. The sampler must already be stopped or gone.
    fn retire_locked(&self) {
        if let Some(config) = self.config() {
            if let Err(e) = self.tags.replace_global_tags(&config_tags(&config), &[]) {
                warn!("Failed to remove configured tags: {}", e);
            }
        }
        self.publish_state(AgentState::Stopped);
        self.release();
    }

    fn lock_transition(&self) -> MutexGuard<'_, ()> {
        self.transition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_state(&self, state: AgentState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn publish_config(&self, config: Arc<Config>) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Some(config);
    }

    /// Takes the process-wide running slot.
    fn claim(&self) -> Result<(), AgentError> {
        match RUNNING_AGENT.compare_exchange(0, self.id, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => Ok(()),
            Err(holder) if holder == self.id => Ok(()),
            Err(_) => Err(AgentError::AlreadyRunning),
        }
    }

    fn release(&self) {
        let _ = RUNNING_AGENT.compare_exchange(self.id, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if self.core.current_state() == AgentState::Running {
            if let Err(e) = self.core.stop() {
                warn!("Failed to stop agent on drop: {}", e);
            }
        }
        self.core.release();
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, RawConfig};
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct CountingSampler {
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail_start: std::sync::atomic::AtomicBool,
    }

    impl Sampler for CountingSampler {
        fn start(&self, _config: &Config, _tags: Arc<TagStore>) -> bool {
            self.starts.fetch_add(1, Ordering::SeqCst);
            !self.fail_start.load(Ordering::SeqCst)
        }

        fn stop(&self) -> bool {
            self.stops.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn config(name: &str) -> Config {
        resolve(&RawConfig {
            application_name: Some(name.to_string()),
            ..RawConfig::default()
        })
    }

    #[test]
    #[serial]
    fn test_lifecycle() {
        let sampler = Arc::new(CountingSampler::default());
        let agent = Agent::new(sampler.clone());
        assert_eq!(agent.state(), AgentState::Uninitialized);

        agent.initialize(config("app")).expect("start");
        assert_eq!(agent.state(), AgentState::Running);
        assert_eq!(sampler.starts.load(Ordering::SeqCst), 1);

        agent.stop().expect("stop");
        assert_eq!(agent.state(), AgentState::Stopped);
        assert_eq!(sampler.stops.load(Ordering::SeqCst), 1);

        agent.stop().expect("stop is idempotent");
        assert_eq!(sampler.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[serial]
    fn test_identical_initialize_is_noop() {
        let sampler = Arc::new(CountingSampler::default());
        let agent = Agent::new(sampler.clone());

        agent.initialize(config("app")).expect("start");
        agent.initialize(config("app")).expect("noop");
        assert_eq!(sampler.starts.load(Ordering::SeqCst), 1);
        assert_eq!(sampler.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[serial]
    fn test_reconfigure_swaps_in_place() {
        let sampler = Arc::new(CountingSampler::default());
        let agent = Agent::new(sampler.clone());

        agent.initialize(config("one")).expect("start");
        agent.reconfigure(config("two")).expect("swap");

        assert_eq!(agent.state(), AgentState::Running);
        assert_eq!(
            agent.config().expect("configured").application_name,
            "two"
        );
        assert_eq!(sampler.starts.load(Ordering::SeqCst), 2);
        assert_eq!(sampler.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[serial]
    fn test_stop_before_initialize_fails() {
        let agent = Agent::new(Arc::new(CountingSampler::default()));
        assert!(matches!(
            agent.stop(),
            Err(AgentError::NotRunning(AgentState::Uninitialized))
        ));
    }

    #[test]
    #[serial]
    fn test_failed_start_stays_configured() {
        let sampler = Arc::new(CountingSampler::default());
        sampler.fail_start.store(true, Ordering::SeqCst);
        let agent = Agent::new(sampler.clone());

        assert!(matches!(
            agent.initialize(config("app")),
            Err(AgentError::StartupError(_))
        ));
        assert_eq!(agent.state(), AgentState::Configured);

        sampler.fail_start.store(false, Ordering::SeqCst);
        agent.initialize(config("app")).expect("retry");
        assert_eq!(agent.state(), AgentState::Running);
    }

    #[test]
    #[serial]
    fn test_failed_start_keeps_last_applied_config() {
        let sampler = Arc::new(CountingSampler::default());
        let agent = Agent::new(sampler.clone());
        agent.initialize(config("a")).expect("start");
        agent.stop().expect("stop");

        sampler.fail_start.store(true, Ordering::SeqCst);
        assert!(agent.initialize(config("b")).is_err());
        assert_eq!(agent.state(), AgentState::Stopped);
        assert_eq!(agent.config().expect("configured").application_name, "a");
    }

    #[test]
    #[serial]
    fn test_failed_reconfigure_keeps_last_applied_config() {
        let sampler = Arc::new(CountingSampler::default());
        let agent = Agent::new(sampler.clone());
        agent.initialize(config("a")).expect("start");

        sampler.fail_start.store(true, Ordering::SeqCst);
        assert!(agent.reconfigure(config("b")).is_err());
        assert_eq!(agent.state(), AgentState::Stopped);
        assert_eq!(agent.config().expect("configured").application_name, "a");
    }

    #[test]
    #[serial]
    fn test_first_failed_start_has_no_config() {
        let sampler = Arc::new(CountingSampler::default());
        sampler.fail_start.store(true, Ordering::SeqCst);
        let agent = Agent::new(sampler);

        assert!(agent.initialize(config("never")).is_err());
        assert!(agent.config().is_none());
    }

    #[test]
    #[serial]
    fn test_inert_fork_removes_configured_tags() {
        let agent = Agent::new(Arc::new(CountingSampler::default()));
        let mut cfg = config("app");
        cfg.tags.insert("region".to_string(), "us-east".to_string());
        agent.initialize(cfg).expect("start");

        ForkBoundary::record_fork();
        assert_eq!(agent.handle_fork(), Some(ForkAction::Inert));
        assert_eq!(agent.state(), AgentState::Stopped);
        assert!(agent.tags().global_tags().is_empty());
    }

    #[test]
    #[serial]
    fn test_tag_store_applies_fork_decision() {
        let sampler = Arc::new(CountingSampler::default());
        let agent = Agent::new(sampler.clone());
        let mut cfg = config("app");
        cfg.detect_subprocesses = true;
        agent.initialize(cfg).expect("start");
        let store = Arc::clone(agent.tags());

        ForkBoundary::record_fork();
        store
            .add_tag(crate::tags::ExecutionContextId::new(5), "k", "v")
            .expect("tag");
        assert_eq!(sampler.starts.load(Ordering::SeqCst), 2);
        assert_eq!(agent.handle_fork(), None);
        assert_eq!(agent.state(), AgentState::Running);

        store.clear_context(crate::tags::ExecutionContextId::new(5));
        agent.stop().expect("stop");
    }

    #[test]
    #[serial]
    #[traced_test]
    fn test_start_and_failure_are_logged() {
        let sampler = Arc::new(CountingSampler::default());
        let agent = Agent::new(sampler.clone());

        agent.initialize(config("logged")).expect("start");
        assert!(logs_contain("Agent started"));
        agent.stop().expect("stop");

        sampler.fail_start.store(true, Ordering::SeqCst);
        assert!(agent.initialize(config("logged")).is_err());
        assert!(logs_contain("Sampler failed to start"));
    }

    #[test]
    #[serial]
    fn test_only_one_running_agent() {
        let first = Agent::new(Arc::new(CountingSampler::default()));
        let second = Agent::new(Arc::new(CountingSampler::default()));

        first.initialize(config("first")).expect("start");
        assert!(matches!(
            second.initialize(config("second")),
            Err(AgentError::AlreadyRunning)
        ));
        assert_eq!(second.state(), AgentState::Uninitialized);

        first.stop().expect("stop");
        second.initialize(config("second")).expect("slot released");
    }

    #[test]
    #[serial]
    fn test_restart_after_stop() {
        let agent = Agent::new(Arc::new(CountingSampler::default()));
        agent.initialize(config("app")).expect("start");
        agent.stop().expect("stop");
        agent.initialize(config("app")).expect("restart");
        assert_eq!(agent.state(), AgentState::Running);
    }

    #[test]
    #[serial]
    fn test_config_tags_are_global_while_running() {
        let agent = Agent::new(Arc::new(CountingSampler::default()));
        let mut cfg = config("app");
        cfg.tags.insert("region".to_string(), "us-east".to_string());

        agent.initialize(cfg).expect("start");
        assert_eq!(agent.tags().global_tags(), vec![Tag::new("region", "us-east")]);

        agent.stop().expect("stop");
        assert!(agent.tags().global_tags().is_empty());
    }

    #[test]
    #[serial]
    fn test_dropping_running_agent_releases_slot() {
        {
            let agent = Agent::new(Arc::new(CountingSampler::default()));
            agent.initialize(config("dropped")).expect("start");
        }
        let agent = Agent::new(Arc::new(CountingSampler::default()));
        agent.initialize(config("next")).expect("slot released on drop");
    }
}
