//! Fork boundary handling.
//!
//! When a process forks, the child gets a point-in-time copy of the parent's memory:
//! the tag store, the agent's published state, everything. It does *not* get the
//! parent's other threads, so a sampler that was running in the parent is dead in the
//! child even though the agent state still says `Running`. After the fork the two
//! processes share nothing; tags added or removed in one are never visible in the other.
//!
//! This module detects the fork and decides, once per fork and only in the child,
//! whether the child keeps profiling.
//!
//! # Detection
//!
//! [`ForkBoundary::install`] registers a `pthread_atfork` child handler. The handler
//! runs in the child before `fork()` returns and only bumps an atomic fork counter
//! ([`ForkBoundary::record_fork`]), which is async-signal-safe. As a fallback for forks
//! that bypass `pthread_atfork` (raw `clone`, or a handler that was never installed),
//! each [`ForkBoundary`] also remembers the pid it last saw.
//!
//! # Decision
//!
//! Restarting a sampler spawns threads, which cannot happen inside the atfork handler.
//! The decision is applied on the first agent or tag entry point the child reaches
//! ([`ForkBoundary::on_child`] returns `true` exactly once per fork), see
//! [`Agent::handle_fork`](crate::agent::Agent::handle_fork).
//!
//! Tag entry points cover callers that only ever touch the tag store: the store carries
//! a [`ForkHook`] pointing back at its agent, and the first store operation after a
//! fork hands control to the agent before it proceeds. Pid-only forks (no atfork
//! handler) are picked up by the agent entry points alone.
//!
//! | `detect_subprocesses` | Action | Effect in the child |
//! |---|---|---|
//! | `true` | [`ForkAction::Restart`] | the sampler is started again under the same configuration |
//! | `false` | [`ForkAction::Inert`] | the agent is stopped; the sampler's start is never called |
//!
//! A failed restart is isolated to the child: the child's agent ends `Stopped`, the
//! parent is unaffected.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, Once, PoisonError, RwLock, Weak};

use tracing::{debug, warn};

/// Number of forks this process (or its ancestors) went through, as seen by the atfork
/// child handler.
static FORK_GENERATION: AtomicU64 = AtomicU64::new(0);

static INSTALL: Once = Once::new();
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// What a forked child does with an agent that was running in its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkAction {
    /// Start a fresh sampler in the child under the inherited configuration.
    Restart,
    /// Leave the child unprofiled.
    Inert,
}

/// Maps the `detect_subprocesses` setting to the child's action.
#[must_use]
pub const fn decide(detect_subprocesses: bool) -> ForkAction {
    if detect_subprocesses {
        ForkAction::Restart
    } else {
        ForkAction::Inert
    }
}

extern "C" fn atfork_child() {
    ForkBoundary::record_fork();
}

fn current_pid() -> u32 {
    // Pids are always positive.
    u32::try_from(nix::unistd::getpid().as_raw()).unwrap_or_default()
}

/// Something that applies the fork decision when a [`ForkHook`] fires.
pub trait ForkObserver: Send + Sync {
    fn on_fork(&self);
}

/// Fires its observer on the first [`ForkHook::check`] after each recorded fork.
///
/// Only fork generations count here, so the check on the hot path is one atomic load.
#[derive(Debug)]
pub struct ForkHook {
    generation: AtomicU64,
    observer: RwLock<Option<Weak<dyn ForkObserver>>>,
}

impl Default for ForkHook {
    fn default() -> Self {
        Self::new()
    }
}

impl ForkHook {
    #[must_use]
    pub fn new() -> Self {
        ForkHook {
            generation: AtomicU64::new(FORK_GENERATION.load(Ordering::SeqCst)),
            observer: RwLock::new(None),
        }
    }

    /// Replaces the observer. The hook never keeps its observer alive.
    pub fn set_observer(&self, observer: Weak<dyn ForkObserver>) {
        *self
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    /// Notifies the observer if a fork was recorded since the last check.
    pub fn check(&self) {
        let generation = FORK_GENERATION.load(Ordering::SeqCst);
        if self.generation.load(Ordering::SeqCst) == generation
            || self.generation.swap(generation, Ordering::SeqCst) == generation
        {
            return;
        }

        let observer = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(observer) = observer {
            observer.on_fork();
        }
    }
}

/// Per-agent view of fork events.
#[derive(Debug)]
pub struct ForkBoundary {
    /// Pid observed at the last check.
    pid: AtomicU32,
    /// Fork generation observed at the last check.
    generation: AtomicU64,
    /// Serializes the slow path so each fork is reported once.
    observe: Mutex<()>,
}

impl Default for ForkBoundary {
    fn default() -> Self {
        Self::new()
    }
}

impl ForkBoundary {
    /// Creates a boundary that treats the current process as already handled.
    #[must_use]
    pub fn new() -> Self {
        ForkBoundary {
            pid: AtomicU32::new(current_pid()),
            generation: AtomicU64::new(FORK_GENERATION.load(Ordering::SeqCst)),
            observe: Mutex::new(()),
        }
    }

    /// Registers the process-wide atfork child handler. Idempotent; returns false if
    /// registration failed (detection then relies on pid changes alone).
    pub fn install() -> bool {
        INSTALL.call_once(|| {
            // SAFETY: `atfork_child` only performs an atomic increment, which is
            // async-signal-safe and therefore valid in a forked child.
            let rc = unsafe { libc::pthread_atfork(None, None, Some(atfork_child)) };
            if rc == 0 {
                INSTALLED.store(true, Ordering::SeqCst);
                debug!("Registered fork handler");
            } else {
                warn!(
                    "Failed to register fork handler (error {}), falling back to pid checks",
                    rc
                );
            }
        });
        INSTALLED.load(Ordering::SeqCst)
    }

    /// Records that a fork just happened. Called by the atfork child handler; also
    /// usable by hosts that fork through a path `pthread_atfork` does not see.
    pub fn record_fork() {
        FORK_GENERATION.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns true exactly once after each fork, in the child.
    pub fn on_child(&self) -> bool {
        let generation = FORK_GENERATION.load(Ordering::SeqCst);
        let pid = current_pid();
        if generation == self.generation.load(Ordering::SeqCst)
            && pid == self.pid.load(Ordering::SeqCst)
        {
            return false;
        }

        let _guard = self.observe.lock().unwrap_or_else(PoisonError::into_inner);
        let generation_changed =
            self.generation.swap(generation, Ordering::SeqCst) != generation;
        let pid_changed = self.pid.swap(pid, Ordering::SeqCst) != pid;
        if generation_changed || pid_changed {
            debug!(pid, generation, "Detected fork");
            true
        } else {
            false
        }
    }
}
