//! Execution context identifiers and providers.
//!
//! An [`ExecutionContextId`] names "the thing tags are scoped to". Which thing that is
//! depends on the host:
//!
//! - Native threads: [`ThreadContextProvider`] hands every OS thread a process-unique id
//!   the first time it asks.
//! - Async tasks: [`TaskContextProvider`] scopes an id to a tokio task so tags follow the
//!   unit of work across worker threads, falling back to the thread id outside a task.
//! - Host bindings that already know their thread id (the Ruby and Python bindings pass
//!   one across the C ABI): [`FixedContextProvider`] wraps an explicit id, usually built
//!   with [`ExecutionContextId::from_host_thread_id`].
//!
//! The [`TagStore`](super::TagStore) never resolves contexts itself. Callers pass a
//! provider, so swapping the resolution strategy does not touch call sites.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::future::Future;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Ids handed out by the thread and task providers. Starts at 1 so 0 never names a
/// live context.
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_CONTEXT_ID: ExecutionContextId = ExecutionContextId::next();
}

tokio::task_local! {
    static TASK_CONTEXT_ID: ExecutionContextId;
}

/// Opaque, comparable token identifying an execution context.
///
/// Ids are stable for the lifetime of the context they were issued to and never
/// collide across concurrently live contexts of the same provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ExecutionContextId(u64);

impl ExecutionContextId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        ExecutionContextId(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Derives an id from a thread id supplied by a host binding.
    ///
    /// The thread id is reduced modulo the pid and hashed, matching how the Python
    /// binding has always keyed thread tags, so an id computed on either side of the
    /// C ABI for the same thread is identical.
    #[must_use]
    pub fn from_host_thread_id(thread_id: u64, pid: u32) -> Self {
        let reduced = thread_id.checked_rem(u64::from(pid)).unwrap_or(thread_id);
        let mut hasher = DefaultHasher::new();
        hasher.write_u64(reduced);
        ExecutionContextId(hasher.finish())
    }

    fn next() -> Self {
        ExecutionContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ExecutionContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ExecutionContextId {
    fn from(raw: u64) -> Self {
        ExecutionContextId(raw)
    }
}

/// Resolves the execution context of the caller.
pub trait ContextProvider: Send + Sync {
    fn current_id(&self) -> ExecutionContextId;
}

/// One id per OS thread, assigned lazily from a process-wide counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadContextProvider;

impl ContextProvider for ThreadContextProvider {
    fn current_id(&self) -> ExecutionContextId {
        THREAD_CONTEXT_ID.with(|id| *id)
    }
}

/// One id per tokio task, for tags that must follow a unit of work across threads.
///
/// Tasks only have an id inside [`TaskContextProvider::scope`]. Anywhere else the
/// provider behaves like [`ThreadContextProvider`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskContextProvider;

impl TaskContextProvider {
    /// Runs `future` with a fresh task context id.
    pub async fn scope<F: Future>(future: F) -> F::Output {
        TASK_CONTEXT_ID.scope(ExecutionContextId::next(), future).await
    }

    /// Runs `f` synchronously with a fresh task context id.
    pub fn sync_scope<R>(f: impl FnOnce() -> R) -> R {
        TASK_CONTEXT_ID.sync_scope(ExecutionContextId::next(), f)
    }
}

impl ContextProvider for TaskContextProvider {
    fn current_id(&self) -> ExecutionContextId {
        TASK_CONTEXT_ID
            .try_with(|id| *id)
            .unwrap_or_else(|_| ThreadContextProvider.current_id())
    }
}

/// Always resolves to the id it was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedContextProvider(pub ExecutionContextId);

impl ContextProvider for FixedContextProvider {
    fn current_id(&self) -> ExecutionContextId {
        self.0
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_thread_ids_are_stable_per_thread() {
        let provider = ThreadContextProvider;
        assert_eq!(provider.current_id(), provider.current_id());
    }

    #[test]
    fn test_thread_ids_differ_across_threads() {
        let ids: HashSet<ExecutionContextId> = (0..8)
            .map(|_| std::thread::spawn(|| ThreadContextProvider.current_id()))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .collect();
        assert_eq!(ids.len(), 8);
        assert!(!ids.contains(&ThreadContextProvider.current_id()));
    }

    #[test]
    fn test_task_provider_falls_back_to_thread() {
        assert_eq!(
            TaskContextProvider.current_id(),
            ThreadContextProvider.current_id()
        );
    }

    #[test]
    fn test_task_scope_has_its_own_id() {
        let outside = TaskContextProvider.current_id();
        let (first, again) = TaskContextProvider::sync_scope(|| {
            (
                TaskContextProvider.current_id(),
                TaskContextProvider.current_id(),
            )
        });
        let second = TaskContextProvider::sync_scope(|| TaskContextProvider.current_id());

        assert_eq!(first, again);
        assert_ne!(first, outside);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_task_scope_follows_future() {
        let id = TaskContextProvider::scope(async {
            let before = TaskContextProvider.current_id();
            tokio::task::yield_now().await;
            assert_eq!(before, TaskContextProvider.current_id());
            before
        })
        .await;
        assert_ne!(id, TaskContextProvider.current_id());
    }

    #[test]
    fn test_from_host_thread_id_is_deterministic() {
        let a = ExecutionContextId::from_host_thread_id(140_234_567, 4242);
        let b = ExecutionContextId::from_host_thread_id(140_234_567, 4242);
        let c = ExecutionContextId::from_host_thread_id(140_234_568, 4242);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_from_host_thread_id_zero_pid() {
        let a = ExecutionContextId::from_host_thread_id(7, 0);
        assert_eq!(a, ExecutionContextId::from_host_thread_id(7, 0));
    }

    #[test]
    fn test_fixed_provider() {
        let provider = FixedContextProvider(ExecutionContextId::new(99));
        assert_eq!(provider.current_id().as_u64(), 99);
    }
}
