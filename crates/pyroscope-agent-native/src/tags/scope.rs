//! Scoped tag application.
//!
//! A [`TagScope`] resolves the caller's execution context once, adds its tags, and
//! removes exactly those tags when dropped. Because removal lives in `Drop`, it runs on
//! every exit path: normal return, `?` propagation, panics unwinding through the scope,
//! and futures dropped mid-await.
//!
//! Scopes nest. Removal is by exact `(key, value)` pair, most recent occurrence first,
//! so an inner scope never strips a pair an enclosing scope still holds.

use std::future::Future;

use tracing::trace;

use crate::tags::{ContextProvider, ExecutionContextId, Tag, TagError, TagStore};

/// Guard holding a set of tags on one execution context.
#[must_use = "the tags are removed as soon as the scope is dropped"]
#[derive(Debug)]
pub struct TagScope<'a> {
    store: &'a TagStore,
    context: ExecutionContextId,
    tags: Vec<Tag>,
}

impl<'a> TagScope<'a> {
    /// Adds `tags` to the caller's current context and returns the guard that removes
    /// them. No tag is added if any of them is invalid.
    pub fn enter<I, T>(
        store: &'a TagStore,
        provider: &dyn ContextProvider,
        tags: I,
    ) -> Result<Self, TagError>
    where
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        Self::enter_context(store, provider.current_id(), tags)
    }

    /// Like [`TagScope::enter`] for an explicitly known context.
    pub fn enter_context<I, T>(
        store: &'a TagStore,
        context: ExecutionContextId,
        tags: I,
    ) -> Result<Self, TagError>
    where
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        let tags: Vec<Tag> = tags.into_iter().map(Into::into).collect();
        store.add_tags(context, &tags)?;
        trace!(context = %context, count = tags.len(), "entered tag scope");
        Ok(TagScope {
            store,
            context,
            tags,
        })
    }

    #[must_use]
    pub fn context(&self) -> ExecutionContextId {
        self.context
    }

    #[must_use]
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }
}

impl Drop for TagScope<'_> {
    fn drop(&mut self) {
        self.store.remove_tags(self.context, &self.tags);
        trace!(context = %self.context, "exited tag scope");
    }
}

/// Runs `f` with `tags` applied to the caller's current context.
///
/// Whatever `f` returns (including an `Err`) is handed back unchanged; a panic in `f`
/// keeps unwinding after the tags are removed.
pub fn with_tags<I, T, F, R>(
    store: &TagStore,
    provider: &dyn ContextProvider,
    tags: I,
    f: F,
) -> Result<R, TagError>
where
    I: IntoIterator<Item = T>,
    T: Into<Tag>,
    F: FnOnce() -> R,
{
    let _scope = TagScope::enter(store, provider, tags)?;
    Ok(f())
}

/// Awaits `future` with `tags` applied to the context current at the call.
///
/// With [`TaskContextProvider`](super::context::TaskContextProvider) inside a task scope
/// the tags follow the task across worker threads. If the returned future is dropped
/// before completion the tags are removed at that point.
pub async fn with_tags_async<I, T, F>(
    store: &TagStore,
    provider: &dyn ContextProvider,
    tags: I,
    future: F,
) -> Result<F::Output, TagError>
where
    I: IntoIterator<Item = T>,
    T: Into<Tag>,
    F: Future,
{
    let _scope = TagScope::enter(store, provider, tags)?;
    Ok(future.await)
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::context::{FixedContextProvider, TaskContextProvider};

    const CTX: FixedContextProvider = FixedContextProvider(ExecutionContextId::new(7));

    fn snapshot(store: &TagStore) -> Vec<(String, String)> {
        store
            .snapshot(CTX.0)
            .into_iter()
            .map(|t| (t.key, t.value))
            .collect()
    }

    #[test]
    fn test_scope_removes_on_drop() {
        let store = TagStore::new();
        {
            let scope = TagScope::enter(&store, &CTX, [("function", "fast")]).expect("valid");
            assert_eq!(scope.context(), CTX.0);
            assert_eq!(snapshot(&store).len(), 1);
        }
        assert!(snapshot(&store).is_empty());
        assert_eq!(store.context_count(), 0);
    }

    #[test]
    fn test_nested_same_pair_survives_inner_exit() {
        let store = TagStore::new();
        let outer = TagScope::enter(&store, &CTX, [("env", "prod")]).expect("valid");
        {
            let _inner = TagScope::enter(&store, &CTX, [("env", "prod")]).expect("valid");
        }
        assert_eq!(
            snapshot(&store),
            vec![("env".to_string(), "prod".to_string())]
        );
        drop(outer);
        assert!(snapshot(&store).is_empty());
    }

    #[test]
    fn test_error_is_propagated_unchanged() {
        let store = TagStore::new();
        let result: Result<Result<(), String>, TagError> =
            with_tags(&store, &CTX, [("step", "parse")], || {
                assert_eq!(snapshot(&store).len(), 1);
                Err("boom".to_string())
            });
        assert_eq!(result.expect("valid tags"), Err("boom".to_string()));
        assert!(snapshot(&store).is_empty());
    }

    #[test]
    fn test_panic_still_cleans_up() {
        let store = TagStore::new();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = with_tags(&store, &CTX, [("step", "explode")], || {
                panic!("body failed");
            });
        }));
        assert!(outcome.is_err());
        assert!(snapshot(&store).is_empty());
    }

    #[test]
    fn test_invalid_tags_add_nothing() {
        let store = TagStore::new();
        let result = with_tags(&store, &CTX, [("ok", "1"), ("", "2")], || ());
        assert!(result.is_err());
        assert!(snapshot(&store).is_empty());
    }

    #[tokio::test]
    async fn test_async_scope_follows_task() {
        let store = TagStore::new();
        let provider = TaskContextProvider;

        TaskContextProvider::scope(async {
            let context = provider.current_id();
            with_tags_async(&store, &provider, [("request", "42")], async {
                tokio::task::yield_now().await;
                assert_eq!(store.snapshot(provider.current_id()).len(), 1);
            })
            .await
            .expect("valid tags");
            assert!(store.snapshot(context).is_empty());
        })
        .await;
    }

    #[tokio::test]
    async fn test_dropped_future_cleans_up() {
        let store = TagStore::new();
        {
            let pending =
                with_tags_async(&store, &CTX, [("job", "slow")], std::future::pending::<()>());
            let timed_out =
                tokio::time::timeout(std::time::Duration::from_millis(10), pending).await;
            assert!(timed_out.is_err());
        }
        assert!(snapshot(&store).is_empty());
    }
}
