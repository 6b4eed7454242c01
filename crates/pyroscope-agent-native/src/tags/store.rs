//! Concurrent tag store.
//!
//! The store maps each [`ExecutionContextId`] to an ordered multiset of tags and keeps a
//! separate multiset of global (process-wide) tags. It is the only mutable structure
//! shared between caller threads and the sampler.
//!
//! # Locking
//!
//! - The context map sits behind an `RwLock`, but every context owns its own `Mutex`.
//!   Mutations take the map lock only long enough to find (or create) the context's
//!   entry, so callers on different contexts never wait on each other's mutations.
//! - A mutation and a [`TagStore::snapshot`] of the same context serialize on that
//!   context's mutex, and batch operations ([`TagStore::add_tags`] /
//!   [`TagStore::remove_tags`]) apply under one acquisition. The sampler therefore never
//!   observes half of a scope's tag set.
//! - Global tags have their own `RwLock`.
//!
//! Every mutation and snapshot first runs the store's [`ForkHook`], so a forked child
//! that only touches tags still gets its agent's fork decision applied before the
//! operation proceeds.
//!
//! Lock poisoning is ignored: a caller that panics while holding a lock leaves the data
//! in a consistent state (every critical section is a single push, remove or clone), so
//! the store keeps serving everyone else.
//!
//! # Multiset semantics
//!
//! Adding the same pair twice stores it twice. Removal takes out the most recently added
//! occurrence of the exact `(key, value)` pair, so nested scopes that tag the same pair
//! keep it visible until the outermost one exits. Nested scopes using the same key with
//! *different* values each remove only their own pair; which value a snapshot lists
//! first while both are live follows insertion order.

use std::collections::HashMap;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};

use tracing::trace;

use crate::config::Config;
use crate::fork::{ForkHook, ForkObserver};
use crate::tags::{ExecutionContextId, Tag, TagError};

type ContextTags = Arc<Mutex<Vec<Tag>>>;

#[derive(Debug, Default)]
pub struct TagStore {
    /// Process-wide tags, listed first in every snapshot.
    global: RwLock<Vec<Tag>>,

    /// Per-context tags. Entries are dropped once their last tag is removed.
    contexts: RwLock<HashMap<ExecutionContextId, ContextTags>>,

    /// Points back at the agent owning this store.
    fork: ForkHook,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the most recent occurrence of `tag`. Returns false when absent.
fn remove_last(tags: &mut Vec<Tag>, tag: &Tag) -> bool {
    match tags.iter().rposition(|t| t == tag) {
        Some(position) => {
            tags.remove(position);
            true
        }
        None => false,
    }
}

impl TagStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers who applies the fork decision when this store is first touched in a
    /// forked child. A later registration replaces the earlier one.
    pub fn set_fork_observer(&self, observer: Weak<dyn ForkObserver>) {
        self.fork.set_observer(observer);
    }

    /// Adds one tag to `context`.
    pub fn add_tag(
        &self,
        context: ExecutionContextId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), TagError> {
        self.add_tags(context, &[Tag::new(key, value)])
    }

    /// Adds every tag to `context` atomically with respect to snapshots of `context`.
    ///
    /// Nothing is added if any tag is invalid.
    pub fn add_tags(&self, context: ExecutionContextId, tags: &[Tag]) -> Result<(), TagError> {
        self.fork.check();
        for tag in tags {
            tag.validate()?;
        }
        if tags.is_empty() {
            return Ok(());
        }

        let entry = self.entry(context);
        lock(&entry).extend_from_slice(tags);
        trace!(context = %context, count = tags.len(), "added context tags");
        Ok(())
    }

    /// Removes the most recently added occurrence of the exact `(key, value)` pair from
    /// `context`. Returns false when the pair was not present.
    pub fn remove_tag(&self, context: ExecutionContextId, key: &str, value: &str) -> bool {
        self.remove_tags(context, &[Tag::new(key, value)]) == 1
    }

    /// Removes one occurrence of every tag (in reverse order, so a batch undoes a
    /// matching [`TagStore::add_tags`]). Returns how many were present.
    pub fn remove_tags(&self, context: ExecutionContextId, tags: &[Tag]) -> usize {
        self.fork.check();
        let Some(entry) = read(&self.contexts).get(&context).cloned() else {
            return 0;
        };

        let (removed, now_empty) = {
            let mut current = lock(&entry);
            let removed = tags
                .iter()
                .rev()
                .filter(|tag| remove_last(&mut current, tag))
                .count();
            (removed, current.is_empty())
        };
        drop(entry);

        if now_empty {
            self.prune(context);
        }
        trace!(context = %context, removed, "removed context tags");
        removed
    }

    pub fn add_global_tag(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), TagError> {
        self.fork.check();
        let tag = Tag::new(key, value);
        tag.validate()?;
        write(&self.global).push(tag);
        Ok(())
    }

    /// Removes the most recently added occurrence of the exact global pair.
    pub fn remove_global_tag(&self, key: &str, value: &str) -> bool {
        self.fork.check();
        remove_last(&mut write(&self.global), &Tag::new(key, value))
    }

    /// Swaps one set of global tags for another under a single lock acquisition, so no
    /// snapshot lists both or neither.
    pub fn replace_global_tags(&self, old: &[Tag], new: &[Tag]) -> Result<(), TagError> {
        self.fork.check();
        for tag in new {
            tag.validate()?;
        }
        let mut global = write(&self.global);
        for tag in old.iter().rev() {
            remove_last(&mut global, tag);
        }
        global.extend_from_slice(new);
        Ok(())
    }

    /// Global tags followed by the tags of `context`, in insertion order. Duplicates are
    /// kept.
    #[must_use]
    pub fn snapshot(&self, context: ExecutionContextId) -> Vec<Tag> {
        self.fork.check();
        let mut tags = read(&self.global).clone();
        let entry = read(&self.contexts).get(&context).cloned();
        if let Some(entry) = entry {
            tags.extend(lock(&entry).iter().cloned());
        }
        tags
    }

    /// [`TagStore::snapshot`] decorated with the process metadata the configuration asks
    /// the sampler to report (`pid`, `thread_id`).
    #[must_use]
    pub fn snapshot_with_process(&self, context: ExecutionContextId, config: &Config) -> Vec<Tag> {
        let mut tags = self.snapshot(context);
        if config.report_pid {
            tags.push(Tag::new("pid", std::process::id().to_string()));
        }
        if config.report_thread_id {
            tags.push(Tag::new("thread_id", context.to_string()));
        }
        tags
    }

    #[must_use]
    pub fn global_tags(&self) -> Vec<Tag> {
        read(&self.global).clone()
    }

    /// Number of contexts currently holding at least one tag.
    #[must_use]
    pub fn context_count(&self) -> usize {
        read(&self.contexts).len()
    }

    /// Drops every tag of `context`. Returns how many were dropped.
    pub fn clear_context(&self, context: ExecutionContextId) -> usize {
        self.fork.check();
        write(&self.contexts)
            .remove(&context)
            .map_or(0, |entry| lock(&entry).len())
    }

    /// Returns the entry for `context`, creating it if needed.
    fn entry(&self, context: ExecutionContextId) -> ContextTags {
        if let Some(entry) = read(&self.contexts).get(&context) {
            return Arc::clone(entry);
        }
        Arc::clone(write(&self.contexts).entry(context).or_default())
    }

    /// Drops the entry for `context` if it is empty and nobody else holds it.
    ///
    /// Holders clone the entry under the map lock, so with the write lock held a strong
    /// count of 1 means no concurrent mutation can still land in it.
    fn prune(&self, context: ExecutionContextId) {
        let mut contexts = write(&self.contexts);
        let unused = contexts
            .get(&context)
            .is_some_and(|entry| Arc::strong_count(entry) == 1 && lock(entry).is_empty());
        if unused {
            contexts.remove(&context);
        }
    }
}
