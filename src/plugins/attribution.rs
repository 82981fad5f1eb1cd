//! Thread → plugin attribution.
//!
//! Guest code always runs on a thread tagged with its plugin's name, so any
//! side effect (a `print`, a log line) can be traced back by looking up the
//! current thread. Tags are scoped with [`ExecutionTag`] guards.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::ThreadId;

/// Name reported for threads that carry no tag.
pub const UNKNOWN_PLUGIN: &str = "unknown";

/// Shared `ThreadId → plugin name` map.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    tags: RwLock<HashMap<ThreadId, Arc<str>>>,
}

impl ThreadRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plugin owning `thread`, or [`UNKNOWN_PLUGIN`].
    pub fn resolve(&self, thread: ThreadId) -> String {
        self.tags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&thread)
            .map_or_else(|| UNKNOWN_PLUGIN.to_string(), ToString::to_string)
    }

    /// Plugin owning the calling thread.
    pub fn resolve_current(&self) -> String {
        self.resolve(std::thread::current().id())
    }

    /// Number of tagged threads.
    pub fn len(&self) -> usize {
        self.tags.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no thread is tagged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tag the calling thread with `plugin` until the guard drops.
    pub fn tag_current(self: &Arc<Self>, plugin: &str) -> ExecutionTag {
        let thread = std::thread::current().id();
        let previous = self.swap(thread, Some(Arc::from(plugin)));
        ExecutionTag {
            registry: Arc::clone(self),
            thread,
            previous,
            _thread_bound: PhantomData,
        }
    }

    fn swap(&self, thread: ThreadId, tag: Option<Arc<str>>) -> Option<Arc<str>> {
        let mut tags = self.tags.write().unwrap_or_else(PoisonError::into_inner);
        match tag {
            Some(tag) => tags.insert(thread, tag),
            None => tags.remove(&thread),
        }
    }
}

/// Scoped attribution for the current thread.
///
/// Dropping restores whatever tag the thread carried before, so tags nest.
#[must_use = "the tag is removed as soon as the guard drops"]
pub struct ExecutionTag {
    registry: Arc<ThreadRegistry>,
    thread: ThreadId,
    previous: Option<Arc<str>>,
    _thread_bound: PhantomData<*const ()>,
}

impl std::fmt::Debug for ExecutionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionTag")
            .field("thread", &self.thread)
            .field("previous", &self.previous)
            .finish_non_exhaustive()
    }
}

impl Drop for ExecutionTag {
    fn drop(&mut self) {
        self.registry.swap(self.thread, self.previous.take());
    }
}
