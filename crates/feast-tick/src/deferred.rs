//! Keyed, cancellable delayed tasks.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time;

/// Identifies one scheduled task within its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

struct Pending<K> {
    next_id: u64,
    tasks: HashMap<K, HashMap<TaskId, AbortHandle>>,
}

/// Delayed tasks grouped by key.
///
/// A task is cancellable only while it is still waiting out its delay.
/// Once the delay elapses it removes itself from the group and runs to
/// completion, so cancelling a group from inside one of its own tasks
/// never aborts the caller.
pub struct DeferredTasks<K> {
    pending: Arc<Mutex<Pending<K>>>,
}

impl<K> DeferredTasks<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(Pending {
                next_id: 0,
                tasks: HashMap::new(),
            })),
        }
    }

    fn lock(pending: &Mutex<Pending<K>>) -> MutexGuard<'_, Pending<K>> {
        pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `task` after `delay` unless the key is cancelled first.
    pub fn schedule<F>(&self, key: K, delay: Duration, task: F) -> TaskId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending = Self::lock(&self.pending);
        pending.next_id += 1;
        let id = TaskId(pending.next_id);

        let shared = Arc::clone(&self.pending);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            if !Self::claim(&shared, &task_key, id) {
                return;
            }
            task.await;
        });

        // Registered before the guard drops, so claim() always finds it.
        pending
            .tasks
            .entry(key)
            .or_default()
            .insert(id, handle.abort_handle());
        id
    }

    fn claim(pending: &Mutex<Pending<K>>, key: &K, id: TaskId) -> bool {
        let mut pending = Self::lock(pending);
        let Some(group) = pending.tasks.get_mut(key) else {
            return false;
        };
        let claimed = group.remove(&id).is_some();
        if group.is_empty() {
            pending.tasks.remove(key);
        }
        claimed
    }

    /// Cancels every waiting task under `key`. Returns how many.
    pub fn cancel(&self, key: &K) -> usize {
        let group = Self::lock(&self.pending).tasks.remove(key);
        let Some(group) = group else {
            return 0;
        };
        for handle in group.values() {
            handle.abort();
        }
        tracing::trace!(cancelled = group.len(), "deferred tasks cancelled");
        group.len()
    }

    /// Cancels one waiting task. Returns whether it was still waiting.
    pub fn cancel_task(&self, key: &K, id: TaskId) -> bool {
        let mut pending = Self::lock(&self.pending);
        let Some(group) = pending.tasks.get_mut(key) else {
            return false;
        };
        let Some(handle) = group.remove(&id) else {
            return false;
        };
        handle.abort();
        if group.is_empty() {
            pending.tasks.remove(key);
        }
        true
    }

    /// Number of tasks still waiting under `key`.
    pub fn pending(&self, key: &K) -> usize {
        Self::lock(&self.pending)
            .tasks
            .get(key)
            .map_or(0, HashMap::len)
    }

    /// Whether no task is waiting under any key.
    pub fn is_empty(&self) -> bool {
        Self::lock(&self.pending).tasks.is_empty()
    }
}

impl<K> Default for DeferredTasks<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for DeferredTasks<K> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
        }
    }
}
