//! Per-service busy lock.
//!
//! Every lifecycle operation on a service holds that service's slot for its
//! whole duration, so operations on the same id serialize while distinct ids
//! run concurrently. A slot carries two independent pieces of state:
//!
//! - `locked`: whether an operation is in flight
//! - `action_tag`: what kind of operation it is (`"resume"`, `"stop"`, ...)
//!
//! The tag outlives the lock on purpose: the runtime's exit watcher may fire
//! right after a stop released the slot and still needs to see `"stop"` to
//! know the exit was requested. Release order is always unlock, then clear.
//!
//! All map mutations happen under a synchronous `parking_lot` mutex that is
//! never held across an `.await`.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{oneshot, watch};

pub const ACTION_RESUME: &str = "resume";
pub const ACTION_STOP: &str = "stop";
pub const ACTION_FORCE_STOP: &str = "forceStop";
pub const ACTION_DELETE: &str = "delete";
pub const ACTION_UPDATE: &str = "update";

/// What waiters observe when a slot is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockOutcome {
    pub id: String,
    pub action: Option<String>,
    pub error: Option<String>,
}

#[derive(Default)]
struct LockEntry {
    locked: bool,
    action_tag: Option<String>,
    waiters: VecDeque<oneshot::Sender<UnlockOutcome>>,
}

impl LockEntry {
    fn is_idle(&self) -> bool {
        !self.locked && self.action_tag.is_none() && self.waiters.is_empty()
    }
}

pub struct BusyLock {
    entries: Mutex<HashMap<String, LockEntry>>,
    stopping: AtomicBool,
    /// Number of currently locked slots, for the global barrier.
    held: watch::Sender<usize>,
}

impl BusyLock {
    pub fn new() -> Self {
        let (held, _) = watch::channel(0);
        Self {
            entries: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            held,
        }
    }

    /// Acquire the slot for `id`, tagging it with `action`.
    ///
    /// Fails with [`Error::Conflict`] if the slot is held, unless the node is
    /// shutting down, in which case teardown may proceed over a pending action.
    pub fn lock(&self, id: &str, action: &str) -> Result<BusyGuard<'_>> {
        {
            let mut entries = self.entries.lock();
            let entry = entries.entry(id.to_string()).or_default();
            if entry.locked && !self.is_stopping() {
                let pending = entry.action_tag.clone().unwrap_or_default();
                return Err(Error::Conflict(format!(
                    "service '{}' is busy ({})",
                    id, pending
                )));
            }
            entry.locked = true;
            entry.action_tag = Some(action.to_string());
            self.publish_held(&entries);
        }
        tracing::trace!("busy lock acquired for '{}' ({})", id, action);

        Ok(BusyGuard {
            lock: self,
            id: id.to_string(),
            clear_tag: false,
            released: false,
        })
    }

    /// Release the slot and notify every waiter, oldest first.
    ///
    /// The action tag is left in place; see [`BusyLock::clear_action_tag`].
    pub fn unlock(&self, id: &str, error: Option<String>) {
        let (waiters, outcome) = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(id) else {
                return;
            };
            entry.locked = false;
            let outcome = UnlockOutcome {
                id: id.to_string(),
                action: entry.action_tag.clone(),
                error,
            };
            let waiters = std::mem::take(&mut entry.waiters);
            if entry.is_idle() {
                entries.remove(id);
            }
            self.publish_held(&entries);
            (waiters, outcome)
        };

        for waiter in waiters {
            // A dropped receiver just means nobody is waiting any more
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Resolve immediately if `id` is unlocked, otherwise at its next release.
    pub async fn when_unlocked(&self, id: &str) -> UnlockOutcome {
        let rx = {
            let mut entries = self.entries.lock();
            match entries.get_mut(id) {
                Some(entry) if entry.locked => {
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push_back(tx);
                    rx
                }
                other => {
                    return UnlockOutcome {
                        id: id.to_string(),
                        action: other.and_then(|e| e.action_tag.clone()),
                        error: None,
                    }
                }
            }
        };

        rx.await.unwrap_or_else(|_| UnlockOutcome {
            id: id.to_string(),
            action: None,
            error: None,
        })
    }

    /// Resolve once no service holds its slot.
    pub async fn when_unlocked_all(&self) {
        let mut rx = self.held.subscribe();
        // The sender lives as long as `self`, so this only errs if we are dropped
        let _ = rx.wait_for(|held| *held == 0).await;
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.entries.lock().get(id).is_some_and(|e| e.locked)
    }

    pub fn set_action_tag(&self, id: &str, action: &str) {
        self.entries
            .lock()
            .entry(id.to_string())
            .or_default()
            .action_tag = Some(action.to_string());
    }

    pub fn action_tag(&self, id: &str) -> Option<String> {
        self.entries.lock().get(id).and_then(|e| e.action_tag.clone())
    }

    pub fn clear_action_tag(&self, id: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(id) {
            entry.action_tag = None;
            if entry.is_idle() {
                entries.remove(id);
            }
        }
    }

    /// Enter or leave the global shutdown state.
    pub fn set_stopping(&self, stopping: bool) {
        self.stopping.store(stopping, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn publish_held(&self, entries: &HashMap<String, LockEntry>) {
        let held = entries.values().filter(|e| e.locked).count();
        self.held.send_replace(held);
    }
}

impl Default for BusyLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds a service's slot; releases it on [`BusyGuard::release`] or drop.
#[must_use = "dropping the guard releases the busy lock immediately"]
pub struct BusyGuard<'a> {
    lock: &'a BusyLock,
    id: String,
    clear_tag: bool,
    released: bool,
}

impl BusyGuard<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Also clear the action tag, after the unlock, when this guard releases.
    pub fn clear_tag_on_release(mut self) -> Self {
        self.clear_tag = true;
        self
    }

    /// Release the slot, handing `error` to waiters.
    pub fn release(mut self, error: Option<String>) {
        self.finish(error);
    }

    fn finish(&mut self, error: Option<String>) {
        if self.released {
            return;
        }
        self.released = true;
        self.lock.unlock(&self.id, error);
        if self.clear_tag {
            self.lock.clear_action_tag(&self.id);
        }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.finish(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn second_lock_conflicts() {
        let lock = BusyLock::new();
        let guard = lock.lock("a", ACTION_RESUME).unwrap();
        let err = lock.lock("a", ACTION_STOP).err().unwrap();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("resume"));
        // Other ids are unaffected
        drop(lock.lock("b", ACTION_RESUME).unwrap());
        guard.release(None);
        assert!(!lock.is_locked("a"));
    }

    #[test]
    fn stopping_bypasses_pending_check() {
        let lock = BusyLock::new();
        let _first = lock.lock("a", ACTION_RESUME).unwrap();
        lock.set_stopping(true);
        let second = lock.lock("a", ACTION_FORCE_STOP).unwrap();
        assert_eq!(lock.action_tag("a").as_deref(), Some(ACTION_FORCE_STOP));
        second.release(None);
    }

    #[test]
    fn tag_survives_unlock_until_cleared() {
        let lock = BusyLock::new();
        let guard = lock.lock("a", ACTION_STOP).unwrap();
        guard.release(None);
        assert!(!lock.is_locked("a"));
        assert_eq!(lock.action_tag("a").as_deref(), Some(ACTION_STOP));
        lock.clear_action_tag("a");
        assert_eq!(lock.action_tag("a"), None);
    }

    #[test]
    fn guard_can_clear_tag_after_unlock() {
        let lock = BusyLock::new();
        let guard = lock.lock("a", ACTION_STOP).unwrap().clear_tag_on_release();
        drop(guard);
        assert!(!lock.is_locked("a"));
        assert_eq!(lock.action_tag("a"), None);
    }

    #[tokio::test]
    async fn waiters_fire_in_order_with_outcome() {
        let lock = Arc::new(BusyLock::new());
        let guard = lock.lock("a", ACTION_RESUME).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let outcome = lock.when_unlocked("a").await;
                order.lock().push(i);
                outcome
            }));
            // Let each waiter enqueue before the next one
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        guard.release(Some("boom".to_string()));
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert_eq!(outcome.action.as_deref(), Some(ACTION_RESUME));
            assert_eq!(outcome.error.as_deref(), Some("boom"));
        }
        assert_eq!(order.lock().len(), 3);
    }

    #[tokio::test]
    async fn when_unlocked_resolves_immediately_when_free() {
        let lock = BusyLock::new();
        let outcome = lock.when_unlocked("nobody").await;
        assert_eq!(outcome.error, None);
    }

    #[tokio::test]
    async fn when_unlocked_all_waits_for_every_slot() {
        let lock = Arc::new(BusyLock::new());
        let a = lock.lock("a", ACTION_RESUME).unwrap();
        let b = lock.lock("b", ACTION_RESUME).unwrap();

        let barrier = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.when_unlocked_all().await })
        };

        a.release(None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!barrier.is_finished());
        b.release(None);
        tokio::time::timeout(Duration::from_secs(1), barrier)
            .await
            .expect("barrier should resolve once all slots are free")
            .unwrap();
    }
}
