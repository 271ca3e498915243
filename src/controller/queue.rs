//! Per-key serialized work queue.
//!
//! A key is in at most one of three places: pending (waiting for a worker),
//! active (held by a worker) or neither. Adding a pending key is a no-op;
//! adding an active key marks it dirty so it is queued again once the worker
//! calls [`WorkQueue::done`]. No two workers ever hold the same key.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::controller::ResourceKey;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<ResourceKey>,
    queued: HashSet<ResourceKey>,
    active: HashSet<ResourceKey>,
    dirty: HashSet<ResourceKey>,
    shut_down: bool,
}

/// Outcome of [`WorkQueue::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Added to the end of the queue
    Queued,
    /// Already waiting in the queue
    Deduplicated,
    /// Being processed; it will be queued again when the worker is done
    Deferred,
    /// The queue is shut down
    Rejected,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: ResourceKey) -> Enqueued {
        let outcome = {
            let mut state = self.lock();
            if state.shut_down {
                Enqueued::Rejected
            } else if state.queued.contains(&key) {
                Enqueued::Deduplicated
            } else if state.active.contains(&key) {
                state.dirty.insert(key);
                Enqueued::Deferred
            } else {
                state.queued.insert(key.clone());
                state.pending.push_back(key);
                Enqueued::Queued
            }
        };

        if outcome == Enqueued::Queued {
            self.notify.notify_one();
        }
        outcome
    }

    /// Wait for the next key and mark it active. Returns `None` once the
    /// queue is shut down.
    pub async fn next(&self) -> Option<ResourceKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent add is not missed
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shut_down {
                    return None;
                }
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    let more = !state.pending.is_empty();
                    drop(state);
                    if more {
                        // Pass the wakeup on to another idle worker
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release a key taken with [`WorkQueue::next`]. Returns `true` when the
    /// key was dirty and has been queued again.
    pub fn done(&self, key: &ResourceKey) -> bool {
        let requeued = {
            let mut state = self.lock();
            state.active.remove(key);
            if state.dirty.remove(key) && !state.shut_down {
                state.queued.insert(key.clone());
                state.pending.push_back(key.clone());
                true
            } else {
                false
            }
        };

        if requeued {
            self.notify.notify_one();
        }
        requeued
    }

    /// Stop handing out keys. Returns every key that was waiting, including
    /// dirty keys whose re-run will now never happen.
    pub fn shutdown(&self) -> Vec<ResourceKey> {
        let abandoned = {
            let mut state = self.lock();
            state.shut_down = true;
            state.queued.clear();
            let mut abandoned: Vec<ResourceKey> = state.pending.drain(..).collect();
            let mut dirty: Vec<ResourceKey> = state.dirty.drain().collect();
            dirty.sort();
            abandoned.extend(dirty);
            abandoned
        };
        self.notify.notify_waiters();
        abandoned
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }
}
