/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The state change queue: an ordered log of device-application state deltas with
//! monotonic ids, debounced upload notification, and an acknowledged watermark.
//!
//! Stores an ordered `Vec<StateChange>` plus a `HashMap<String, usize>` index from property path
//! to its most recent slot, so coalescing consecutive writes to the same property is an O(1)
//! overwrite instead of a queue scan.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde_json::Value;

use crate::scheduler::TaskRunner;

/// Minimum time between debounced notifications to the uploader.
pub const DEBOUNCE: Duration = Duration::from_millis(250);

/// One property write. `id` is the queue's monotonic change id at the
/// time this entry was recorded.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub id: u64,
    pub property_path: String,
    pub value: Value,
    pub timestamp: SystemTime,
}

struct Inner {
    entries: Vec<StateChange>,
    index: HashMap<String, usize>,
    last_state_change_id: u64,
    acknowledged: u64,
}

/// Callback invoked (debounced) whenever new changes land, so an uploader can schedule an upload
/// pass. Only a single listener (the uploader) is expected to subscribe at a time.
pub trait ChangeListener: Send + Sync {
    fn on_changes(&self);
}

/// The ordered state-change log.
pub struct StateChangeQueue {
    inner: Mutex<Inner>,
    listener: Mutex<Option<Arc<dyn ChangeListener>>>,
    task_runner: Arc<dyn TaskRunner>,
    // `Arc` (not plain `Mutex<bool>` on `self`) because the debounced closure handed to
    // `TaskRunner::post_delayed` must be `'static` and outlive any particular `&self` borrow; it
    // instead holds its own clone of this flag and clears it once it actually runs.
    debounce_pending: Arc<Mutex<bool>>,
}

impl StateChangeQueue {
    pub fn new(task_runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                index: HashMap::new(),
                last_state_change_id: 0,
                acknowledged: 0,
            }),
            listener: Mutex::new(None),
            task_runner,
            debounce_pending: Arc::new(Mutex::new(false)),
        }
    }

    /// Subscribe the one allowed listener. Replaces any previous subscriber.
    pub fn subscribe(&self, listener: Arc<dyn ChangeListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Record a property write, coalescing with any not-yet-acknowledged write to the same
    /// property path, and return the change id assigned to it.
    pub fn notify(&self, property_path: impl Into<String>, value: Value, timestamp: SystemTime) -> u64 {
        let property_path = property_path.into();
        let id = {
            let mut inner = self.inner.lock();
            inner.last_state_change_id += 1;
            let id = inner.last_state_change_id;
            let change = StateChange { id, property_path: property_path.clone(), value, timestamp };
            match inner.index.get(&property_path).copied() {
                Some(slot) => inner.entries[slot] = change,
                None => {
                    let slot = inner.entries.len();
                    inner.entries.push(change);
                    inner.index.insert(property_path, slot);
                }
            }
            id
        };
        self.schedule_notification();
        id
    }

    /// Debounce notifications to the subscribed listener. Uses the task-loop's `post_delayed`
    /// rather than blocking, consistent with the cooperative scheduling model the rest of this
    /// crate runs on. While a notification is already scheduled, further calls are no-ops — the
    /// changes themselves are already recorded by `notify`, only the listener wakeup is coalesced.
    fn schedule_notification(&self) {
        let mut pending = self.debounce_pending.lock();
        if *pending {
            return;
        }
        let Some(listener) = self.listener.lock().clone() else {
            return;
        };
        *pending = true;
        let debounce_pending = self.debounce_pending.clone();
        self.task_runner.post_delayed(
            Box::new(move || {
                *debounce_pending.lock() = false;
                listener.on_changes();
            }),
            DEBOUNCE,
        );
    }

    /// A consistent snapshot of the current value for every property ever notified.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .map(|c| (c.property_path.clone(), c.value.clone()))
            .collect()
    }

    /// All changes with id greater than `change_id`, in insertion order.
    pub fn get_since(&self, change_id: u64) -> Vec<StateChange> {
        let inner = self.inner.lock();
        inner.entries.iter().filter(|c| c.id > change_id).cloned().collect()
    }

    pub fn last_state_change_id(&self) -> u64 {
        self.inner.lock().last_state_change_id
    }

    /// Advance the acknowledged watermark after a successful upload.
    /// Entries at or below the watermark become eligible for compaction by a future `clear_up_to`.
    pub fn acknowledge(&self, change_id: u64) {
        let mut inner = self.inner.lock();
        if change_id > inner.acknowledged {
            inner.acknowledged = change_id;
        }
    }

    pub fn acknowledged(&self) -> u64 {
        self.inner.lock().acknowledged
    }

    /// Compact entries at or below `change_id`, preserving the last-seen value for every
    /// currently-valid property. Entries above the watermark, or whose
    /// property path's sole entry is being compacted, are always kept regardless of id so the
    /// current value of every property survives.
    pub fn clear_up_to(&self, change_id: u64) {
        let mut inner = self.inner.lock();
        // Because `notify` already coalesces per property path, `inner.index` already names the
        // one surviving slot for each currently-valid property — compaction only needs to drop
        // entries that are both below the watermark and not that slot.
        let surviving_slots: std::collections::HashSet<usize> = inner.index.values().copied().collect();
        let mut final_entries = Vec::new();
        let mut index = HashMap::new();
        for (slot, change) in std::mem::take(&mut inner.entries).into_iter().enumerate() {
            if change.id > change_id || surviving_slots.contains(&slot) {
                let new_slot = final_entries.len();
                index.insert(change.property_path.clone(), new_slot);
                final_entries.push(change);
            }
        }
        inner.entries = final_entries;
        inner.index = index;
    }
}
