//
// Copyright 2024 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Downstream notifications.
//!
//! The service publishes to typed channels and downstream consumers
//! subscribe at construction, so neither side owns the other. Callbacks run
//! synchronously on the firing thread; a callback that needs real work
//! should hand off to its own executor.

use std::sync::{Arc, Mutex, Weak};

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct EventState {
    callbacks: Vec<(u64, Callback)>,
    next_id: u64,
}

/// An event that can fire on any thread and synchronously runs its
/// callbacks when it does.
#[derive(Default)]
pub struct ObservableEvent {
    state: Arc<Mutex<EventState>>,
}

impl ObservableEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every subscribed callback before returning.
    ///
    /// Callbacks run outside the subscription lock, so a callback may
    /// subscribe or unsubscribe without deadlocking; such changes take
    /// effect on the next fire.
    pub fn fire(&self) {
        let callbacks: Vec<Callback> = {
            let state = self.state.lock().expect("not poisoned");
            state.callbacks.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Adds a callback that runs on every fire until the returned
    /// subscription is dropped.
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> EventSubscription {
        let mut state = self.state.lock().expect("not poisoned");
        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.push((id, Arc::new(callback)));
        EventSubscription {
            state: Arc::downgrade(&self.state),
            id,
        }
    }
}

/// Handle for a callback registered with [`ObservableEvent::subscribe`].
///
/// Dropping it removes the callback.
#[must_use]
pub struct EventSubscription {
    state: Weak<Mutex<EventState>>,
    id: u64,
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.lock().expect("not poisoned");
        state.callbacks.retain(|(id, _)| *id != self.id);
    }
}

/// The channels the key backup service publishes to.
#[derive(Default)]
pub struct KeyBackupEvents {
    /// The storage service manifest no longer decrypts and must be rebuilt
    /// or re-fetched: the master key changed or the storage service key
    /// rotated.
    pub manifest_needs_rebuild: ObservableEvent,
    /// Linked devices need to be sent fresh keys.
    pub send_keys_sync_message: ObservableEvent,
}
