//! Keyed trailing-edge debouncer
//!
//! The first trigger for a key opens a window; triggers inside the window are
//! coalesced and the action runs once when it closes. At most one action per
//! key runs at a time. Triggers that land while the action is running
//! schedule exactly one follow-up run, after another window.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Action run when a key's window closes
pub type DebouncedAction<K> = Arc<dyn Fn(K) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Window open, action not started
    Pending,
    /// Action running; `rerun` requests one follow-up
    InFlight { rerun: bool },
}

struct Slot {
    generation: u64,
    phase: Phase,
    cancel: CancellationToken,
}

struct State<K> {
    slots: HashMap<K, Slot>,
    next_generation: u64,
}

pub struct Debouncer<K> {
    window: Duration,
    action: DebouncedAction<K>,
    state: Arc<Mutex<State<K>>>,
    cancel: CancellationToken,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(window: Duration, action: DebouncedAction<K>) -> Self {
        Self {
            window,
            action,
            state: Arc::new(Mutex::new(State {
                slots: HashMap::new(),
                next_generation: 0,
            })),
            cancel: CancellationToken::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Request a run for `key`.
    ///
    /// Returns true when this trigger scheduled new work, false when it was
    /// coalesced into work already scheduled.
    pub fn trigger(&self, key: K) -> bool {
        let mut state = self.state.lock();

        if let Some(slot) = state.slots.get_mut(&key) {
            return match &mut slot.phase {
                Phase::Pending => false,
                Phase::InFlight { rerun } => !std::mem::replace(rerun, true),
            };
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let cancel = self.cancel.child_token();
        state.slots.insert(
            key.clone(),
            Slot {
                generation,
                phase: Phase::Pending,
                cancel: cancel.clone(),
            },
        );
        drop(state);

        trace!(key = ?key, window_ms = self.window.as_millis() as u64, "Debounce window opened");
        tokio::spawn(run_slot(
            key,
            generation,
            self.window,
            self.action.clone(),
            self.state.clone(),
            cancel,
        ));
        true
    }

    /// Drop any pending or follow-up run for `key`
    pub fn cancel(&self, key: &K) {
        if let Some(slot) = self.state.lock().slots.remove(key) {
            slot.cancel.cancel();
        }
    }

    /// Whether `key` has a pending or running action
    pub fn is_active(&self, key: &K) -> bool {
        self.state.lock().slots.contains_key(key)
    }
}

impl<K> Drop for Debouncer<K> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_slot<K>(
    key: K,
    generation: u64,
    window: Duration,
    action: DebouncedAction<K>,
    state: Arc<Mutex<State<K>>>,
    cancel: CancellationToken,
) where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(window) => {}
        }

        {
            let mut slots = state.lock();
            match slots.slots.get_mut(&key) {
                Some(slot) if slot.generation == generation => {
                    slot.phase = Phase::InFlight { rerun: false };
                }
                _ => return,
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = action(key.clone()) => {}
        }

        let mut slots = state.lock();
        let rerun = match slots.slots.get_mut(&key) {
            Some(slot) if slot.generation == generation => match slot.phase {
                Phase::InFlight { rerun: true } => {
                    slot.phase = Phase::Pending;
                    true
                }
                _ => false,
            },
            _ => return,
        };
        if !rerun {
            slots.slots.remove(&key);
            return;
        }
        trace!(key = ?key, "Running follow-up after triggers during flight");
    }
}
