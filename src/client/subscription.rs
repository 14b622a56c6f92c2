use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::{trace, warn};

use crate::{
    callback::GetCallback,
    channel_access::{ChannelAccess, SubscriptionId},
    client::PvId,
};

/// The monitor installed on one client PV
struct MonitorSlot {
    callback: GetCallback,
    subscription: SubscriptionId,
    generation: u64,
}

#[derive(Default)]
struct MonitorState {
    slots: HashMap<PvId, MonitorSlot>,
    next_generation: u64,
}

/// Monitor callbacks and subscriptions of every client PV, behind one lock
///
/// Subscription handlers run on protocol threads and look up the callback here at
/// update time. Each installation gets a fresh generation; an update or queued event
/// carrying an older generation belongs to a replaced monitor and is dropped.
#[derive(Clone, Default)]
pub(crate) struct MonitorTable {
    state: Arc<Mutex<MonitorState>>,
}

pub(crate) struct MonitorGuard<'a> {
    state: std::sync::MutexGuard<'a, MonitorState>,
}

impl MonitorTable {
    /// Hold the monitor lock across a clear-then-install sequence
    pub fn lock(&self) -> MonitorGuard<'_> {
        MonitorGuard {
            state: self.state.lock().unwrap(),
        }
    }

    /// The callback to use for an update of generation `generation`, if still current
    pub fn current_callback(&self, pv: PvId, generation: u64) -> Option<GetCallback> {
        let state = self.state.lock().unwrap();
        state
            .slots
            .get(&pv)
            .filter(|slot| slot.generation == generation)
            .map(|slot| slot.callback.clone())
    }

    pub fn is_current(&self, pv: PvId, generation: u64) -> bool {
        let state = self.state.lock().unwrap();
        state
            .slots
            .get(&pv)
            .is_some_and(|slot| slot.generation == generation)
    }

    pub fn has_monitor(&self, pv: PvId) -> bool {
        self.state.lock().unwrap().slots.contains_key(&pv)
    }
}

impl MonitorGuard<'_> {
    /// Clear and forget the subscription of `pv`, if there is one
    pub fn clear(&mut self, pv: PvId, access: &dyn ChannelAccess) {
        if let Some(old) = self.state.slots.remove(&pv) {
            trace!("Clearing monitor generation {} of {pv}", old.generation);
            if let Err(e) = access.clear_subscription(old.subscription) {
                warn!("Failed to clear subscription of {pv}: {e}");
            }
        }
    }

    /// Reserve the generation for the next installation
    pub fn next_generation(&mut self) -> u64 {
        self.state.next_generation += 1;
        self.state.next_generation
    }

    pub fn install(
        &mut self,
        pv: PvId,
        callback: GetCallback,
        subscription: SubscriptionId,
        generation: u64,
    ) {
        self.state.slots.insert(
            pv,
            MonitorSlot {
                callback,
                subscription,
                generation,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::Callback;

    #[test]
    fn generations_supersede() {
        let table = MonitorTable::default();
        let pv = PvId(1);
        let first = {
            let mut guard = table.lock();
            let generation = guard.next_generation();
            guard.install(pv, Callback::new(|_, _| Ok(())), SubscriptionId(1), generation);
            generation
        };
        assert!(table.is_current(pv, first));
        let second = {
            let mut guard = table.lock();
            let generation = guard.next_generation();
            guard.install(pv, Callback::new(|_, _| Ok(())), SubscriptionId(2), generation);
            generation
        };
        assert!(second > first);
        assert!(!table.is_current(pv, first));
        assert!(table.current_callback(pv, first).is_none());
        assert!(table.current_callback(pv, second).is_some());
        assert!(!table.is_current(PvId(2), second));
    }
}
