//! Engine notifications for presentation layers: listening state, per-profile
//! state, fires and failures. Delivered over a broadcast channel; the core
//! never waits on subscribers.

use tokio::sync::broadcast;
use tracing::trace;

use crate::arbiter::TriggerEvent;
use crate::audio::capture::DeviceError;
use crate::profile::ProfileId;
use crate::state_machine::{ListenState, ProfileState};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    ListenStateChanged(ListenState),
    ProfileStateChanged {
        profile: ProfileId,
        state: ProfileState,
    },
    TriggerFired(TriggerEvent),
    DispatchFailed {
        profile: ProfileId,
        error: String,
    },
    DeviceFailed(DeviceError),
}

#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish to current subscribers. Lagging subscribers lose the oldest events.
    pub fn publish(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            trace!("event_dropped_no_subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}
