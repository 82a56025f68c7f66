//! Listening state (Idle ⇄ Listening) and per-profile lifecycle states.
//! Transitions are validated; listeners observe the global state through a watch channel.

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

/// Global engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ListenState {
    Idle,
    Listening,
}

impl std::fmt::Display for ListenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenState::Idle => write!(f, "Idle"),
            ListenState::Listening => write!(f, "Listening"),
        }
    }
}

impl ListenState {
    pub fn can_transition_to(self, next: ListenState) -> bool {
        matches!(
            (self, next),
            (ListenState::Idle, ListenState::Listening) | (ListenState::Listening, ListenState::Idle)
        )
    }
}

/// Lifecycle of a single profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProfileState {
    Untrained,
    Training,
    Ready,
    Disabled,
    Error,
}

impl std::fmt::Display for ProfileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfileState::Untrained => write!(f, "Untrained"),
            ProfileState::Training => write!(f, "Training"),
            ProfileState::Ready => write!(f, "Ready"),
            ProfileState::Disabled => write!(f, "Disabled"),
            ProfileState::Error => write!(f, "Error"),
        }
    }
}

impl ProfileState {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: ProfileState) -> bool {
        matches!(
            (self, next),
            (ProfileState::Untrained, ProfileState::Training)
                | (ProfileState::Training, ProfileState::Ready)
                | (ProfileState::Training, ProfileState::Disabled) // trained while disabled
                | (ProfileState::Ready, ProfileState::Disabled)
                | (ProfileState::Disabled, ProfileState::Ready)
                | (ProfileState::Ready, ProfileState::Training) // re-train
                | (ProfileState::Disabled, ProfileState::Training)
                | (ProfileState::Error, ProfileState::Training)
                // training or matching failure
                | (_, ProfileState::Error)
        )
    }

    /// Only `Ready` profiles take part in a detection cycle.
    pub fn is_evaluated(self) -> bool {
        self == ProfileState::Ready
    }
}

/// Listening state held in a watch channel; the sender is the source of truth.
pub struct ListenStateMachine {
    tx: watch::Sender<ListenState>,
}

impl Default for ListenStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenStateMachine {
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(ListenState::Idle),
        }
    }

    pub fn current(&self) -> ListenState {
        *self.tx.borrow()
    }

    pub fn is_listening(&self) -> bool {
        self.current() == ListenState::Listening
    }

    /// Validated transition; subscribers are woken only on success.
    pub fn transition(&self, next: ListenState) -> Result<ListenState, String> {
        let mut rejected = None;
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                info!(from = %state, to = %next, "listen_state_transition");
                *state = next;
                true
            } else {
                rejected = Some(*state);
                false
            }
        });
        match rejected {
            None => Ok(next),
            Some(from) => {
                warn!(from = %from, to = %next, "listen_state_transition_rejected");
                Err(format!("invalid transition: {from} -> {next}"))
            }
        }
    }

    /// Go to `Idle` whatever the current state; returns the state it left.
    pub fn force_idle(&self) -> ListenState {
        let mut prev = ListenState::Idle;
        self.tx.send_if_modified(|state| {
            prev = std::mem::replace(state, ListenState::Idle);
            prev != ListenState::Idle
        });
        if prev != ListenState::Idle {
            info!(from = %prev, "force_idle");
        }
        prev
    }

    pub fn subscribe(&self) -> watch::Receiver<ListenState> {
        self.tx.subscribe()
    }
}
