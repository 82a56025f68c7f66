//! Registration-ordered store of profiles and their lifecycle states.
//! Read concurrently by the evaluation thread; mutated by training, settings
//! changes and fire commits under a short write lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::events::{EngineEvent, EventHub};
use crate::features::{FeatureExtractor, FeatureMatrix};
use crate::profile::{
    cooldown_permits, Profile, ProfileError, ProfileId, ProfileSettings, Reference, TrainError,
};
use crate::state_machine::ProfileState;

struct Entry {
    profile: Profile,
    state: ProfileState,
}

impl Entry {
    fn settled_state(&self) -> ProfileState {
        match (self.profile.is_trained(), self.profile.is_enabled()) {
            (false, _) => ProfileState::Untrained,
            (true, true) => ProfileState::Ready,
            (true, false) => ProfileState::Disabled,
        }
    }
}

/// What the arbiter needs from a `Ready` profile for one cycle.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: ProfileId,
    pub name: String,
    pub reference: Arc<FeatureMatrix>,
    pub distance_threshold: f32,
    pub min_volume: f32,
    pub cooldown: Duration,
    pub last_fire: Option<Instant>,
}

pub struct TemplateStore {
    entries: RwLock<Vec<Entry>>,
    events: EventHub,
}

impl TemplateStore {
    pub fn new(events: EventHub) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            events,
        }
    }

    fn publish_state(&self, id: ProfileId, state: ProfileState) {
        self.events.publish(EngineEvent::ProfileStateChanged { profile: id, state });
    }

    /// Register an untrained profile; it is evaluated only after training.
    pub fn register(
        &self,
        name: impl Into<String>,
        settings: ProfileSettings,
    ) -> Result<ProfileId, ProfileError> {
        self.insert(Profile::untrained(name, settings)?)
    }

    /// Add a profile, or replace the one with the same id in place.
    pub fn insert(&self, profile: Profile) -> Result<ProfileId, ProfileError> {
        profile.validate()?;
        let id = profile.id();
        let mut entry = Entry {
            profile,
            state: ProfileState::Untrained,
        };
        entry.state = entry.settled_state();
        let state = entry.state;
        {
            let mut entries = self.entries.write();
            match entries.iter_mut().find(|e| e.profile.id() == id) {
                Some(existing) => *existing = entry,
                None => entries.push(entry),
            }
        }
        info!(profile = %id, state = %state, "profile_inserted");
        self.publish_state(id, state);
        Ok(id)
    }

    /// Train or re-train a profile in place. The previous reference stays in
    /// effect until the new one is accepted; failure leaves the profile in `Error`.
    pub fn train(
        &self,
        id: ProfileId,
        samples: &[f32],
        extractor: &FeatureExtractor,
        min_training_secs: f32,
    ) -> Result<(), TrainError> {
        {
            let mut entries = self.entries.write();
            let entry = entries
                .iter_mut()
                .find(|e| e.profile.id() == id)
                .ok_or(ProfileError::UnknownProfile(id))?;
            if !entry.state.can_transition_to(ProfileState::Training) {
                return Err(ProfileError::InvalidTransition {
                    from: entry.state,
                    to: ProfileState::Training,
                }
                .into());
            }
            entry.state = ProfileState::Training;
        }
        self.publish_state(id, ProfileState::Training);

        let result = extractor
            .extract_training(samples, min_training_secs)
            .and_then(|features| {
                let duration_secs = samples.len() as f32 / extractor.sample_rate() as f32;
                Reference::new(features, duration_secs).map_err(TrainError::from)
            });

        let state = {
            let mut entries = self.entries.write();
            let entry = entries
                .iter_mut()
                .find(|e| e.profile.id() == id)
                .ok_or(ProfileError::UnknownProfile(id))?;
            entry.state = match &result {
                Ok(reference) => {
                    entry.profile.replace_reference(reference.clone());
                    entry.settled_state()
                }
                Err(_) => ProfileState::Error,
            };
            entry.state
        };
        self.publish_state(id, state);

        match result {
            Ok(reference) => {
                info!(
                    profile = %id,
                    frames = reference.features().frames(),
                    duration_secs = reference.duration_secs(),
                    state = %state,
                    "profile_trained"
                );
                Ok(())
            }
            Err(e) => {
                warn!(profile = %id, error = %e, "profile_training_failed");
                Err(e)
            }
        }
    }

    pub fn remove(&self, id: ProfileId) -> Result<Profile, ProfileError> {
        let mut entries = self.entries.write();
        let idx = entries
            .iter()
            .position(|e| e.profile.id() == id)
            .ok_or(ProfileError::UnknownProfile(id))?;
        let removed = entries.remove(idx).profile;
        info!(profile = %id, name = removed.name(), "profile_removed");
        Ok(removed)
    }

    /// Enable or disable a profile. `Ready ⇄ Disabled` for trained profiles;
    /// other states only record the flag.
    pub fn set_enabled(&self, id: ProfileId, enabled: bool) -> Result<ProfileState, ProfileError> {
        let (state, changed) = {
            let mut entries = self.entries.write();
            let entry = entries
                .iter_mut()
                .find(|e| e.profile.id() == id)
                .ok_or(ProfileError::UnknownProfile(id))?;
            entry.profile.set_enabled(enabled);
            let next = match entry.state {
                ProfileState::Ready | ProfileState::Disabled => entry.settled_state(),
                other => other,
            };
            let changed = next != entry.state;
            if changed {
                if !entry.state.can_transition_to(next) {
                    return Err(ProfileError::InvalidTransition {
                        from: entry.state,
                        to: next,
                    });
                }
                entry.state = next;
            }
            (next, changed)
        };
        if changed {
            info!(profile = %id, enabled, state = %state, "profile_enabled_changed");
            self.publish_state(id, state);
        }
        Ok(state)
    }

    pub fn update_settings(&self, id: ProfileId, settings: ProfileSettings) -> Result<(), ProfileError> {
        let mut entries = self.entries.write();
        let entry = entries
            .iter_mut()
            .find(|e| e.profile.id() == id)
            .ok_or(ProfileError::UnknownProfile(id))?;
        entry.profile.set_settings(settings)?;
        info!(profile = %id, settings = ?entry.profile.settings(), "profile_settings_updated");
        Ok(())
    }

    /// Move a profile to `Error`; it stays out of evaluation until re-trained.
    pub fn mark_error(&self, id: ProfileId) {
        let updated = {
            let mut entries = self.entries.write();
            match entries.iter_mut().find(|e| e.profile.id() == id) {
                Some(entry) if entry.state != ProfileState::Error => {
                    entry.state = ProfileState::Error;
                    true
                }
                _ => false,
            }
        };
        if updated {
            warn!(profile = %id, "profile_marked_error");
            self.publish_state(id, ProfileState::Error);
        }
    }

    /// At least one enabled, trained profile can be evaluated.
    pub fn has_ready(&self) -> bool {
        self.entries
            .read()
            .iter()
            .any(|e| e.state.is_evaluated() && e.profile.is_enabled())
    }

    /// Evaluation inputs for every `Ready`, enabled profile, in registration order.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.state.is_evaluated() && e.profile.is_enabled())
            .filter_map(|e| {
                let reference = e.profile.reference()?;
                let settings = e.profile.settings();
                Some(Candidate {
                    id: e.profile.id(),
                    name: e.profile.name().to_string(),
                    reference: Arc::clone(reference.features()),
                    distance_threshold: settings.distance_threshold,
                    min_volume: settings.min_volume,
                    cooldown: settings.cooldown(),
                    last_fire: e.profile.last_fire(),
                })
            })
            .collect()
    }

    /// Commit a fire decided outside the lock. Re-checks that the profile still
    /// exists, is `Ready` and enabled, and that its cooldown still permits firing.
    pub fn commit_fire(&self, id: ProfileId, now: Instant) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.iter_mut().find(|e| e.profile.id() == id) else {
            return false;
        };
        if !entry.state.is_evaluated() || !entry.profile.is_enabled() {
            return false;
        }
        if !cooldown_permits(entry.profile.last_fire(), entry.profile.settings().cooldown(), now) {
            return false;
        }
        entry.profile.record_fire(now);
        true
    }

    pub fn get(&self, id: ProfileId) -> Option<Profile> {
        self.entries
            .read()
            .iter()
            .find(|e| e.profile.id() == id)
            .map(|e| e.profile.clone())
    }

    pub fn state(&self, id: ProfileId) -> Option<ProfileState> {
        self.entries
            .read()
            .iter()
            .find(|e| e.profile.id() == id)
            .map(|e| e.state)
    }

    pub fn find_by_name(&self, name: &str) -> Option<ProfileId> {
        self.entries
            .read()
            .iter()
            .find(|e| e.profile.name() == name)
            .map(|e| e.profile.id())
    }

    /// Every profile with its state, in registration order.
    pub fn list(&self) -> Vec<(Profile, ProfileState)> {
        self.entries
            .read()
            .iter()
            .map(|e| (e.profile.clone(), e.state))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
