//! Trained trigger templates and their validated settings.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::features::{FeatureExtractor, FeatureMatrix};
use crate::state_machine::ProfileState;
use crate::MIN_FRAMES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(Uuid);

impl ProfileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProfileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProfileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ProfileId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProfileError {
    TooFewFrames { frames: usize, min: usize },
    NegativeThreshold(f32),
    NonFiniteThreshold,
    VolumeOutOfRange(f32),
    NegativeCooldown(f32),
    UnknownProfile(ProfileId),
    InvalidTransition { from: ProfileState, to: ProfileState },
}

impl std::fmt::Display for ProfileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfileError::TooFewFrames { frames, min } => {
                write!(f, "reference has {frames} frames, at least {min} required")
            }
            ProfileError::NegativeThreshold(v) => write!(f, "distance threshold {v} is negative"),
            ProfileError::NonFiniteThreshold => write!(f, "distance threshold must be finite"),
            ProfileError::VolumeOutOfRange(v) => write!(f, "minimum volume {v} outside [0, 1]"),
            ProfileError::NegativeCooldown(v) => write!(f, "cooldown {v}s must be non-negative"),
            ProfileError::UnknownProfile(id) => write!(f, "unknown profile {id}"),
            ProfileError::InvalidTransition { from, to } => {
                write!(f, "invalid profile transition: {from} -> {to}")
            }
        }
    }
}

impl std::error::Error for ProfileError {}

#[derive(Debug, Clone, PartialEq)]
pub enum TrainError {
    TooShort { duration_secs: f32, min_secs: f32 },
    Profile(ProfileError),
}

impl std::fmt::Display for TrainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainError::TooShort {
                duration_secs,
                min_secs,
            } => write!(
                f,
                "training clip is {duration_secs:.2}s, at least {min_secs:.2}s required"
            ),
            TrainError::Profile(e) => write!(f, "training rejected: {e}"),
        }
    }
}

impl std::error::Error for TrainError {}

impl From<ProfileError> for TrainError {
    fn from(e: ProfileError) -> Self {
        TrainError::Profile(e)
    }
}

/// Matching parameters of a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    /// Fire when the normalized distance is strictly below this. Lower is
    /// stricter; useful values sit between 50 and 500.
    pub distance_threshold: f32,
    /// Normalized RMS below which the profile is not evaluated.
    pub min_volume: f32,
    pub cooldown_secs: f32,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            distance_threshold: 60.0,
            min_volume: 0.008,
            cooldown_secs: 1.2,
        }
    }
}

impl ProfileSettings {
    pub fn validate(&self) -> Result<(), ProfileError> {
        if !self.distance_threshold.is_finite() {
            return Err(ProfileError::NonFiniteThreshold);
        }
        if self.distance_threshold < 0.0 {
            return Err(ProfileError::NegativeThreshold(self.distance_threshold));
        }
        if !(0.0..=1.0).contains(&self.min_volume) {
            return Err(ProfileError::VolumeOutOfRange(self.min_volume));
        }
        if !(self.cooldown_secs.is_finite() && self.cooldown_secs >= 0.0) {
            return Err(ProfileError::NegativeCooldown(self.cooldown_secs));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::try_from_secs_f32(self.cooldown_secs).unwrap_or(Duration::ZERO)
    }
}

/// Immutable reference template. Re-training swaps the whole value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    features: Arc<FeatureMatrix>,
    duration_secs: f32,
}

impl Reference {
    pub fn new(features: FeatureMatrix, duration_secs: f32) -> Result<Self, ProfileError> {
        if features.frames() < MIN_FRAMES {
            return Err(ProfileError::TooFewFrames {
                frames: features.frames(),
                min: MIN_FRAMES,
            });
        }
        Ok(Self {
            features: Arc::new(features),
            duration_secs,
        })
    }

    pub fn features(&self) -> &Arc<FeatureMatrix> {
        &self.features
    }

    pub fn duration_secs(&self) -> f32 {
        self.duration_secs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    id: ProfileId,
    name: String,
    reference: Option<Reference>,
    settings: ProfileSettings,
    enabled: bool,
    #[serde(skip)]
    last_fire: Option<Instant>,
    #[serde(skip)]
    fire_count: u64,
}

impl Profile {
    /// A trained, enabled profile.
    pub fn new(
        name: impl Into<String>,
        reference: Reference,
        settings: ProfileSettings,
    ) -> Result<Self, ProfileError> {
        let mut profile = Self::untrained(name, settings)?;
        profile.reference = Some(reference);
        Ok(profile)
    }

    /// A registered profile with no reference yet.
    pub fn untrained(name: impl Into<String>, settings: ProfileSettings) -> Result<Self, ProfileError> {
        settings.validate()?;
        Ok(Self {
            id: ProfileId::new(),
            name: name.into(),
            reference: None,
            settings,
            enabled: true,
            last_fire: None,
            fire_count: 0,
        })
    }

    /// Re-check invariants of a value that bypassed the constructors (deserialization).
    pub fn validate(&self) -> Result<(), ProfileError> {
        self.settings.validate()?;
        if let Some(reference) = &self.reference {
            if reference.features.frames() < MIN_FRAMES {
                return Err(ProfileError::TooFewFrames {
                    frames: reference.features.frames(),
                    min: MIN_FRAMES,
                });
            }
        }
        Ok(())
    }

    pub fn id(&self) -> ProfileId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reference(&self) -> Option<&Reference> {
        self.reference.as_ref()
    }

    pub fn is_trained(&self) -> bool {
        self.reference.is_some()
    }

    pub fn settings(&self) -> &ProfileSettings {
        &self.settings
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn last_fire(&self) -> Option<Instant> {
        self.last_fire
    }

    pub fn fire_count(&self) -> u64 {
        self.fire_count
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether the cooldown permits firing at `now`.
    pub fn cooldown_elapsed(&self, now: Instant) -> bool {
        cooldown_permits(self.last_fire, self.settings.cooldown(), now)
    }

    pub(crate) fn set_settings(&mut self, settings: ProfileSettings) -> Result<(), ProfileError> {
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn replace_reference(&mut self, reference: Reference) {
        self.reference = Some(reference);
    }

    pub(crate) fn record_fire(&mut self, now: Instant) {
        self.last_fire = Some(now);
        self.fire_count += 1;
    }
}

/// `now - last_fire >= cooldown`, with "never fired" always permitting.
#[inline]
pub fn cooldown_permits(last_fire: Option<Instant>, cooldown: Duration, now: Instant) -> bool {
    match last_fire {
        Some(last) => now.saturating_duration_since(last) >= cooldown,
        None => true,
    }
}

/// Build a trained profile from a raw clip.
pub fn train_profile(
    name: &str,
    samples: &[f32],
    settings: ProfileSettings,
    extractor: &FeatureExtractor,
    min_training_secs: f32,
) -> Result<Profile, TrainError> {
    settings.validate()?;
    let features = extractor.extract_training(samples, min_training_secs)?;
    let duration_secs = samples.len() as f32 / extractor.sample_rate() as f32;
    let frames = features.frames();
    let profile = Profile::new(name, Reference::new(features, duration_secs)?, settings)?;
    info!(
        profile = %profile.id(),
        name,
        duration_secs,
        frames,
        "profile_trained"
    );
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(secs: f32) -> Vec<f32> {
        let len = (secs * 16_000.0) as usize;
        (0..len).map(|n| ((n as f32) * 0.07).sin() * 0.3).collect()
    }

    #[test]
    fn settings_validation() {
        assert!(ProfileSettings::default().validate().is_ok());
        let bad = |f: fn(&mut ProfileSettings)| {
            let mut s = ProfileSettings::default();
            f(&mut s);
            s.validate().unwrap_err()
        };
        assert_eq!(bad(|s| s.distance_threshold = -0.1), ProfileError::NegativeThreshold(-0.1));
        assert_eq!(bad(|s| s.distance_threshold = f32::INFINITY), ProfileError::NonFiniteThreshold);
        assert_eq!(bad(|s| s.min_volume = 1.5), ProfileError::VolumeOutOfRange(1.5));
        assert_eq!(bad(|s| s.cooldown_secs = -1.0), ProfileError::NegativeCooldown(-1.0));
    }

    #[test]
    fn train_profile_accepts_long_clip() {
        let fx = FeatureExtractor::new(16_000);
        let p = train_profile("clap", &clip(1.0), ProfileSettings::default(), &fx, 0.3).unwrap();
        assert!(p.is_trained());
        assert!(p.is_enabled());
        assert_eq!(p.reference().unwrap().features().frames(), 63);
        assert!((p.reference().unwrap().duration_secs() - 1.0).abs() < 1e-6);
        assert_eq!(p.fire_count(), 0);
    }

    #[test]
    fn train_profile_rejects_short_clip() {
        let fx = FeatureExtractor::new(16_000);
        let err = train_profile("snap", &clip(0.2), ProfileSettings::default(), &fx, 0.3).unwrap_err();
        match err {
            TrainError::TooShort {
                duration_secs,
                min_secs,
            } => {
                assert!((duration_secs - 0.2).abs() < 1e-3);
                assert_eq!(min_secs, 0.3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reference_needs_minimum_frames() {
        let m = FeatureMatrix::from_vec(vec![0.0; 7 * 39], 7, 39).unwrap();
        assert_eq!(
            Reference::new(m, 0.1).unwrap_err(),
            ProfileError::TooFewFrames { frames: 7, min: 8 }
        );
    }

    #[test]
    fn cooldown_gate() {
        let mut p = Profile::untrained("x", ProfileSettings::default()).unwrap();
        let t0 = Instant::now();
        assert!(p.cooldown_elapsed(t0));
        p.record_fire(t0);
        assert!(!p.cooldown_elapsed(t0 + Duration::from_millis(1_199)));
        assert!(p.cooldown_elapsed(t0 + Duration::from_millis(1_201)));
        assert_eq!(p.fire_count(), 1);
    }

    #[test]
    fn profile_id_parses() {
        let id = ProfileId::new();
        assert_eq!(id.to_string().parse::<ProfileId>().unwrap(), id);
    }
}
