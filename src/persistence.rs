//! Versioned JSON profile file: profiles (reference, settings, identity) plus
//! the launch command bound to each. Lives outside the detection core.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dispatch::{CommandLauncher, LaunchCommand};
use crate::profile::{Profile, ProfileError};
use crate::store::TemplateStore;

pub const PROFILE_FILE_VERSION: u32 = 1;

#[derive(Debug)]
pub enum PersistError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    UnsupportedVersion(u32),
    Profile(ProfileError),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::Io(e) => write!(f, "profile file IO error: {e}"),
            PersistError::Parse(e) => write!(f, "profile file parse error: {e}"),
            PersistError::UnsupportedVersion(v) => {
                write!(f, "profile file version {v} is not supported (expected {PROFILE_FILE_VERSION})")
            }
            PersistError::Profile(e) => write!(f, "invalid profile in file: {e}"),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        PersistError::Io(e)
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(e: serde_json::Error) -> Self {
        PersistError::Parse(e)
    }
}

impl From<ProfileError> for PersistError {
    fn from(e: ProfileError) -> Self {
        PersistError::Profile(e)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub profile: Profile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<LaunchCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileFile {
    pub version: u32,
    pub profiles: Vec<ProfileRecord>,
}

impl Default for ProfileFile {
    fn default() -> Self {
        Self {
            version: PROFILE_FILE_VERSION,
            profiles: Vec::new(),
        }
    }
}

impl ProfileFile {
    /// Load a profile file. A missing file yields an empty one.
    pub fn load(path: &Path) -> Result<Self, PersistError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let file: ProfileFile = serde_json::from_str(&content)?;
        if file.version != PROFILE_FILE_VERSION {
            return Err(PersistError::UnsupportedVersion(file.version));
        }
        for record in &file.profiles {
            record.profile.validate()?;
        }
        info!(path = %path.display(), count = file.profiles.len(), "profiles loaded");
        Ok(file)
    }

    /// Write through a temporary file, then rename over the target.
    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        info!(path = %path.display(), count = self.profiles.len(), "profiles saved");
        Ok(())
    }

    /// Snapshot the store and launcher bindings.
    pub fn capture(store: &TemplateStore, launcher: &CommandLauncher) -> Self {
        let profiles = store
            .list()
            .into_iter()
            .map(|(profile, _)| ProfileRecord {
                action: launcher.command_for(profile.id()),
                profile,
            })
            .collect();
        Self {
            version: PROFILE_FILE_VERSION,
            profiles,
        }
    }

    /// Insert every profile into the store and bind its launch command.
    pub fn apply(self, store: &TemplateStore, launcher: &CommandLauncher) -> Result<usize, PersistError> {
        let count = self.profiles.len();
        for record in self.profiles {
            let id = store.insert(record.profile)?;
            if let Some(action) = record.action {
                launcher.bind(id, action);
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHub;
    use crate::features::FeatureExtractor;
    use crate::profile::{train_profile, ProfileSettings};
    use crate::state_machine::ProfileState;

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("soundtrigger-profiles-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn roundtrip_preserves_reference_settings_and_action() {
        let fx = FeatureExtractor::new(16_000);
        let clip: Vec<f32> = (0..12_000).map(|n| ((n as f32) * 0.03).sin() * 0.5).collect();
        let settings = ProfileSettings {
            distance_threshold: 120.0,
            min_volume: 0.02,
            cooldown_secs: 2.0,
        };
        let profile = train_profile("door", &clip, settings.clone(), &fx, 0.3).unwrap();
        let id = profile.id();

        let store = TemplateStore::new(EventHub::new());
        let launcher = CommandLauncher::new();
        store.insert(profile.clone().with_enabled(false)).unwrap();
        launcher.bind(id, LaunchCommand::new("notepad").with_args(["a.txt"]));

        let path = temp_path();
        ProfileFile::capture(&store, &launcher).save(&path).unwrap();

        let restored_store = TemplateStore::new(EventHub::new());
        let restored_launcher = CommandLauncher::new();
        let n = ProfileFile::load(&path)
            .unwrap()
            .apply(&restored_store, &restored_launcher)
            .unwrap();
        assert_eq!(n, 1);

        let restored = restored_store.get(id).unwrap();
        assert_eq!(restored.name(), "door");
        assert_eq!(restored.settings(), &settings);
        assert_eq!(restored.reference(), profile.reference());
        assert!(!restored.is_enabled());
        assert_eq!(restored_store.state(id), Some(ProfileState::Disabled));
        assert_eq!(
            restored_launcher.command_for(id),
            Some(LaunchCommand::new("notepad").with_args(["a.txt"]))
        );
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_file_is_empty() {
        let file = ProfileFile::load(&temp_path()).unwrap();
        assert!(file.profiles.is_empty());
    }

    #[test]
    fn rejects_unknown_version_and_invalid_settings() {
        let path = temp_path();
        std::fs::write(&path, r#"{"version":9,"profiles":[]}"#).unwrap();
        assert!(matches!(
            ProfileFile::load(&path),
            Err(PersistError::UnsupportedVersion(9))
        ));

        let bad = r#"{"version":1,"profiles":[{"profile":{
            "id":"7c9e6679-7425-40de-944b-e07fc1f90ae7","name":"x","reference":null,
            "settings":{"distance_threshold":-1.0},"enabled":true}}]}"#;
        std::fs::write(&path, bad).unwrap();
        assert!(matches!(
            ProfileFile::load(&path),
            Err(PersistError::Profile(ProfileError::NegativeThreshold(_)))
        ));
        let _ = std::fs::remove_file(path);
    }
}
