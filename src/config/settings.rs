//! Persisted user choices for image generation.
//!
//! The orchestrator reads the settings at the start of every request and
//! writes them back when it substitutes an unavailable provider or when a
//! generation option is picked.

use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::{GenError, GenResult},
    generation::provider::{GuidancePreset, PlaygroundStyle, ProviderKind, StartMode, StepPreset},
};

pub const DEFAULT_PROMPT_SUFFIX: &str = "photo, high quality, 8k";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub provider: ProviderKind,
    pub steps: StepPreset,
    pub guidance: GuidancePreset,
    pub start_mode: StartMode,
    pub style: PlaygroundStyle,
    /// Appended to the description before it is sent to the diffusion model.
    pub prompt_suffix: String,
    pub negative_prompt: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Diffusion,
            steps: StepPreset::Balanced,
            guidance: GuidancePreset::Standard,
            start_mode: StartMode::Noise,
            style: PlaygroundStyle::Sketch,
            prompt_suffix: DEFAULT_PROMPT_SUFFIX.to_string(),
            negative_prompt: String::new(),
        }
    }
}

/// Storage for [`GenerationSettings`].
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> GenerationSettings;
    fn save(&self, settings: &GenerationSettings) -> GenResult<()>;
}

impl dyn SettingsStore {
    /// Load, modify and save in one step. Returns the saved settings.
    pub fn update(
        &self,
        change: impl FnOnce(&mut GenerationSettings),
    ) -> GenResult<GenerationSettings> {
        let mut settings = self.load();
        change(&mut settings);
        self.save(&settings)?;
        Ok(settings)
    }
}

fn lock(settings: &Mutex<GenerationSettings>) -> MutexGuard<'_, GenerationSettings> {
    settings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory settings, lost when the process exits.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: Mutex<GenerationSettings>,
}

impl MemorySettingsStore {
    pub fn new(settings: GenerationSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> GenerationSettings {
        lock(&self.settings).clone()
    }

    fn save(&self, settings: &GenerationSettings) -> GenResult<()> {
        *lock(&self.settings) = settings.clone();
        Ok(())
    }
}

/// Settings stored as pretty-printed JSON in a single file.
#[derive(Debug)]
pub struct JsonSettingsStore {
    path: PathBuf,
    cached: Mutex<GenerationSettings>,
}

impl JsonSettingsStore {
    /// Open the store at `path`. A missing file yields the defaults; a file
    /// that cannot be parsed is logged and replaced on the next save.
    pub fn open(path: impl Into<PathBuf>) -> GenResult<Self> {
        let path = path.into();
        let settings = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!(
                        "Ignoring unreadable settings file {}: {}",
                        path.display(),
                        e
                    );
                    GenerationSettings::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings file at {}, using defaults", path.display());
                GenerationSettings::default()
            }
            Err(e) => return Err(GenError::io("read settings", e)),
        };
        Ok(Self {
            path,
            cached: Mutex::new(settings),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> GenerationSettings {
        lock(&self.cached).clone()
    }

    fn save(&self, settings: &GenerationSettings) -> GenResult<()> {
        let json = serde_json::to_vec_pretty(settings)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| GenError::io("create settings directory", e))?;
        }
        std::fs::write(&self.path, json).map_err(|e| GenError::io("write settings", e))?;
        *lock(&self.cached) = settings.clone();
        debug!("Saved generation settings to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_menu() {
        let settings = GenerationSettings::default();
        assert_eq!(settings.provider, ProviderKind::Diffusion);
        assert_eq!(settings.steps.steps(), 25);
        assert_eq!(settings.guidance.scale(), 7.5);
        assert_eq!(settings.prompt_suffix, "photo, high quality, 8k");
    }

    #[test]
    fn json_store_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let store = JsonSettingsStore::open(&path).unwrap();
        assert_eq!(store.load(), GenerationSettings::default());

        let store: &dyn SettingsStore = &store;
        store
            .update(|s| {
                s.provider = ProviderKind::Style;
                s.style = PlaygroundStyle::Animation;
                s.start_mode = StartMode::Photo { strength: 0.5 };
            })
            .unwrap();

        let reopened = JsonSettingsStore::open(&path).unwrap();
        let settings = reopened.load();
        assert_eq!(settings.provider, ProviderKind::Style);
        assert_eq!(settings.style, PlaygroundStyle::Animation);
        assert_eq!(settings.start_mode, StartMode::Photo { strength: 0.5 });
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = JsonSettingsStore::open(&path).unwrap();
        assert_eq!(store.load(), GenerationSettings::default());
    }

    #[test]
    fn partial_file_keeps_missing_fields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, br#"{ "steps": "quality" }"#).unwrap();

        let settings = JsonSettingsStore::open(&path).unwrap().load();
        assert_eq!(settings.steps, StepPreset::Quality);
        assert_eq!(settings.prompt_suffix, DEFAULT_PROMPT_SUFFIX);
    }
}
