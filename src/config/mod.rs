//! # Configuration Module
//!
//! Session tunables ([`StudioConfig`]) and the persisted user choices for
//! image generation ([`settings`]).

#[allow(clippy::module_inception)]
pub mod config;
pub mod settings;

pub use config::{DEFAULT_LOW_MEMORY_THRESHOLD, DescriptionMode, StudioConfig};
pub use settings::{GenerationSettings, JsonSettingsStore, MemorySettingsStore, SettingsStore};
