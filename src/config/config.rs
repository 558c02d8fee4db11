//! # Studio Configuration
//!
//! Tunables shared by the description, live-analysis and capture paths. The
//! CLI and embedding applications build a [`StudioConfig`], validate it, and
//! hand it to the camera session.
//!
//! ## Configuration Parameters
//!
//! | Parameter | Default | Description |
//! |-----------|---------|-------------|
//! | `prompt` | "Describe the image in English." | Base instruction for every description |
//! | `short_prompt_suffix` | "Output is very brief use maximum of 10 words." | Appended for short descriptions |
//! | `long_prompt_suffix` | "Long and detailed description please." | Appended for long descriptions |
//! | `max_tokens` | 240 | Token budget per description |
//! | `display_every_n_tokens` | 4 | Streaming update interval |
//! | `frame_delay` | 1 ms | Pause between live-analysis passes |
//! | `snapshot_preset` | preview (1024 px) | Size of the captured photo |
//! | `low_memory_threshold_bytes` | 8 GiB | Devices below this run the low-memory policy |
//!
//! ## Examples
//!
//! ```rust
//! use genai_cam::config::{DescriptionMode, StudioConfig};
//!
//! let config = StudioConfig::default();
//! assert!(config.validate().is_ok());
//! assert_eq!(
//!     config.prompt_for(DescriptionMode::Short),
//!     "Describe the image in English. Output is very brief use maximum of 10 words."
//! );
//! ```

use std::time::Duration;

use cam_scale::presets::SnapshotPreset;

/// 8 GiB, the physical memory below which heavyweight models are unloaded
/// before image generation.
pub const DEFAULT_LOW_MEMORY_THRESHOLD: u64 = 8 * 1024 * 1024 * 1024;

/// Which description a prompt asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DescriptionMode {
    #[default]
    Short,
    Long,
}

/// Configuration for a camera studio session.
#[derive(Debug, Clone)]
pub struct StudioConfig {
    /// Base instruction sent with every image.
    pub prompt: String,

    pub short_prompt_suffix: String,

    pub long_prompt_suffix: String,

    /// Generation stops once this many tokens were produced.
    pub max_tokens: usize,

    /// While streaming, decoded text is published every N tokens.
    pub display_every_n_tokens: usize,

    /// Pause after each live-analysis pass.
    pub frame_delay: Duration,

    /// Size of the captured photo.
    pub snapshot_preset: SnapshotPreset,

    /// Physical memory below which the low-memory policy applies.
    pub low_memory_threshold_bytes: u64,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            prompt: "Describe the image in English.".to_string(),
            short_prompt_suffix: "Output is very brief use maximum of 10 words.".to_string(),
            long_prompt_suffix: "Long and detailed description please.".to_string(),
            max_tokens: 240,
            display_every_n_tokens: 4,
            frame_delay: Duration::from_millis(1),
            snapshot_preset: SnapshotPreset::Preview1024,
            low_memory_threshold_bytes: DEFAULT_LOW_MEMORY_THRESHOLD,
        }
    }
}

impl StudioConfig {
    /// Creates a configuration with a custom base prompt and token budget,
    /// keeping every other default.
    pub fn new(prompt: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens,
            ..Self::default()
        }
    }

    /// Validates the configuration parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.prompt.trim().is_empty() {
            return Err("Prompt must not be empty".to_string());
        }
        if self.max_tokens == 0 {
            return Err("Token budget must be greater than 0".to_string());
        }
        if self.display_every_n_tokens == 0 {
            return Err("Display interval must be at least 1 token".to_string());
        }
        if self.low_memory_threshold_bytes == 0 {
            return Err("Low-memory threshold must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Full prompt for a description mode: base prompt, a space, the suffix.
    pub fn prompt_for(&self, mode: DescriptionMode) -> String {
        let suffix = match mode {
            DescriptionMode::Short => &self.short_prompt_suffix,
            DescriptionMode::Long => &self.long_prompt_suffix,
        };
        format!("{} {}", self.prompt, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StudioConfig::default();
        assert_eq!(config.max_tokens, 240);
        assert_eq!(config.display_every_n_tokens, 4);
        assert_eq!(config.frame_delay, Duration::from_millis(1));
        assert_eq!(config.snapshot_preset.max_long_side(), 1024);
    }

    #[test]
    fn test_long_prompt() {
        let config = StudioConfig::default();
        assert_eq!(
            config.prompt_for(DescriptionMode::Long),
            "Describe the image in English. Long and detailed description please."
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = StudioConfig::default();
        assert!(config.validate().is_ok());

        config.max_tokens = 0;
        assert!(config.validate().is_err());

        let mut config = StudioConfig::new("  ", 240);
        assert_eq!(config.validate(), Err("Prompt must not be empty".to_string()));

        config.prompt = "What is on the table?".to_string();
        config.display_every_n_tokens = 0;
        assert!(config.validate().is_err());
    }
}
