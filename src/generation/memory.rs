//! Memory policy, chosen once from the device's physical memory.
//!
//! Below the threshold the description model is unloaded before every
//! diffusion run, the diffusion pipeline is rebuilt per call instead of being
//! cached, and its safety checker is skipped.

use log::{debug, info};

use crate::config::DEFAULT_LOW_MEMORY_THRESHOLD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPolicy {
    total_bytes: Option<u64>,
    threshold_bytes: u64,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self::detect(DEFAULT_LOW_MEMORY_THRESHOLD)
    }
}

impl MemoryPolicy {
    /// Policy for a known amount of physical memory.
    pub fn with_total(total_bytes: u64, threshold_bytes: u64) -> Self {
        Self {
            total_bytes: Some(total_bytes),
            threshold_bytes,
        }
    }

    /// Always low-memory, regardless of the device.
    pub fn low_memory() -> Self {
        Self::with_total(0, DEFAULT_LOW_MEMORY_THRESHOLD)
    }

    /// Never low-memory.
    pub fn unconstrained() -> Self {
        Self {
            total_bytes: None,
            threshold_bytes: DEFAULT_LOW_MEMORY_THRESHOLD,
        }
    }

    /// Measure physical memory. When it cannot be measured the device is
    /// treated as unconstrained.
    pub fn detect(threshold_bytes: u64) -> Self {
        let total_bytes = physical_memory();
        match total_bytes {
            Some(total) => info!(
                "Physical memory {} MiB, low-memory threshold {} MiB",
                total / (1024 * 1024),
                threshold_bytes / (1024 * 1024)
            ),
            None => debug!("Physical memory unknown, assuming an unconstrained device"),
        }
        Self {
            total_bytes,
            threshold_bytes,
        }
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn is_low_memory(&self) -> bool {
        self.total_bytes
            .is_some_and(|total| total < self.threshold_bytes)
    }

    /// Cache the diffusion pipeline between runs.
    pub fn cache_pipeline(&self) -> bool {
        !self.is_low_memory()
    }

    /// Unload the description model before diffusion runs.
    pub fn unload_description_model(&self) -> bool {
        self.is_low_memory()
    }
}

fn physical_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&meminfo)
}

/// `MemTotal` from a `/proc/meminfo` dump, in bytes.
fn parse_meminfo(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let kib: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
        Some(kib * 1024)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_total_is_parsed() {
        let dump = "MemTotal:        6045496 kB\nMemFree:          212340 kB\n";
        assert_eq!(parse_meminfo(dump), Some(6045496 * 1024));
        assert_eq!(parse_meminfo("MemFree: 1 kB"), None);
    }

    #[test]
    fn threshold_selects_policy() {
        let gib = 1024 * 1024 * 1024;
        let small = MemoryPolicy::with_total(6 * gib, DEFAULT_LOW_MEMORY_THRESHOLD);
        assert!(small.is_low_memory());
        assert!(!small.cache_pipeline());

        let large = MemoryPolicy::with_total(16 * gib, DEFAULT_LOW_MEMORY_THRESHOLD);
        assert!(!large.is_low_memory());
        assert!(large.cache_pipeline());

        assert!(!MemoryPolicy::unconstrained().is_low_memory());
        assert!(MemoryPolicy::low_memory().unload_description_model());
    }
}
