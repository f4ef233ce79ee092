// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use crate::error::CliError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine sizing and policy defaults.
///
/// Every field has a default, so a configuration file only needs the
/// values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct EngineConfig {
    /// Number of object slots.
    pub max_loaded_objects: usize,
    /// Number of loaded-session slots.
    pub max_loaded_sessions: usize,
    /// Number of active (loaded or saved) sessions.
    pub max_active_sessions: usize,
    /// Largest distance between the newest and the oldest saved session.
    pub context_gap_limit: u64,
    /// Size of the NV image in bytes.
    pub nv_memory_size: usize,
    /// Bytes at the start of the NV image held for persistent state.
    pub nv_reserved_size: usize,
    /// Largest NV index data size.
    pub max_nv_index_size: u16,
    pub nv_rate: NvRateConfig,
    pub dictionary_attack: DaConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct NvRateConfig {
    /// Largest number of NV writes in a window, zero disables the limit.
    pub max_writes: u32,
    pub window_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct DaConfig {
    pub max_tries: u32,
    /// Seconds per recovered failure.
    pub recovery_time: u32,
    /// Seconds until a failed lockout authorization may be retried.
    pub lockout_recovery: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_loaded_objects: 3,
            max_loaded_sessions: 3,
            max_active_sessions: 64,
            context_gap_limit: 255,
            nv_memory_size: 32 * 1024,
            nv_reserved_size: 4096,
            max_nv_index_size: 2048,
            nv_rate: NvRateConfig::default(),
            dictionary_attack: DaConfig::default(),
        }
    }
}

impl Default for NvRateConfig {
    fn default() -> Self {
        Self {
            max_writes: 0,
            window_ms: 1000,
        }
    }
}

impl Default for DaConfig {
    fn default() -> Self {
        Self {
            max_tries: 3,
            recovery_time: 1000,
            lockout_recovery: 1000,
        }
    }
}

impl EngineConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `CliError::File` when the file cannot be read and
    /// `CliError::Config` when it is not a valid configuration.
    pub fn from_file(path: &Path) -> Result<Self, CliError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CliError::File(path.display().to_string(), e))?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "context-gap-limit": 4, "nv-rate": { "max-writes": 2 } }"#)
                .unwrap();
        assert_eq!(config.context_gap_limit, 4);
        assert_eq!(config.nv_rate.max_writes, 2);
        assert_eq!(config.nv_rate.window_ms, 1000);
        assert_eq!(config.max_loaded_sessions, 3);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(serde_json::from_str::<EngineConfig>(r#"{ "bogus": 1 }"#).is_err());
    }
}
