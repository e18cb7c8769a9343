//! Script runner configuration.
//!
//! Defaults can be overridden by environment variables:
//!
//! - `STAGE_SCRIPT_PATH` - Default script file for the demo runner
//! - `STAGE_SCRIPT_STRICT` - If "1", attribute-callback errors are fatal
//! - `STAGE_UPDATE_RATE` - Update ticks per second (default 200)

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default number of `update` calls per second.
pub const DEFAULT_UPDATE_RATE: u32 = 200;

/// Highest accepted update rate.
pub const MAX_UPDATE_RATE: u32 = 1000;

/// Configuration shared by [`ScriptInstance`](crate::lua::ScriptInstance)s.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ScriptConfig {
    /// Script to load when none is given explicitly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_path: Option<PathBuf>,
    /// Treat errors raised by attribute callbacks as fatal for the instance.
    pub strict: bool,
    /// Update ticks per second.
    pub update_rate: u32,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            script_path: None,
            strict: false,
            update_rate: DEFAULT_UPDATE_RATE,
        }
    }
}

impl ScriptConfig {
    /// Defaults with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("STAGE_SCRIPT_PATH") {
            self.script_path = Some(PathBuf::from(path));
        }
        if let Ok(strict) = std::env::var("STAGE_SCRIPT_STRICT") {
            self.strict = strict == "1";
        }
        if let Ok(rate) = std::env::var("STAGE_UPDATE_RATE") {
            match rate.parse::<u32>() {
                Ok(rate) => self.update_rate = clamp_update_rate(rate),
                Err(e) => log::warn!("Ignoring STAGE_UPDATE_RATE={}: {}", rate, e),
            }
        }
    }
}

/// Clamp a requested update rate to `1..=MAX_UPDATE_RATE`.
#[must_use]
pub fn clamp_update_rate(rate: u32) -> u32 {
    rate.clamp(1, MAX_UPDATE_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ScriptConfig::default();
        assert_eq!(config.update_rate, 200);
        assert!(!config.strict);
        assert!(config.script_path.is_none());
    }

    #[test]
    fn test_clamp_update_rate() {
        assert_eq!(clamp_update_rate(0), 1);
        assert_eq!(clamp_update_rate(60), 60);
        assert_eq!(clamp_update_rate(5000), MAX_UPDATE_RATE);
    }

    #[test]
    fn test_serde_round_trip() {
        let config = ScriptConfig {
            script_path: Some(PathBuf::from("/tmp/show.lua")),
            strict: true,
            update_rate: 30,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ScriptConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
