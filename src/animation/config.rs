use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{EffectPoolError, Result};

/// Tunables for an effect pool manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectPoolConfig {
    /// Lifetime used when a template yields no usable timing (milliseconds, > 0)
    pub default_lifetime_ms: u64,

    /// Push spawn/return events for the host to drain
    pub record_events: bool,

    /// Name of the node retired instances are parked under
    pub holding_area_name: String,
}

impl Default for EffectPoolConfig {
    fn default() -> Self {
        Self {
            default_lifetime_ms: 1000, // Default 1 second
            record_events: true,
            holding_area_name: String::from("EffectPoolHolding"),
        }
    }
}

impl EffectPoolConfig {
    /// Parse and validate a JSON config; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| EffectPoolError::InvalidConfig {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_lifetime_ms == 0 {
            return Err(EffectPoolError::InvalidConfig {
                message: "default_lifetime_ms must be greater than zero".to_string(),
            });
        }
        if self.holding_area_name.trim().is_empty() {
            return Err(EffectPoolError::InvalidConfig {
                message: "holding_area_name must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn default_lifetime(&self) -> Duration {
        Duration::from_millis(self.default_lifetime_ms)
    }
}
