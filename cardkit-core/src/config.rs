//! Deployment configuration.
//!
//! Every struct deserializes with defaults for the fields it omits, so a
//! deployment file only lists what it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CardKitError, CardKitResult};
use crate::role::RolePolicy;

/// Scheduled rotation sweep settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Seconds between two sweeps over all cards.
    pub sweep_interval_secs: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
        }
    }
}

impl RotationConfig {
    /// Sweep interval as a [`Duration`].
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Offline controller settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Identifier written into every journal entry.
    pub controller_id: String,
    /// Maximum number of cards held in the local cache.
    pub cache_capacity: usize,
    /// Budget for one sync attempt, in seconds.
    pub sync_timeout_secs: u64,
    /// Maximum number of journal entries sent per sync attempt.
    pub sync_batch_size: usize,
    /// Age after which acknowledged journal entries may be pruned, in seconds.
    pub journal_retention_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_id: "controller-1".to_string(),
            cache_capacity: 1024,
            sync_timeout_secs: 10,
            sync_batch_size: 256,
            journal_retention_secs: 30 * 24 * 60 * 60,
        }
    }
}

impl ControllerConfig {
    /// Sync budget as a [`Duration`].
    #[must_use]
    pub const fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    /// Checks the settings for values the controller cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`CardKitError::InvalidInput`] naming the offending field.
    pub fn validate(&self) -> CardKitResult<()> {
        if self.controller_id.trim().is_empty() {
            return Err(CardKitError::InvalidInput(
                "controller_id must not be empty".to_string(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(CardKitError::InvalidInput(
                "cache_capacity must be positive".to_string(),
            ));
        }
        if self.sync_batch_size == 0 {
            return Err(CardKitError::InvalidInput(
                "sync_batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CardKitConfig {
    /// Role policy table.
    pub roles: RolePolicy,
    /// Rotation scheduler settings.
    pub rotation: RotationConfig,
    /// Offline controller settings.
    pub controller: ControllerConfig,
}

impl CardKitConfig {
    /// Parses a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`CardKitError::Serialization`] for malformed JSON and
    /// [`CardKitError::InvalidInput`] when validation fails.
    pub fn from_json(json: &str) -> CardKitResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| CardKitError::Serialization(err.to_string()))?;
        config.controller.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::Role;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = CardKitConfig::from_json("{}").expect("parse");
        assert_eq!(config, CardKitConfig::default());
        assert_eq!(config.rotation.sweep_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = CardKitConfig::from_json(
            r#"{
                "controller": {"controller_id": "lobby", "cache_capacity": 8},
                "roles": {"admin": {"default_ttl": 10, "rotation_interval": 5}}
            }"#,
        )
        .expect("parse");
        assert_eq!(config.controller.controller_id, "lobby");
        assert_eq!(config.controller.cache_capacity, 8);
        assert_eq!(config.controller.sync_batch_size, 256);
        assert_eq!(config.roles.rotation_interval(Role::Admin), 5);
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        match CardKitConfig::from_json(r#"{"controller": {"cache_capacity": 0}}"#) {
            Err(CardKitError::InvalidInput(message)) => {
                assert!(message.contains("cache_capacity"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
