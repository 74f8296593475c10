//! Configuration types.

use std::time::Duration;

use crate::dispatch::mode::ExecutionMode;
use crate::error::ConfigError;

/// Delegation configuration.
#[derive(Debug, Clone)]
pub struct DelegationConfig {
    /// Mailbox id of the coordinating caller; workers ask questions here.
    pub parent_id: String,
    /// Sender id stamped on cancel notices.
    pub manager_id: String,
    /// Prefix for per-task worker mailbox ids.
    pub mailbox_prefix: String,
    /// How long a worker waits for the parent to answer.
    pub ask_timeout: Duration,
    /// Mode used when a request does not specify one.
    pub default_mode: ExecutionMode,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            parent_id: "parent".to_string(),
            manager_id: "task_manager".to_string(),
            mailbox_prefix: "subagent-".to_string(),
            ask_timeout: Duration::from_secs(300), // 5 minutes
            default_mode: ExecutionMode::Sync,
        }
    }
}

impl DelegationConfig {
    /// Load from `SUBAGENTS_*` environment variables, defaulting anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`DelegationConfig::from_env`] over an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let parent_id = lookup("SUBAGENTS_PARENT_ID")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.parent_id);

        let manager_id = lookup("SUBAGENTS_MANAGER_ID")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.manager_id);

        let mailbox_prefix = lookup("SUBAGENTS_MAILBOX_PREFIX").unwrap_or(defaults.mailbox_prefix);

        let ask_timeout = lookup("SUBAGENTS_ASK_TIMEOUT_SECS")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.ask_timeout);

        let default_mode = match lookup("SUBAGENTS_DEFAULT_MODE") {
            Some(raw) => raw.parse::<ExecutionMode>().map_err(|message| ConfigError::InvalidValue {
                key: "SUBAGENTS_DEFAULT_MODE".to_string(),
                message,
            })?,
            None => defaults.default_mode,
        };

        Ok(Self {
            parent_id,
            manager_id,
            mailbox_prefix,
            ask_timeout,
            default_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = DelegationConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.parent_id, "parent");
        assert_eq!(config.manager_id, "task_manager");
        assert_eq!(config.mailbox_prefix, "subagent-");
        assert_eq!(config.ask_timeout, Duration::from_secs(300));
        assert_eq!(config.default_mode, ExecutionMode::Sync);
    }

    #[test]
    fn overrides_are_applied() {
        let config = DelegationConfig::from_lookup(lookup(&[
            ("SUBAGENTS_PARENT_ID", "coordinator"),
            ("SUBAGENTS_ASK_TIMEOUT_SECS", "12"),
            ("SUBAGENTS_DEFAULT_MODE", "auto"),
        ]))
        .unwrap();
        assert_eq!(config.parent_id, "coordinator");
        assert_eq!(config.ask_timeout, Duration::from_secs(12));
        assert_eq!(config.default_mode, ExecutionMode::Auto);
    }

    #[test]
    fn unparsable_timeout_falls_back() {
        let config =
            DelegationConfig::from_lookup(lookup(&[("SUBAGENTS_ASK_TIMEOUT_SECS", "soon")])).unwrap();
        assert_eq!(config.ask_timeout, Duration::from_secs(300));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let err =
            DelegationConfig::from_lookup(lookup(&[("SUBAGENTS_DEFAULT_MODE", "later")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SUBAGENTS_DEFAULT_MODE"));
    }
}
