// Engine configuration
//
// SyncConfig aggregates the per-component configs. Each component owns its
// config struct next to its implementation; this module only ties them
// together and validates cross-field constraints.

use serde::{Deserialize, Serialize};

use crate::bridge::BridgeConfig;
use crate::channel::ChannelConfig;
use crate::error::ConfigError;
use crate::event_log::EventLogConfig;
use crate::model::Lifecycle;
use crate::scheduler::PollingConfig;
use crate::status::EventVocabulary;

/// History seeding configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryConfig {
    /// Events requested per page
    pub page_size: usize,

    /// Upper bound on pages fetched per seed
    pub max_pages: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 10,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    #[serde(default)]
    pub channel: ChannelConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub event_log: EventLogConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default = "EventVocabulary::agent_run")]
    pub agent_run_vocabulary: EventVocabulary,

    #[serde(default = "EventVocabulary::session")]
    pub session_vocabulary: EventVocabulary,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            polling: PollingConfig::default(),
            bridge: BridgeConfig::default(),
            event_log: EventLogConfig::default(),
            history: HistoryConfig::default(),
            agent_run_vocabulary: EventVocabulary::agent_run(),
            session_vocabulary: EventVocabulary::session(),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    pub fn with_bridge(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn with_event_log(mut self, event_log: EventLogConfig) -> Self {
        self.event_log = event_log;
        self
    }

    pub fn with_history(mut self, history: HistoryConfig) -> Self {
        self.history = history;
        self
    }

    pub fn with_vocabulary(mut self, lifecycle: Lifecycle, vocabulary: EventVocabulary) -> Self {
        match lifecycle {
            Lifecycle::AgentRun => self.agent_run_vocabulary = vocabulary,
            Lifecycle::Session => self.session_vocabulary = vocabulary,
        }
        self
    }

    /// Vocabulary used for a lifecycle
    pub fn vocabulary(&self, lifecycle: Lifecycle) -> &EventVocabulary {
        match lifecycle {
            Lifecycle::AgentRun => &self.agent_run_vocabulary,
            Lifecycle::Session => &self.session_vocabulary,
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.polling.busy_interval.is_zero() {
            return Err(ConfigError::invalid("polling.busy_interval", "must be non-zero"));
        }
        if self.polling.not_found_interval.is_zero() {
            return Err(ConfigError::invalid(
                "polling.not_found_interval",
                "must be non-zero",
            ));
        }
        if self.history.page_size == 0 || self.history.page_size > 500 {
            return Err(ConfigError::invalid(
                "history.page_size",
                "must be between 1 and 500",
            ));
        }
        if self.channel.backoff.initial_interval > self.channel.backoff.max_interval {
            return Err(ConfigError::invalid(
                "channel.backoff",
                "initial_interval exceeds max_interval",
            ));
        }
        Ok(())
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        let config = SyncConfig::new()
            .with_polling(PollingConfig::default().with_busy_interval(Duration::ZERO));

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "polling.busy_interval",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_oversized_history_page() {
        let config = SyncConfig::new().with_history(HistoryConfig {
            page_size: 1000,
            max_pages: 1,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(
            r#"{ "polling": { "busy_interval": 1500, "not_found_interval": 2000 } }"#,
        )
        .unwrap();

        assert_eq!(config.polling.busy_interval, Duration::from_millis(1500));
        assert_eq!(config.bridge, BridgeConfig::default());
        assert_eq!(config.agent_run_vocabulary, EventVocabulary::agent_run());
    }
}
