//! Service configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{NotifyError, Result};
use crate::reconnect::{ReconnectPolicy, millis};
use crate::record::NotificationKind;
use crate::window::DEFAULT_WINDOW_CAPACITY;

/// Path suffix trimmed from the REST base address to get the channel host.
pub const DEFAULT_STREAM_PATH_SUFFIX: &str = "/api";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// REST base address, e.g. `https://example.com/api`
    pub base_url: String,
    pub stream_path_suffix: String,
    pub reconnect: ReconnectPolicy,
    /// Streamed records kept in memory before the oldest are evicted
    pub stream_window: usize,
    /// Debounce of the history refresh triggered by a full window
    #[serde(with = "millis")]
    pub refresh_debounce: Duration,
    /// Kinds counted by a sibling subsystem and excluded from the streamed tally
    pub out_of_band_kinds: Vec<NotificationKind>,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Capacity of the command, socket event and broadcast channels
    pub event_capacity: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            stream_path_suffix: DEFAULT_STREAM_PATH_SUFFIX.to_string(),
            reconnect: ReconnectPolicy::default(),
            stream_window: DEFAULT_WINDOW_CAPACITY,
            refresh_debounce: Duration::from_secs(2),
            out_of_band_kinds: vec![NotificationKind::FollowRequest],
            request_timeout: Duration::from_secs(15),
            event_capacity: 256,
        }
    }
}

impl NotifyConfig {
    pub fn builder() -> NotifyConfigBuilder {
        NotifyConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.base_url)
            .map_err(|e| NotifyError::config(format!("invalid base_url {:?}: {e}", self.base_url)))?;
        if self.stream_window == 0 {
            return Err(NotifyError::config("stream_window must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(NotifyError::config("event_capacity must be at least 1"));
        }
        if self.reconnect.base_delay.is_zero() {
            return Err(NotifyError::config("reconnect.base_delay must be positive"));
        }
        if self.reconnect.max_delay < self.reconnect.base_delay {
            return Err(NotifyError::config(
                "reconnect.max_delay must not be below reconnect.base_delay",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotifyConfigBuilder {
    config: NotifyConfig,
}

impl NotifyConfigBuilder {
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = base_url.into();
        self
    }

    pub fn stream_path_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.config.stream_path_suffix = suffix.into();
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    pub fn stream_window(mut self, capacity: usize) -> Self {
        self.config.stream_window = capacity;
        self
    }

    pub fn refresh_debounce(mut self, debounce: Duration) -> Self {
        self.config.refresh_debounce = debounce;
        self
    }

    pub fn out_of_band_kinds(mut self, kinds: Vec<NotificationKind>) -> Self {
        self.config.out_of_band_kinds = kinds;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<NotifyConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NotifyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stream_window, 50);
        assert_eq!(config.out_of_band_kinds, vec![NotificationKind::FollowRequest]);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: NotifyConfig = serde_json::from_str(
            r#"{"base_url": "https://example.com/api", "refresh_debounce": 500,
                "reconnect": {"max_attempts": 3}}"#,
        )
        .unwrap();

        assert_eq!(config.base_url, "https://example.com/api");
        assert_eq!(config.refresh_debounce, Duration::from_millis(500));
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.base_delay, Duration::from_secs(1));
        assert_eq!(config.stream_path_suffix, "/api");
    }

    #[test]
    fn test_builder_validates() {
        assert!(
            NotifyConfig::builder()
                .base_url("not a url")
                .build()
                .is_err()
        );
        assert!(NotifyConfig::builder().stream_window(0).build().is_err());

        let config = NotifyConfig::builder()
            .base_url("https://example.com/api")
            .stream_window(10)
            .build()
            .unwrap();
        assert_eq!(config.stream_window, 10);
    }
}
