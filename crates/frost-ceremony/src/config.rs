//! Ceremony timing and resource limits

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Default capacity of the deduplication set
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Timeouts and limits shared by coordinator and participant drivers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CeremonyConfig {
    /// Session lifetime while waiting for a signing attempt
    #[serde(with = "duration_ms")]
    pub session_timeout: Duration,
    /// Commitment collection window
    #[serde(with = "duration_ms")]
    pub round1_timeout: Duration,
    /// Signature share collection window
    #[serde(with = "duration_ms")]
    pub round2_timeout: Duration,
    /// How long a participant waits for the final result
    #[serde(with = "duration_ms")]
    pub result_timeout: Duration,
    /// Delay between transport polls
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Maximum number of remembered (session, message) pairs
    pub dedup_capacity: usize,
    /// Reject stale or future-dated envelopes
    pub check_freshness: bool,
    #[serde(with = "duration_ms")]
    pub max_message_age: Duration,
    #[serde(with = "duration_ms")]
    pub max_clock_skew: Duration,
}

impl Default for CeremonyConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(10 * 60),
            round1_timeout: Duration::from_secs(2 * 60),
            round2_timeout: Duration::from_secs(2 * 60),
            result_timeout: Duration::from_secs(2 * 60),
            poll_interval: Duration::from_millis(250),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            check_freshness: true,
            max_message_age: Duration::from_secs(10 * 60),
            max_clock_skew: Duration::from_secs(60),
        }
    }
}

impl CeremonyConfig {
    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        let config: CeremonyConfig =
            serde_json::from_str(&json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set both round timeouts and the result timeout
    pub fn with_round_timeout(mut self, timeout: Duration) -> Self {
        self.round1_timeout = timeout;
        self.round2_timeout = timeout;
        self.result_timeout = timeout;
        self
    }

    pub fn with_round1_timeout(mut self, timeout: Duration) -> Self {
        self.round1_timeout = timeout;
        self
    }

    pub fn with_round2_timeout(mut self, timeout: Duration) -> Self {
        self.round2_timeout = timeout;
        self
    }

    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    pub fn with_freshness(mut self, enabled: bool) -> Self {
        self.check_freshness = enabled;
        self
    }

    /// Check that no timeout or limit is zero
    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("sessionTimeout", self.session_timeout),
            ("round1Timeout", self.round1_timeout),
            ("round2Timeout", self.round2_timeout),
            ("resultTimeout", self.result_timeout),
            ("pollInterval", self.poll_interval),
            ("maxMessageAge", self.max_message_age),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(Error::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }
        if self.dedup_capacity == 0 {
            return Err(Error::InvalidConfig("dedupCapacity must be non-zero".into()));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CeremonyConfig::default();
        assert_eq!(config.session_timeout, Duration::from_secs(600));
        assert_eq!(config.round1_timeout, Duration::from_secs(120));
        assert_eq!(config.dedup_capacity, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: CeremonyConfig =
            serde_json::from_str(r#"{"round1Timeout": 500, "checkFreshness": false}"#).unwrap();
        assert_eq!(config.round1_timeout, Duration::from_millis(500));
        assert!(!config.check_freshness);
        assert_eq!(config.round2_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = CeremonyConfig::default().with_round1_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
