use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and ICE settings for a call session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval between connectivity-restart attempts while reconnecting
    #[serde(with = "duration_secs")]
    pub retry_interval: Duration,
    /// Time allowed in `Reconnecting` before the call is given up
    #[serde(with = "duration_secs")]
    pub retry_budget: Duration,
    /// Resolution of the connected-duration counter
    #[serde(with = "duration_secs")]
    pub duration_tick: Duration,
    pub ice_servers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(5),
            retry_budget: Duration::from_secs(30),
            duration_tick: Duration::from_secs(1),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl SessionConfig {
    /// Check the timers can actually run. Returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.retry_interval.is_zero() {
            errors.push("retry_interval must be non-zero".to_string());
        }
        if self.duration_tick.is_zero() {
            errors.push("duration_tick must be non-zero".to_string());
        }
        if self.retry_budget < self.retry_interval {
            errors.push(format!(
                "retry_budget ({}s) must be at least retry_interval ({}s)",
                self.retry_budget.as_secs(),
                self.retry_interval.as_secs()
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
