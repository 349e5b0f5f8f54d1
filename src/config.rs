//! Tracker configuration
//!
//! Fixed at startup. Loaded from TOML or assembled with the `with_*`
//! setters, then checked by [`TrackerConfig::validate`] before any loop is
//! spawned.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Longest accepted duration for any timing field
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Capacities, timings and retry ceiling for one [`PublishTracker`](crate::PublishTracker)
///
/// Durations are written in humantime form in TOML:
///
/// ```toml
/// registration_capacity = 4
/// publish_timeout = "1s"
/// replay_delay = "500ms"
/// max_replays = 2
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Number of callers that may wait on an outcome at the same time.
    pub registration_capacity: usize,

    /// Number of orphaned confirmations that may await re-announcement.
    pub replay_capacity: usize,

    /// How long a caller waits for its confirmation before timing out.
    #[serde(with = "humantime_serde")]
    pub publish_timeout: Duration,

    /// Delay before an orphaned confirmation is re-announced.
    #[serde(with = "humantime_serde")]
    pub replay_delay: Duration,

    /// Maximum re-announcements of one orphaned confirmation.
    pub max_replays: u32,

    /// Longest wait of the reconciliation loop for the next event; bounds
    /// the expiry sweep cadence.
    #[serde(with = "humantime_serde")]
    pub sweep_period: Duration,

    /// Replay scheduler tick.
    #[serde(with = "humantime_serde")]
    pub replay_period: Duration,

    /// Depth of the bounded confirmation queue.
    pub feed_depth: usize,

    /// Last-resort unblock for a caller whose registration was never
    /// resolved.
    #[serde(with = "humantime_serde")]
    pub hard_ceiling: Duration,

    /// Topic used by `publish` when none is given.
    pub default_topic: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            registration_capacity: crate::REGISTRATION_CAPACITY,
            replay_capacity: crate::REPLAY_CAPACITY,
            publish_timeout: Duration::from_millis(crate::PUBLISH_TIMEOUT_MS),
            replay_delay: Duration::from_millis(crate::REPLAY_DELAY_MS),
            max_replays: crate::MAX_REPLAYS,
            sweep_period: Duration::from_millis(crate::SWEEP_PERIOD_MS),
            replay_period: Duration::from_millis(crate::REPLAY_PERIOD_MS),
            feed_depth: crate::FEED_DEPTH,
            hard_ceiling: Duration::from_millis(crate::HARD_CEILING_MS),
            default_topic: crate::records::INCIDENTS_TOPIC.to_string(),
        }
    }
}

impl TrackerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML text; missing keys keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn with_registration_capacity(mut self, capacity: usize) -> Self {
        self.registration_capacity = capacity;
        self
    }

    pub fn with_replay_capacity(mut self, capacity: usize) -> Self {
        self.replay_capacity = capacity;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_replay_delay(mut self, delay: Duration) -> Self {
        self.replay_delay = delay;
        self
    }

    pub fn with_max_replays(mut self, max_replays: u32) -> Self {
        self.max_replays = max_replays;
        self
    }

    pub fn with_sweep_period(mut self, period: Duration) -> Self {
        self.sweep_period = period;
        self
    }

    pub fn with_replay_period(mut self, period: Duration) -> Self {
        self.replay_period = period;
        self
    }

    pub fn with_feed_depth(mut self, depth: usize) -> Self {
        self.feed_depth = depth;
        self
    }

    pub fn with_hard_ceiling(mut self, ceiling: Duration) -> Self {
        self.hard_ceiling = ceiling;
        self
    }

    pub fn with_default_topic(mut self, topic: impl Into<String>) -> Self {
        self.default_topic = topic.into();
        self
    }

    /// Check the configuration for values the loops cannot run with
    ///
    /// # Errors
    /// - any capacity, the feed depth or a loop period is zero
    /// - a duration is longer than [`MAX_DURATION`]
    /// - `hard_ceiling` is shorter than `publish_timeout + sweep_period`,
    ///   which would unblock callers before a regular timeout could reach them
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("registration_capacity", self.registration_capacity as u128),
            ("replay_capacity", self.replay_capacity as u128),
            ("feed_depth", self.feed_depth as u128),
            ("publish_timeout", self.publish_timeout.as_millis()),
            ("sweep_period", self.sweep_period.as_millis()),
            ("replay_period", self.replay_period.as_millis()),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field });
        }

        let timings = [
            ("publish_timeout", self.publish_timeout),
            ("replay_delay", self.replay_delay),
            ("sweep_period", self.sweep_period),
            ("replay_period", self.replay_period),
            ("hard_ceiling", self.hard_ceiling),
        ];
        if let Some((field, _)) = timings.iter().find(|(_, value)| *value > MAX_DURATION) {
            return Err(ConfigError::DurationTooLarge {
                field,
                limit_secs: MAX_DURATION.as_secs(),
            });
        }

        let minimum = self
            .publish_timeout
            .checked_add(self.sweep_period)
            .ok_or(ConfigError::DurationTooLarge {
                field: "publish_timeout",
                limit_secs: MAX_DURATION.as_secs(),
            })?;
        if self.hard_ceiling < minimum {
            return Err(ConfigError::CeilingTooShort {
                ceiling_ms: self.hard_ceiling.as_millis(),
                minimum_ms: minimum.as_millis(),
            });
        }
        Ok(())
    }
}
