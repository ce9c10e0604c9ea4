//! Coordination configuration
//!
//! Every tuning constant of the sync protocol lives here. The defaults were
//! tuned against ordinary home and mobile networks; none of them are
//! load-bearing and all can be overridden from TOML.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for a coordinator and its clients
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Clock synchronization cadence and filtering
    #[serde(default)]
    pub clock: ClockSyncConfig,

    /// Scheduling margin bounds
    #[serde(default)]
    pub scheduling: SchedulingConfig,

    /// Client-side drift correction
    #[serde(default)]
    pub drift: DriftConfig,

    /// Grace periods for membership
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Voting
    #[serde(default)]
    pub voting: VotingConfig,

    /// Debounce windows and bounded buffers
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Clock synchronization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockSyncConfig {
    /// Ping interval while calibrating
    #[serde(default = "default_calibration_interval_ms")]
    pub calibration_interval_ms: u64,

    /// Accepted samples required before switching to steady state
    #[serde(default = "default_calibration_samples")]
    pub calibration_samples: usize,

    /// Ping interval once calibrated
    #[serde(default = "default_steady_interval_ms")]
    pub steady_interval_ms: u64,

    /// Sliding window of retained samples
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Samples with a round trip above this are discarded
    #[serde(default = "default_max_rtt_ms")]
    pub max_rtt_ms: f64,
}

fn default_calibration_interval_ms() -> u64 {
    50
}

fn default_calibration_samples() -> usize {
    8
}

fn default_steady_interval_ms() -> u64 {
    5_000
}

fn default_window_size() -> usize {
    20
}

fn default_max_rtt_ms() -> f64 {
    10_000.0
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            calibration_interval_ms: default_calibration_interval_ms(),
            calibration_samples: default_calibration_samples(),
            steady_interval_ms: default_steady_interval_ms(),
            window_size: default_window_size(),
            max_rtt_ms: default_max_rtt_ms(),
        }
    }
}

impl ClockSyncConfig {
    pub fn calibration_interval(&self) -> Duration {
        Duration::from_millis(self.calibration_interval_ms)
    }

    pub fn steady_interval(&self) -> Duration {
        Duration::from_millis(self.steady_interval_ms)
    }
}

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Lower bound for the lead time of a scheduled action
    #[serde(default = "default_min_margin_ms")]
    pub min_margin_ms: u64,

    /// Upper bound for the lead time of a scheduled action
    #[serde(default = "default_max_margin_ms")]
    pub max_margin_ms: u64,

    /// Worst round trip in the room is multiplied by this before clamping
    #[serde(default = "default_rtt_multiplier")]
    pub rtt_multiplier: f64,

    /// Periodic snapshot broadcast for rooms with a current track
    #[serde(default = "default_snapshot_broadcast_interval_ms")]
    pub snapshot_broadcast_interval_ms: u64,
}

fn default_min_margin_ms() -> u64 {
    300
}

fn default_max_margin_ms() -> u64 {
    2_000
}

fn default_rtt_multiplier() -> f64 {
    1.5
}

fn default_snapshot_broadcast_interval_ms() -> u64 {
    10_000
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            min_margin_ms: default_min_margin_ms(),
            max_margin_ms: default_max_margin_ms(),
            rtt_multiplier: default_rtt_multiplier(),
            snapshot_broadcast_interval_ms: default_snapshot_broadcast_interval_ms(),
        }
    }
}

impl SchedulingConfig {
    pub fn snapshot_broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_broadcast_interval_ms)
    }
}

/// Drift correction settings (client side)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    /// Above this absolute drift the client seeks
    #[serde(default = "default_hard_threshold_secs")]
    pub hard_threshold_secs: f64,

    /// Above this absolute drift the client nudges its playback rate
    #[serde(default = "default_soft_threshold_secs")]
    pub soft_threshold_secs: f64,

    /// Rate adjustment applied between the soft and hard thresholds
    #[serde(default = "default_rate_nudge")]
    pub rate_nudge: f64,

    /// Corrections are suppressed for this long after any seek or transition
    #[serde(default = "default_guard_window_ms")]
    pub guard_window_ms: u64,

    /// Upper clamp for the one-way network delay added to a snapshot
    #[serde(default = "default_max_network_delay_ms")]
    pub max_network_delay_ms: u64,

    /// Host position report interval
    #[serde(default = "default_host_report_interval_ms")]
    pub host_report_interval_ms: u64,

    /// Fallback snapshot poll interval for non-host clients
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_hard_threshold_secs() -> f64 {
    3.0
}

fn default_soft_threshold_secs() -> f64 {
    0.3
}

fn default_rate_nudge() -> f64 {
    0.04
}

fn default_guard_window_ms() -> u64 {
    2_000
}

fn default_max_network_delay_ms() -> u64 {
    1_000
}

fn default_host_report_interval_ms() -> u64 {
    3_000
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            hard_threshold_secs: default_hard_threshold_secs(),
            soft_threshold_secs: default_soft_threshold_secs(),
            rate_nudge: default_rate_nudge(),
            guard_window_ms: default_guard_window_ms(),
            max_network_delay_ms: default_max_network_delay_ms(),
            host_report_interval_ms: default_host_report_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl DriftConfig {
    pub fn guard_window(&self) -> Duration {
        Duration::from_millis(self.guard_window_ms)
    }

    pub fn host_report_interval(&self) -> Duration {
        Duration::from_millis(self.host_report_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Membership grace periods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// How long a disconnected host/admin keeps their role
    #[serde(default = "default_role_grace_ms")]
    pub role_grace_ms: u64,

    /// How long an empty room survives before deletion
    #[serde(default = "default_room_deletion_grace_ms")]
    pub room_deletion_grace_ms: u64,
}

fn default_role_grace_ms() -> u64 {
    30_000
}

fn default_room_deletion_grace_ms() -> u64 {
    60_000
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            role_grace_ms: default_role_grace_ms(),
            room_deletion_grace_ms: default_room_deletion_grace_ms(),
        }
    }
}

impl LifecycleConfig {
    pub fn role_grace(&self) -> Duration {
        Duration::from_millis(self.role_grace_ms)
    }

    pub fn room_deletion_grace(&self) -> Duration {
        Duration::from_millis(self.room_deletion_grace_ms)
    }
}

/// Voting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingConfig {
    /// Votes that have not resolved after this long fail with `timeout`
    #[serde(default = "default_vote_timeout_ms")]
    pub vote_timeout_ms: u64,
}

fn default_vote_timeout_ms() -> u64 {
    30_000
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            vote_timeout_ms: default_vote_timeout_ms(),
        }
    }
}

impl VotingConfig {
    pub fn vote_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_timeout_ms)
    }
}

/// Debounce windows and bounded buffers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Repeated skips inside this window are ignored
    #[serde(default = "default_skip_debounce_ms")]
    pub skip_debounce_ms: u64,

    /// A second play request for the same track inside this window is ignored
    #[serde(default = "default_duplicate_play_window_ms")]
    pub duplicate_play_window_ms: u64,

    /// Chat messages kept per room
    #[serde(default = "default_chat_history_limit")]
    pub chat_history_limit: usize,

    /// Maximum queued tracks per room
    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: usize,
}

fn default_skip_debounce_ms() -> u64 {
    2_000
}

fn default_duplicate_play_window_ms() -> u64 {
    1_500
}

fn default_chat_history_limit() -> usize {
    100
}

fn default_max_queue_len() -> usize {
    500
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            skip_debounce_ms: default_skip_debounce_ms(),
            duplicate_play_window_ms: default_duplicate_play_window_ms(),
            chat_history_limit: default_chat_history_limit(),
            max_queue_len: default_max_queue_len(),
        }
    }
}

impl CoordinationConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: CoordinationConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.clock.calibration_samples == 0 {
            return Err(Error::InvalidConfig(
                "clock.calibration_samples must be at least 1".to_string(),
            ));
        }

        if self.clock.window_size < self.clock.calibration_samples {
            return Err(Error::InvalidConfig(format!(
                "clock.window_size ({}) must be >= clock.calibration_samples ({})",
                self.clock.window_size, self.clock.calibration_samples
            )));
        }

        if self.clock.calibration_interval_ms == 0
            || self.clock.steady_interval_ms < self.clock.calibration_interval_ms
        {
            return Err(Error::InvalidConfig(format!(
                "clock intervals must satisfy 0 < calibration ({}) <= steady ({})",
                self.clock.calibration_interval_ms, self.clock.steady_interval_ms
            )));
        }

        if self.clock.max_rtt_ms <= 0.0 {
            return Err(Error::InvalidConfig(
                "clock.max_rtt_ms must be positive".to_string(),
            ));
        }

        if self.scheduling.min_margin_ms > self.scheduling.max_margin_ms {
            return Err(Error::InvalidConfig(format!(
                "scheduling.min_margin_ms ({}) must be <= max_margin_ms ({})",
                self.scheduling.min_margin_ms, self.scheduling.max_margin_ms
            )));
        }

        if self.scheduling.rtt_multiplier <= 0.0 {
            return Err(Error::InvalidConfig(
                "scheduling.rtt_multiplier must be positive".to_string(),
            ));
        }

        if self.drift.soft_threshold_secs < 0.0
            || self.drift.soft_threshold_secs >= self.drift.hard_threshold_secs
        {
            return Err(Error::InvalidConfig(format!(
                "drift thresholds must satisfy 0 <= soft ({}) < hard ({})",
                self.drift.soft_threshold_secs, self.drift.hard_threshold_secs
            )));
        }

        if !(0.0..0.5).contains(&self.drift.rate_nudge) {
            return Err(Error::InvalidConfig(format!(
                "drift.rate_nudge must be in range 0.0-0.5, got {}",
                self.drift.rate_nudge
            )));
        }

        if self.voting.vote_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "voting.vote_timeout_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CoordinationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.clock.calibration_samples, 8);
        assert_eq!(config.drift.hard_threshold_secs, 3.0);
        assert!(config.lifecycle.room_deletion_grace_ms > config.lifecycle.role_grace_ms);
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[clock]
calibration_samples = 4
window_size = 10

[drift]
hard_threshold_secs = 2.0
soft_threshold_secs = 0.25

[lifecycle]
role_grace_ms = 10000
"#;

        let config: CoordinationConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.clock.calibration_samples, 4);
        assert_eq!(config.clock.steady_interval_ms, 5_000);
        assert_eq!(config.drift.soft_threshold_secs, 0.25);
        assert_eq!(config.lifecycle.role_grace_ms, 10_000);
        assert_eq!(config.voting.vote_timeout_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let mut config = CoordinationConfig::default();
        config.drift.soft_threshold_secs = 5.0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_margins_rejected() {
        let mut config = CoordinationConfig::default();
        config.scheduling.min_margin_ms = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cosync.toml");
        std::fs::write(&path, "[voting]\nvote_timeout_ms = 15000\n").unwrap();

        let config = CoordinationConfig::from_file(&path).unwrap();
        assert_eq!(config.voting.vote_timeout_ms, 15_000);
    }
}
