//! Session configuration.

use serde::{Deserialize, Serialize};

use avsync_frame::MAX_FRAME_NUM;
use avsync_types::time::ms_to_pts;
use avsync_types::StartPolicy;

use crate::{
    SyncError, SyncResult, DEFAULT_DISC_THRES_MAX, DEFAULT_DISC_THRES_MIN,
    DEFAULT_START_THRESHOLD, MAX_START_THRESHOLD,
};

/// Tunables shared by every leg of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Capacity of the video frame queue.
    pub queue_capacity: usize,

    /// Start threshold used when a leg is created with 0.
    pub start_threshold: usize,

    /// Largest start threshold accepted at create.
    pub max_start_threshold: usize,

    /// Idle time before the underflow callback fires, in ms.
    pub underflow_threshold_ms: u32,

    /// Notification wait of the audio poll thread, in ms.
    pub audio_poll_timeout_ms: u64,

    /// Notification wait of the video poll thread, in ms.
    pub video_poll_timeout_ms: u64,

    /// Fallback lower discontinuity threshold, 90 kHz units.
    pub disc_thres_min: u32,

    /// Fallback upper discontinuity threshold, 90 kHz units.
    pub disc_thres_max: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_capacity: MAX_FRAME_NUM,
            start_threshold: DEFAULT_START_THRESHOLD,
            max_start_threshold: MAX_START_THRESHOLD,
            underflow_threshold_ms: 100,
            audio_poll_timeout_ms: 10,
            video_poll_timeout_ms: 100,
            disc_thres_min: DEFAULT_DISC_THRES_MIN,
            disc_thres_max: DEFAULT_DISC_THRES_MAX,
        }
    }
}

impl SyncConfig {
    /// Reject values no session could run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.queue_capacity == 0 {
            return Err(SyncError::InvalidConfig("queue_capacity must be positive".into()));
        }
        if self.start_threshold == 0 || self.start_threshold > self.max_start_threshold {
            return Err(SyncError::InvalidConfig(format!(
                "start_threshold {} outside 1..={}",
                self.start_threshold, self.max_start_threshold
            )));
        }
        if self.max_start_threshold > self.queue_capacity {
            return Err(SyncError::InvalidConfig(format!(
                "max_start_threshold {} exceeds queue capacity {}",
                self.max_start_threshold, self.queue_capacity
            )));
        }
        if self.audio_poll_timeout_ms == 0 || self.video_poll_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig("poll timeouts must be positive".into()));
        }
        if self.disc_thres_min == 0 || self.disc_thres_min >= self.disc_thres_max {
            return Err(SyncError::InvalidConfig(format!(
                "discontinuity thresholds {}..{} are not ordered",
                self.disc_thres_min, self.disc_thres_max
            )));
        }
        Ok(())
    }
}

/// Display pipeline settings of a video leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Display pipeline depth in ticks, 1 or 2.
    pub delay: u32,

    /// Extra latency added to every frame timestamp, in ms.
    pub extra_delay_ms: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            delay: 1,
            extra_delay_ms: 0,
        }
    }
}

impl VideoConfig {
    pub fn validate(&self) -> SyncResult<()> {
        match self.delay {
            1 | 2 => Ok(()),
            other => Err(SyncError::InvalidDelay(other)),
        }
    }

    /// Extra delay in 90 kHz units.
    pub fn extra_delay_pts(&self) -> u32 {
        ms_to_pts(self.extra_delay_ms)
    }
}

/// Start policy plus its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartPolicyConfig {
    pub policy: StartPolicy,

    /// Timeout in ms; negative means the authority default.
    pub timeout_ms: i32,
}

impl Default for StartPolicyConfig {
    fn default() -> Self {
        Self {
            policy: StartPolicy::None,
            timeout_ms: -1,
        }
    }
}

/// Underflow callback settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnderflowConfig {
    /// Idle time without a new frame before the callback fires, in ms.
    pub time_threshold_ms: u32,
}

impl Default for UnderflowConfig {
    fn default() -> Self {
        Self {
            time_threshold_ms: SyncConfig::default().underflow_threshold_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_capacity, 32);
        assert_eq!(config.disc_thres_min, 30_000);
    }

    #[test]
    fn test_unordered_thresholds_rejected() {
        let config = SyncConfig {
            disc_thres_min: 900_000,
            disc_thres_max: 30_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"start_threshold": 1}"#).unwrap();
        assert_eq!(config.start_threshold, 1);
        assert_eq!(config.video_poll_timeout_ms, 100);
    }

    #[test]
    fn test_video_delay() {
        assert!(VideoConfig { delay: 2, extra_delay_ms: 0 }.validate().is_ok());
        assert!(matches!(
            VideoConfig { delay: 3, extra_delay_ms: 0 }.validate(),
            Err(SyncError::InvalidDelay(3))
        ));
        assert_eq!(VideoConfig { delay: 1, extra_delay_ms: 20 }.extra_delay_pts(), 1800);
    }
}
