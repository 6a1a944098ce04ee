//! Mutable state of one session leg, guarded by the session lock.

use std::time::Duration;

use tracing::warn;

use avsync_frame::{Frame, FrameQueue};
use avsync_types::{AudioSwitchState, PausePts, SessionState, StartPolicy, SyncMode};

use crate::config::SyncConfig;
use crate::pattern::PatternDetector;
use crate::pcr::PcrMonitor;
use crate::session::{AudioStartCallback, PtsCallback};
use crate::SyncResult;

/// Frame deltas above this (20 fps) are not used for rate estimation.
const MAX_FPS_DELTA: i32 = 4500;

/// Deltas averaged before the estimate is frozen.
const FPS_SAMPLE_LIMIT: u32 = 100;

const SYNC_LOST_PRINT_INTERVAL: Duration = Duration::from_secs(10);

/// Sub-tick offset added to the wall clock once locked.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Phase {
    pub offset: u32,
    pub locked: bool,
    pub nudged: bool,
}

impl Phase {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn apply(&self, systime: u32) -> u32 {
        if self.locked {
            systime.wrapping_add(self.offset)
        } else {
            systime
        }
    }
}

/// Running average of pushed frame deltas.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FpsEstimator {
    total: u64,
    samples: u32,
    interval: Option<u32>,
}

impl FpsEstimator {
    pub fn observe(&mut self, delta: i32) {
        if self.samples >= FPS_SAMPLE_LIMIT || delta <= 0 || delta > MAX_FPS_DELTA {
            return;
        }
        self.total += u64::from(delta.unsigned_abs());
        self.samples += 1;
        if self.samples > 1 {
            self.interval = Some((self.total / u64::from(self.samples)) as u32);
        }
    }

    /// Estimated frame interval, falling back to the tick interval.
    pub fn interval_or(&self, tick: u32) -> u32 {
        self.interval.unwrap_or(tick)
    }
}

/// Idle tracking for the underflow callback.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct UnderflowWatch {
    pub threshold_ms: u32,
    pub last_update: Duration,
    pub reported: bool,
}

impl UnderflowWatch {
    pub fn touch(&mut self, now: Duration) {
        self.last_update = now;
        self.reported = false;
    }
}

/// Rate limiter for the sync-lost warning.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SyncLostLog {
    last_systime: Option<u32>,
    last_fpts: Option<u32>,
    last_print: Option<Duration>,
    suppressed: u32,
}

impl SyncLostLog {
    pub fn note(&mut self, session: u32, systime: u32, fpts: u32, now: Duration) {
        if self.last_systime == Some(systime) && self.last_fpts == Some(fpts) {
            return;
        }
        self.last_systime = Some(systime);
        self.last_fpts = Some(fpts);

        match self.last_print {
            Some(at) if now.saturating_sub(at) < SYNC_LOST_PRINT_INTERVAL => self.suppressed += 1,
            _ => {
                warn!(
                    session,
                    systime,
                    fpts,
                    gap = avsync_types::time::diff(systime, fpts),
                    suppressed = self.suppressed,
                    "video sync lost"
                );
                self.suppressed = 0;
                self.last_print = Some(now);
            }
        }
    }
}

/// Callbacks invoked outside the session lock.
#[derive(Default)]
pub(crate) struct Callbacks {
    pub pause_reached: Option<PtsCallback>,
    pub underflow: Option<PtsCallback>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum PtsEvent {
    PauseReached,
    Underflow,
}

impl Callbacks {
    pub fn slot(&mut self, event: PtsEvent) -> &mut Option<PtsCallback> {
        match event {
            PtsEvent::PauseReached => &mut self.pause_reached,
            PtsEvent::Underflow => &mut self.underflow,
        }
    }
}

pub(crate) struct SessionCore {
    pub mode: SyncMode,
    /// Mode to restore when the debug free-run override is lifted.
    pub backup_mode: SyncMode,
    pub active_mode: SyncMode,
    pub state: SessionState,
    pub start_policy: StartPolicy,
    pub start_timeout_ms: i32,
    pub start_threshold: usize,
    pub delay: u32,
    pub extra_delay: u32,
    pub disc_thres_min: u32,
    pub disc_thres_max: u32,
    pub paused: bool,
    pub pause_pts: Option<PausePts>,
    pub session_started: bool,
    pub first_frame_toggled: bool,
    /// Last displayed (video) or rendered (audio) timestamp.
    pub last_pts: Option<u32>,

    pub queue: FrameQueue<Frame>,
    pub next_sequence: u64,
    pub last_frame: Option<Frame>,
    pub last_holding_period: u32,
    pub last_queued_pts: Option<u32>,
    pub vpts: u32,
    pub interval: Option<u32>,
    pub fps: FpsEstimator,
    pub phase: Phase,
    pub pattern: Option<PatternDetector>,
    pub outlier_cnt: u32,
    pub last_disc_pts: Option<u32>,
    /// Wall time of the last fps-paced expiry.
    pub last_paced_systime: Option<u32>,
    pub sync_lost_log: SyncLostLog,
    pub underflow: UnderflowWatch,
    pub vsync_mono_ns: u64,

    pub in_audio_switch: bool,
    pub audio_switch_state: AudioSwitchState,
    pub audio_start_cb: Option<AudioStartCallback>,
    /// Last audio timestamp accepted by `audio_render`.
    pub apts: Option<u32>,
    /// Start of the current run of dropped chunks.
    pub audio_drop_started: Option<Duration>,
    pub debug_free_run: bool,
    /// Playback rate mirrored from the authority in audio master mode.
    pub rate: f32,

    pub pcr_monitor: Option<PcrMonitor>,
    pub last_ppm: i32,
}

impl SessionCore {
    pub fn new(mode: SyncMode, start_threshold: usize, config: &SyncConfig) -> SyncResult<Self> {
        Ok(Self {
            mode,
            backup_mode: mode,
            active_mode: mode,
            state: SessionState::Init,
            start_policy: StartPolicy::None,
            start_timeout_ms: -1,
            start_threshold,
            delay: 1,
            extra_delay: 0,
            disc_thres_min: config.disc_thres_min,
            disc_thres_max: config.disc_thres_max,
            paused: false,
            pause_pts: None,
            session_started: false,
            first_frame_toggled: false,
            last_pts: None,
            queue: FrameQueue::new(config.queue_capacity)?,
            next_sequence: 0,
            last_frame: None,
            last_holding_period: 0,
            last_queued_pts: None,
            vpts: 0,
            interval: None,
            fps: FpsEstimator::default(),
            phase: Phase::default(),
            pattern: None,
            outlier_cnt: 0,
            last_disc_pts: None,
            last_paced_systime: None,
            sync_lost_log: SyncLostLog::default(),
            underflow: UnderflowWatch {
                threshold_ms: config.underflow_threshold_ms,
                ..Default::default()
            },
            vsync_mono_ns: 0,
            in_audio_switch: false,
            audio_switch_state: AudioSwitchState::Init,
            audio_start_cb: None,
            apts: None,
            audio_drop_started: None,
            debug_free_run: false,
            rate: 1.0,
            pcr_monitor: None,
            last_ppm: 0,
        })
    }

    /// Drop phase lock and cadence history.
    pub fn reset_lock(&mut self) {
        self.phase.reset();
        self.reset_pattern();
    }

    pub fn reset_pattern(&mut self) {
        if let Some(pattern) = self.pattern.as_mut() {
            pattern.reset();
        }
    }

    /// Hold period of the displayed frame, 0 before the first toggle.
    pub fn current_hold(&self) -> u32 {
        self.last_frame.as_ref().map_or(0, Frame::hold_period)
    }

    /// Every frame the leg still owns, displayed frame first then FIFO.
    pub fn drain_frames(&mut self) -> Vec<Frame> {
        let mut frames: Vec<Frame> = self.last_frame.take().into_iter().collect();
        frames.extend(self.queue.drain());
        frames
    }

    pub fn stamp_sequence(&mut self, frame: &mut Frame) {
        frame.set_sequence(self.next_sequence);
        self.next_sequence += 1;
    }
}
