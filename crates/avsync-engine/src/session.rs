//! Sync session lifecycle and the operations shared by all legs.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, instrument, warn};

use avsync_clock::{ClockAuthority, SessionBinding, WallClock, DEFAULT_VSYNC_INTERVAL};
use avsync_types::{
    AudioSwitchState, LegType, Position, SessionState, StartPolicy, StartReason, SyncMode,
};

use crate::config::{StartPolicyConfig, SyncConfig};
use crate::pattern::PatternDetector;
use crate::pcr::PcrMonitor;
use crate::poll::PollThread;
use crate::state::{Callbacks, PtsEvent, SessionCore};
use crate::stats::{SessionStats, SyncStats};
use crate::{SyncError, SyncResult, DEFAULT_WALL_ADJUST_THRESHOLD};

/// Callback receiving a timestamp (pause reached, underflow).
pub type PtsCallback = Box<dyn FnMut(u32) + Send>;

/// One-shot callback ending an asynchronous audio start.
pub type AudioStartCallback = Box<dyn FnOnce(StartReason) + Send>;

const MIN_SPEED: f32 = 0.001;
const MAX_SPEED: f32 = 100.0;

/// State shared between a session handle and its poll thread.
pub(crate) struct Shared {
    pub id: u32,
    pub leg: LegType,
    pub binding: SessionBinding,
    pub config: SyncConfig,
    pub core: Mutex<SessionCore>,
    pub callbacks: Mutex<Callbacks>,
    pub stats: SyncStats,
}

impl Shared {
    pub fn clock(&self) -> &dyn ClockAuthority {
        self.binding.clock().as_ref()
    }

    pub fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock()
    }

    /// Run a timestamp callback without holding any lock while it runs.
    pub fn fire(&self, event: PtsEvent, pts: u32) {
        let taken = self.callbacks.lock().slot(event).take();
        if let Some(mut callback) = taken {
            callback(pts);
            let mut callbacks = self.callbacks.lock();
            let slot = callbacks.slot(event);
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }

    pub fn has_callback(&self, event: PtsEvent) -> bool {
        self.callbacks.lock().slot(event).is_some()
    }
}

/// One leg (audio, video or PCR) of a playback session.
///
/// All legs created from the same [`SessionBinding`] share its clock
/// authority. Dropping the session drains and releases every frame it
/// still owns, stops its poll thread and tells the authority the leg
/// stopped.
pub struct SyncSession {
    pub(crate) shared: Arc<Shared>,
    pub(crate) poll: Mutex<Option<PollThread>>,
}

impl SyncSession {
    /// Create a leg with the default configuration.
    ///
    /// `start_threshold` is the queue depth that ends buffering; 0 picks
    /// the default.
    pub fn create(
        binding: &SessionBinding,
        mode: SyncMode,
        leg: LegType,
        start_threshold: usize,
    ) -> SyncResult<Self> {
        Self::create_with_config(binding, mode, leg, start_threshold, SyncConfig::default())
    }

    #[instrument(name = "sync_create", skip(binding, config), fields(session = binding.id()))]
    pub fn create_with_config(
        binding: &SessionBinding,
        mode: SyncMode,
        leg: LegType,
        start_threshold: usize,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        config.validate()?;
        let start_threshold = match start_threshold {
            0 => config.start_threshold,
            n if n > config.max_start_threshold => {
                error!(start_threshold = n, "start threshold too large");
                return Err(SyncError::InvalidStartThreshold(n));
            }
            n => n,
        };
        Self::open(binding, mode, leg, start_threshold, config, false)
    }

    /// Join an existing session as an audio or PCR leg.
    ///
    /// Mode, start policy and audio switch state come from the authority.
    #[instrument(name = "sync_attach", skip(binding), fields(session = binding.id()))]
    pub fn attach(binding: &SessionBinding, leg: LegType) -> SyncResult<Self> {
        if leg == LegType::Video {
            error!("video legs cannot attach");
            return Err(SyncError::NotSupported("attaching a video leg"));
        }
        let mode = binding.clock().mode()?;
        let config = SyncConfig::default();
        let start_threshold = config.start_threshold;
        Self::open(binding, mode, leg, start_threshold, config, true)
    }

    fn open(
        binding: &SessionBinding,
        mode: SyncMode,
        leg: LegType,
        start_threshold: usize,
        config: SyncConfig,
        attached: bool,
    ) -> SyncResult<Self> {
        let id = binding.id();
        let clock = binding.clock();
        let mut core = SessionCore::new(mode, start_threshold, &config)?;

        if leg == LegType::Video && mode != SyncMode::VideoMono {
            let interval = clock.wall_clock().map(|w| w.interval).unwrap_or_else(|e| {
                warn!(session = id, error = %e, "no tick interval, assuming 60 Hz");
                DEFAULT_VSYNC_INTERVAL
            });
            core.pattern = Some(PatternDetector::new(interval));
        }
        if leg == LegType::Pcr {
            core.pcr_monitor = Some(PcrMonitor::new());
        }

        match clock.disc_thresholds() {
            Ok((min, max)) => {
                core.disc_thres_min = min;
                core.disc_thres_max = max;
            }
            Err(e) => warn!(
                session = id,
                error = %e,
                min = core.disc_thres_min,
                max = core.disc_thres_max,
                "discontinuity thresholds unavailable, using defaults"
            ),
        }

        if attached {
            match clock.start_policy() {
                Ok((policy, timeout_ms)) => {
                    core.start_policy = policy;
                    core.start_timeout_ms = timeout_ms;
                }
                Err(e) => warn!(session = id, error = %e, "start policy unavailable"),
            }
            match clock.active_status(leg, false) {
                Ok(status) => {
                    core.active_mode = status.active_mode;
                    core.in_audio_switch = status.audio_switch;
                    if status.audio_switch {
                        core.audio_switch_state = AudioSwitchState::Reset;
                    }
                }
                Err(e) => warn!(session = id, error = %e, "active status unavailable"),
            }
        } else {
            clock.set_mode(mode)?;
            if leg == LegType::Video && matches!(mode, SyncMode::VideoMaster | SyncMode::Iptv) {
                if let Err(e) = clock.set_wall_adjust_threshold(core.disc_thres_min) {
                    warn!(session = id, error = %e, "failed to set wall adjust threshold");
                }
            }
        }

        info!(
            session = id,
            mode = mode.name(),
            leg = leg.name(),
            start_threshold,
            attached,
            "sync session created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                leg,
                binding: binding.clone(),
                config,
                core: Mutex::new(core),
                callbacks: Mutex::new(Callbacks::default()),
                stats: SyncStats::new(),
            }),
            poll: Mutex::new(None),
        })
    }

    /// Tear the leg down. Same as dropping it.
    pub fn destroy(self) {}

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn leg(&self) -> LegType {
        self.shared.leg
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats.snapshot()
    }

    pub(crate) fn clock(&self) -> &dyn ClockAuthority {
        self.shared.clock()
    }

    pub(crate) fn expect_leg(&self, expected: LegType) -> SyncResult<()> {
        if self.shared.leg == expected {
            Ok(())
        } else {
            Err(SyncError::WrongLeg {
                expected: expected.name(),
                actual: self.shared.leg.name(),
            })
        }
    }

    /// Start the poll thread unless it is already running.
    pub(crate) fn ensure_poll_thread(&self) -> SyncResult<()> {
        let mut poll = self.poll.lock();
        if poll.is_none() {
            *poll = Some(PollThread::spawn(Arc::clone(&self.shared))?);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn has_poll_thread(&self) -> bool {
        self.poll.lock().is_some()
    }

    /// Pause or resume the leg.
    pub fn pause(&self, pause: bool) -> SyncResult<()> {
        let leg = self.shared.leg;
        let clock = self.clock();
        let mut core = self.shared.lock();

        if core.mode == SyncMode::VideoMono && leg == LegType::Video {
            return Err(SyncError::NotSupported("pause in mono-clock mode"));
        }
        if core.mode == SyncMode::PcrMaster {
            return Err(SyncError::NotSupported("pause in PCR master mode"));
        }

        let status = match clock.active_status(leg, false) {
            Ok(status) => {
                core.active_mode = status.active_mode;
                core.in_audio_switch = status.audio_switch;
                Some(status)
            }
            Err(e) => {
                warn!(session = self.shared.id, error = %e, "active status unavailable");
                None
            }
        };

        if core.mode == SyncMode::AudioMaster
            && leg == LegType::Video
            && status.is_some_and(|s| s.audio_active)
            && !core.in_audio_switch
        {
            if pause {
                info!(session = self.shared.id, "audio leg active, video pause ignored");
            } else {
                core.paused = false;
            }
            return Ok(());
        }

        if core.in_audio_switch && leg == LegType::Audio {
            info!(session = self.shared.id, pause, "audio switch in progress, resetting");
            core.audio_switch_state = AudioSwitchState::Reset;
            return Ok(());
        }

        let result = clock.signal_pause(pause);
        core.paused = pause;
        if !pause && core.first_frame_toggled {
            core.underflow.touch(clock.monotonic_now());
        }
        info!(session = self.shared.id, leg = leg.name(), pause, "pause");
        result.map_err(Into::into)
    }

    /// Set the playback rate. Ignored in live modes.
    pub fn set_speed(&self, speed: f32) -> SyncResult<()> {
        if !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
            error!(session = self.shared.id, speed, "speed out of range");
            return Err(SyncError::InvalidSpeed(speed));
        }
        let clock = self.clock();
        let core = self.shared.lock();
        if core.mode.is_live() {
            info!(session = self.shared.id, speed, "speed ignored in live mode");
            return Ok(());
        }
        if self.shared.leg == LegType::Audio {
            let threshold = if speed == 1.0 {
                DEFAULT_WALL_ADJUST_THRESHOLD
            } else {
                core.disc_thres_min
            };
            clock.set_wall_adjust_threshold(threshold)?;
        }
        drop(core);
        clock.set_rate(speed)?;
        info!(session = self.shared.id, speed, "speed set");
        Ok(())
    }

    /// Current playback rate of the authority.
    pub fn speed(&self) -> SyncResult<f32> {
        Ok(self.clock().rate()?)
    }

    #[instrument(name = "sync_change_mode", skip(self), fields(session = self.shared.id))]
    pub fn change_mode(&self, mode: SyncMode) -> SyncResult<()> {
        let mut core = self.shared.lock();
        self.clock().set_mode(mode)?;
        info!(from = core.mode.name(), to = mode.name(), "sync mode changed");
        core.mode = mode;
        core.backup_mode = mode;
        Ok(())
    }

    pub fn mode(&self) -> SyncMode {
        self.shared.lock().mode
    }

    /// Set the start policy. `None` and `VideoPeek` stay local.
    pub fn set_start_policy(&self, config: StartPolicyConfig) -> SyncResult<()> {
        let clock = self.clock();
        let mut core = self.shared.lock();
        let StartPolicyConfig { policy, timeout_ms } = config;

        if core.mode == SyncMode::Iptv && policy != StartPolicy::Asap {
            error!(session = self.shared.id, ?policy, "IPTV only supports ASAP start");
            return Err(SyncError::UnsupportedPolicy {
                policy,
                mode: core.mode,
            });
        }
        if core.mode == SyncMode::PcrMaster {
            clock.set_start_buffer_threshold(timeout_ms.max(0) as u32)?;
        }

        core.start_policy = policy;
        core.start_timeout_ms = timeout_ms;
        if !policy.is_local() {
            clock.set_start_policy(policy, timeout_ms)?;
        }
        info!(session = self.shared.id, ?policy, timeout_ms, "start policy set");
        Ok(())
    }

    pub fn start_policy(&self) -> StartPolicyConfig {
        let core = self.shared.lock();
        StartPolicyConfig {
            policy: core.start_policy,
            timeout_ms: core.start_timeout_ms,
        }
    }

    pub fn set_name(&self, name: &str) -> SyncResult<()> {
        self.clock().set_name(name)?;
        debug!(session = self.shared.id, name, "session named");
        Ok(())
    }

    pub fn wall_clock(&self) -> SyncResult<WallClock> {
        Ok(self.clock().wall_clock()?)
    }

    /// Last position the authority recorded for this leg.
    pub fn position(&self) -> SyncResult<Position> {
        Ok(self.clock().position(self.shared.leg)?)
    }

    /// Start a seamless audio switch. Both legs must be active.
    pub fn set_audio_switch(&self, start: bool) -> SyncResult<()> {
        let clock = self.clock();
        let status = clock.active_status(self.shared.leg, false)?;
        if !status.video_active || !status.audio_active {
            error!(
                session = self.shared.id,
                video = status.video_active,
                audio = status.audio_active,
                "audio switch needs both legs active"
            );
            return Err(SyncError::LegsInactive {
                video: status.video_active,
                audio: status.audio_active,
            });
        }
        clock.set_audio_switch(start)?;

        let mut core = self.shared.lock();
        core.in_audio_switch = start;
        core.audio_switch_state = AudioSwitchState::Init;
        info!(session = self.shared.id, start, "audio switch");
        Ok(())
    }

    /// Whether the authority reports an audio switch in progress.
    pub fn audio_switch(&self) -> SyncResult<bool> {
        Ok(self.clock().active_status(self.shared.leg, false)?.audio_switch)
    }

    fn teardown(&mut self) {
        let id = self.shared.id;
        let leg = self.shared.leg;

        let frames = if leg == LegType::Video {
            let mut core = self.shared.lock();
            core.state = SessionState::Init;
            core.drain_frames()
        } else {
            Vec::new()
        };
        let released = frames.len();
        // Release callbacks run here, outside the lock.
        drop(frames);

        let poll = self.poll.lock().take();
        if let Some(mut poll) = poll {
            poll.stop();
        }

        let (pending, started) = {
            let mut core = self.shared.lock();
            (core.audio_start_cb.take(), core.session_started)
        };
        if let Some(callback) = pending {
            info!(session = id, "cancelling pending audio start");
            callback(StartReason::Stop);
        }
        if started {
            if let Err(e) = self.clock().signal_stop(leg) {
                error!(session = id, leg = leg.name(), error = %e, "failed to signal stop");
            }
        }
        info!(session = id, leg = leg.name(), released, "sync session destroyed");
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
