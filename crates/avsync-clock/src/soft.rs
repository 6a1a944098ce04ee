//! In-memory clock authority.
//!
//! Keeps the wall clock, mode register and leg flags in process memory.
//! Time only moves when [`SoftClock::advance`] is called, which makes it
//! the authority of choice for tests and the simulator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use avsync_types::time::{self, TIME_UNIT_90K};
use avsync_types::{
    ActiveStatus, AudioStartDecision, ClockEvent, LegType, Position, StartPolicy, SyncMode,
};

use crate::{ClockAuthority, ClockError, ClockResult, WallClock, DEFAULT_VSYNC_INTERVAL};

/// Start points within this distance of the wall clock start synchronously.
const SYNC_START_WINDOW: u32 = 2700;

/// One timestamp report received from a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportedPts {
    pub wall: u32,
    pub pts: u32,
    pub delay: u32,
}

#[derive(Debug)]
struct SoftState {
    mode: SyncMode,
    active_mode: SyncMode,
    rate: f32,
    wall: Option<u32>,
    interval: u32,
    paused: bool,
    mono: Duration,
    video_active: bool,
    audio_active: bool,
    video_timeout: bool,
    audio_switch: bool,
    debug_free_run: bool,
    start_policy: StartPolicy,
    start_timeout_ms: i32,
    start_buffer_ms: u32,
    pcr: Position,
    clock_deviation: i32,
    disc_thresholds: Option<(u32, u32)>,
    wall_adjust_threshold: u32,
    name: String,
    video_pos: Position,
    audio_pos: Position,
    video_start: Option<u32>,
    audio_start: Option<u32>,
    scripted_audio_starts: VecDeque<AudioStartDecision>,
    discontinuities: Vec<(LegType, u32)>,
    video_reports: Vec<ReportedPts>,
    audio_reports: Vec<ReportedPts>,
    audio_wait_releases: u32,
}

impl SoftState {
    fn new() -> Self {
        Self {
            mode: SyncMode::VideoMaster,
            active_mode: SyncMode::VideoMaster,
            rate: 1.0,
            wall: None,
            interval: DEFAULT_VSYNC_INTERVAL,
            paused: false,
            mono: Duration::ZERO,
            video_active: false,
            audio_active: false,
            video_timeout: false,
            audio_switch: false,
            debug_free_run: false,
            start_policy: StartPolicy::None,
            start_timeout_ms: -1,
            start_buffer_ms: 0,
            pcr: Position::default(),
            clock_deviation: 0,
            disc_thresholds: Some((30_000, 900_000)),
            wall_adjust_threshold: 9000,
            name: String::new(),
            video_pos: Position::default(),
            audio_pos: Position::default(),
            video_start: None,
            audio_start: None,
            scripted_audio_starts: VecDeque::new(),
            discontinuities: Vec::new(),
            video_reports: Vec::new(),
            audio_reports: Vec::new(),
            audio_wait_releases: 0,
        }
    }

    fn mono_ns(&self) -> u64 {
        self.mono.as_nanos() as u64
    }

    fn decide_audio_start(&mut self, start: u32) -> AudioStartDecision {
        match self.wall {
            None if self.mode == SyncMode::AudioMaster => {
                self.wall = Some(start);
                AudioStartDecision::Sync
            }
            None => AudioStartDecision::Async,
            Some(wall) => {
                let gap = time::diff(start, wall);
                if gap.unsigned_abs() < SYNC_START_WINDOW || gap < 0 {
                    AudioStartDecision::Sync
                } else {
                    AudioStartDecision::Async
                }
            }
        }
    }
}

/// Clock authority backed by process memory.
pub struct SoftClock {
    id: u32,
    failing: AtomicBool,
    state: Mutex<SoftState>,
    subscribers: Mutex<Vec<Sender<ClockEvent>>>,
}

impl SoftClock {
    /// Create a stopped clock for session `id`.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            failing: AtomicBool::new(false),
            state: Mutex::new(SoftState::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> ClockResult<MutexGuard<'_, SoftState>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ClockError::Unavailable(format!(
                "session {} authority offline",
                self.id
            )));
        }
        Ok(self.state.lock())
    }

    /// Deliver `event` to every live subscriber without blocking.
    pub fn raise(&self, event: ClockEvent) {
        trace!(session = self.id, ?event, "raising clock event");
        self.subscribers
            .lock()
            .retain(|tx| !matches!(tx.try_send(event), Err(TrySendError::Disconnected(_))));
    }

    /// Move time forward by `ticks` 90 kHz units.
    ///
    /// The monotonic clock always advances; the wall clock only advances
    /// once started and while not paused, scaled by the playback rate.
    pub fn advance(&self, ticks: u32) {
        let mut st = self.state.lock();
        st.mono += Duration::from_nanos(u64::from(ticks) * 1_000_000_000 / u64::from(TIME_UNIT_90K));
        if st.paused {
            return;
        }
        let step = (f64::from(ticks) * f64::from(st.rate)).round() as u32;
        if let Some(wall) = st.wall.as_mut() {
            *wall = wall.wrapping_add(step);
        }
    }

    /// Move only the monotonic clock.
    pub fn advance_mono(&self, elapsed: Duration) {
        self.state.lock().mono += elapsed;
    }

    pub fn set_wall(&self, wall: Option<u32>) {
        self.state.lock().wall = wall;
    }

    pub fn set_interval(&self, interval: u32) {
        self.state.lock().interval = interval;
    }

    /// Override the active mode without touching the configured one.
    pub fn set_active_mode(&self, mode: SyncMode) {
        self.state.lock().active_mode = mode;
        self.raise(ClockEvent::ModeChanged(mode));
    }

    pub fn set_leg_active(&self, leg: LegType, active: bool) {
        {
            let mut st = self.state.lock();
            match leg {
                LegType::Video => st.video_active = active,
                LegType::Audio => st.audio_active = active,
                LegType::Pcr => {}
            }
        }
        self.raise(ClockEvent::LegActivity);
    }

    pub fn set_video_timeout(&self, timeout: bool) {
        self.state.lock().video_timeout = timeout;
        self.raise(ClockEvent::LegActivity);
    }

    pub fn set_debug_free_run(&self, on: bool) {
        self.state.lock().debug_free_run = on;
        self.raise(ClockEvent::DebugFreeRun(on));
    }

    /// Make every fallible operation fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stop reporting discontinuity thresholds.
    pub fn clear_disc_thresholds(&self) {
        self.state.lock().disc_thresholds = None;
    }

    /// Queue the answer for the next `signal_audio_start`.
    pub fn script_audio_start(&self, decision: AudioStartDecision) {
        self.state.lock().scripted_audio_starts.push_back(decision);
    }

    pub fn wall(&self) -> Option<u32> {
        self.state.lock().wall
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn video_start_pts(&self) -> Option<u32> {
        self.state.lock().video_start
    }

    pub fn audio_start_pts(&self) -> Option<u32> {
        self.state.lock().audio_start
    }

    pub fn discontinuities(&self) -> Vec<(LegType, u32)> {
        self.state.lock().discontinuities.clone()
    }

    pub fn video_reports(&self) -> Vec<ReportedPts> {
        self.state.lock().video_reports.clone()
    }

    pub fn audio_reports(&self) -> Vec<ReportedPts> {
        self.state.lock().audio_reports.clone()
    }

    pub fn audio_wait_releases(&self) -> u32 {
        self.state.lock().audio_wait_releases
    }

    pub fn wall_adjust_threshold(&self) -> u32 {
        self.state.lock().wall_adjust_threshold
    }

    pub fn start_buffer_threshold(&self) -> u32 {
        self.state.lock().start_buffer_ms
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }
}

impl ClockAuthority for SoftClock {
    fn session_id(&self) -> u32 {
        self.id
    }

    fn wall_clock(&self) -> ClockResult<WallClock> {
        let st = self.state()?;
        Ok(WallClock {
            time: st.wall,
            interval: st.interval,
        })
    }

    fn set_mode(&self, mode: SyncMode) -> ClockResult<()> {
        {
            let mut st = self.state()?;
            st.mode = mode;
            st.active_mode = mode;
        }
        debug!(session = self.id, mode = mode.name(), "mode set");
        self.raise(ClockEvent::ModeChanged(mode));
        Ok(())
    }

    fn mode(&self) -> ClockResult<SyncMode> {
        Ok(self.state()?.mode)
    }

    fn set_rate(&self, rate: f32) -> ClockResult<()> {
        self.state()?.rate = rate;
        self.raise(ClockEvent::RateChanged);
        Ok(())
    }

    fn rate(&self) -> ClockResult<f32> {
        Ok(self.state()?.rate)
    }

    fn report_video_pts(&self, wall: u32, pts: u32, delay: u32) -> ClockResult<()> {
        let mut st = self.state()?;
        st.video_pos = Position {
            pts,
            mono_ns: st.mono_ns(),
        };
        st.video_reports.push(ReportedPts { wall, pts, delay });
        Ok(())
    }

    fn report_audio_pts(&self, wall: u32, pts: u32, delay: u32) -> ClockResult<()> {
        let mut st = self.state()?;
        st.audio_pos = Position {
            pts,
            mono_ns: st.mono_ns(),
        };
        st.audio_reports.push(ReportedPts { wall, pts, delay });
        Ok(())
    }

    fn signal_discontinuity(&self, leg: LegType, pts: u32) -> ClockResult<()> {
        let mut st = self.state()?;
        st.discontinuities.push((leg, pts));
        if leg == LegType::Video && st.mode == SyncMode::VideoMaster {
            st.wall = Some(pts);
        }
        Ok(())
    }

    fn signal_video_start(&self, pts: u32) -> ClockResult<()> {
        {
            let mut st = self.state()?;
            st.video_active = true;
            st.video_start = Some(pts);
            if st.wall.is_none() && st.mode != SyncMode::AudioMaster {
                st.wall = Some(pts);
            }
        }
        self.raise(ClockEvent::LegActivity);
        Ok(())
    }

    fn signal_audio_start(&self, pts: u32, delay: u32) -> ClockResult<AudioStartDecision> {
        let decision = {
            let mut st = self.state()?;
            st.audio_active = true;
            st.audio_start = Some(pts);
            match st.scripted_audio_starts.pop_front() {
                Some(decision) => decision,
                None => st.decide_audio_start(pts.wrapping_sub(delay)),
            }
        };
        self.raise(ClockEvent::LegActivity);
        Ok(decision)
    }

    fn signal_stop(&self, leg: LegType) -> ClockResult<()> {
        {
            let mut st = self.state()?;
            match leg {
                LegType::Video => st.video_active = false,
                LegType::Audio => st.audio_active = false,
                LegType::Pcr => {}
            }
        }
        self.raise(ClockEvent::LegActivity);
        Ok(())
    }

    fn signal_pause(&self, paused: bool) -> ClockResult<()> {
        self.state()?.paused = paused;
        Ok(())
    }

    fn active_status(&self, _leg: LegType, _clear_urgent: bool) -> ClockResult<ActiveStatus> {
        let st = self.state()?;
        Ok(ActiveStatus {
            active_mode: st.active_mode,
            video_active: st.video_active,
            audio_active: st.audio_active,
            video_timeout: st.video_timeout,
            audio_switch: st.audio_switch,
            debug_free_run: st.debug_free_run,
        })
    }

    fn set_clock_deviation(&self, ppm: i32) -> ClockResult<()> {
        self.state()?.clock_deviation = ppm;
        Ok(())
    }

    fn clock_deviation(&self) -> ClockResult<i32> {
        Ok(self.state()?.clock_deviation)
    }

    fn clock_started(&self) -> ClockResult<bool> {
        Ok(self.state()?.wall.is_some())
    }

    fn set_start_policy(&self, policy: StartPolicy, timeout_ms: i32) -> ClockResult<()> {
        let mut st = self.state()?;
        st.start_policy = policy;
        st.start_timeout_ms = timeout_ms;
        Ok(())
    }

    fn start_policy(&self) -> ClockResult<(StartPolicy, i32)> {
        let st = self.state()?;
        Ok((st.start_policy, st.start_timeout_ms))
    }

    fn set_start_buffer_threshold(&self, ms: u32) -> ClockResult<()> {
        self.state()?.start_buffer_ms = ms;
        Ok(())
    }

    fn set_pcr(&self, pts: u32, mono_ns: u64) -> ClockResult<()> {
        self.state()?.pcr = Position { pts, mono_ns };
        Ok(())
    }

    fn pcr(&self) -> ClockResult<Position> {
        Ok(self.state()?.pcr)
    }

    fn disc_thresholds(&self) -> ClockResult<(u32, u32)> {
        self.state()?
            .disc_thresholds
            .ok_or(ClockError::Rejected("discontinuity threshold query"))
    }

    fn set_disc_thresholds(&self, min: u32, max: u32) -> ClockResult<()> {
        self.state()?.disc_thresholds = Some((min, max));
        Ok(())
    }

    fn set_wall_adjust_threshold(&self, threshold: u32) -> ClockResult<()> {
        self.state()?.wall_adjust_threshold = threshold;
        Ok(())
    }

    fn set_name(&self, name: &str) -> ClockResult<()> {
        self.state()?.name = name.to_string();
        Ok(())
    }

    fn set_audio_switch(&self, active: bool) -> ClockResult<()> {
        self.state()?.audio_switch = active;
        self.raise(ClockEvent::AudioSwitch(active));
        Ok(())
    }

    fn release_audio_wait(&self) -> ClockResult<()> {
        self.state()?.audio_wait_releases += 1;
        Ok(())
    }

    fn position(&self, leg: LegType) -> ClockResult<Position> {
        let st = self.state()?;
        match leg {
            LegType::Video => Ok(st.video_pos),
            LegType::Audio => Ok(st.audio_pos),
            LegType::Pcr => Ok(st.pcr),
        }
    }

    fn monotonic_now(&self) -> Duration {
        self.state.lock().mono
    }

    fn subscribe(&self) -> Receiver<ClockEvent> {
        let (tx, rx) = avsync_types::event_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}
