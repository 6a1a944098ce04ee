//! Video leg: frame push and the per-tick pop.

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use avsync_clock::ClockAuthority;
use avsync_frame::Frame;
use avsync_types::time::diff;
use avsync_types::{LegType, PausePts, SessionState, StartPolicy, SyncMode};

use crate::config::{UnderflowConfig, VideoConfig};
use crate::expiry::ExpiryInput;
use crate::pattern::Cadence;
use crate::session::{PtsCallback, Shared, SyncSession};
use crate::state::{PtsEvent, SessionCore};
use crate::{SyncError, SyncResult};

/// Frames a widened video-master gap is multiplied by for the thresholds.
const TRICK_PLAY_MIN_FACTOR: u32 = 6;
const TRICK_PLAY_MAX_FACTOR: u32 = 20;

/// The frame on screen after a pop.
///
/// `toggled` is true on the tick the frame replaced its predecessor;
/// held frames come back with the same `sequence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayedFrame {
    pub sequence: u64,
    pub pts: u32,
    pub duration: u32,
    /// Ticks this frame has been on screen, this one included.
    pub hold_period: u32,
    pub toggled: bool,
    pub payload: Bytes,
}

impl DisplayedFrame {
    fn new(frame: &Frame, toggled: bool) -> Self {
        Self {
            sequence: frame.sequence(),
            pts: frame.pts(),
            duration: frame.duration(),
            hold_period: frame.hold_period(),
            toggled,
            payload: frame.payload().clone(),
        }
    }
}

/// Work left for after the session lock is released.
#[derive(Default)]
struct PopEffects {
    retired: Vec<Frame>,
    pause_reached: Option<u32>,
    underflow: Option<u32>,
    report: Option<(u32, u32, u32)>,
}

impl SyncSession {
    /// Queue a frame for display.
    ///
    /// On a full queue the frame comes back inside the error and no state
    /// changes.
    pub fn push_frame(&self, mut frame: Frame) -> SyncResult<()> {
        self.expect_leg(LegType::Video)?;
        let id = self.shared.id;
        let clock = self.clock();

        let mut evicted = None;
        {
            let mut core = self.shared.lock();
            if core.queue.is_full() {
                warn!(session = id, pts = frame.pts(), "frame queue full");
                return Err(SyncError::QueueFull(frame));
            }

            if core.mode == SyncMode::VideoMono {
                core.stamp_sequence(&mut frame);
                trace!(session = id, mono_ns = frame.mono_time_ns(), "push mono frame");
                core.queue.push(frame).map_err(SyncError::QueueFull)?;
                self.shared.stats.record_push();
                return Ok(());
            }

            if core.state.is_init() && core.queue.is_empty() {
                let (policy, timeout_ms) = clock.start_policy()?;
                core.start_policy = policy;
                core.start_timeout_ms = timeout_ms;
            }

            if let Some(last) = core.last_queued_pts {
                let gap = diff(frame.pts(), last);
                if core.mode == SyncMode::VideoMaster && gap > core.disc_thres_min as i32 {
                    widen_thresholds(&mut core, id, gap.unsigned_abs(), clock);
                }
                if gap == 0 && core.mode == SyncMode::AudioMaster {
                    evicted = core.queue.pop_back();
                    info!(session = id, pts = last, "duplicate timestamp, replacing queued frame");
                } else {
                    core.fps.observe(gap);
                }
            }

            frame.reset_hold_period();
            core.last_queued_pts = Some(frame.pts());
            core.stamp_sequence(&mut frame);
            trace!(session = id, pts = frame.pts(), queued = core.queue.len() + 1, "push frame");
            core.queue.push(frame).map_err(SyncError::QueueFull)?;
            self.shared.stats.record_push();

            if core.state.is_init() && core.queue.len() >= core.start_threshold {
                core.state = SessionState::Running;
                info!(session = id, queued = core.queue.len(), "video running");
            }
        }
        drop(evicted);

        if let Err(e) = self.ensure_poll_thread() {
            error!(session = id, error = %e, "video poll thread unavailable");
        }
        Ok(())
    }

    /// Pick the frame to show on this tick.
    ///
    /// Returns `None` while buffering, while waiting for the clock under the
    /// align policy, or before the first frame is due.
    pub fn pop_frame(&self) -> SyncResult<Option<DisplayedFrame>> {
        self.expect_leg(LegType::Video)?;
        let shared = &*self.shared;
        let clock = self.clock();

        let mut effects = PopEffects::default();
        let shown = {
            let mut core = shared.lock();
            let entered = core.last_frame.as_ref().map(Frame::sequence);

            if core.mode == SyncMode::VideoMono {
                pop_mono(&mut core, shared.id, &mut effects.retired);
            } else if core.state.is_started() {
                if !core.session_started {
                    let Some(head_pts) = core.queue.peek(0).map(Frame::pts) else {
                        return Ok(None);
                    };
                    let wall = clock.wall_clock()?;
                    let start = head_pts.wrapping_sub(core.delay.wrapping_mul(wall.interval));
                    if let Err(e) = clock.signal_video_start(start) {
                        error!(session = shared.id, error = %e, "failed to signal video start");
                    }
                    info!(session = shared.id, pts = start, "video start");
                    core.session_started = true;
                }

                if core.start_policy == StartPolicy::Align
                    && !core.first_frame_toggled
                    && !clock.clock_started().unwrap_or(false)
                {
                    trace!(session = shared.id, "clock not started");
                    return Ok(None);
                }

                let wall = clock.wall_clock()?;
                if core.interval != Some(wall.interval) {
                    info!(
                        session = shared.id,
                        from = ?core.interval,
                        to = wall.interval,
                        "tick interval update"
                    );
                    core.interval = Some(wall.interval);
                    core.reset_lock();
                }

                if let Some(systime) = wall.time {
                    expire_frames(&mut core, shared, systime, wall.interval, &mut effects.retired);
                }
                effects.pause_reached = check_pause_target(&mut core, shared.id);
                effects.underflow = check_underflow(&mut core, shared);

                if let (Some(systime), Some(last)) = (wall.time, core.last_frame.as_ref()) {
                    if entered != Some(last.sequence()) && !last.is_outlier() {
                        effects.report = Some((
                            systime,
                            last.pts().wrapping_add(core.extra_delay),
                            wall.interval.wrapping_mul(core.delay),
                        ));
                    }
                }
            }

            core.last_frame.as_mut().map(|frame| {
                frame.hold();
                DisplayedFrame::new(frame, entered != Some(frame.sequence()))
            })
        };

        let PopEffects {
            retired,
            pause_reached,
            underflow,
            report,
        } = effects;
        drop(retired);

        if let Some(pts) = pause_reached {
            shared.fire(PtsEvent::PauseReached, pts);
        }
        if let Some(pts) = underflow {
            shared.stats.record_underflow();
            shared.fire(PtsEvent::Underflow, pts);
        }
        if let Some((wall, pts, delay)) = report {
            if let Err(e) = clock.report_video_pts(wall, pts, delay) {
                error!(session = shared.id, error = %e, "failed to report video pts");
            }
        }
        Ok(shown)
    }

    /// Set pipeline delay and extra latency.
    pub fn set_video_config(&self, config: VideoConfig) -> SyncResult<()> {
        config.validate()?;
        let mut core = self.shared.lock();
        core.delay = config.delay;
        core.extra_delay = config.extra_delay_pts();
        info!(
            session = self.shared.id,
            delay = config.delay,
            extra_delay_ms = config.extra_delay_ms,
            "video config"
        );
        Ok(())
    }

    /// Arm, or with `None` clear, the pause target.
    pub fn set_pause_pts(&self, target: Option<PausePts>) {
        let mut core = self.shared.lock();
        core.pause_pts = target;
        info!(session = self.shared.id, ?target, "pause target");
    }

    /// Callback fired once when the pause target is reached.
    pub fn set_pause_callback(&self, callback: Option<PtsCallback>) {
        self.shared.callbacks.lock().pause_reached = callback;
    }

    /// Callback fired when no new frame was shown for too long.
    pub fn set_underflow_callback(&self, callback: Option<PtsCallback>, config: UnderflowConfig) {
        self.shared.callbacks.lock().underflow = callback;
        self.shared.lock().underflow.threshold_ms = config.time_threshold_ms;
    }

    /// End of stream: start playing even below the start threshold.
    pub fn set_eos(&self) {
        let mut core = self.shared.lock();
        if core.state.is_init() {
            core.state = SessionState::Running;
            info!(session = self.shared.id, queued = core.queue.len(), "eos, video running");
        }
    }

    /// Monotonic time of the current tick, for mono-clock mode.
    pub fn set_vsync_mono_time(&self, mono_ns: u64) {
        self.shared.lock().vsync_mono_ns = mono_ns;
    }

    /// Pulldown cadence the detector has locked onto.
    pub fn cadence(&self) -> Option<Cadence> {
        self.shared.lock().pattern.as_ref().and_then(|p| p.detected())
    }
}

fn widen_thresholds(core: &mut SessionCore, id: u32, gap: u32, clock: &dyn ClockAuthority) {
    core.disc_thres_min = gap.saturating_mul(TRICK_PLAY_MIN_FACTOR);
    core.disc_thres_max = gap.saturating_mul(TRICK_PLAY_MAX_FACTOR);
    info!(
        session = id,
        gap,
        min = core.disc_thres_min,
        max = core.disc_thres_max,
        "large frame gap, widening discontinuity thresholds"
    );
    if let Err(e) = clock.set_wall_adjust_threshold(core.disc_thres_min) {
        error!(session = id, error = %e, "failed to set wall adjust threshold");
    }
    if let Err(e) = clock.set_disc_thresholds(core.disc_thres_min, core.disc_thres_max) {
        error!(session = id, error = %e, "failed to set discontinuity thresholds");
    }
}

/// Toggle through every expired frame at the head of the queue.
fn expire_frames(
    core: &mut SessionCore,
    shared: &Shared,
    systime: u32,
    interval: u32,
    retired: &mut Vec<Frame>,
) {
    let clock = shared.clock();
    let now = clock.monotonic_now();
    let mut toggled = 0;

    while let Some(head) = core.queue.peek(0) {
        let input = ExpiryInput {
            systime,
            interval,
            pts: head.pts(),
            next_pts: core.queue.peek(1).map(Frame::pts),
            toggled,
            now,
        };
        let verdict = core.frame_expire(shared.id, &input, clock, &shared.stats);
        if verdict.outlier {
            if let Some(head) = core.queue.peek_mut(0) {
                head.mark_outlier();
            }
        }
        if !verdict.expire {
            break;
        }
        toggled += 1;

        let cur = core.current_hold();
        let last = core.last_holding_period;
        if let Some(pattern) = core.pattern.as_mut() {
            if pattern.detect(cur, last) {
                shared.stats.record_pattern_break();
                debug!(session = shared.id, pts = input.pts, systime, "cadence broken");
            }
        }
        if core.last_frame.is_some() {
            core.last_holding_period = cur;
        }

        let Some(frame) = core.queue.pop() else {
            break;
        };
        let pts = frame.pts();
        match core.last_frame.replace(frame) {
            Some(previous) => {
                if toggled > 1 {
                    shared.stats.record_drop();
                    debug!(
                        session = shared.id,
                        dropped = previous.pts(),
                        pts,
                        queued = core.queue.len(),
                        "frame dropped within tick"
                    );
                }
                retired.push(previous);
            }
            None => {
                core.first_frame_toggled = true;
                info!(session = shared.id, pts, queued = core.queue.len(), "first frame toggled");
            }
        }
        core.last_pts = Some(pts);
        core.underflow.touch(now);
        shared.stats.record_toggle();
        trace!(session = shared.id, pts, systime, "frame expired");

        if core.pause_pts == Some(PausePts::Step) {
            break;
        }
    }
}

/// Mono-clock mode: expire purely on frame monotonic times.
fn pop_mono(core: &mut SessionCore, id: u32, retired: &mut Vec<Frame>) {
    let now = core.vsync_mono_ns;
    while core.queue.peek(0).is_some_and(|f| now >= f.mono_time_ns()) {
        let Some(frame) = core.queue.pop() else {
            break;
        };
        if let Some(previous) = core.last_frame.as_ref() {
            core.last_holding_period = previous.hold_period();
        }
        match core.last_frame.replace(frame) {
            Some(previous) => retired.push(previous),
            None => {
                core.first_frame_toggled = true;
                info!(session = id, mono_ns = now, "first mono frame toggled");
            }
        }
    }
}

fn check_pause_target(core: &mut SessionCore, id: u32) -> Option<u32> {
    let target = core.pause_pts?;
    let reached = match (target, core.last_frame.as_ref()) {
        (PausePts::Step, Some(last)) => Some(last.pts()),
        (PausePts::At(pts), Some(last)) => (diff(last.pts(), pts) >= 0).then_some(pts),
        (PausePts::At(pts), None) => core
            .queue
            .peek(0)
            .is_some_and(|head| diff(head.pts(), pts) >= 0)
            .then_some(pts),
        (PausePts::Step, None) => None,
    }?;

    core.paused = true;
    core.pause_pts = None;
    info!(session = id, pts = reached, "pause target reached");
    Some(reached)
}

fn check_underflow(core: &mut SessionCore, shared: &Shared) -> Option<u32> {
    if !core.session_started
        || !core.first_frame_toggled
        || core.paused
        || core.state < SessionState::Running
        || !core.queue.is_empty()
        || core.underflow.reported
    {
        return None;
    }
    if !shared.has_callback(PtsEvent::Underflow) {
        return None;
    }

    let interval = core.interval.unwrap_or(0);
    let allowed_ms = u64::from(core.underflow.threshold_ms)
        + u64::from(interval) * u64::from(core.last_holding_period) / 90;
    let idle = shared
        .clock()
        .monotonic_now()
        .saturating_sub(core.underflow.last_update);
    if (idle.as_millis() as u64) < allowed_ms {
        return None;
    }

    core.underflow.reported = true;
    let pts = core.last_pts.unwrap_or(0);
    info!(session = shared.id, pts, idle_ms = idle.as_millis() as u64, "video underflow");
    Some(pts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Weak};
    use std::time::Duration;

    use parking_lot::Mutex;

    use avsync_clock::{SessionBinding, SoftClock};

    const BASE: u32 = 90_000;

    fn session(mode: SyncMode) -> (Arc<SoftClock>, SyncSession) {
        let clock = Arc::new(SoftClock::new(7));
        let binding = SessionBinding::open(clock.clone());
        let session = SyncSession::create(&binding, mode, LegType::Video, 0).unwrap();
        (clock, session)
    }

    fn frame(pts: u32) -> Frame {
        Frame::new(Bytes::from_static(b"nv12"), pts, 1500)
    }

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Frame) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |pts: u32| {
            let sink = Arc::clone(&sink);
            frame(pts).with_release(move |f: &Frame| sink.lock().push(f.pts()))
        };
        (log, make)
    }

    #[test]
    fn test_each_frame_toggles_exactly_once() {
        let (clock, video) = session(SyncMode::VideoMaster);
        for i in 0..32 {
            video.push_frame(frame(BASE + i * 1500)).unwrap();
        }

        let mut toggled = Vec::new();
        for _ in 0..40 {
            if let Some(shown) = video.pop_frame().unwrap() {
                if shown.toggled {
                    toggled.push(shown.sequence);
                }
            }
            clock.advance(1500);
        }

        assert_eq!(toggled, (0..32).collect::<Vec<u64>>());
        let stats = video.stats();
        assert_eq!(stats.frames_toggled, 32);
        assert_eq!(stats.frames_dropped, 0);
        assert_eq!(video.state(), SessionState::SyncSetup);
        assert_eq!(clock.video_start_pts(), Some(BASE - 1500));

        let reports = clock.video_reports();
        assert_eq!(reports.len(), 32);
        assert_eq!(reports[0].pts, BASE);
        assert_eq!(reports[0].delay, 1500);
    }

    #[test]
    fn test_buffering_until_start_threshold() {
        let (_clock, video) = session(SyncMode::VideoMaster);
        video.push_frame(frame(BASE)).unwrap();
        assert_eq!(video.state(), SessionState::Init);
        assert!(video.pop_frame().unwrap().is_none());

        video.push_frame(frame(BASE + 1500)).unwrap();
        assert_eq!(video.state(), SessionState::Running);
        assert_eq!(video.pop_frame().unwrap().map(|f| f.pts), Some(BASE));
    }

    #[test]
    fn test_eos_starts_below_threshold() {
        let (_clock, video) = session(SyncMode::VideoMaster);
        video.push_frame(frame(BASE)).unwrap();
        video.set_eos();
        assert_eq!(video.pop_frame().unwrap().map(|f| f.pts), Some(BASE));
    }

    #[test]
    fn test_queue_full_hands_frame_back() {
        let (_clock, video) = session(SyncMode::VideoMaster);
        for i in 0..32 {
            video.push_frame(frame(BASE + i * 1500)).unwrap();
        }
        match video.push_frame(frame(1234)) {
            Err(SyncError::QueueFull(rejected)) => assert_eq!(rejected.pts(), 1234),
            other => panic!("expected queue full, got {other:?}"),
        }
        let core = video.shared.lock();
        assert_eq!(core.queue.len(), 32);
        assert_eq!(core.last_queued_pts, Some(BASE + 31 * 1500));
    }

    #[test]
    fn test_audio_master_duplicate_replaces_queued_frame() {
        let (_clock, video) = session(SyncMode::AudioMaster);
        let (released, make) = recorder();
        video.push_frame(make(BASE)).unwrap();
        video.push_frame(frame(BASE)).unwrap();

        assert_eq!(*released.lock(), vec![BASE]);
        assert_eq!(video.shared.lock().queue.len(), 1);
    }

    #[test]
    fn test_video_master_widens_thresholds_on_large_gap() {
        let (clock, video) = session(SyncMode::VideoMaster);
        video.push_frame(frame(BASE)).unwrap();
        video.push_frame(frame(BASE + 45_000)).unwrap();

        let core = video.shared.lock();
        assert_eq!(core.disc_thres_min, 270_000);
        assert_eq!(core.disc_thres_max, 900_000);
        assert_eq!(clock.wall_adjust_threshold(), 270_000);
        assert_eq!(clock.disc_thresholds().unwrap(), (270_000, 900_000));
    }

    #[test]
    fn test_wrong_leg_rejected() {
        let clock = Arc::new(SoftClock::new(7));
        let binding = SessionBinding::open(clock);
        let audio = SyncSession::create(&binding, SyncMode::AudioMaster, LegType::Audio, 0).unwrap();
        assert!(matches!(
            audio.push_frame(frame(BASE)),
            Err(SyncError::WrongLeg { .. })
        ));
        assert!(matches!(audio.pop_frame(), Err(SyncError::WrongLeg { .. })));
    }

    #[test]
    fn test_step_pause_shows_one_frame() {
        let (clock, video) = session(SyncMode::VideoMaster);
        let reached = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reached);
        video.set_pause_callback(Some(Box::new(move |pts| sink.lock().push(pts))));
        for i in 0..3 {
            video.push_frame(frame(BASE + i * 1500)).unwrap();
        }
        video.set_pause_pts(Some(PausePts::Step));

        assert_eq!(video.pop_frame().unwrap().map(|f| f.pts), Some(BASE));
        clock.advance(1500);
        let held = video.pop_frame().unwrap().unwrap();
        assert_eq!(held.pts, BASE);
        assert!(!held.toggled);
        assert_eq!(*reached.lock(), vec![BASE]);
        assert_eq!(video.shared.lock().queue.len(), 2);
    }

    #[test]
    fn test_pause_at_target() {
        let (clock, video) = session(SyncMode::VideoMaster);
        let reached = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reached);
        video.set_pause_callback(Some(Box::new(move |pts| sink.lock().push(pts))));
        for i in 0..5 {
            video.push_frame(frame(BASE + i * 1500)).unwrap();
        }
        video.set_pause_pts(Some(PausePts::At(BASE + 3000)));

        let mut shown = Vec::new();
        for _ in 0..5 {
            shown.push(video.pop_frame().unwrap().map(|f| f.pts));
            clock.advance(1500);
        }
        assert_eq!(
            shown,
            vec![
                Some(BASE),
                Some(BASE + 1500),
                Some(BASE + 3000),
                Some(BASE + 3000),
                Some(BASE + 3000)
            ]
        );
        assert_eq!(*reached.lock(), vec![BASE + 3000]);
        assert!(video.shared.lock().paused);
    }

    #[test]
    fn test_underflow_fires_once_per_starvation() {
        let (clock, video) = session(SyncMode::VideoMaster);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        video.set_underflow_callback(
            Some(Box::new(move |pts| sink.lock().push(pts))),
            UnderflowConfig {
                time_threshold_ms: 100,
            },
        );
        video.push_frame(frame(BASE)).unwrap();
        video.push_frame(frame(BASE + 1500)).unwrap();

        video.pop_frame().unwrap();
        clock.advance(1500);
        video.pop_frame().unwrap();
        assert!(events.lock().is_empty());

        clock.advance_mono(Duration::from_millis(200));
        video.pop_frame().unwrap();
        clock.advance_mono(Duration::from_millis(200));
        video.pop_frame().unwrap();
        assert_eq!(*events.lock(), vec![BASE + 1500]);

        video.push_frame(frame(BASE + 3000)).unwrap();
        clock.advance(1500);
        assert!(video.pop_frame().unwrap().unwrap().toggled);
        clock.advance_mono(Duration::from_millis(200));
        video.pop_frame().unwrap();

        assert_eq!(*events.lock(), vec![BASE + 1500, BASE + 3000]);
        assert_eq!(video.stats().underflows, 2);
    }

    #[test]
    fn test_underflow_needs_callback() {
        let (clock, video) = session(SyncMode::VideoMaster);
        video.push_frame(frame(BASE)).unwrap();
        video.set_eos();
        video.pop_frame().unwrap();
        clock.advance_mono(Duration::from_secs(1));
        video.pop_frame().unwrap();
        assert_eq!(video.stats().underflows, 0);
    }

    #[test]
    fn test_align_waits_for_clock() {
        let (clock, video) = session(SyncMode::AudioMaster);
        clock.set_start_policy(StartPolicy::Align, -1).unwrap();
        video.push_frame(frame(BASE)).unwrap();
        video.push_frame(frame(BASE + 1500)).unwrap();

        assert!(video.pop_frame().unwrap().is_none());
        assert!(video.pop_frame().unwrap().is_none());

        clock.set_wall(Some(BASE - 1500));
        assert_eq!(video.pop_frame().unwrap().map(|f| f.pts), Some(BASE));
    }

    #[test]
    fn test_mono_mode_expires_on_monotonic_time() {
        let (_clock, video) = session(SyncMode::VideoMono);
        let (released, make) = recorder();
        for (i, mono) in [1_000u64, 2_000, 3_000].into_iter().enumerate() {
            video
                .push_frame(make(BASE + i as u32 * 1500).with_mono_time(mono))
                .unwrap();
        }
        assert!(!video.has_poll_thread());

        video.set_vsync_mono_time(500);
        assert!(video.pop_frame().unwrap().is_none());

        video.set_vsync_mono_time(2_500);
        let shown = video.pop_frame().unwrap().unwrap();
        assert_eq!(shown.sequence, 1);
        assert!(shown.toggled);
        assert_eq!(*released.lock(), vec![BASE]);
    }

    #[test]
    fn test_video_config_validation() {
        let (_clock, video) = session(SyncMode::VideoMaster);
        assert!(matches!(
            video.set_video_config(VideoConfig {
                delay: 3,
                extra_delay_ms: 0
            }),
            Err(SyncError::InvalidDelay(3))
        ));
        video
            .set_video_config(VideoConfig {
                delay: 2,
                extra_delay_ms: 10,
            })
            .unwrap();
        let core = video.shared.lock();
        assert_eq!(core.delay, 2);
        assert_eq!(core.extra_delay, 900);
    }

    #[test]
    fn test_release_callback_may_reenter_session() {
        let (clock, video) = session(SyncMode::VideoMaster);
        let video = Arc::new(video);
        let observed = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let weak: Weak<SyncSession> = Arc::downgrade(&video);
            let sink = Arc::clone(&observed);
            let f = frame(BASE + i * 1500).with_release(move |_: &Frame| {
                if let Some(session) = weak.upgrade() {
                    sink.lock().push(session.state());
                }
            });
            video.push_frame(f).unwrap();
        }

        video.pop_frame().unwrap();
        clock.advance(1500);
        video.pop_frame().unwrap();
        assert_eq!(*observed.lock(), vec![SessionState::SyncSetup]);
    }

    #[test]
    fn test_teardown_releases_everything_in_order() {
        let (clock, video) = session(SyncMode::VideoMaster);
        let (released, make) = recorder();
        for i in 0..5 {
            video.push_frame(make(BASE + i * 1500)).unwrap();
        }
        assert!(video.has_poll_thread());
        video.pop_frame().unwrap();
        clock.advance(1500);
        video.pop_frame().unwrap();
        assert_eq!(*released.lock(), vec![BASE]);

        video.destroy();
        assert_eq!(
            *released.lock(),
            vec![BASE, BASE + 1500, BASE + 3000, BASE + 4500, BASE + 6000]
        );
        assert!(!clock.active_status(LegType::Video, false).unwrap().video_active);
    }
}
