//! Frame expiry decision.
//!
//! Decides, once per queued frame per tick, whether the head of the queue
//! should replace the displayed frame. The wall clock is first corrected by
//! the pipeline delay and the phase offset; a gap beyond the discontinuity
//! threshold takes the discontinuity branch, everything else is compared
//! wrap-aware and then nudged by the look-ahead rules and the cadence
//! detector.

use std::time::Duration;

use tracing::{debug, error, info, trace};

use avsync_clock::ClockAuthority;
use avsync_types::time::{abs_diff, at_or_after, diff};
use avsync_types::{LegType, PausePts, SessionState, SyncMode};

use crate::pattern::Correction;
use crate::state::SessionCore;
use crate::stats::SyncStats;
use crate::{PATTERN_RESET_THRESHOLD, STREAM_DISC_THRESHOLD};

/// Outlier frames tolerated in a row before a jump counts as real.
const VIDEO_OUTLIER_LIMIT: u32 = 8;

/// What the expiry loop knows about the tick and the candidate frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExpiryInput {
    /// Raw wall clock of this tick.
    pub systime: u32,
    pub interval: u32,
    pub pts: u32,
    pub next_pts: Option<u32>,
    /// Frames already toggled this tick.
    pub toggled: u32,
    pub now: Duration,
}

/// Outcome for one candidate frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Expiry {
    pub expire: bool,
    /// The frame is a stream outlier and must not be reported.
    pub outlier: bool,
}

impl Expiry {
    fn show() -> Self {
        Self {
            expire: true,
            outlier: false,
        }
    }

    fn hold() -> Self {
        Self::default()
    }
}

impl SessionCore {
    pub(crate) fn frame_expire(
        &mut self,
        session: u32,
        input: &ExpiryInput,
        clock: &dyn ClockAuthority,
        stats: &SyncStats,
    ) -> Expiry {
        let interval = input.interval;

        if self.paused && self.pause_pts.is_none() {
            return Expiry::hold();
        }
        match self.pause_pts {
            Some(PausePts::Step) => {
                trace!(session, pts = input.pts, "step frame");
                return Expiry::show();
            }
            Some(PausePts::At(target)) if target == input.pts => {
                debug!(session, pts = input.pts, "pause target frame");
                return Expiry::show();
            }
            _ => {}
        }

        let mut fpts = input.pts.wrapping_add(self.extra_delay);
        let nfpts = input
            .next_pts
            .map(|n| n.wrapping_add(self.extra_delay))
            .filter(|n| *n != 0);

        if self.mode == SyncMode::FreeRun
            && self.last_frame.is_some()
            && abs_diff(input.systime, fpts) > PATTERN_RESET_THRESHOLD
            && self.current_hold() >= self.fps.interval_or(interval) / interval.max(1)
        {
            return Expiry::show();
        }

        if fpts == 0 {
            fpts = match &self.last_frame {
                Some(last) => self.vpts.wrapping_add(last.duration()),
                None => self.vpts,
            };
        }

        let mut systime = input.systime.wrapping_add(self.delay.wrapping_mul(interval));
        systime = self.phase.apply(systime);

        if abs_diff(systime, fpts) > self.disc_thres_min {
            if self.paused {
                return Expiry::hold();
            }
            if let Some(verdict) = self.discontinuity(session, input, &mut systime, fpts, clock, stats) {
                return verdict;
            }
        }

        if abs_diff(systime, fpts) > PATTERN_RESET_THRESHOLD && self.first_frame_toggled {
            self.reset_pattern();
            debug!(session, systime, fpts, "cadence reset on large gap");
        }

        let mut expire = at_or_after(systime, fpts);
        let next_tick = systime.wrapping_add(interval);

        if let Some(next) = nfpts {
            if expire && input.toggled > 0 && diff(next_tick, next) < 0 {
                // The next tick would have nothing to show; keep this one for it.
                expire = false;
                trace!(session, fpts, next, "scatter frame to next tick");
            } else if !expire
                && input.toggled == 0
                && self.first_frame_toggled
                && at_or_after(next_tick, next)
            {
                // Otherwise the next tick would have to expire two frames.
                expire = true;
                trace!(session, fpts, next, "pull frame forward");
            }
        }

        if self.state == SessionState::SyncSetup {
            if let Some(pattern) = &self.pattern {
                let correction = Correction {
                    fpts,
                    npts: nfpts,
                    cur_period: self.current_hold(),
                    last_period: self.last_holding_period,
                    systime,
                    interval,
                };
                expire = pattern.correct(&correction, expire);
            }
        }

        if expire {
            self.lock_phase(session, systime, fpts, interval);
        }

        Expiry {
            expire,
            outlier: false,
        }
    }

    /// Handle a gap wider than `disc_thres_min`.
    ///
    /// Returns `None` to continue with the normal comparison, which happens
    /// when video master mode re-anchored the wall clock on the frame.
    fn discontinuity(
        &mut self,
        session: u32,
        input: &ExpiryInput,
        systime: &mut u32,
        fpts: u32,
        clock: &dyn ClockAuthority,
        stats: &SyncStats,
    ) -> Option<Expiry> {
        self.sync_lost_log.note(session, *systime, fpts, input.now);

        let mut outlier = false;
        if self.state == SessionState::SyncSetup
            && self.mode.is_live()
            && self
                .last_pts
                .is_some_and(|last| abs_diff(last, fpts) > STREAM_DISC_THRESHOLD)
        {
            self.outlier_cnt += 1;
            outlier = true;
            stats.record_outlier();
            if self.outlier_cnt < VIDEO_OUTLIER_LIMIT {
                info!(session, fpts, count = self.outlier_cnt, "video stream outlier");
                return Some(Expiry {
                    expire: true,
                    outlier,
                });
            }
        }

        self.outlier_cnt = 0;
        if self.state != SessionState::SyncLost {
            stats.record_sync_lost();
        }
        self.state = SessionState::SyncLost;
        self.reset_lock();

        if self.mode.reports_video_discontinuity() && self.last_disc_pts != Some(fpts) {
            info!(session, systime = *systime, fpts, "video discontinuity");
            if let Err(e) = clock.signal_discontinuity(LegType::Video, fpts) {
                error!(session, error = %e, "failed to signal video discontinuity");
            }
            stats.record_discontinuity();
            self.last_disc_pts = Some(fpts);
            if self.mode == SyncMode::VideoMaster {
                *systime = fpts;
                self.last_paced_systime = None;
            }
        }

        let behind = diff(*systime, fpts);
        let expire = if behind > 0 {
            if behind < self.disc_thres_max as i32 {
                self.last_paced_systime = None;
                true
            } else {
                self.fps_paced(*systime, input.interval)
            }
        } else if self.mode.is_live() {
            if diff(fpts, *systime) < self.disc_thres_max as i32 {
                false
            } else {
                self.fps_paced(*systime, input.interval)
            }
        } else {
            return None;
        };

        Some(Expiry { expire, outlier })
    }

    /// Expire at most once per estimated frame interval.
    fn fps_paced(&mut self, systime: u32, interval: u32) -> bool {
        let due = self
            .last_paced_systime
            .map_or(true, |last| diff(systime, last) >= self.fps.interval_or(interval) as i32);
        if due {
            self.last_paced_systime = Some(systime);
        }
        due
    }

    fn lock_phase(&mut self, session: u32, systime: u32, fpts: u32, interval: u32) {
        self.vpts = fpts;

        let lead = diff(systime, fpts);
        let in_window = lead >= 0 && diff(fpts.wrapping_add(interval), systime) > 0;

        if !self.phase.locked {
            if in_window {
                self.phase.offset = (interval / 2).wrapping_add(fpts).wrapping_sub(systime);
                self.phase.locked = true;
                info!(session, offset = self.phase.offset as i32, "video phase locked");
            }
        } else if !self.phase.nudged
            && in_window
            && self.pattern.as_ref().map_or(true, |p| p.detected().is_none())
            && (lead < 10 || lead > interval as i32 - 10)
        {
            self.phase.offset = self.phase.offset.wrapping_add(interval / 8);
            self.phase.nudged = true;
            info!(session, offset = self.phase.offset as i32, "video phase nudged");
        }

        if self.state != SessionState::SyncSetup {
            info!(session, fpts, "video sync setup");
        }
        self.state = SessionState::SyncSetup;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::pattern::{Cadence, PatternDetector};
    use avsync_clock::SoftClock;
    use avsync_frame::Frame;
    use bytes::Bytes;

    fn core(mode: SyncMode) -> SessionCore {
        let mut core = SessionCore::new(mode, 2, &SyncConfig::default()).unwrap();
        core.pattern = Some(PatternDetector::new(1500));
        core.state = SessionState::Running;
        core
    }

    fn input(systime: u32, pts: u32, next_pts: Option<u32>, toggled: u32) -> ExpiryInput {
        ExpiryInput {
            systime,
            interval: 1500,
            pts,
            next_pts,
            toggled,
            now: Duration::ZERO,
        }
    }

    #[test]
    fn test_due_frame_expires_and_locks_phase() {
        let clock = SoftClock::new(1);
        let stats = SyncStats::new();
        let mut core = core(SyncMode::VideoMaster);

        // systime + delay * interval = 3000, frame at 3000
        let verdict = core.frame_expire(1, &input(1500, 3000, Some(4500), 0), &clock, &stats);
        assert!(verdict.expire);
        assert!(core.phase.locked);
        assert_eq!(core.phase.offset, 750);
        assert_eq!(core.state, SessionState::SyncSetup);
        assert_eq!(core.vpts, 3000);
    }

    #[test]
    fn test_future_frame_held() {
        let clock = SoftClock::new(1);
        let stats = SyncStats::new();
        let mut core = core(SyncMode::VideoMaster);
        let verdict = core.frame_expire(1, &input(0, 6000, None, 0), &clock, &stats);
        assert!(!verdict.expire);
        assert_eq!(core.state, SessionState::Running);
    }

    #[test]
    fn test_scatter_keeps_frame_for_next_tick() {
        let clock = SoftClock::new(1);
        let stats = SyncStats::new();
        let mut core = core(SyncMode::VideoMaster);
        // Due, but one frame already went out and the next is two ticks away.
        let verdict = core.frame_expire(1, &input(1500, 2900, Some(6000), 1), &clock, &stats);
        assert!(!verdict.expire);
    }

    #[test]
    fn test_pull_forward() {
        let clock = SoftClock::new(1);
        let stats = SyncStats::new();
        let mut core = core(SyncMode::VideoMaster);
        core.first_frame_toggled = true;
        // Not yet due, but the next frame is due next tick.
        let verdict = core.frame_expire(1, &input(1500, 3100, Some(4400), 0), &clock, &stats);
        assert!(verdict.expire);
    }

    #[test]
    fn test_paused_holds_unless_stepping() {
        let clock = SoftClock::new(1);
        let stats = SyncStats::new();
        let mut core = core(SyncMode::VideoMaster);
        core.paused = true;
        assert!(!core.frame_expire(1, &input(90_000, 0, None, 0), &clock, &stats).expire);
        core.pause_pts = Some(PausePts::Step);
        assert!(core.frame_expire(1, &input(0, 90_000, None, 0), &clock, &stats).expire);
    }

    #[test]
    fn test_video_master_discontinuity_reanchors() {
        let clock = SoftClock::new(1);
        let stats = SyncStats::new();
        let mut core = core(SyncMode::VideoMaster);
        let verdict = core.frame_expire(1, &input(0, 900_000, None, 0), &clock, &stats);
        assert!(verdict.expire);
        assert_eq!(clock.discontinuities(), vec![(LegType::Video, 900_000)]);
        assert_eq!(stats.snapshot().discontinuities, 1);
        assert_eq!(core.last_disc_pts, Some(900_000));
    }

    #[test]
    fn test_catch_up_when_behind() {
        let clock = SoftClock::new(1);
        let stats = SyncStats::new();
        let mut core = core(SyncMode::AudioMaster);
        // Wall clock 1 s ahead of the frame: catch up immediately.
        let verdict = core.frame_expire(1, &input(90_000, 1000, None, 0), &clock, &stats);
        assert!(verdict.expire);
        assert_eq!(core.state, SessionState::SyncLost);
        assert!(clock.discontinuities().is_empty());
    }

    #[test]
    fn test_fps_paced_when_far_behind() {
        let clock = SoftClock::new(1);
        let stats = SyncStats::new();
        let mut core = core(SyncMode::AudioMaster);
        let far = 2_000_000;
        assert!(core.frame_expire(1, &input(far, 1000, None, 0), &clock, &stats).expire);
        // Same tick time again: paced, not expired.
        assert!(!core.frame_expire(1, &input(far, 1000, None, 0), &clock, &stats).expire);
        assert!(core.frame_expire(1, &input(far + 1500, 1000, None, 0), &clock, &stats).expire);
    }

    #[test]
    fn test_live_early_frame_held() {
        let clock = SoftClock::new(1);
        let stats = SyncStats::new();
        let mut core = core(SyncMode::PcrMaster);
        let verdict = core.frame_expire(1, &input(0, 90_000, None, 0), &clock, &stats);
        assert!(!verdict.expire);
        assert_eq!(clock.discontinuities(), vec![(LegType::Video, 90_000)]);
    }

    #[test]
    fn test_live_outlier_burst() {
        let clock = SoftClock::new(1);
        let stats = SyncStats::new();
        let mut core = core(SyncMode::PcrMaster);
        core.state = SessionState::SyncSetup;
        core.last_pts = Some(3000);

        for n in 1..VIDEO_OUTLIER_LIMIT {
            let verdict = core.frame_expire(1, &input(1500 + n, 500_000, None, 0), &clock, &stats);
            assert_eq!(verdict, Expiry { expire: true, outlier: true });
            assert_eq!(core.state, SessionState::SyncSetup);
        }
        let verdict = core.frame_expire(1, &input(1500, 500_000, None, 0), &clock, &stats);
        assert!(verdict.outlier);
        assert!(!verdict.expire);
        assert_eq!(core.state, SessionState::SyncLost);
        assert_eq!(core.outlier_cnt, 0);
    }

    #[test]
    fn test_wrap_around_expiry() {
        let clock = SoftClock::new(1);
        let stats = SyncStats::new();
        let mut core = core(SyncMode::VideoMaster);
        let pts = u32::MAX - 500;
        // Corrected wall clock has wrapped past the frame.
        let verdict = core.frame_expire(1, &input(pts.wrapping_add(100), pts.wrapping_add(1500), None, 0), &clock, &stats);
        assert!(verdict.expire);
        let verdict = core.frame_expire(1, &input(pts.wrapping_sub(3000), pts, None, 0), &clock, &stats);
        assert!(!verdict.expire);
    }

    #[test]
    fn test_free_run_forces_only_a_held_frame() {
        let clock = SoftClock::new(1);
        let stats = SyncStats::new();
        let mut core = core(SyncMode::FreeRun);
        core.fps.observe(750);
        core.fps.observe(750);
        core.disc_thres_min = 10_000_000;
        core.disc_thres_max = 20_000_000;

        // Nothing on screen yet: far-future frame waits for the clock.
        let verdict = core.frame_expire(1, &input(0, 30_000, None, 0), &clock, &stats);
        assert!(!verdict.expire);

        let mut shown = Frame::new(Bytes::new(), 0, 1500);
        shown.hold();
        core.last_frame = Some(shown);
        let verdict = core.frame_expire(1, &input(0, 30_000, None, 0), &clock, &stats);
        assert!(verdict.expire);
    }

    #[test]
    fn test_free_run_close_frame_uses_clock() {
        let clock = SoftClock::new(1);
        let stats = SyncStats::new();
        let mut core = core(SyncMode::FreeRun);
        let mut shown = Frame::new(Bytes::new(), 0, 1500);
        shown.hold();
        core.last_frame = Some(shown);
        // Within the cadence reset gap the normal comparison applies.
        let verdict = core.frame_expire(1, &input(0, 6000, None, 0), &clock, &stats);
        assert!(!verdict.expire);
    }

    #[test]
    fn test_phase_nudged_once_near_tick_edge() {
        let clock = SoftClock::new(1);
        let stats = SyncStats::new();
        let mut core = core(SyncMode::VideoMaster);
        core.phase.locked = true;

        // Corrected systime 3000, frame 5 ahead of the edge.
        let verdict = core.frame_expire(1, &input(1500, 2995, None, 0), &clock, &stats);
        assert!(verdict.expire);
        assert!(core.phase.nudged);
        assert_eq!(core.phase.offset, 187);
        assert_eq!(core.state, SessionState::SyncSetup);

        // Corrected systime 4687, frame again 5 ahead of the edge.
        let verdict = core.frame_expire(1, &input(3000, 4682, None, 0), &clock, &stats);
        assert!(verdict.expire);
        assert_eq!(core.phase.offset, 187);
    }

    #[test]
    fn test_phase_not_nudged_with_cadence() {
        let clock = SoftClock::new(1);
        let stats = SyncStats::new();
        let mut core = core(SyncMode::VideoMaster);
        core.phase.locked = true;
        let pattern = core.pattern.as_mut().unwrap();
        for _ in 0..10 {
            pattern.detect(1, 1);
        }
        assert_eq!(pattern.detected(), Some(Cadence::Progressive11));

        let verdict = core.frame_expire(1, &input(1500, 2995, None, 0), &clock, &stats);
        assert!(verdict.expire);
        assert!(!core.phase.nudged);
        assert_eq!(core.phase.offset, 0);
    }

    fn setup_32(core: &mut SessionCore) {
        let pattern = core.pattern.as_mut().unwrap();
        let mut last = 0;
        for cur in [3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3] {
            pattern.detect(cur, last);
            last = cur;
        }
        core.state = SessionState::SyncSetup;
        core.last_holding_period = 3;
        let mut shown = Frame::new(Bytes::new(), 85_500, 3750);
        shown.hold();
        core.last_frame = Some(shown);
    }

    #[test]
    fn test_cadence_holds_due_frame_in_sync_setup() {
        let clock = SoftClock::new(1);
        let stats = SyncStats::new();
        let mut core = core(SyncMode::VideoMaster);
        setup_32(&mut core);
        assert_eq!(core.pattern.as_ref().unwrap().detected(), Some(Cadence::Pulldown32));

        // Corrected systime 90_050: due by 50, but the shown frame has held
        // 1 of its 2 ticks.
        let verdict = core.frame_expire(1, &input(88_550, 90_000, Some(93_750), 0), &clock, &stats);
        assert!(!verdict.expire);
        assert!(!core.phase.locked);
    }

    #[test]
    fn test_no_cadence_leaves_due_frame_expiring() {
        let clock = SoftClock::new(1);
        let stats = SyncStats::new();
        let mut core = core(SyncMode::VideoMaster);
        setup_32(&mut core);
        core.pattern = Some(PatternDetector::new(1500));

        let verdict = core.frame_expire(1, &input(88_550, 90_000, Some(93_750), 0), &clock, &stats);
        assert!(verdict.expire);
        assert!(core.phase.locked);
    }
}
