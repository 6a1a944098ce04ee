//! Audio leg: start decision, per-chunk render policy and the seamless
//! audio switch.
//!
//! Audio never waits on the session lock for long: every call reads the
//! wall clock once, decides, and reports back to the authority. The
//! switch protocol walks `Init -> Reset -> Start -> Finish`, with `Again`
//! looping back while the new track is still behind the wall clock.

use std::time::Duration;

use tracing::{debug, error, info, instrument, trace};

use avsync_clock::ClockAuthority;
use avsync_types::time::{abs_diff, diff};
use avsync_types::{
    AudioAction, AudioPolicy, AudioStartDecision, AudioSwitchState, LegType, SessionState,
    StartReason, SyncMode,
};

use crate::session::{AudioStartCallback, SyncSession};
use crate::state::SessionCore;
use crate::stats::SyncStats;
use crate::{SyncError, SyncResult, STREAM_DISC_THRESHOLD};

/// Within this distance (20 ms) audio counts as in sync.
const AUDIO_ADJUST_LOW: u32 = 1800;

/// Tolerance (30 ms) for completing an audio switch.
const AUDIO_ADJUST_MID: u32 = 2700;

/// Excursions below this (60 ms) keep an established lock.
const AUDIO_ADJUST_HIGH: u32 = 5400;

/// Outlier chunks rendered in a row before the jump counts as real.
const AUDIO_OUTLIER_LIMIT: u32 = 8;

/// Continuous dropping longer than this is escalated to a discontinuity.
const DROP_ESCALATION: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
struct Verdict {
    action: AudioAction,
    /// Timestamp the verdict was computed against; outliers snap to the wall.
    pts: u32,
    outlier: bool,
    send_disc: bool,
}

impl Verdict {
    fn new(action: AudioAction, pts: u32) -> Self {
        Self {
            action,
            pts,
            outlier: false,
            send_disc: false,
        }
    }
}

impl SyncSession {
    /// Decide how the audio leg starts.
    ///
    /// An `Async` decision stores `callback`, which later fires from the
    /// poll thread with [`StartReason::Ok`] or on teardown with
    /// [`StartReason::Stop`].
    #[instrument(name = "audio_start", skip(self, callback), fields(session = self.shared.id))]
    pub fn audio_start(
        &self,
        pts: u32,
        delay: u32,
        callback: Option<AudioStartCallback>,
    ) -> SyncResult<AudioStartDecision> {
        self.expect_leg(LegType::Audio)?;
        let clock = self.clock();
        info!(pts_ms = pts / 90, delay_ms = delay / 90, "audio start");

        let mut core = self.shared.lock();

        let mut switch_wall = None;
        if core.in_audio_switch {
            match clock.wall_clock()?.time {
                Some(wall) => switch_wall = Some(wall),
                None => {
                    info!(
                        pts,
                        state = ?core.audio_switch_state,
                        "no wall clock during audio switch, retry"
                    );
                    core.audio_switch_state = AudioSwitchState::Reset;
                    return Ok(AudioStartDecision::Again);
                }
            }
        }

        let mut decision =
            if core.in_audio_switch && core.audio_switch_state == AudioSwitchState::Again {
                AudioStartDecision::Sync
            } else {
                clock.signal_audio_start(pts, delay)?
            };

        if let Some(wall) = switch_wall.filter(|_| core.audio_switch_state.needs_resync()) {
            let late = diff(wall, pts);
            if late > AUDIO_ADJUST_LOW as i32 && decision == AudioStartDecision::Sync {
                info!(late_ms = late / 90, "audio behind the wall clock, drop before switching");
                core.audio_switch_state = AudioSwitchState::Again;
                return Ok(AudioStartDecision::Again);
            }

            let lead = diff(pts, wall);
            if lead < AUDIO_ADJUST_LOW as i32 {
                debug!(lead_ms = lead / 90, "close enough, start directly");
                decision = AudioStartDecision::Sync;
            } else if decision != AudioStartDecision::Async {
                debug!(lead_ms = lead / 90, ?decision, "too far ahead, restart asynchronously");
                if let Err(e) = clock.signal_stop(LegType::Audio) {
                    error!(error = %e, "failed to stop audio before restart");
                }
                decision = clock.signal_audio_start(pts, delay)?;
            }
            core.audio_switch_state = AudioSwitchState::Start;
        }

        match decision {
            AudioStartDecision::Sync => {
                core.session_started = true;
                core.state = SessionState::Running;
                widen_for_pcr_gap(&mut core, self.shared.id, pts, clock);
            }
            AudioStartDecision::Async => {
                core.state = SessionState::Running;
                widen_for_pcr_gap(&mut core, self.shared.id, pts, clock);
            }
            AudioStartDecision::Again => {}
        }
        core.last_pts = Some(pts);
        if decision == AudioStartDecision::Again {
            info!("audio start again");
            return Ok(decision);
        }

        let wants_poll =
            core.mode == SyncMode::AudioMaster || core.in_audio_switch || core.mode.is_live();

        let replaced = if decision == AudioStartDecision::Async {
            let Some(callback) = callback else {
                error!("asynchronous start without a callback");
                return Err(SyncError::MissingCallback);
            };
            core.audio_start_cb.replace(callback)
        } else {
            None
        };
        drop(core);

        if let Some(stale) = replaced {
            info!("replacing pending audio start callback");
            stale(StartReason::Stop);
        }
        if wants_poll {
            self.ensure_poll_thread()?;
        }
        info!(?decision, "audio start decided");
        Ok(decision)
    }

    /// Decide what the renderer does with the chunk at `pts`.
    ///
    /// `delta` in the returned policy is wall clock minus pts.
    pub fn audio_render(&self, pts: u32) -> SyncResult<AudioPolicy> {
        self.expect_leg(LegType::Audio)?;
        let shared = &*self.shared;
        let clock = self.clock();
        let wall = clock.wall_clock()?;

        let mut core = shared.lock();
        core.last_pts = Some(pts);

        let Some(systime) = wall.time else {
            let action = if matches!(core.mode, SyncMode::FreeRun | SyncMode::AudioMaster) {
                AudioAction::Render
            } else {
                AudioAction::Insert
            };
            trace!(session = shared.id, pts, ?action, "wall clock not started");
            return Ok(AudioPolicy { action, delta: 0 });
        };

        let verdict = core.audio_verdict(shared.id, systime, pts, &shared.stats);
        let policy = AudioPolicy {
            action: verdict.action,
            delta: diff(systime, verdict.pts),
        };
        trace!(
            session = shared.id,
            pts,
            systime,
            action = ?policy.action,
            delta = policy.delta,
            "audio render"
        );

        if verdict.action == AudioAction::Render {
            core.settle_render(shared.id, systime, &verdict, clock);
        } else {
            let now = clock.monotonic_now();
            core.settle_skew(shared.id, systime, &verdict, now, clock, &shared.stats);
        }
        Ok(policy)
    }

    /// Release an audio leg blocked in the authority's start wait.
    pub fn stop_audio(&self) -> SyncResult<()> {
        self.expect_leg(LegType::Audio)?;
        self.clock().release_audio_wait()?;
        info!(session = self.shared.id, "audio wait released");
        Ok(())
    }
}

/// PCR master streams can start with a large audio/PCR gap.
fn widen_for_pcr_gap(core: &mut SessionCore, id: u32, pts: u32, clock: &dyn ClockAuthority) {
    if core.mode != SyncMode::PcrMaster {
        return;
    }
    match clock.pcr() {
        Ok(pcr) => {
            let gap = abs_diff(pcr.pts, pts);
            let widened = gap.saturating_mul(3);
            if widened > core.disc_thres_min {
                core.disc_thres_min = widened;
            }
            info!(
                session = id,
                gap,
                min = core.disc_thres_min,
                "discontinuity threshold from pcr gap"
            );
        }
        Err(e) => debug!(session = id, error = %e, "no pcr yet"),
    }
}

impl SessionCore {
    fn audio_verdict(&mut self, session: u32, systime: u32, pts: u32, stats: &SyncStats) -> Verdict {
        if self.in_audio_switch && self.audio_switch_state == AudioSwitchState::Start {
            let action = if abs_diff(systime, pts) < AUDIO_ADJUST_MID {
                info!(session, systime, pts, "audio back within range");
                self.audio_switch_state = AudioSwitchState::Finish;
                AudioAction::Render
            } else if diff(systime, pts) > 0 {
                debug!(session, late_ms = diff(systime, pts) / 90, "audio switch drop");
                AudioAction::Drop
            } else {
                debug!(session, early_ms = diff(pts, systime) / 90, "audio switch insert");
                AudioAction::Insert
            };
            return Verdict::new(action, pts);
        }

        if matches!(self.mode, SyncMode::FreeRun | SyncMode::AudioMaster) {
            return Verdict::new(AudioAction::Render, pts);
        }
        // Live stopping procedure: keep the renderer moving.
        if self.mode.is_live() && self.active_mode == SyncMode::FreeRun {
            return Verdict::new(AudioAction::Drop, pts);
        }
        if self.active_mode == SyncMode::AudioMaster {
            return Verdict::new(AudioAction::Render, pts);
        }

        let mut send_disc = false;
        if self.mode.is_live()
            && self.state == SessionState::SyncSetup
            && self
                .apts
                .is_some_and(|apts| abs_diff(apts, pts) > STREAM_DISC_THRESHOLD)
        {
            self.outlier_cnt += 1;
            stats.record_outlier();
            if self.outlier_cnt > AUDIO_OUTLIER_LIMIT {
                send_disc = true;
            } else {
                info!(session, pts, apts = ?self.apts, systime, "ignoring audio outlier");
                return Verdict {
                    action: AudioAction::Render,
                    pts: systime,
                    outlier: true,
                    send_disc: false,
                };
            }
        }

        let gap = abs_diff(systime, pts);
        if gap < AUDIO_ADJUST_LOW || (gap < AUDIO_ADJUST_HIGH && self.state != SessionState::SyncLost) {
            self.outlier_cnt = 0;
            self.state = SessionState::SyncSetup;
            return Verdict {
                send_disc,
                ..Verdict::new(AudioAction::Render, pts)
            };
        }

        if self.state != SessionState::SyncLost {
            stats.record_sync_lost();
            info!(session, systime, pts, "audio sync lost");
        }
        self.state = SessionState::SyncLost;
        let action = if diff(systime, pts) > 0 {
            AudioAction::Drop
        } else {
            AudioAction::Insert
        };
        Verdict {
            send_disc,
            ..Verdict::new(action, pts)
        }
    }

    fn settle_render(&mut self, session: u32, systime: u32, verdict: &Verdict, clock: &dyn ClockAuthority) {
        if !verdict.outlier {
            self.apts = Some(verdict.pts);
        }
        if !self.in_audio_switch {
            if !verdict.outlier {
                if let Err(e) = clock.report_audio_pts(systime, verdict.pts, 0) {
                    error!(session, error = %e, "failed to report audio pts");
                }
            }
        } else if self.audio_switch_state == AudioSwitchState::Finish {
            if let Err(e) = clock.report_audio_pts(systime, verdict.pts, 0) {
                error!(session, error = %e, "failed to report audio pts");
            }
            if let Err(e) = clock.set_audio_switch(false) {
                error!(session, error = %e, "failed to clear audio switch");
            }
            self.in_audio_switch = false;
            self.audio_switch_state = AudioSwitchState::Init;
            info!(session, systime, pts = verdict.pts, "audio switch done");
        }
        self.audio_drop_started = None;
    }

    fn settle_skew(
        &mut self,
        session: u32,
        systime: u32,
        verdict: &Verdict,
        now: Duration,
        clock: &dyn ClockAuthority,
        stats: &SyncStats,
    ) {
        let pts = verdict.pts;
        match verdict.action {
            AudioAction::Drop => stats.record_audio_drop(),
            AudioAction::Insert => stats.record_audio_insert(),
            AudioAction::Render => {}
        }

        let far = abs_diff(systime, pts) > self.disc_thres_min;
        let forced = verdict.action == AudioAction::Insert && verdict.send_disc;
        if !self.in_audio_switch && self.last_disc_pts != Some(pts) && (far || forced) {
            info!(session, systime, pts, "audio discontinuity");
            if let Err(e) = clock.signal_discontinuity(LegType::Audio, pts) {
                error!(session, error = %e, "failed to signal audio discontinuity");
            }
            stats.record_discontinuity();
            self.last_disc_pts = Some(pts);
        } else if verdict.action == AudioAction::Drop {
            self.apts = Some(pts);
            let started = *self.audio_drop_started.get_or_insert(now);
            if now.saturating_sub(started) > DROP_ESCALATION {
                info!(session, systime, pts, "audio keeps dropping");
                if let Err(e) = clock.signal_discontinuity(LegType::Audio, pts) {
                    error!(session, error = %e, "failed to signal audio discontinuity");
                }
                stats.record_discontinuity();
            }
        }

        if verdict.action != AudioAction::Drop {
            self.audio_drop_started = None;
        }
    }
}
