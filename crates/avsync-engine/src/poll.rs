//! Per-leg background thread watching the clock authority.
//!
//! The thread wakes on authority events, refreshes the cached active mode
//! and switch flag, and resolves a pending asynchronous audio start.
//! Callbacks run after the session lock is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, instrument, warn};

use avsync_clock::ClockAuthority;
use avsync_types::{ActiveStatus, ClockEvent, LegType, SessionState, StartReason, SyncMode};

use crate::session::{AudioStartCallback, Shared};
use crate::state::SessionCore;
use crate::{SyncError, SyncResult};

pub(crate) struct PollThread {
    should_stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PollThread {
    pub fn spawn(shared: Arc<Shared>) -> SyncResult<Self> {
        // Subscribe before the thread exists so no event raised after
        // spawn returns is missed.
        let events = shared.clock().subscribe();
        let should_stop = Arc::new(AtomicBool::new(false));

        let (name, timeout_ms) = match shared.leg {
            LegType::Audio => ("avs_apoll", shared.config.audio_poll_timeout_ms),
            _ => ("avs_vpoll", shared.config.video_poll_timeout_ms),
        };
        let timeout = Duration::from_millis(timeout_ms);
        let id = shared.id;

        let stop = Arc::clone(&should_stop);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || poll_loop(shared, events, stop, timeout))
            .map_err(SyncError::ThreadSpawn)?;

        info!(session = id, thread = name, "poll thread started");
        Ok(Self {
            should_stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("poll thread panicked");
            }
        }
    }
}

impl Drop for PollThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[instrument(name = "sync_poll", skip_all, fields(session = shared.id, leg = shared.leg.name()))]
fn poll_loop(
    shared: Arc<Shared>,
    events: Receiver<ClockEvent>,
    should_stop: Arc<AtomicBool>,
    timeout: Duration,
) {
    debug!("poll loop starting");

    while !should_stop.load(Ordering::SeqCst) {
        match events.recv_timeout(timeout) {
            Ok(event) => {
                debug!(?event, "clock event");
                handle_event(&shared);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("clock event channel closed");
                break;
            }
        }
    }

    debug!("poll loop stopped");
}

fn handle_event(shared: &Shared) {
    let clock = shared.clock();
    let status = match clock.active_status(shared.leg, true) {
        Ok(status) => status,
        Err(e) => {
            warn!(error = %e, "active status unavailable");
            return;
        }
    };

    let pending = {
        let mut core = shared.lock();
        core.active_mode = status.active_mode;
        core.in_audio_switch = status.audio_switch;
        info!(
            active_mode = status.active_mode.name(),
            mode = core.mode.name(),
            video = status.video_active,
            audio = status.audio_active,
            video_timeout = status.video_timeout,
            state = core.state.name(),
            "clock state changed"
        );

        match shared.leg {
            LegType::Audio => audio_rules(&mut core, &status, clock),
            _ => {
                mirror_debug_free_run(&mut core, status.debug_free_run);
                None
            }
        }
    };

    if let Some((callback, reason)) = pending {
        info!(?reason, "audio start callback");
        callback(reason);
    }
}

type PendingStart = (AudioStartCallback, StartReason);

fn audio_rules(
    core: &mut SessionCore,
    status: &ActiveStatus,
    clock: &dyn ClockAuthority,
) -> Option<PendingStart> {
    let video_ready = status.video_active || status.video_timeout;
    let waiting = core.audio_start_cb.is_some();

    // IPTV holds the start until the first authority event.
    if core.mode == SyncMode::Iptv && waiting {
        return take_start(core, StartReason::Ok);
    }

    match core.active_mode {
        SyncMode::AudioMaster => {
            let pending = if status.audio_active && waiting {
                if video_ready || core.in_audio_switch {
                    take_start(core, StartReason::Ok)
                } else {
                    None
                }
            } else if !status.audio_active && !core.session_started {
                take_start(core, StartReason::Stop)
            } else {
                None
            };

            match clock.rate() {
                Ok(rate) => {
                    if rate != core.rate {
                        info!(rate, "playback rate changed");
                    }
                    core.rate = rate;
                }
                Err(e) => debug!(error = %e, "rate unavailable"),
            }
            pending
        }
        // PCR master stopping procedure.
        SyncMode::FreeRun if core.mode == SyncMode::PcrMaster => {
            start_when_ready(core, status.audio_active && video_ready)
        }
        SyncMode::PcrMaster => {
            let pending = start_when_ready(core, status.audio_active && video_ready);
            mirror_debug_free_run(core, status.debug_free_run);
            pending
        }
        SyncMode::VideoMaster => start_when_ready(core, status.audio_active && video_ready),
        _ => None,
    }
}

fn start_when_ready(core: &mut SessionCore, ready: bool) -> Option<PendingStart> {
    if ready {
        take_start(core, StartReason::Ok)
    } else {
        None
    }
}

fn take_start(core: &mut SessionCore, reason: StartReason) -> Option<PendingStart> {
    let callback = core.audio_start_cb.take()?;
    core.session_started = true;
    core.state = SessionState::SyncSetup;
    Some((callback, reason))
}

fn mirror_debug_free_run(core: &mut SessionCore, on: bool) {
    if on && !core.debug_free_run {
        core.backup_mode = core.mode;
        core.mode = SyncMode::FreeRun;
        core.debug_free_run = true;
        warn!(saved = core.backup_mode.name(), "debug free-run on");
    } else if !on && core.debug_free_run {
        core.mode = core.backup_mode;
        core.debug_free_run = false;
        warn!(mode = core.mode.name(), "debug free-run off");
    }
}
