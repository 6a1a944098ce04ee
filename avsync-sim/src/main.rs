//! Sync session simulator.
//!
//! Runs one scenario against an in-memory clock authority and prints a
//! JSON report on stdout. Logs go to stderr, filtered by `RUST_LOG`.
//!
//! ```text
//! avsync-sim video --fps 24 --refresh 60 --frames 480
//! avsync-sim audio --drift-ticks 30 --chunks 500
//! avsync-sim pcr --ppm 50 --jitter-us 200
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};

use avsync_clock::{SessionBinding, SoftClock};
use avsync_engine::{SessionStats, SyncConfig, SyncError, SyncSession, VideoConfig};
use avsync_frame::Frame;
use avsync_types::time::TIME_UNIT_90K;
use avsync_types::{
    AudioAction, AudioStartDecision, ClockRecoveryStatus, LegType, SessionState, SyncMode,
};

/// First timestamp of every generated stream.
const BASE_PTS: u32 = 90_000;

#[derive(Parser, Debug)]
#[command(name = "avsync-sim", version, about)]
struct Cli {
    /// Session configuration as JSON; missing fields keep their defaults.
    #[arg(long, global = true, env = "AVSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Pretty-print the report.
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(Subcommand, Debug)]
enum Scenario {
    /// Play a constant frame rate stream on a fixed refresh display.
    Video {
        /// Content frame rate.
        #[arg(long, default_value_t = 24)]
        fps: u32,

        /// Display refresh rate.
        #[arg(long, default_value_t = 60)]
        refresh: u32,

        /// Frames to play.
        #[arg(long, default_value_t = 480)]
        frames: u32,

        #[arg(long, default_value = "vmaster", value_parser = parse_mode)]
        mode: SyncMode,

        /// Display pipeline delay in ticks.
        #[arg(long, default_value_t = 1)]
        delay: u32,
    },

    /// Render an audio stream whose timestamps drift from the wall clock.
    Audio {
        /// Audio chunks to render.
        #[arg(long, default_value_t = 500)]
        chunks: u32,

        /// Chunk length in ms.
        #[arg(long, default_value_t = 20)]
        chunk_ms: u32,

        /// Start offset of the audio against the wall clock, in ms.
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        offset_ms: i32,

        /// Extra 90 kHz ticks added to every chunk timestamp.
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        drift_ticks: i32,
    },

    /// Feed program clock samples from a drifting encoder clock.
    Pcr {
        /// Encoder clock drift in ppm.
        #[arg(long, default_value_t = 50, allow_hyphen_values = true)]
        ppm: i64,

        /// Standard deviation of the arrival jitter, in µs.
        #[arg(long, default_value_t = 0)]
        jitter_us: u32,

        /// Sample period in ms.
        #[arg(long, default_value_t = 40)]
        period_ms: u32,

        /// Give up after this many samples.
        #[arg(long, default_value_t = 100_000)]
        samples: u32,

        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
}

fn parse_mode(name: &str) -> Result<SyncMode, String> {
    SyncMode::from_name(name).ok_or_else(|| {
        format!("unknown mode {name}; expected vmaster, amaster, pcrmaster, iptv, freerun or vmono")
    })
}

#[derive(Serialize)]
#[serde(tag = "scenario", rename_all = "snake_case")]
enum Report {
    Video(VideoReport),
    Audio(AudioReport),
    Pcr(PcrReport),
}

#[derive(Serialize)]
struct VideoReport {
    mode: &'static str,
    ticks: u64,
    frames_shown: u64,
    /// Ticks each shown frame stayed on screen, by count.
    hold_periods: BTreeMap<u32, u64>,
    cadence: Option<&'static str>,
    final_state: SessionState,
    stats: SessionStats,
}

#[derive(Serialize)]
struct AudioReport {
    start: AudioStartDecision,
    rendered: u64,
    dropped: u64,
    inserted: u64,
    max_delta: i32,
    stats: SessionStats,
}

#[derive(Serialize)]
struct PcrReport {
    samples: u32,
    status: ClockRecoveryStatus,
    ppm: i32,
    expected_ppm: i64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => SyncConfig::default(),
    };
    config.validate().context("invalid session configuration")?;

    let report = match cli.scenario {
        Scenario::Video {
            fps,
            refresh,
            frames,
            mode,
            delay,
        } => Report::Video(run_video(&config, fps, refresh, frames, mode, delay)?),
        Scenario::Audio {
            chunks,
            chunk_ms,
            offset_ms,
            drift_ticks,
        } => Report::Audio(run_audio(&config, chunks, chunk_ms, offset_ms, drift_ticks)?),
        Scenario::Pcr {
            ppm,
            jitter_us,
            period_ms,
            samples,
            seed,
        } => Report::Pcr(run_pcr(&config, ppm, jitter_us, period_ms, samples, seed)?),
    };

    let json = if cli.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{json}");
    Ok(())
}

fn load_config(path: &Path) -> Result<SyncConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    info!(path = %path.display(), "loaded session configuration");
    Ok(config)
}

fn run_video(
    config: &SyncConfig,
    fps: u32,
    refresh: u32,
    frames: u32,
    mode: SyncMode,
    delay: u32,
) -> Result<VideoReport> {
    if fps == 0 || refresh == 0 {
        bail!("frame rate and refresh rate must be positive");
    }
    if matches!(mode, SyncMode::VideoMono | SyncMode::AudioMaster) {
        bail!("the video scenario needs a mode where video drives the wall clock");
    }
    let interval = TIME_UNIT_90K / refresh;
    let duration = TIME_UNIT_90K / fps;

    let clock = Arc::new(SoftClock::new(1));
    clock.set_interval(interval);
    let binding = SessionBinding::open(clock.clone());
    let video = SyncSession::create_with_config(&binding, mode, LegType::Video, 0, config.clone())?;
    video.set_video_config(VideoConfig {
        delay,
        extra_delay_ms: 0,
    })?;

    let lookahead = duration.saturating_mul(8);
    let mut next = 0u32;
    let mut ticks = 0u64;
    let mut shown: Option<(u64, u32)> = None;
    let mut hold_periods = BTreeMap::new();
    let mut frames_shown = 0u64;
    let tick_limit = u64::from(frames) * u64::from(duration.div_ceil(interval).max(1)) * 2 + 64;

    while ticks < tick_limit {
        let horizon = clock.wall().unwrap_or(BASE_PTS).wrapping_add(lookahead);
        while next < frames {
            let pts = BASE_PTS + next * duration;
            if pts > horizon {
                break;
            }
            match video.push_frame(Frame::new(Bytes::new(), pts, duration)) {
                Ok(()) => next += 1,
                Err(SyncError::QueueFull(_)) => break,
                Err(e) => return Err(e.into()),
            }
        }
        if next == frames {
            video.set_eos();
        }

        if let Some(frame) = video.pop_frame()? {
            if frame.toggled {
                frames_shown += 1;
                if let Some((_, hold)) = shown {
                    *hold_periods.entry(hold).or_insert(0u64) += 1;
                }
            }
            shown = Some((frame.sequence, frame.hold_period));
            if next == frames && frame.sequence + 1 == u64::from(frames) && !frame.toggled {
                break;
            }
        }
        clock.advance(interval);
        ticks += 1;
    }
    if ticks == tick_limit {
        warn!(ticks, "video scenario hit its tick limit");
    }

    let report = VideoReport {
        mode: mode.name(),
        ticks,
        frames_shown,
        hold_periods,
        cadence: video.cadence().map(|c| c.name()),
        final_state: video.state(),
        stats: video.stats(),
    };
    video.destroy();
    Ok(report)
}

fn run_audio(
    config: &SyncConfig,
    chunks: u32,
    chunk_ms: u32,
    offset_ms: i32,
    drift_ticks: i32,
) -> Result<AudioReport> {
    let chunk = chunk_ms * (TIME_UNIT_90K / 1000);
    if chunk == 0 {
        bail!("chunk length must be positive");
    }

    let clock = Arc::new(SoftClock::new(2));
    clock.set_wall(Some(BASE_PTS));
    let binding = SessionBinding::open(clock.clone());
    let audio =
        SyncSession::create_with_config(&binding, SyncMode::VideoMaster, LegType::Audio, 0, config.clone())?;

    let mut pts = BASE_PTS.wrapping_add_signed(offset_ms.saturating_mul(90));
    let start = audio.audio_start(
        pts,
        0,
        Some(Box::new(|reason| info!(?reason, "audio start released"))),
    )?;
    info!(?start, pts, "audio start");

    let (mut rendered, mut dropped, mut inserted) = (0u64, 0u64, 0u64);
    let mut max_delta = 0i32;
    for _ in 0..chunks {
        let policy = audio.audio_render(pts)?;
        match policy.action {
            AudioAction::Render => rendered += 1,
            AudioAction::Drop => dropped += 1,
            AudioAction::Insert => inserted += 1,
        }
        if policy.delta.unsigned_abs() > max_delta.unsigned_abs() {
            max_delta = policy.delta;
        }
        pts = pts.wrapping_add(chunk).wrapping_add_signed(drift_ticks);
        clock.advance(chunk);
    }

    let report = AudioReport {
        start,
        rendered,
        dropped,
        inserted,
        max_delta,
        stats: audio.stats(),
    };
    audio.stop_audio()?;
    audio.destroy();
    Ok(report)
}

fn run_pcr(
    config: &SyncConfig,
    ppm: i64,
    jitter_us: u32,
    period_ms: u32,
    samples: u32,
    seed: u64,
) -> Result<PcrReport> {
    if period_ms == 0 {
        bail!("sample period must be positive");
    }
    let clock = Arc::new(SoftClock::new(3));
    let binding = SessionBinding::open(clock.clone());
    let pcr = SyncSession::create_with_config(&binding, SyncMode::PcrMaster, LegType::Pcr, 0, config.clone())?;

    let mut rng = StdRng::seed_from_u64(seed);
    let sigma = f64::from(jitter_us);
    let period_us = i64::from(period_ms) * 1000;

    let mut fed = 0;
    for i in 0..i64::from(samples) {
        let mono_us = i * period_us;
        let reference_us = 5_000_000 + mono_us + mono_us * ppm / 1_000_000;
        let arrival_us = (mono_us + gaussian(&mut rng, sigma) as i64).max(0);
        let pts = (reference_us * 90 / 1000) as u32;
        pcr.set_pcr_clock(pts, (arrival_us * 1000) as u64)?;
        fed += 1;
        if pcr.pcr_status().is_some_and(|s| s.is_ready()) {
            break;
        }
    }

    let (status, estimate) = pcr.clock_deviation();
    if status != ClockRecoveryStatus::Ready {
        warn!(samples = fed, ?status, "drift estimate not ready");
    }
    Ok(PcrReport {
        samples: fed,
        status,
        ppm: estimate,
        expected_ppm: ppm,
    })
}

/// Box-Muller sample, clamped to three standard deviations.
fn gaussian(rng: &mut StdRng, sigma: f64) -> f64 {
    if sigma == 0.0 {
        return 0.0;
    }
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    (z * sigma).clamp(-3.0 * sigma, 3.0 * sigma)
}
