//! PCR drift monitor.
//!
//! Estimates how fast the program clock runs relative to the local
//! monotonic clock, in parts per million. Raw samples are averaged into
//! groups of [`SAMPLES_PER_GROUP`]; deviations are measured between group
//! averages, so per-sample jitter cancels out long before an estimate is
//! published.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Raw samples averaged into one group.
pub const SAMPLES_PER_GROUP: usize = 1000;

/// Groups kept in the history.
pub const MAX_GROUPS: usize = 100;

/// Samples of a window that must survive outlier rejection (98%).
const VALID_SAMPLES: usize = SAMPLES_PER_GROUP * 98 / 100;

/// A sample further than this from the window average is an outlier.
const RECORD_BIAS_MAX_US: i64 = 30_000;

/// A reference back-jump larger than this is a stream restart.
const GAP_MAX_US: i64 = 60_000_000;

/// Start-up groups thrown away after every reset.
const SKIPPED_GROUPS: usize = 3;

const INITIAL_STEP: usize = 10;
const PROBE_AGREE_PPM: i32 = 10;
const PROBE_REJECT_PPM: i32 = 100;

/// Estimates whose median becomes the short-term deviation.
const STABILITY_SAMPLES: usize = 11;

const LONG_TERM_DIVERGENCE_PPM: i32 = 30;

/// Largest probe step that still lets the stability wait finish.
const MAX_STEP: usize = MAX_GROUPS - STABILITY_SAMPLES - 1;

/// Progress of the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MonitorStatus {
    /// Collecting the first groups.
    Recording,

    /// Searching for a window size whose deviation is stable.
    Probing,

    /// Window size fixed; deriving the first estimate.
    Constructing,

    /// Collecting estimates for the median.
    WaitingForStability,

    /// A deviation is available.
    DeviationReady,
}

impl MonitorStatus {
    pub fn is_ready(&self) -> bool {
        *self >= Self::DeviationReady
    }
}

/// Reference and monotonic time of one sample, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcrSample {
    pub reference_us: i64,
    pub mono_us: i64,
}

fn mean(samples: &[PcrSample]) -> PcrSample {
    let n = samples.len().max(1) as i64;
    let (reference, mono) = samples.iter().fold((0i64, 0i64), |(r, m), s| {
        (r + s.reference_us, m + s.mono_us)
    });
    PcrSample {
        reference_us: reference / n,
        mono_us: mono / n,
    }
}

/// Drift estimator fed with PCR samples.
#[derive(Debug, Clone)]
pub struct PcrMonitor {
    status: MonitorStatus,
    window: Vec<PcrSample>,
    /// Averages of closed groups, oldest first.
    groups: VecDeque<PcrSample>,
    new_group: bool,
    startup_skipped: bool,
    step: usize,
    short_term: i32,
    deviation: i32,
}

impl Default for PcrMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PcrMonitor {
    pub fn new() -> Self {
        Self {
            status: MonitorStatus::Recording,
            window: Vec::with_capacity(SAMPLES_PER_GROUP),
            groups: VecDeque::with_capacity(MAX_GROUPS),
            new_group: false,
            startup_skipped: false,
            step: INITIAL_STEP,
            short_term: 0,
            deviation: 0,
        }
    }

    /// Forget everything, as after a stream restart.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn status(&self) -> MonitorStatus {
        self.status
    }

    /// Current deviation in ppm, once ready. Positive means the reference
    /// clock runs faster than the monotonic clock.
    pub fn deviation(&self) -> Option<i32> {
        self.status.is_ready().then_some(self.deviation)
    }

    /// Estimate of the last construction pass.
    pub fn short_term(&self) -> i32 {
        self.short_term
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Feed one sample and advance the state machine.
    pub fn process(&mut self, sample: PcrSample) -> MonitorStatus {
        self.window.push(sample);
        if self.window.len() >= SAMPLES_PER_GROUP {
            self.close_window();
        }
        self.advance();
        self.status
    }

    fn close_window(&mut self) {
        let window = std::mem::replace(&mut self.window, Vec::with_capacity(SAMPLES_PER_GROUP));

        if let Some(jump) = window
            .windows(2)
            .map(|w| w[0].reference_us - w[1].reference_us)
            .find(|back| *back > GAP_MAX_US)
        {
            warn!(jump_us = jump, "PCR jumped back, restarting drift monitor");
            self.reset();
            return;
        }

        let avg = mean(&window);
        let survivors: Vec<PcrSample> = window
            .iter()
            .filter(|s| {
                let bias = (s.reference_us - avg.reference_us) - (s.mono_us - avg.mono_us);
                bias.abs() <= RECORD_BIAS_MAX_US
            })
            .copied()
            .collect();
        if survivors.len() < VALID_SAMPLES {
            debug!(valid = survivors.len(), "PCR window too noisy, discarded");
            return;
        }

        let (Some(&first), Some(&last)) = (survivors.first(), survivors.last()) else {
            return;
        };
        if self.groups.len() == MAX_GROUPS {
            self.groups.pop_front();
        }
        self.groups.push_back(mean(&survivors));
        self.new_group = true;
        debug!(
            groups = self.groups.len(),
            span_us = last.mono_us - first.mono_us,
            "PCR group closed"
        );
    }

    fn take_new_group(&mut self) -> bool {
        std::mem::take(&mut self.new_group)
    }

    fn advance(&mut self) {
        match self.status {
            MonitorStatus::Recording | MonitorStatus::Probing => {
                if self.take_new_group() {
                    self.probe();
                }
            }
            MonitorStatus::Constructing => {
                if let Some(ppm) = self.deviation_between(0, self.step - 1) {
                    self.short_term = ppm;
                    self.status = MonitorStatus::WaitingForStability;
                    debug!(step = self.step, ppm, "PCR short-term estimate");
                }
            }
            MonitorStatus::WaitingForStability => {
                if self.take_new_group() && self.groups.len() > self.step + STABILITY_SAMPLES - 1 {
                    self.settle();
                }
            }
            MonitorStatus::DeviationReady => {
                if self.take_new_group() {
                    self.check_long_term();
                }
            }
        }
    }

    fn probe(&mut self) {
        let count = self.groups.len();
        if count <= self.step {
            return;
        }
        if !self.startup_skipped {
            self.groups.drain(..SKIPPED_GROUPS);
            self.startup_skipped = true;
            self.status = MonitorStatus::Probing;
            return;
        }

        let (Some(d1), Some(d2)) = (
            self.deviation_between(0, self.step - 1),
            self.deviation_between(1, self.step),
        ) else {
            return;
        };
        let spread = (d1 - d2).abs();

        if spread < PROBE_AGREE_PPM {
            info!(step = self.step, d1, d2, "PCR probe window settled");
            self.status = MonitorStatus::Constructing;
        } else if spread > PROBE_REJECT_PPM {
            if (d1 < 0) != (d2 < 0) || d1.abs() > d2.abs() {
                debug!(d1, d2, "dropping oldest PCR group");
                self.groups.pop_front();
            } else {
                debug!(d1, d2, "dropping newest PCR groups");
                self.groups.truncate(self.step);
            }
        } else {
            self.step = (self.step + 1).min(MAX_STEP);
        }
    }

    fn settle(&mut self) {
        let mut estimates: Vec<i32> = (0..STABILITY_SAMPLES)
            .filter_map(|i| self.deviation_between(0, self.step + i))
            .collect();
        if estimates.len() < STABILITY_SAMPLES {
            return;
        }
        estimates.sort_unstable();
        self.deviation = estimates[STABILITY_SAMPLES / 2];
        self.status = MonitorStatus::DeviationReady;
        info!(ppm = self.deviation, step = self.step, "PCR deviation ready");
    }

    fn check_long_term(&mut self) {
        let Some(long_term) = self.deviation_between(0, self.groups.len() - 1) else {
            return;
        };
        if (long_term - self.deviation).abs() > LONG_TERM_DIVERGENCE_PPM {
            self.step = self.groups.len().min(MAX_STEP);
            self.status = MonitorStatus::Constructing;
            info!(
                long_term,
                current = self.deviation,
                step = self.step,
                "PCR drift changed, re-deriving"
            );
        }
    }

    /// Deviation between the averages of groups `start` and `end`.
    fn deviation_between(&self, start: usize, end: usize) -> Option<i32> {
        let a = self.groups.get(start)?;
        let b = self.groups.get(end)?;
        let mono = b.mono_us - a.mono_us;
        if mono <= 0 {
            return None;
        }
        let reference = b.reference_us - a.reference_us;
        i32::try_from((reference - mono) * 1_000_000 / mono).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const SAMPLE_PERIOD_US: i64 = 40_000;

    /// Gaussian noise via Box-Muller, clamped to 3 sigma.
    fn jitter(rng: &mut StdRng, sigma: f64) -> i64 {
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        (z.clamp(-3.0, 3.0) * sigma) as i64
    }

    fn drifting_sample(i: i64, ppm: i64, noise: i64) -> PcrSample {
        let mono = i * SAMPLE_PERIOD_US;
        PcrSample {
            reference_us: 5_000_000 + mono + mono * ppm / 1_000_000 + noise,
            mono_us: mono,
        }
    }

    fn run_until_ready(monitor: &mut PcrMonitor, ppm: i64, limit: i64, seed: u64) -> Option<i64> {
        let mut rng = StdRng::seed_from_u64(seed);
        for i in 0..limit {
            let noise = jitter(&mut rng, 300.0);
            if monitor.process(drifting_sample(i, ppm, noise)).is_ready() {
                return Some(i + 1);
            }
        }
        None
    }

    #[test]
    fn test_converges_on_positive_drift() {
        let mut monitor = PcrMonitor::new();
        let used = run_until_ready(&mut monitor, 50, 40_000, 7).expect("monitor never converged");
        assert!(used <= 40_000);
        let ppm = monitor.deviation().unwrap();
        assert!((ppm - 50).abs() <= 2, "estimated {ppm} ppm");
    }

    #[test]
    fn test_converges_on_negative_drift() {
        let mut monitor = PcrMonitor::new();
        run_until_ready(&mut monitor, -120, 40_000, 11).expect("monitor never converged");
        let ppm = monitor.deviation().unwrap();
        assert!((ppm + 120).abs() <= 2, "estimated {ppm} ppm");
    }

    #[test]
    fn test_stays_ready_on_steady_stream() {
        let mut monitor = PcrMonitor::new();
        let used = run_until_ready(&mut monitor, 20, 40_000, 3).unwrap();
        for i in used..used + 10_000 {
            monitor.process(drifting_sample(i, 20, 0));
        }
        assert_eq!(monitor.status(), MonitorStatus::DeviationReady);
    }

    #[test]
    fn test_status_progression() {
        let mut monitor = PcrMonitor::new();
        let mut seen = vec![monitor.status()];
        for i in 0..30_000 {
            let status = monitor.process(drifting_sample(i, 10, 0));
            if seen.last() != Some(&status) {
                seen.push(status);
            }
        }
        assert_eq!(
            seen,
            vec![
                MonitorStatus::Recording,
                MonitorStatus::Probing,
                MonitorStatus::Constructing,
                MonitorStatus::WaitingForStability,
                MonitorStatus::DeviationReady,
            ]
        );
    }

    #[test]
    fn test_back_jump_resets() {
        let mut monitor = PcrMonitor::new();
        for i in 0..2_000 {
            monitor.process(drifting_sample(i, 0, 0));
        }
        assert_eq!(monitor.group_count(), 2);

        for i in 0..SAMPLES_PER_GROUP as i64 {
            let mut s = drifting_sample(2_000 + i, 0, 0);
            if i >= 500 {
                s.reference_us -= 70_000_000;
            }
            monitor.process(s);
        }
        assert_eq!(monitor.group_count(), 0);
        assert_eq!(monitor.status(), MonitorStatus::Recording);
    }

    #[test]
    fn test_noisy_window_discarded() {
        let mut monitor = PcrMonitor::new();
        for i in 0..SAMPLES_PER_GROUP as i64 {
            let mut s = drifting_sample(i, 0, 0);
            if i % 30 == 0 {
                s.reference_us += 100_000;
            }
            monitor.process(s);
        }
        assert_eq!(monitor.group_count(), 0);

        for i in 0..SAMPLES_PER_GROUP as i64 {
            let mut s = drifting_sample(1_000 + i, 0, 0);
            if i % 100 == 0 {
                s.reference_us += 100_000;
            }
            monitor.process(s);
        }
        assert_eq!(monitor.group_count(), 1);
    }

    #[test]
    fn test_no_deviation_before_ready() {
        let mut monitor = PcrMonitor::new();
        for i in 0..5_000 {
            monitor.process(drifting_sample(i, 40, 0));
        }
        assert!(monitor.deviation().is_none());
    }
}
