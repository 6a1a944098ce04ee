//! Cadence pattern detection.
//!
//! Watches how many ticks each displayed frame was held and recognises
//! steady pulldown cadences. Once a cadence is confirmed the expiry engine
//! asks [`PatternDetector::correct`] to keep a single late or early tick
//! from breaking it.

use tracing::{debug, info};

use avsync_types::time::diff;

/// Tick intervals above this (below 100 Hz) use the classic pattern bank.
const HIGH_REFRESH_INTERVAL: u32 = 900;

/// Default next-frame distance for 3:2 pulldown when the next frame is unknown.
const PULLDOWN_32_DURATION: u32 = 3750;

/// Frames overdue by at most this much may still be held for the cadence.
const HOLD_MARGIN: u32 = 90;

/// A recognisable hold-period cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cadence {
    /// 3,2,3,2 (24 fps on 60 Hz).
    Pulldown32,
    /// 2,2,2 (30 fps on 60 Hz).
    Even22,
    /// 2,1,1,1 (48 fps on 60 Hz).
    Pulldown41,
    /// 1,1,1.
    Progressive11,
    /// 4,4 (30 fps on 120 Hz).
    Even44,
    /// 5,5 (24 fps on 120 Hz).
    Even55,
}

impl Cadence {
    /// Consecutive matching pairs needed before the cadence is trusted.
    pub fn window(&self) -> u32 {
        match self {
            Self::Pulldown41 => 2,
            _ => 10,
        }
    }

    fn factors(&self) -> (u32, u32) {
        match self {
            Self::Pulldown32 => (3, 2),
            Self::Even22 => (2, 2),
            Self::Pulldown41 => (2, 1),
            Self::Progressive11 => (1, 1),
            Self::Even44 => (4, 4),
            Self::Even55 => (5, 5),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pulldown32 => "3:2",
            Self::Even22 => "2:2",
            Self::Pulldown41 => "4:1",
            Self::Progressive11 => "1:1",
            Self::Even44 => "4:4",
            Self::Even55 => "5:5",
        }
    }

    /// Hold periods `(previous, current)` the cadence expects after a frame
    /// held `last_period` ticks, and the next-frame distance to assume.
    fn expectation(&self, last_period: u32, interval: u32) -> Option<Expectation> {
        let (prev, cur, gap) = match (self, last_period) {
            (Self::Pulldown32, 3) => (3, 2, PULLDOWN_32_DURATION),
            (Self::Pulldown32, 2) => (2, 3, PULLDOWN_32_DURATION),
            (Self::Even22, 2) => (2, 2, 2 * interval),
            (Self::Even44, 4) => (4, 4, 4 * interval),
            (Self::Even55, 5) => (5, 5, 5 * interval),
            (Self::Progressive11, 1) => (1, 1, interval),
            _ => return None,
        };
        Some(Expectation { prev, cur, gap })
    }
}

#[derive(Debug, Clone, Copy)]
struct Expectation {
    prev: u32,
    cur: u32,
    gap: u32,
}

/// Per-cadence counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CadenceCounter {
    /// Consecutive matching pairs, saturating at the window.
    pub matches: u32,
    /// Times the cadence was confirmed.
    pub entered: u32,
    /// Times a confirmed cadence broke.
    pub exited: u32,
}

/// Inputs of one correction query.
#[derive(Debug, Clone, Copy)]
pub struct Correction {
    /// Frame timestamp including extra delay.
    pub fpts: u32,
    /// Next frame timestamp, if queued.
    pub npts: Option<u32>,
    /// Ticks the displayed frame has held so far.
    pub cur_period: u32,
    /// Ticks the frame before it held.
    pub last_period: u32,
    /// Wall clock with delay and phase applied.
    pub systime: u32,
    pub interval: u32,
}

#[derive(Debug, Clone)]
struct Bank<const N: usize> {
    cadences: [Cadence; N],
    counters: [CadenceCounter; N],
    detected: Option<Cadence>,
}

impl<const N: usize> Bank<N> {
    fn new(cadences: [Cadence; N]) -> Self {
        Self {
            cadences,
            counters: [CadenceCounter::default(); N],
            detected: None,
        }
    }

    fn counter(&self, cadence: Cadence) -> Option<&CadenceCounter> {
        self.cadences
            .iter()
            .position(|c| *c == cadence)
            .map(|i| &self.counters[i])
    }

    /// Pairwise detection for every cadence except 4:1.
    fn detect_pair(&mut self, index: usize, cur: u32, last: u32) -> bool {
        let cadence = self.cadences[index];
        let (a, b) = cadence.factors();
        let window = cadence.window();
        let counter = &mut self.counters[index];

        if (last == a && cur == b) || (last == b && cur == a) {
            if counter.matches < window {
                counter.matches += 1;
                if counter.matches == window {
                    counter.entered += 1;
                    self.detected = Some(cadence);
                    info!(cadence = cadence.name(), entered = counter.entered, "video cadence detected");
                }
            }
            false
        } else if counter.matches == window {
            counter.matches = 0;
            counter.exited += 1;
            if self.detected == Some(cadence) {
                self.detected = None;
            }
            info!(
                cadence = cadence.name(),
                last,
                cur,
                exited = counter.exited,
                "video cadence broken"
            );
            true
        } else {
            counter.matches = 0;
            false
        }
    }

    fn reset(&mut self) {
        for counter in &mut self.counters {
            counter.matches = 0;
        }
        self.detected = None;
    }

    fn correct(&self, c: &Correction, expire: bool) -> bool {
        if c.fpts == 0 {
            return expire;
        }
        let Some(cadence) = self.detected else {
            return expire;
        };
        let Some(exp) = cadence.expectation(c.last_period, c.interval) else {
            return expire;
        };
        if self.counter(cadence).map(|k| k.matches) != Some(cadence.window()) {
            return expire;
        }

        let npts = match c.npts {
            Some(n) if n != 0 => n,
            _ => c.fpts.wrapping_add(exp.gap),
        };
        let ahead = |ticks: u32| c.systime.wrapping_add(ticks.wrapping_mul(c.interval));

        if expire {
            if c.cur_period < exp.cur {
                let remain = exp.cur - c.cur_period;
                if c.systime.wrapping_sub(c.fpts) <= HOLD_MARGIN {
                    debug!(cadence = cadence.name(), systime = c.systime, fpts = c.fpts, "hold frame for cadence");
                    return false;
                }
                if diff(ahead(remain + 1), npts) <= 0 && diff(ahead(remain + 2), npts) > 0 {
                    debug!(cadence = cadence.name(), npts, "hold frame for cadence");
                    return false;
                }
            }
            true
        } else {
            if c.cur_period == exp.cur
                && diff(ahead(1), c.fpts) >= 0
                && diff(ahead(exp.prev - 1), npts) < 0
                && diff(ahead(exp.prev), npts) >= 0
            {
                debug!(cadence = cadence.name(), fpts = c.fpts, "squeeze frame for cadence");
                return true;
            }
            false
        }
    }
}

/// Classic bank: 3:2, 2:2, 4:1, 1:1.
#[derive(Debug, Clone)]
pub struct StandardDetector {
    bank: Bank<4>,
    run_41: [u32; 4],
    run_41_len: usize,
}

impl StandardDetector {
    fn new() -> Self {
        Self {
            bank: Bank::new([
                Cadence::Pulldown32,
                Cadence::Even22,
                Cadence::Pulldown41,
                Cadence::Progressive11,
            ]),
            run_41: [0; 4],
            run_41_len: 0,
        }
    }

    fn clear_run_41(&mut self) {
        self.run_41 = [0; 4];
        self.run_41_len = 0;
    }

    /// 4:1 is tracked over the 2,1,1,1 run rather than pairwise.
    fn detect_41(&mut self, cur: u32) -> bool {
        const INDEX: usize = 2;
        let window = Cadence::Pulldown41.window();
        let confirmed = self.bank.counters[INDEX].matches == window;

        match cur {
            2 => {
                let counter = &mut self.bank.counters[INDEX];
                if self.run_41[1..] == [1, 1, 1] && counter.matches < window {
                    counter.matches += 1;
                    if counter.matches == window {
                        counter.entered += 1;
                        self.bank.detected = Some(Cadence::Pulldown41);
                        info!(entered = counter.entered, "video cadence 4:1 detected");
                    }
                }
                self.run_41 = [2, 0, 0, 0];
                self.run_41_len = 1;
                false
            }
            1 if (1..4).contains(&self.run_41_len) => {
                self.run_41[self.run_41_len] = 1;
                self.run_41_len += 1;
                false
            }
            _ => {
                self.clear_run_41();
                let counter = &mut self.bank.counters[INDEX];
                counter.matches = 0;
                if !confirmed {
                    return false;
                }
                counter.exited += 1;
                if self.bank.detected == Some(Cadence::Pulldown41) {
                    self.bank.detected = None;
                }
                info!(exited = counter.exited, "video cadence 4:1 broken");
                true
            }
        }
    }

    fn detect(&mut self, cur: u32, last: u32) -> bool {
        let mut broken = self.bank.detect_pair(0, cur, last);
        broken |= self.bank.detect_pair(1, cur, last);
        broken |= self.detect_41(cur);
        broken |= self.bank.detect_pair(3, cur, last);
        broken
    }
}

/// High refresh bank: 5:5, 4:4, 3:2, 2:2, 1:1.
#[derive(Debug, Clone)]
pub struct HighRefreshDetector {
    bank: Bank<5>,
}

impl HighRefreshDetector {
    fn new() -> Self {
        Self {
            bank: Bank::new([
                Cadence::Even55,
                Cadence::Even44,
                Cadence::Pulldown32,
                Cadence::Even22,
                Cadence::Progressive11,
            ]),
        }
    }

    fn detect(&mut self, cur: u32, last: u32) -> bool {
        let mut broken = false;
        for i in 0..5 {
            broken |= self.bank.detect_pair(i, cur, last);
        }
        broken
    }
}

/// Cadence detector, chosen once from the tick interval at creation.
#[derive(Debug, Clone)]
pub enum PatternDetector {
    Standard(StandardDetector),
    HighRefresh(HighRefreshDetector),
}

impl PatternDetector {
    pub fn new(interval: u32) -> Self {
        if interval > HIGH_REFRESH_INTERVAL {
            Self::Standard(StandardDetector::new())
        } else {
            Self::HighRefresh(HighRefreshDetector::new())
        }
    }

    pub fn is_high_refresh(&self) -> bool {
        matches!(self, Self::HighRefresh(_))
    }

    /// Feed the hold periods of the two most recent frames.
    ///
    /// Returns true when a confirmed cadence just broke.
    pub fn detect(&mut self, cur_period: u32, last_period: u32) -> bool {
        match self {
            Self::Standard(d) => d.detect(cur_period, last_period),
            Self::HighRefresh(d) => d.detect(cur_period, last_period),
        }
    }

    /// Possibly flip an expiry decision to preserve a confirmed cadence.
    pub fn correct(&self, correction: &Correction, expire: bool) -> bool {
        match self {
            Self::Standard(d) => d.bank.correct(correction, expire),
            Self::HighRefresh(d) => d.bank.correct(correction, expire),
        }
    }

    /// Clear match counters and the detected cadence.
    pub fn reset(&mut self) {
        match self {
            Self::Standard(d) => {
                d.bank.reset();
                d.clear_run_41();
            }
            Self::HighRefresh(d) => d.bank.reset(),
        }
    }

    pub fn detected(&self) -> Option<Cadence> {
        match self {
            Self::Standard(d) => d.bank.detected,
            Self::HighRefresh(d) => d.bank.detected,
        }
    }

    /// Counters of `cadence`, if this bank tracks it.
    pub fn counter(&self, cadence: Cadence) -> Option<CadenceCounter> {
        match self {
            Self::Standard(d) => d.bank.counter(cadence).copied(),
            Self::HighRefresh(d) => d.bank.counter(cadence).copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Feed a hold sequence the way the expiry loop does.
    fn feed(pd: &mut PatternDetector, holds: &[u32], last: &mut u32) -> u32 {
        let mut breaks = 0;
        for &cur in holds {
            if pd.detect(cur, *last) {
                breaks += 1;
            }
            *last = cur;
        }
        breaks
    }

    #[test]
    fn test_bank_selection() {
        assert!(!PatternDetector::new(1500).is_high_refresh());
        assert!(!PatternDetector::new(1800).is_high_refresh());
        assert!(PatternDetector::new(750).is_high_refresh());
        assert!(PatternDetector::new(900).is_high_refresh());
    }

    #[test]
    fn test_pulldown_32_detected_then_broken_once() {
        let mut pd = PatternDetector::new(1500);
        let mut last = 0;
        let cycles: Vec<u32> = [3, 2].iter().copied().cycle().take(20).collect();
        assert_eq!(feed(&mut pd, &cycles, &mut last), 0);
        assert_eq!(pd.detected(), Some(Cadence::Pulldown32));

        // last was 2, so [3, 3] breaks on the second 3
        assert_eq!(feed(&mut pd, &[3, 3], &mut last), 1);
        assert_eq!(pd.detected(), None);
        let counter = pd.counter(Cadence::Pulldown32).unwrap();
        assert_eq!(counter.matches, 0);
        assert_eq!(counter.entered, 1);
        assert_eq!(counter.exited, 1);

        assert_eq!(feed(&mut pd, &[3, 3, 3], &mut last), 0);
    }

    #[test]
    fn test_even_22_needs_full_window() {
        let mut pd = PatternDetector::new(1500);
        let mut last = 2;
        feed(&mut pd, &[2; 9], &mut last);
        assert_eq!(pd.detected(), None);
        feed(&mut pd, &[2], &mut last);
        assert_eq!(pd.detected(), Some(Cadence::Even22));
    }

    #[test]
    fn test_pulldown_41_detected_and_broken() {
        let mut pd = PatternDetector::new(1500);
        let mut last = 0;
        feed(&mut pd, &[2, 1, 1, 1, 2, 1, 1, 1, 2], &mut last);
        assert_eq!(pd.detected(), Some(Cadence::Pulldown41));

        assert_eq!(feed(&mut pd, &[3], &mut last), 1);
        assert_eq!(pd.detected(), None);
        assert_eq!(pd.counter(Cadence::Pulldown41).unwrap().exited, 1);
    }

    #[test]
    fn test_high_refresh_55() {
        let mut pd = PatternDetector::new(750);
        let mut last = 5;
        feed(&mut pd, &[5; 10], &mut last);
        assert_eq!(pd.detected(), Some(Cadence::Even55));
        assert!(pd.counter(Cadence::Pulldown41).is_none());
    }

    #[test]
    fn test_reset_keeps_history_counters() {
        let mut pd = PatternDetector::new(1500);
        let mut last = 1;
        feed(&mut pd, &[1; 10], &mut last);
        assert_eq!(pd.detected(), Some(Cadence::Progressive11));
        pd.reset();
        assert_eq!(pd.detected(), None);
        let counter = pd.counter(Cadence::Progressive11).unwrap();
        assert_eq!(counter.matches, 0);
        assert_eq!(counter.entered, 1);
    }

    #[test]
    fn test_correct_requires_confirmation() {
        let pd = PatternDetector::new(1500);
        let c = Correction {
            fpts: 9000,
            npts: Some(12750),
            cur_period: 1,
            last_period: 3,
            systime: 9000,
            interval: 1500,
        };
        assert!(pd.correct(&c, true));
        assert!(!pd.correct(&c, false));
    }

    #[test]
    fn test_correct_holds_short_period_in_32() {
        let mut pd = PatternDetector::new(1500);
        let mut last = 0;
        feed(&mut pd, &[3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3], &mut last);
        assert_eq!(pd.detected(), Some(Cadence::Pulldown32));

        // Previous frame held 3, current has held 1 of its expected 2 and
        // the frame is only just due.
        let c = Correction {
            fpts: 90_000,
            npts: Some(93_750),
            cur_period: 1,
            last_period: 3,
            systime: 90_050,
            interval: 1500,
        };
        assert!(!pd.correct(&c, true));

        // Far overdue and the next frame is not in the hold window.
        let late = Correction { systime: 93_000, ..c };
        assert!(pd.correct(&late, true));
    }

    #[test]
    fn test_correct_squeezes_in_22() {
        let mut pd = PatternDetector::new(1500);
        let mut last = 2;
        feed(&mut pd, &[2; 10], &mut last);

        // Held the expected 2 ticks; the frame is due next tick and the
        // following one lands two ticks out.
        let c = Correction {
            fpts: 10_000,
            npts: Some(11_800),
            cur_period: 2,
            last_period: 2,
            systime: 9_000,
            interval: 1500,
        };
        assert!(pd.correct(&c, false));
    }

    #[test]
    fn test_41_never_corrects() {
        let mut pd = PatternDetector::new(1500);
        let mut last = 0;
        feed(&mut pd, &[2, 1, 1, 1, 2, 1, 1, 1, 2], &mut last);
        let c = Correction {
            fpts: 9000,
            npts: None,
            cur_period: 0,
            last_period: 1,
            systime: 9000,
            interval: 1500,
        };
        assert!(pd.correct(&c, true));
        assert!(!pd.correct(&c, false));
    }

    const ALL: [Cadence; 6] = [
        Cadence::Pulldown32,
        Cadence::Even22,
        Cadence::Pulldown41,
        Cadence::Progressive11,
        Cadence::Even44,
        Cadence::Even55,
    ];

    proptest! {
        #[test]
        fn test_reset_clears_any_history(
            interval in prop::sample::select(vec![750u32, 900, 1500, 1800]),
            holds in prop::collection::vec(1u32..=6, 0..200),
        ) {
            let mut pd = PatternDetector::new(interval);
            let mut last = 0;
            feed(&mut pd, &holds, &mut last);
            pd.reset();
            prop_assert_eq!(pd.detected(), None);
            for cadence in ALL {
                if let Some(counter) = pd.counter(cadence) {
                    prop_assert_eq!(counter.matches, 0);
                }
            }
        }

        #[test]
        fn test_unconfirmed_detector_never_flips(
            fpts in any::<u32>(),
            systime in any::<u32>(),
            cur_period in 0u32..8,
            last_period in 0u32..8,
            expire in any::<bool>(),
        ) {
            let pd = PatternDetector::new(1500);
            let c = Correction {
                fpts,
                npts: Some(fpts.wrapping_add(3750)),
                cur_period,
                last_period,
                systime,
                interval: 1500,
            };
            prop_assert_eq!(pd.correct(&c, expire), expire);
        }
    }
}
