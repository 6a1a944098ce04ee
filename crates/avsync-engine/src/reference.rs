//! Reference (PCR) leg: drift estimation against the program clock.

use tracing::{error, info, warn};

use avsync_types::time::pts_to_us;
use avsync_types::{ClockRecoveryStatus, LegType, Position, SyncMode};

use crate::pcr::{MonitorStatus, PcrSample};
use crate::session::SyncSession;
use crate::SyncResult;

impl SyncSession {
    /// Feed one program clock sample and forward it to the authority.
    ///
    /// Once the drift monitor is ready, every change of the estimate is
    /// pushed to the authority's rate correction.
    pub fn set_pcr_clock(&self, pts: u32, mono_ns: u64) -> SyncResult<()> {
        self.expect_leg(LegType::Pcr)?;
        let id = self.shared.id;
        let clock = self.clock();
        let sample = PcrSample {
            reference_us: pts_to_us(pts),
            mono_us: (mono_ns / 1000) as i64,
        };

        {
            let mut guard = self.shared.lock();
            let core = &mut *guard;
            if let Some(monitor) = core.pcr_monitor.as_mut() {
                let status = monitor.process(sample);
                let estimate = monitor.deviation().filter(|_| status.is_ready());
                if let Some(ppm) = estimate.filter(|ppm| *ppm != core.last_ppm) {
                    core.last_ppm = ppm;
                    info!(session = id, ppm, "clock deviation");
                    if let Err(e) = clock.set_clock_deviation(ppm) {
                        error!(session = id, error = %e, "failed to set clock deviation");
                    }
                }
            }
        }

        clock.set_pcr(pts, mono_ns)?;
        Ok(())
    }

    /// Last PCR pair known to the authority.
    pub fn pcr_clock(&self) -> SyncResult<Position> {
        Ok(self.clock().pcr()?)
    }

    /// Drift monitor progress, for PCR legs.
    pub fn pcr_status(&self) -> Option<MonitorStatus> {
        self.shared.lock().pcr_monitor.as_ref().map(|m| m.status())
    }

    /// Clock deviation in ppm and whether it can be trusted.
    pub fn clock_deviation(&self) -> (ClockRecoveryStatus, i32) {
        if self.mode() != SyncMode::PcrMaster {
            return (ClockRecoveryStatus::NotRunning, 0);
        }
        match self.clock().clock_deviation() {
            Ok(0) => (ClockRecoveryStatus::Ongoing, 0),
            Ok(ppm) => (ClockRecoveryStatus::Ready, ppm),
            Err(e) => {
                warn!(session = self.shared.id, error = %e, "clock deviation unavailable");
                (ClockRecoveryStatus::Error, 0)
            }
        }
    }
}
