//! Migratable PMU state — capture and restore.
//!
//! A snapshot carries everything the engine needs to reproduce identical
//! future behavior on another host: register contents, per-counter values
//! and baselines, and the armed overflow deadlines. Cached event kinds are
//! derived state and are re-resolved from MMCR1 on restore; timer ids are
//! allocated fresh from the destination queue.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vpmu_clock::TimerQueue;

use crate::event::resolve_all;
use crate::pmu::{ArmedTimerParts, Book3sPmu, NUM_PMCS};

/// Serialisable state of one counter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PmcSnapshot {
    /// Architectural register value as of the capture.
    pub value: u64,
    /// Progress baseline in virtual nanoseconds.
    pub base_ns: u64,
    /// Absolute overflow deadline, if a timer was armed.
    pub armed_deadline_ns: Option<u64>,
}

/// Complete serialisable PMU state for one vCPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PmuSnapshot {
    /// MMCR0 contents.
    pub mmcr0: u64,
    /// MMCR1 contents.
    pub mmcr1: u64,
    /// CTRL contents.
    pub ctrl: u64,
    /// The six counter slots, PMC1 first.
    pub pmcs: [PmcSnapshot; NUM_PMCS],
}

/// A snapshot that cannot describe a reachable PMU state.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// A counter claims an armed deadline although its configuration
    /// (gate, event kind, condition enable) cannot arm one.
    #[error("PMC{pmc} has an armed overflow deadline its configuration cannot produce")]
    InconsistentTimer {
        /// Counter number, 1-based.
        pmc: usize,
    },
}

impl Book3sPmu {
    /// Capture the complete engine state.
    pub fn snapshot(&self) -> PmuSnapshot {
        PmuSnapshot {
            mmcr0: self.mmcr0,
            mmcr1: self.mmcr1,
            ctrl: self.ctrl,
            pmcs: std::array::from_fn(|pmc| {
                let (value, base_ns, armed_deadline_ns) = self.pmc_raw(pmc);
                PmcSnapshot {
                    value,
                    base_ns,
                    armed_deadline_ns,
                }
            }),
        }
    }

    /// Rebuild an engine from a snapshot, re-scheduling every armed
    /// deadline into `timers` so future overflow timing is identical.
    pub fn restore(
        snapshot: &PmuSnapshot,
        timers: &mut TimerQueue,
    ) -> Result<Self, RestoreError> {
        let mut pmu = Book3sPmu::new();
        pmu.mmcr0 = snapshot.mmcr0;
        pmu.mmcr1 = snapshot.mmcr1;
        pmu.ctrl = snapshot.ctrl;
        pmu.set_kinds(resolve_all(snapshot.mmcr1));

        for (pmc, slot) in snapshot.pmcs.iter().enumerate() {
            pmu.pmc_restore_raw(pmc, slot.value, slot.base_ns, None);

            if let Some(deadline_ns) = slot.armed_deadline_ns {
                if !pmu.can_arm(pmc) {
                    return Err(RestoreError::InconsistentTimer { pmc: pmc + 1 });
                }
                let id = timers.schedule(deadline_ns);
                pmu.pmc_restore_raw(
                    pmc,
                    slot.value,
                    slot.base_ns,
                    Some(ArmedTimerParts { id, deadline_ns }),
                );
            }
        }

        Ok(pmu)
    }
}
