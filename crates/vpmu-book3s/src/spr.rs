//! Guest-facing SPR dispatch for the PMU register file.
//!
//! The privilege/access layer decides whether an access reaches us at all;
//! the masks applied here are architectural and hold regardless of
//! privilege. The problem-state aliases (U-prefixed SPR numbers) are
//! read-mostly: UMMCR0 writes are merged under [`MMCR0_UREG_MASK`], and
//! writes through the other aliases are accepted but have no effect.

use vpmu_clock::TimerQueue;

use crate::pmu::Book3sPmu;
use crate::regs::MMCR0_UREG_MASK;

/// CTRL, read alias.
pub const SPR_UCTRL: u32 = 136;
/// CTRL, write register.
pub const SPR_CTRL: u32 = 152;

/// PMC1–PMC6, problem-state aliases.
pub const SPR_UPMC1: u32 = 771;
pub const SPR_UPMC6: u32 = 776;
/// MMCR0, problem-state alias.
pub const SPR_UMMCR0: u32 = 779;
/// MMCR1, problem-state alias.
pub const SPR_UMMCR1: u32 = 782;

/// PMC1–PMC6, supervisor registers.
pub const SPR_PMC1: u32 = 787;
pub const SPR_PMC6: u32 = 792;
/// MMCR0, supervisor register.
pub const SPR_MMCR0: u32 = 795;
/// MMCR1, supervisor register.
pub const SPR_MMCR1: u32 = 798;

impl Book3sPmu {
    /// Read a PMU SPR. Returns `None` for SPR numbers this unit does not
    /// own. Counter reads flush pending progress first.
    pub fn read_spr(&mut self, now_ns: u64, spr: u32) -> Option<u64> {
        match spr {
            SPR_MMCR0 => Some(self.mmcr0()),
            SPR_UMMCR0 => Some(self.mmcr0() & MMCR0_UREG_MASK),
            SPR_MMCR1 | SPR_UMMCR1 => Some(self.mmcr1()),
            SPR_CTRL | SPR_UCTRL => Some(self.ctrl()),
            SPR_PMC1..=SPR_PMC6 => Some(self.read_pmc(now_ns, (spr - SPR_PMC1) as usize)),
            SPR_UPMC1..=SPR_UPMC6 => Some(self.read_pmc(now_ns, (spr - SPR_UPMC1) as usize)),
            _ => None,
        }
    }

    /// Write a PMU SPR. Returns `false` for SPR numbers this unit does not
    /// own.
    pub fn write_spr(
        &mut self,
        now_ns: u64,
        spr: u32,
        value: u64,
        timers: &mut TimerQueue,
    ) -> bool {
        match spr {
            SPR_MMCR0 => self.store_mmcr0(now_ns, value, timers),
            SPR_UMMCR0 => self.store_mmcr0_ureg(now_ns, value, timers),
            SPR_MMCR1 => self.store_mmcr1(now_ns, value, timers),
            SPR_CTRL => self.store_ctrl(value),
            SPR_PMC1..=SPR_PMC6 => {
                self.store_pmc(now_ns, (spr - SPR_PMC1) as usize, value, timers)
            }
            // Read-only aliases: the store is accepted and discarded.
            SPR_UMMCR1 | SPR_UCTRL => {}
            SPR_UPMC1..=SPR_UPMC6 => {}
            _ => return false,
        }
        true
    }
}
