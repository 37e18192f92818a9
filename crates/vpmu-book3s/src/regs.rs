//! Register bit layout for the Book3s performance monitor SPRs.
//!
//! PowerISA numbers bits big-endian within a 64-bit doubleword: bit 0 is the
//! most significant. [`ppc_bit`] converts that numbering to a mask so the
//! constants below can be read straight off the ISA tables.

/// Mask for PowerISA big-endian bit `n` of a doubleword (bit 0 = MSB).
pub const fn ppc_bit(n: u32) -> u64 {
    1 << (63 - n)
}

// ─── MMCR0 ───────────────────────────────────────────────────────────

/// Freeze all counters.
pub const MMCR0_FC: u64 = ppc_bit(32);

/// Freeze counters on enabled condition or event: when an overflow fires,
/// hardware clears this bit and sets [`MMCR0_FC`].
pub const MMCR0_FCECE: u64 = ppc_bit(38);

/// PMC1 counter-negative condition enable.
pub const MMCR0_PMC1CE: u64 = ppc_bit(48);

/// PMC2–PMC6 counter-negative condition enable.
pub const MMCR0_PMCJCE: u64 = ppc_bit(49);

/// Performance-monitor alert enable. Cleared by hardware when the alert
/// occurs; software re-arms it.
pub const MMCR0_PMAE: u64 = ppc_bit(53);

/// Performance-monitor alert occurred.
pub const MMCR0_PMAO: u64 = ppc_bit(56);

/// Freeze counters 1–4.
pub const MMCR0_FC14: u64 = ppc_bit(58);

/// Freeze counters 5–6.
pub const MMCR0_FC56: u64 = ppc_bit(59);

/// MMCR0 bits visible through the problem-state alias (UMMCR0). Reads
/// through the alias see only these bits; writes alter only these bits.
pub const MMCR0_UREG_MASK: u64 = MMCR0_FC | MMCR0_PMAO | MMCR0_PMAE;

/// Counter-negative boundary. A counter at or above this value has its
/// sign bit set in the 32-bit guest view, which is what the overflow
/// machinery (and guest profilers polling for "counter negative") test.
pub const COUNTER_NEGATIVE_VAL: u64 = 0x8000_0000;

// ─── MMCR1 ───────────────────────────────────────────────────────────

/// Width of one PMCnSEL event-select field.
pub const MMCR1_EVT_SIZE: u32 = 8;

/// Right-shift amounts of the PMC1SEL..PMC4SEL fields within MMCR1.
const MMCR1_PMCSEL_SHIFT: [u32; 4] = [24, 16, 8, 0];

/// Extract the event-select code for programmable counter `pmc`
/// (index 0..4, i.e. PMC1–PMC4).
#[inline]
pub fn mmcr1_event_select(mmcr1: u64, pmc: usize) -> u8 {
    debug_assert!(pmc < 4, "only PMC1-PMC4 have select fields");
    (mmcr1 >> MMCR1_PMCSEL_SHIFT[pmc]) as u8
}

// ─── CTRL ────────────────────────────────────────────────────────────

/// Run latch: set by the OS while doing useful work, cleared when idle.
pub const CTRL_RUN: u64 = 0x1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmcr0_bit_positions() {
        assert_eq!(MMCR0_FC, 0x8000_0000);
        assert_eq!(MMCR0_FCECE, 0x0200_0000);
        assert_eq!(MMCR0_PMC1CE, 0x8000);
        assert_eq!(MMCR0_PMCJCE, 0x4000);
        assert_eq!(MMCR0_PMAE, 0x0400);
        assert_eq!(MMCR0_PMAO, 0x0080);
        assert_eq!(MMCR0_FC14, 0x0020);
        assert_eq!(MMCR0_FC56, 0x0010);
    }

    #[test]
    fn ureg_mask_is_freeze_plus_alert_bits() {
        assert_eq!(MMCR0_UREG_MASK, 0x8000_0480);
    }

    #[test]
    fn mmcr1_selector_extraction() {
        let mmcr1 = (0x02u64 << 24) | (0x1Eu64 << 16) | (0xFAu64 << 8) | 0xF0;
        assert_eq!(mmcr1_event_select(mmcr1, 0), 0x02);
        assert_eq!(mmcr1_event_select(mmcr1, 1), 0x1E);
        assert_eq!(mmcr1_event_select(mmcr1, 2), 0xFA);
        assert_eq!(mmcr1_event_select(mmcr1, 3), 0xF0);
    }
}
