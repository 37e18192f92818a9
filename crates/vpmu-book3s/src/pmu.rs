//! The per-vCPU counter engine: counter bank, synchronization, overflow
//! scheduling, and the MMCR0/MMCR1/CTRL register interface.
//!
//! # Counting model
//!
//! Instruction events are counted eagerly: the run loop reports each retired
//! batch through [`Book3sPmu::instructions_retired`] and the affected
//! counters advance immediately, in their native unit.
//!
//! Time-based events (cycles, stalls) are counted lazily. Each counter
//! carries a baseline — the virtual instant counting last (re)started — and
//! a flush folds `now - baseline` into the register value using the event's
//! accumulation formula, then re-bases. Flushes happen on every state
//! transition that needs an up-to-date value: counter reads, counter writes,
//! freeze-bit changes, event reselection, and overflow-timer expiry.
//!
//! # Freeze gates
//!
//! MMCR0[FC] freezes everything; MMCR0[FC14] and MMCR0[FC56] freeze the
//! PMC1–4 and PMC5–6 groups. A counter advances only when both its group
//! gate and FC are clear. While a counter's gate is frozen its baseline is
//! meaningless; unfreezing re-bases to "now".
//!
//! # Overflow
//!
//! The counter-negative boundary is `0x8000_0000`. Instruction-kind
//! counters detect it synchronously at batch time. Time-based counters arm
//! a deadline in the embedder's [`TimerQueue`]; the run loop pops expired
//! ids and hands them back via [`Book3sPmu::overflow_timer_expired`]. Any
//! transition that invalidates a computed deadline cancels the timer before
//! optionally re-arming, so a stale deadline is never applied.

use log::{debug, trace, warn};
use vpmu_clock::{TimerId, TimerQueue};

use crate::event::{resolve_all, resolve_programmable, EventKind, NUM_PROGRAMMABLE};
use crate::regs::{
    mmcr1_event_select, COUNTER_NEGATIVE_VAL, CTRL_RUN, MMCR0_FC, MMCR0_FC14, MMCR0_FC56,
    MMCR0_FCECE, MMCR0_PMAE, MMCR0_PMAO, MMCR0_PMC1CE, MMCR0_PMCJCE, MMCR0_UREG_MASK,
};

/// Number of counters in the bank.
pub const NUM_PMCS: usize = 6;

/// Index of PMC5 (hard-wired instruction counter).
const PMC5: usize = 4;

/// Index of PMC6 (hard-wired cycle counter).
const PMC6: usize = 5;

/// Outgoing edge toward the interrupt-delivery collaborator.
///
/// Called at most once per overflow event, with the alert-occurred bit
/// already set in MMCR0. Delivery and clearing of the guest-visible
/// interrupt are the collaborator's business.
pub trait PerfMonAlert {
    /// Raise the performance-monitor alert line.
    fn raise_alert(&mut self);
}

/// Freeze-gate groups. PMC1–4 share one gate, PMC5–6 the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Pmc14,
    Pmc56,
}

const GATES: [Gate; 2] = [Gate::Pmc14, Gate::Pmc56];

impl Gate {
    fn of(pmc: usize) -> Self {
        if pmc < PMC5 {
            Gate::Pmc14
        } else {
            Gate::Pmc56
        }
    }

    fn pmcs(self) -> std::ops::Range<usize> {
        match self {
            Gate::Pmc14 => 0..PMC5,
            Gate::Pmc56 => PMC5..NUM_PMCS,
        }
    }

    fn frozen_in(self, mmcr0: u64) -> bool {
        let group_bit = match self {
            Gate::Pmc14 => MMCR0_FC14,
            Gate::Pmc56 => MMCR0_FC56,
        };
        mmcr0 & (MMCR0_FC | group_bit) != 0
    }
}

/// An armed overflow timer: the queue id plus the absolute deadline it was
/// computed for, kept so snapshots can reproduce it exactly.
#[derive(Debug, Clone, Copy)]
struct ArmedTimer {
    id: TimerId,
    deadline_ns: u64,
}

/// One counter register slot.
#[derive(Debug, Clone)]
struct Pmc {
    /// Architectural register value as of the last flush.
    value: u64,
    /// Virtual instant counting last (re)started. Meaningless while the
    /// counter's gate is frozen.
    base_ns: u64,
    /// Event resolved from MMCR1 (hard-wired for PMC5/PMC6).
    kind: EventKind,
    /// Outstanding overflow timer, if any.
    armed: Option<ArmedTimer>,
}

/// Book3s performance monitoring unit for one virtual CPU.
///
/// All entry points take the current virtual time explicitly and, where
/// scheduling can change, the embedder's [`TimerQueue`]. Nothing blocks and
/// nothing fails; the only observable outputs are register values, timer
/// deadlines, and [`PerfMonAlert::raise_alert`] calls.
#[derive(Debug, Clone)]
pub struct Book3sPmu {
    pub(crate) mmcr0: u64,
    pub(crate) mmcr1: u64,
    pub(crate) ctrl: u64,
    pmcs: [Pmc; NUM_PMCS],
}

impl Default for Book3sPmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Book3sPmu {
    /// Create a PMU in its reset state: all counters zero and inert, both
    /// gates frozen via MMCR0[FC].
    pub fn new() -> Self {
        let kinds = resolve_all(0);
        Self {
            mmcr0: MMCR0_FC,
            mmcr1: 0,
            ctrl: 0,
            pmcs: std::array::from_fn(|pmc| Pmc {
                value: 0,
                base_ns: 0,
                kind: kinds[pmc],
                armed: None,
            }),
        }
    }

    // ─── Register reads ──────────────────────────────────────────────

    /// Current MMCR0 contents.
    #[inline]
    pub fn mmcr0(&self) -> u64 {
        self.mmcr0
    }

    /// MMCR0 as seen through the problem-state alias.
    #[inline]
    pub fn mmcr0_ureg(&self) -> u64 {
        self.mmcr0 & MMCR0_UREG_MASK
    }

    /// Current MMCR1 contents.
    #[inline]
    pub fn mmcr1(&self) -> u64 {
        self.mmcr1
    }

    /// Current CTRL contents.
    #[inline]
    pub fn ctrl(&self) -> u64 {
        self.ctrl
    }

    /// Whether the performance-monitor alert has occurred (MMCR0[PMAO]).
    #[inline]
    pub fn alert_occurred(&self) -> bool {
        self.mmcr0 & MMCR0_PMAO != 0
    }

    /// Whether counter `pmc` is currently advancing.
    #[inline]
    pub fn pmc_active(&self, pmc: usize) -> bool {
        !Gate::of(pmc).frozen_in(self.mmcr0)
    }

    /// Read counter `pmc` (index 0..6, PMC1 is index 0). Flushes pending
    /// progress first so the returned value is the true architectural one.
    pub fn read_pmc(&mut self, now_ns: u64, pmc: usize) -> u64 {
        debug_assert!(pmc < NUM_PMCS);
        self.flush(pmc, now_ns);
        self.pmcs[pmc].value
    }

    // ─── Register writes ─────────────────────────────────────────────

    /// Write MMCR0.
    ///
    /// Detects freeze-gate and condition-enable transitions regardless of
    /// which other bits changed in the same store: freezing groups flush
    /// under the outgoing state, unfreezing groups re-base to `now_ns`, and
    /// any such transition cancels and recomputes the overflow timer set.
    pub fn store_mmcr0(&mut self, now_ns: u64, value: u64, timers: &mut TimerQueue) {
        let old = self.mmcr0;
        let ce_changed = (old ^ value) & (MMCR0_PMC1CE | MMCR0_PMCJCE) != 0;
        let mut reschedule = ce_changed;

        for gate in GATES {
            let was_frozen = gate.frozen_in(old);
            let now_frozen = gate.frozen_in(value);
            if was_frozen != now_frozen {
                reschedule = true;
                debug!(
                    "{:?} gate {}",
                    gate,
                    if now_frozen { "frozen" } else { "unfrozen" }
                );
            }
            // A group being frozen, or reconfigured while running, settles
            // its accrued progress before the new state applies.
            if !was_frozen && (now_frozen || ce_changed) {
                for pmc in gate.pmcs() {
                    self.flush(pmc, now_ns);
                }
            }
        }

        self.mmcr0 = value;

        for gate in GATES {
            if gate.frozen_in(old) && !gate.frozen_in(value) {
                for pmc in gate.pmcs() {
                    self.pmcs[pmc].base_ns = now_ns;
                }
            }
        }

        if reschedule {
            self.cancel_all_timers(timers);
            self.arm_eligible_timers(now_ns, timers);
        }
    }

    /// Write MMCR0 through the problem-state alias: only the bits in
    /// [`MMCR0_UREG_MASK`] take effect.
    pub fn store_mmcr0_ureg(&mut self, now_ns: u64, value: u64, timers: &mut TimerQueue) {
        let merged = (self.mmcr0 & !MMCR0_UREG_MASK) | (value & MMCR0_UREG_MASK);
        self.store_mmcr0(now_ns, merged, timers);
    }

    /// Write MMCR1 and re-resolve the programmable counters' events.
    ///
    /// Progress accrued under the outgoing events is flushed first, so a
    /// counter never retroactively applies its new formula to old elapsed
    /// time.
    pub fn store_mmcr1(&mut self, now_ns: u64, value: u64, timers: &mut TimerQueue) {
        for pmc in 0..NUM_PROGRAMMABLE {
            self.flush(pmc, now_ns);
        }

        self.mmcr1 = value;

        for pmc in 0..NUM_PROGRAMMABLE {
            let kind = resolve_programmable(pmc, mmcr1_event_select(value, pmc));
            if kind != self.pmcs[pmc].kind {
                trace!("PMC{} event is now {:?}", pmc + 1, kind);
                self.pmcs[pmc].kind = kind;
            }
            self.cancel_timer(pmc, timers);
            self.arm_timer(pmc, now_ns, timers);
        }
    }

    /// Write CTRL. Only the run latch matters to the PMU and it is sampled
    /// at instruction-batch time, so no flush is needed.
    #[inline]
    pub fn store_ctrl(&mut self, value: u64) {
        self.ctrl = value;
    }

    /// Write counter `pmc`. The new value replaces the old one wholesale;
    /// progress accrued before the write does not carry past it.
    pub fn store_pmc(&mut self, now_ns: u64, pmc: usize, value: u64, timers: &mut TimerQueue) {
        debug_assert!(pmc < NUM_PMCS);
        // PMCs are 32-bit registers.
        let value = value & 0xFFFF_FFFF;

        if !self.pmc_active(pmc) {
            self.pmcs[pmc].value = value;
            return;
        }

        self.pmcs[pmc].value = value;
        self.pmcs[pmc].base_ns = now_ns;

        self.cancel_timer(pmc, timers);
        self.arm_timer(pmc, now_ns, timers);
    }

    // ─── Instruction retirement ──────────────────────────────────────

    /// Account a batch of `num_insns` retired instructions (N ≥ 1).
    ///
    /// Every active instruction-counting counter advances immediately; the
    /// run-latch event additionally requires CTRL[RUN]. A counter that
    /// reaches the counter-negative boundary with its condition enable set
    /// is clamped to exactly the boundary and triggers the alert sequence
    /// once for the whole batch.
    pub fn instructions_retired(
        &mut self,
        now_ns: u64,
        num_insns: u64,
        timers: &mut TimerQueue,
        alert: &mut dyn PerfMonAlert,
    ) {
        debug_assert!(num_insns >= 1);
        let mut overflowed = false;

        // PMC6 never counts instructions.
        for pmc in 0..PMC6 {
            if !self.pmc_active(pmc) {
                continue;
            }
            let counts = match self.pmcs[pmc].kind {
                EventKind::Instructions => true,
                EventKind::InstructionsRunLatch => self.ctrl & CTRL_RUN != 0,
                _ => false,
            };
            if !counts {
                continue;
            }

            self.pmcs[pmc].value = self.pmcs[pmc].value.saturating_add(num_insns);

            if self.pmcs[pmc].value >= COUNTER_NEGATIVE_VAL && self.overflow_enabled(pmc) {
                self.pmcs[pmc].value = COUNTER_NEGATIVE_VAL;
                overflowed = true;
            }
        }

        if overflowed {
            self.fire_alert(now_ns, timers, alert);
        }
    }

    // ─── Overflow timers ─────────────────────────────────────────────

    /// Handle an expired overflow timer popped from the queue.
    ///
    /// An id that no longer matches an armed counter is ignored: the
    /// deadline it carried was computed under parameters that have since
    /// changed. A stall counter can come up just short of the boundary at
    /// its deadline (the accumulation formula truncates); it is re-armed
    /// for the remainder instead of raising.
    pub fn overflow_timer_expired(
        &mut self,
        now_ns: u64,
        id: TimerId,
        timers: &mut TimerQueue,
        alert: &mut dyn PerfMonAlert,
    ) {
        let Some(pmc) = (0..NUM_PMCS)
            .find(|&pmc| matches!(self.pmcs[pmc].armed, Some(armed) if armed.id == id))
        else {
            trace!("stale overflow timer {} ignored", id.raw());
            return;
        };
        self.pmcs[pmc].armed = None;

        if !self.timer_eligible(pmc) {
            trace!("overflow timer for reconfigured PMC{} ignored", pmc + 1);
            return;
        }

        self.flush(pmc, now_ns);

        if self.pmcs[pmc].value < COUNTER_NEGATIVE_VAL {
            trace!("PMC{} short of the boundary at its deadline, re-arming", pmc + 1);
            self.arm_timer(pmc, now_ns, timers);
            return;
        }

        self.fire_alert(now_ns, timers, alert);
    }

    /// Soonest armed overflow deadline across the bank, if any.
    pub fn next_overflow_deadline(&self) -> Option<u64> {
        self.pmcs
            .iter()
            .filter_map(|pmc| pmc.armed.map(|armed| armed.deadline_ns))
            .min()
    }

    // ─── Internals ───────────────────────────────────────────────────

    /// Whether counter `pmc` participates in the counter-negative
    /// condition (MMCR0[PMC1CE] for PMC1, MMCR0[PMCjCE] for the rest).
    fn overflow_enabled(&self, pmc: usize) -> bool {
        if pmc == 0 {
            self.mmcr0 & MMCR0_PMC1CE != 0
        } else {
            self.mmcr0 & MMCR0_PMCJCE != 0
        }
    }

    /// Fold progress since the baseline into the counter value and re-base.
    ///
    /// No-op for frozen counters and, in the time domain, for
    /// instruction-kind counters (those advance at batch time). Calling
    /// this twice at the same instant adds zero the second time.
    fn flush(&mut self, pmc: usize, now_ns: u64) {
        if !self.pmc_active(pmc) {
            return;
        }

        let slot = &mut self.pmcs[pmc];
        debug_assert!(
            now_ns >= slot.base_ns,
            "virtual clock behind PMC{} baseline",
            pmc + 1
        );
        if now_ns < slot.base_ns {
            // Baseline bug; clamp rather than corrupt the counter.
            warn!("virtual clock behind PMC{} baseline, clamping", pmc + 1);
            return;
        }
        let elapsed_ns = now_ns - slot.base_ns;

        match slot.kind {
            EventKind::Cycles => {
                // 1 ns == 1 cycle on this machine's 1 GHz clock.
                slot.value = slot.value.saturating_add(elapsed_ns);
            }
            EventKind::Stall { ratio } => {
                slot.value = slot.value.saturating_add(stall_cycles(elapsed_ns, ratio));
            }
            EventKind::Instructions | EventKind::InstructionsRunLatch | EventKind::Invalid => {}
        }
        slot.base_ns = now_ns;
    }

    /// Whether counter `pmc` can have an overflow timer at all under the
    /// current configuration.
    fn timer_eligible(&self, pmc: usize) -> bool {
        self.pmc_active(pmc) && self.pmcs[pmc].kind.is_time_based() && self.overflow_enabled(pmc)
    }

    /// Time until counter `pmc` reaches the counter-negative boundary, or
    /// `None` if its event gives the boundary no predictable instant. A
    /// counter already at or past the boundary gets a zero duration.
    fn overflow_duration(&self, pmc: usize) -> Option<u64> {
        let slot = &self.pmcs[pmc];
        let remaining = COUNTER_NEGATIVE_VAL.saturating_sub(slot.value);
        match slot.kind {
            EventKind::Cycles => Some(remaining),
            EventKind::Stall { ratio } => {
                Some(((remaining as u128 * 100).div_ceil(ratio as u128)) as u64)
            }
            _ => None,
        }
    }

    /// Arm the overflow timer for `pmc` if eligible.
    fn arm_timer(&mut self, pmc: usize, now_ns: u64, timers: &mut TimerQueue) {
        debug_assert!(self.pmcs[pmc].armed.is_none());
        if !self.timer_eligible(pmc) {
            return;
        }
        let Some(duration) = self.overflow_duration(pmc) else {
            return;
        };

        let deadline_ns = now_ns.saturating_add(duration);
        let id = timers.schedule(deadline_ns);
        self.pmcs[pmc].armed = Some(ArmedTimer { id, deadline_ns });
        trace!("PMC{} overflow timer armed for t={}ns", pmc + 1, deadline_ns);
    }

    /// Cancel the overflow timer for `pmc`, if armed.
    fn cancel_timer(&mut self, pmc: usize, timers: &mut TimerQueue) {
        if let Some(armed) = self.pmcs[pmc].armed.take() {
            timers.cancel(armed.id);
        }
    }

    fn cancel_all_timers(&mut self, timers: &mut TimerQueue) {
        for pmc in 0..NUM_PMCS {
            self.cancel_timer(pmc, timers);
        }
    }

    fn arm_eligible_timers(&mut self, now_ns: u64, timers: &mut TimerQueue) {
        for pmc in 0..NUM_PMCS {
            self.arm_timer(pmc, now_ns, timers);
        }
    }

    /// The overflow reaction: sync the bank, apply the freeze-on-event
    /// policy, and deliver the alert if alerts are armed.
    fn fire_alert(&mut self, now_ns: u64, timers: &mut TimerQueue, alert: &mut dyn PerfMonAlert) {
        // Settle every running counter before any freeze takes effect.
        for pmc in 0..NUM_PMCS {
            self.flush(pmc, now_ns);
        }

        if self.mmcr0 & MMCR0_FCECE != 0 {
            self.mmcr0 = (self.mmcr0 & !MMCR0_FCECE) | MMCR0_FC;
            debug!("counter overflow froze the PMU (FCECE)");
            self.cancel_all_timers(timers);
        }

        if self.mmcr0 & MMCR0_PMAE != 0 {
            self.mmcr0 = (self.mmcr0 & !MMCR0_PMAE) | MMCR0_PMAO;
            debug!("performance monitor alert raised");
            alert.raise_alert();
        }
    }

    // Snapshot support lives in `snapshot.rs`; it needs the raw slots.

    pub(crate) fn pmc_raw(&self, pmc: usize) -> (u64, u64, Option<u64>) {
        let slot = &self.pmcs[pmc];
        (
            slot.value,
            slot.base_ns,
            slot.armed.map(|armed| armed.deadline_ns),
        )
    }

    pub(crate) fn pmc_restore_raw(
        &mut self,
        pmc: usize,
        value: u64,
        base_ns: u64,
        armed: Option<ArmedTimerParts>,
    ) {
        let slot = &mut self.pmcs[pmc];
        slot.value = value;
        slot.base_ns = base_ns;
        slot.armed = armed.map(|parts| ArmedTimer {
            id: parts.id,
            deadline_ns: parts.deadline_ns,
        });
    }

    pub(crate) fn set_kinds(&mut self, kinds: [EventKind; NUM_PMCS]) {
        for (slot, kind) in self.pmcs.iter_mut().zip(kinds) {
            slot.kind = kind;
        }
    }

    pub(crate) fn kind_of(&self, pmc: usize) -> EventKind {
        self.pmcs[pmc].kind
    }

    pub(crate) fn can_arm(&self, pmc: usize) -> bool {
        self.timer_eligible(pmc)
    }
}

/// Re-armed timer identity used by snapshot restore.
pub(crate) struct ArmedTimerParts {
    pub id: TimerId,
    pub deadline_ns: u64,
}

/// Stall cycles accrued over `elapsed_ns` at `ratio` percent, truncating.
fn stall_cycles(elapsed_ns: u64, ratio: u8) -> u64 {
    ((elapsed_ns as u128 * ratio as u128) / 100) as u64
}
