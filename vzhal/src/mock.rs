//! A host-side model of the processor.
//!
//! [`MockHal`] keeps every register the core touches in plain fields and records
//! the side effects (timer arming, TLB writes, guest id programming, mask
//! toggles) so tests can assert on them.
use crate::{
    cp0::{Cause, ExceptionCause, GuestCtl0, GuestExitCause, InterruptLines, Status},
    guest_cp0::{GuestCp0, GuestCp0Reg},
    tlb::{GuestId, TlbEntry},
    Hal,
};
use alloc::vec::Vec;

/// A recorded change of `Status.IM`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MaskEvent {
    /// Lines were masked.
    Clear(InterruptLines),
    /// Lines were unmasked.
    Set(InterruptLines),
}

/// Recording [`Hal`] implementation.
#[derive(Debug)]
pub struct MockHal {
    pub vz: bool,
    pub root_mode: bool,
    pub guest_id_support: bool,
    pub root_asid: bool,
    pub pages_1k: bool,
    /// Set once `disable_1k_pages` ran.
    pub pages_1k_disabled: bool,

    pub cause: Cause,
    pub guest_ctl0: GuestCtl0,
    pub epc: u32,
    pub bad_vaddr: u32,
    pub bad_instr: u32,
    pub bad_instr_p: u32,
    pub status: Status,

    /// Every `arm_timer` argument, in order.
    pub timer_armed: Vec<u32>,
    pub mask_events: Vec<MaskEvent>,
    /// Every guest id programmed, in order.
    pub guest_id_writes: Vec<GuestId>,
    /// Number of `enter_guest_mode` calls.
    pub guest_entries: usize,
    pub guest_cp0: GuestCp0,

    pub tlb: Vec<Option<TlbEntry>>,
    pub tlb_writes: usize,
    pub perf: (u32, u32),
    pub waits: usize,
}

impl MockHal {
    /// A VZ capable processor in root mode with `tlb_entries` TLB entries.
    pub fn new(tlb_entries: usize) -> Self {
        let mut tlb = Vec::with_capacity(tlb_entries);
        tlb.resize(tlb_entries, None);
        Self {
            vz: true,
            root_mode: true,
            guest_id_support: true,
            root_asid: false,
            pages_1k: false,
            pages_1k_disabled: false,
            cause: Cause::default(),
            guest_ctl0: GuestCtl0::default(),
            epc: 0,
            bad_vaddr: 0,
            bad_instr: 0,
            bad_instr_p: 0,
            status: Status::empty(),
            timer_armed: Vec::new(),
            mask_events: Vec::new(),
            guest_id_writes: Vec::new(),
            guest_entries: 0,
            guest_cp0: GuestCp0::default(),
            tlb,
            tlb_writes: 0,
            perf: (0, 0),
            waits: 0,
        }
    }

    /// Latch an exception with `code` taken at `epc`.
    pub fn raise_cause(&mut self, code: u32, epc: u32) {
        self.cause = Cause::from_raw(self.cause.raw() & !Cause::BD).with_exc_code(code);
        self.epc = epc;
        // GM survives the exception; root mode comes from EXL.
        self.status.insert(Status::EXL);
    }

    /// Latch an interrupt exception with `lines` pending.
    pub fn raise_interrupt(&mut self, lines: InterruptLines, epc: u32) {
        self.cause = Cause::from_raw(lines.bits());
        self.raise_cause(ExceptionCause::Interrupt as u32, epc);
    }

    /// Latch a Guest Exit with sub-cause `cause` caused by `insn` at `epc`.
    pub fn raise_guest_exit(&mut self, cause: GuestExitCause, insn: u32, epc: u32) {
        self.cause = Cause::default();
        self.raise_cause(ExceptionCause::GuestExit as u32, epc);
        self.guest_ctl0 = self.guest_ctl0.with_gexc_code(cause as u32);
        self.bad_instr = insn;
    }

    /// Latch a root TLB refill on a load from `addr`.
    pub fn raise_tlb_miss(&mut self, addr: u32, epc: u32) {
        self.cause = Cause::default();
        self.raise_cause(ExceptionCause::TlbLoad as u32, epc);
        self.bad_vaddr = addr;
    }

    /// Mark the latched exception as taken in the delay slot of `branch`.
    pub fn in_delay_slot(&mut self, branch: u32) {
        self.cause = Cause::from_raw(self.cause.raw() | Cause::BD);
        self.bad_instr_p = branch;
    }

    /// Valid TLB entries owned by `guest_id`.
    pub fn tlb_entries_of(&self, guest_id: GuestId) -> impl Iterator<Item = &TlbEntry> {
        self.tlb
            .iter()
            .flatten()
            .filter(move |e| e.guest_id == guest_id)
    }
}

impl Hal for MockHal {
    fn has_vz(&self) -> bool {
        self.vz
    }
    fn is_root_mode(&self) -> bool {
        self.root_mode
    }
    fn has_guest_id(&self) -> bool {
        self.guest_id_support
    }
    fn uses_root_asid(&self) -> bool {
        self.root_asid
    }
    fn has_1k_pages(&self) -> bool {
        self.pages_1k && !self.pages_1k_disabled
    }
    fn disable_1k_pages(&mut self) {
        self.pages_1k_disabled = true;
    }

    fn cause(&self) -> Cause {
        self.cause
    }
    fn guest_ctl0(&self) -> GuestCtl0 {
        self.guest_ctl0
    }
    fn epc(&self) -> u32 {
        self.epc
    }
    fn set_epc(&mut self, epc: u32) {
        self.epc = epc;
    }
    fn bad_vaddr(&self) -> u32 {
        self.bad_vaddr
    }
    fn bad_instr(&self) -> u32 {
        self.bad_instr
    }
    fn bad_instr_p(&self) -> u32 {
        self.bad_instr_p
    }
    fn status(&self) -> Status {
        self.status
    }
    fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    fn clear_interrupt_mask(&mut self, lines: InterruptLines) {
        self.status.remove(Status::from_bits_truncate(lines.bits()));
        self.mask_events.push(MaskEvent::Clear(lines));
    }
    fn set_interrupt_mask(&mut self, lines: InterruptLines) {
        self.status.insert(Status::from_bits_truncate(lines.bits()));
        self.mask_events.push(MaskEvent::Set(lines));
    }
    fn arm_timer(&mut self, ticks: u32) {
        self.timer_armed.push(ticks);
    }

    fn enter_guest_mode(&mut self) {
        self.guest_ctl0 = GuestCtl0::from_raw(self.guest_ctl0.raw() | GuestCtl0::GM);
        self.guest_entries += 1;
    }
    fn set_guest_id(&mut self, guest_id: GuestId) {
        self.guest_id_writes.push(guest_id);
    }
    fn read_guest_cp0(&self, reg: GuestCp0Reg) -> u32 {
        self.guest_cp0.get(reg)
    }
    fn write_guest_cp0(&mut self, reg: GuestCp0Reg, value: u32) {
        self.guest_cp0.set(reg, value);
    }

    fn tlb_entries(&self) -> usize {
        self.tlb.len()
    }
    fn tlb_write(&mut self, index: usize, entry: &TlbEntry) {
        if let Some(slot) = self.tlb.get_mut(index) {
            *slot = Some(*entry);
        }
        self.tlb_writes += 1;
    }
    fn tlb_invalidate(&mut self, index: usize) {
        if let Some(slot) = self.tlb.get_mut(index) {
            *slot = None;
        }
    }

    fn perf_counters(&self) -> (u32, u32) {
        self.perf
    }
    fn wait_for_interrupt(&mut self) {
        self.waits += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_entry_needs_exl_and_gm() {
        let mut hal = MockHal::new(8);
        assert!(!hal.guest_mode_entry_ready());
        hal.raise_interrupt(InterruptLines::TIMER, 0x8000_0000);
        assert!(!hal.guest_mode_entry_ready());
        hal.enter_guest_mode();
        assert!(hal.guest_mode_entry_ready());
        hal.status.insert(Status::ERL);
        assert!(!hal.guest_mode_entry_ready());
    }

    #[test]
    fn mask_toggles_are_recorded() {
        let mut hal = MockHal::new(8);
        hal.set_interrupt_mask(InterruptLines::HW0 | InterruptLines::TIMER);
        hal.clear_interrupt_mask(InterruptLines::TIMER);
        assert!(hal.status.contains(Status::IM2));
        assert!(!hal.status.contains(Status::IM7));
        assert_eq!(hal.mask_events.len(), 2);
    }
}
