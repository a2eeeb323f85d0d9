//! Hardware layer of the hypervisor.
//!
//! This crate describes the MIPS32 Virtualization module as the core sees it:
//! CP0 register encodings, root TLB entries, the guest CP0 context and the
//! [`Hal`] trait that the platform implements with `mfc0`/`mtc0`/`tlbwi`
//! sequences. Everything else in the hypervisor talks to the hardware only
//! through [`Hal`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addressing;
pub mod console;
pub mod cp0;
pub mod guest_cp0;
pub mod insn;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod tlb;

use cp0::{Cause, GuestCtl0, InterruptLines, Status};
use guest_cp0::GuestCp0Reg;
use tlb::{GuestId, TlbEntry};

/// Access to the processor, as seen from root mode.
///
/// All methods are called from the single root-mode context with interrupts
/// masked, so implementations need no synchronization.
pub trait Hal {
    /// `Config3.VZ`: the Virtualization module is implemented.
    fn has_vz(&self) -> bool;
    /// The processor currently executes in root mode.
    fn is_root_mode(&self) -> bool;
    /// `GuestCtl0.G1`: guest ids are implemented.
    fn has_guest_id(&self) -> bool;
    /// `GuestCtl0.RAD`: guest TLB entries are tagged with the root ASID instead
    /// of a guest id.
    fn uses_root_asid(&self) -> bool;
    /// `Config3.SP`: 1KiB pages are supported.
    fn has_1k_pages(&self) -> bool;
    /// Clear `PageGrain.ESP`, forcing 4KiB minimum pages.
    fn disable_1k_pages(&mut self);

    /// Root `Cause`.
    fn cause(&self) -> Cause;
    /// `GuestCtl0`.
    fn guest_ctl0(&self) -> GuestCtl0;
    /// Root `EPC`.
    fn epc(&self) -> u32;
    /// Write root `EPC`; `eret` resumes there.
    fn set_epc(&mut self, epc: u32);
    /// Root `BadVAddr`.
    fn bad_vaddr(&self) -> u32;
    /// `BadInstr`: the faulting instruction word.
    fn bad_instr(&self) -> u32;
    /// `BadInstrP`: the branch preceding a faulting delay slot instruction.
    fn bad_instr_p(&self) -> u32;
    /// Root `Status`.
    fn status(&self) -> Status;
    /// Write root `Status`.
    fn set_status(&mut self, status: Status);

    /// Clear `Status.IM` bits of `lines`.
    fn clear_interrupt_mask(&mut self, lines: InterruptLines);
    /// Set `Status.IM` bits of `lines`.
    fn set_interrupt_mask(&mut self, lines: InterruptLines);
    /// Program `Compare` so that the timer fires `ticks` counts from now.
    fn arm_timer(&mut self, ticks: u32);

    /// Set `GuestCtl0.GM`; the next `eret` enters guest mode.
    fn enter_guest_mode(&mut self);
    /// Whether the next `eret` would land in guest mode.
    ///
    /// This needs `GuestCtl0.GM` and `Status.EXL` set and `Status.ERL` clear.
    fn guest_mode_entry_ready(&self) -> bool {
        let status = self.status();
        self.guest_ctl0().guest_mode()
            && status.contains(Status::EXL)
            && !status.contains(Status::ERL)
    }
    /// Program `GuestCtl1.ID` and `GuestCtl1.RID`.
    fn set_guest_id(&mut self, guest_id: GuestId);
    /// `mfgc0`.
    fn read_guest_cp0(&self, reg: GuestCp0Reg) -> u32;
    /// `mtgc0`.
    fn write_guest_cp0(&mut self, reg: GuestCp0Reg, value: u32);

    /// Number of root TLB entries (`Config1.MMUSize + 1`).
    fn tlb_entries(&self) -> usize;
    /// Write `entry` into the root TLB at `index` (`tlbwi`).
    fn tlb_write(&mut self, index: usize, entry: &TlbEntry);
    /// Make the root TLB entry at `index` unmatchable.
    fn tlb_invalidate(&mut self, index: usize);

    /// Performance counters 0 and 1, counting root and guest cycles.
    fn perf_counters(&self) -> (u32, u32);
    /// `wait`.
    fn wait_for_interrupt(&mut self);
}
