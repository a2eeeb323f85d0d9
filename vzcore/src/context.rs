//! Saving and restoring VCPU state across a trap.
//!
//! The exception vector stub spills the general purpose registers into a
//! [`TrapFrame`] before calling into the core, and reloads them from the same
//! frame before `eret`. Everything else the guest can observe lives in CP0 and
//! is moved with [`Hal`] accessors.
use crate::vcpu::Vcpu;
use vzhal::{
    guest_cp0::{GuestCp0, GuestCp0Reg},
    Hal,
};

/// Register spill area shared with the exception vector stub.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct TrapFrame {
    pub gpr: [u32; 32],
    pub hi: u32,
    pub lo: u32,
}

/// Counter snapshots taken by the vector stub on trap entry.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct TrapCounters {
    /// Root `Count` on entry.
    pub root: u32,
    /// Guest `Count` on entry.
    pub guest: u32,
}

/// Saved guest-visible register state of a VCPU.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct GuestContext {
    pub gpr: [u32; 32],
    pub hi: u32,
    pub lo: u32,
    pub cp0: GuestCp0,
}

impl GuestContext {
    /// Context of a VCPU that has not run yet.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Save the interrupted guest into `vcpu`.
///
/// The resume address is taken from the root `EPC`; handlers may later move it.
pub fn save<H: Hal>(hal: &H, frame: &TrapFrame, counters: TrapCounters, vcpu: &mut Vcpu) {
    let ctx = &mut vcpu.context;
    ctx.gpr = frame.gpr;
    ctx.gpr[0] = 0;
    ctx.hi = frame.hi;
    ctx.lo = frame.lo;
    for reg in GuestCp0Reg::SAVED {
        ctx.cp0.set(reg, hal.read_guest_cp0(reg));
    }
    vcpu.pc = hal.epc();
    vcpu.counters.record(counters);
}

/// Load `vcpu` into the hardware and `frame`, ready for `eret`.
pub fn restore<H: Hal>(hal: &mut H, vcpu: &mut Vcpu, frame: &mut TrapFrame) {
    let ctx = &vcpu.context;
    frame.gpr = ctx.gpr;
    frame.hi = ctx.hi;
    frame.lo = ctx.lo;
    for (reg, value) in ctx.cp0.iter() {
        hal.write_guest_cp0(reg, value);
    }
    hal.set_epc(vcpu.pc);
    vcpu.counters.entered(hal.read_guest_cp0(GuestCp0Reg::Count));
}
