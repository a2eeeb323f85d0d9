//! Virtual CPU.
use crate::{
    context::{GuestContext, TrapCounters},
    registry::VmHandle,
};

/// Per-VCPU trap accounting.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct VcpuCounters {
    /// Number of traps taken while this VCPU was running.
    pub traps: u64,
    /// Root `Count` at the last trap.
    pub root_count: u32,
    /// Guest `Count` at the last trap.
    pub guest_count: u32,
    /// Guest `Count` when the VCPU was last entered.
    pub entry_guest_count: u32,
    /// Guest ticks spent running, summed over every entry.
    pub guest_ticks: u64,
}

impl VcpuCounters {
    /// Note the guest `Count` the VCPU is entered with.
    #[inline]
    pub fn entered(&mut self, guest_count: u32) {
        self.entry_guest_count = guest_count;
    }

    /// Account for one trap.
    pub fn record(&mut self, counters: TrapCounters) {
        self.traps += 1;
        self.root_count = counters.root;
        self.guest_count = counters.guest;
        self.guest_ticks += counters.guest.wrapping_sub(self.entry_guest_count) as u64;
    }
}

/// A virtual CPU.
///
/// Owned by the registry and listed by exactly one VM.
#[derive(Debug)]
pub struct Vcpu {
    id: u32,
    vm: VmHandle,
    /// Address the guest resumes at.
    pub pc: u32,
    /// Saved registers.
    pub context: GuestContext,
    pub counters: VcpuCounters,
}

impl Vcpu {
    /// Create a VCPU of `vm` starting at `entry`.
    pub fn new(id: u32, vm: VmHandle, entry: u32) -> Self {
        Self {
            id,
            vm,
            pc: entry,
            context: GuestContext::new(),
            counters: VcpuCounters::default(),
        }
    }

    /// Hypervisor-wide unique id.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The owning VM.
    #[inline]
    pub fn vm(&self) -> VmHandle {
        self.vm
    }

    /// Saved general purpose register `idx`.
    #[inline]
    pub fn gpr(&self, idx: usize) -> u32 {
        self.context.gpr[idx & 0x1f]
    }

    /// Update saved general purpose register `idx`. Writes to `zero` are dropped.
    #[inline]
    pub fn set_gpr(&mut self, idx: usize, value: u32) {
        let idx = idx & 0x1f;
        if idx != 0 {
            self.context.gpr[idx] = value;
        }
    }
}
