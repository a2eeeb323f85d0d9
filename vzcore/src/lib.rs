//! Trap-and-emulate core of a MIPS VZ hypervisor.
//!
//! Every exception taken while a guest runs lands in root mode and is funneled
//! through [`Hypervisor::handle_trap`]:
//!
//! 1. the interrupted VCPU's registers are saved ([`context`]),
//! 2. the exception is classified and handled ([`exits`]), producing an
//!    [`ExitOutcome`],
//! 3. the outcome drives either the one-time initialization of real-time
//!    machines or the round robin scheduler ([`hypervisor`], [`scheduler`]),
//! 4. the selected VCPU is dispatched and its registers are restored.
//!
//! Guest physical memory is statically partitioned; root TLB misses taken on
//! behalf of a guest are resolved by the [`shadow_tlb`] mapper.
//!
//! The hardware is reached only through [`vzhal::Hal`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod context;
pub mod exits;
pub mod hypervisor;
pub mod probe;
pub mod registry;
pub mod scheduler;
pub mod shadow_tlb;
pub mod vcpu;
pub mod vm;

pub use exits::ExitOutcome;
pub use hypervisor::{GuestEntry, Hypervisor, Phase};
pub use probe::Probe;

/// Processor features the hypervisor cannot run without.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Feature {
    /// The Virtualization module.
    Vz,
    /// Execution in root mode.
    RootMode,
    /// Guest ids for tagging TLB entries.
    GuestId,
}

impl core::fmt::Display for Feature {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Feature::Vz => write!(f, "Virtualization module"),
            Feature::RootMode => write!(f, "root mode"),
            Feature::GuestId => write!(f, "GuestID"),
        }
    }
}

/// Possible errors of the hypervisor core.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HvError {
    /// The processor lacks a required feature.
    MissingFeature(Feature),
    /// Guest TLB entries would be tagged with the root ASID.
    RootAsidInUse,
    /// The machine manifest is inconsistent.
    InvalidManifest(&'static str),
    /// More machines than guest ids.
    GuestIdExhausted,
    /// The VCPU handle no longer refers to a live VCPU.
    StaleVcpu,
    /// The VM handle no longer refers to a live VM.
    StaleVm,
    /// The VM still owns VCPUs.
    VmNotEmpty,
    /// A guest address outside the VM memory region.
    OutOfRange {
        /// The faulting guest address.
        addr: u32,
    },
    /// Every VM has ended.
    NoVmLeft,
    /// The operation is not allowed in the current boot phase.
    InvalidPhase,
}

impl core::fmt::Display for HvError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HvError::MissingFeature(feature) => write!(f, "{} not available", feature),
            HvError::RootAsidInUse => write!(f, "guest entries use the root ASID"),
            HvError::InvalidManifest(why) => write!(f, "invalid machine manifest: {}", why),
            HvError::GuestIdExhausted => write!(f, "no guest id left"),
            HvError::StaleVcpu => write!(f, "stale VCPU handle"),
            HvError::StaleVm => write!(f, "stale VM handle"),
            HvError::VmNotEmpty => write!(f, "VM still owns VCPUs"),
            HvError::OutOfRange { addr } => {
                write!(f, "guest address 0x{:x} outside of the VM memory", addr)
            }
            HvError::NoVmLeft => write!(f, "no VM left"),
            HvError::InvalidPhase => write!(f, "operation not allowed in this phase"),
        }
    }
}
