//! Virtual machine.
use crate::{
    config::{MachineKind, MemoryRegion},
    registry::VcpuHandle,
};
use alloc::vec::Vec;
use vzhal::tlb::GuestId;

/// A virtual machine: a guest address space and the VCPUs running in it.
#[derive(Debug)]
pub struct Vm {
    id: u32,
    name: &'static str,
    kind: MachineKind,
    guest_id: GuestId,
    memory: MemoryRegion,
    pub(crate) vcpus: Vec<VcpuHandle>,
}

impl Vm {
    pub(crate) fn new(
        id: u32,
        name: &'static str,
        kind: MachineKind,
        guest_id: GuestId,
        memory: MemoryRegion,
    ) -> Self {
        Self {
            id,
            name,
            kind,
            guest_id,
            memory,
            vcpus: Vec::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn kind(&self) -> MachineKind {
        self.kind
    }

    /// Tag of every root TLB entry installed for this VM.
    #[inline]
    pub fn guest_id(&self) -> GuestId {
        self.guest_id
    }

    #[inline]
    pub fn memory(&self) -> &MemoryRegion {
        &self.memory
    }

    /// Live VCPUs, in creation order.
    #[inline]
    pub fn vcpus(&self) -> &[VcpuHandle] {
        &self.vcpus
    }
}
