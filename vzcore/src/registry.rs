//! Ownership of VCPUs and VMs.
//!
//! VCPUs and VMs live in generational arenas and refer to each other through
//! copyable handles. Releasing a slot bumps its generation, so a handle kept
//! past the release (in the ready queue, as a switch target, ...) no longer
//! resolves instead of aliasing whatever reuses the slot.
use crate::{
    config::{MachineConfig, MachineKind},
    vcpu::Vcpu,
    vm::Vm,
    HvError,
};
use alloc::{collections::VecDeque, vec::Vec};
use vzhal::tlb::GuestId;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
struct RawHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// A slab whose slots are addressed by generational handles.
#[derive(Debug)]
struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    fn insert(&mut self, value: T) -> RawHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            RawHandle {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                value: Some(value),
            });
            RawHandle {
                index: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    fn get(&self, handle: RawHandle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    fn get_mut(&mut self, handle: RawHandle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    fn remove(&mut self, handle: RawHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }
}

macro_rules! handle {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(RawHandle);

        impl $name {
            /// A handle that never resolves.
            pub const fn dangling() -> Self {
                Self(RawHandle {
                    index: u32::MAX,
                    generation: u32::MAX,
                })
            }
        }
    };
}

handle!(
    /// Reference to a [`Vcpu`] in a [`Registry`].
    VcpuHandle
);
handle!(
    /// Reference to a [`Vm`] in a [`Registry`].
    VmHandle
);

/// Every live VCPU and VM.
#[derive(Debug)]
pub struct Registry {
    vcpus: Arena<Vcpu>,
    vms: Arena<Vm>,
    vm_order: Vec<VmHandle>,
    rt_pending: VecDeque<VcpuHandle>,
    next_vcpu_id: u32,
    next_vm_id: u32,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// An empty registry.
    pub const fn new() -> Self {
        Self {
            vcpus: Arena::new(),
            vms: Arena::new(),
            vm_order: Vec::new(),
            rt_pending: VecDeque::new(),
            next_vcpu_id: 1,
            next_vm_id: 1,
        }
    }

    /// Instantiate `config` as a VM tagged with `guest_id`, with all of its VCPUs.
    pub fn insert_vm(
        &mut self,
        kind: MachineKind,
        config: &MachineConfig,
        guest_id: GuestId,
    ) -> VmHandle {
        let id = self.next_vm_id;
        self.next_vm_id += 1;
        let vm = VmHandle(self.vms.insert(Vm::new(
            id,
            config.name,
            kind,
            guest_id,
            config.memory,
        )));
        self.vm_order.push(vm);

        let mut vcpus = Vec::with_capacity(config.vcpus);
        for _ in 0..config.vcpus {
            let id = self.next_vcpu_id;
            self.next_vcpu_id += 1;
            vcpus.push(VcpuHandle(self.vcpus.insert(Vcpu::new(id, vm, config.entry))));
        }
        if let Some(v) = self.vms.get_mut(vm.0) {
            v.vcpus = vcpus;
        }
        vm
    }

    pub fn vm(&self, handle: VmHandle) -> Result<&Vm, HvError> {
        self.vms.get(handle.0).ok_or(HvError::StaleVm)
    }

    pub fn vcpu(&self, handle: VcpuHandle) -> Result<&Vcpu, HvError> {
        self.vcpus.get(handle.0).ok_or(HvError::StaleVcpu)
    }

    pub fn vcpu_mut(&mut self, handle: VcpuHandle) -> Result<&mut Vcpu, HvError> {
        self.vcpus.get_mut(handle.0).ok_or(HvError::StaleVcpu)
    }

    /// Whether `handle` refers to a live VCPU.
    #[inline]
    pub fn is_live(&self, handle: VcpuHandle) -> bool {
        self.vcpus.get(handle.0).is_some()
    }

    /// The VM owning `handle`.
    pub fn vcpu_vm(&self, handle: VcpuHandle) -> Result<VmHandle, HvError> {
        self.vcpu(handle).map(Vcpu::vm)
    }

    /// A VCPU together with its VM.
    pub fn vcpu_and_vm(&mut self, handle: VcpuHandle) -> Result<(&mut Vcpu, &Vm), HvError> {
        let vcpu = self.vcpus.get_mut(handle.0).ok_or(HvError::StaleVcpu)?;
        let vm = self.vms.get(vcpu.vm().0).ok_or(HvError::StaleVm)?;
        Ok((vcpu, vm))
    }

    /// Release a VCPU and unlink it from its VM. The VM itself stays, even if
    /// it is left empty.
    pub fn remove_vcpu(&mut self, handle: VcpuHandle) -> Result<Vcpu, HvError> {
        let vcpu = self.vcpus.remove(handle.0).ok_or(HvError::StaleVcpu)?;
        if let Some(vm) = self.vms.get_mut(vcpu.vm().0) {
            vm.vcpus.retain(|h| *h != handle);
        }
        Ok(vcpu)
    }

    /// Release a VM that no longer owns any VCPU.
    pub fn remove_vm(&mut self, handle: VmHandle) -> Result<Vm, HvError> {
        if !self.vm(handle)?.vcpus.is_empty() {
            return Err(HvError::VmNotEmpty);
        }
        self.vm_order.retain(|h| *h != handle);
        self.vms.remove(handle.0).ok_or(HvError::StaleVm)
    }

    /// Live VMs in creation order.
    pub fn vms(&self) -> impl Iterator<Item = (VmHandle, &Vm)> + '_ {
        self.vm_order
            .iter()
            .filter_map(move |h| self.vms.get(h.0).map(|vm| (*h, vm)))
    }

    #[inline]
    pub fn vm_count(&self) -> usize {
        self.vms.len
    }

    #[inline]
    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len
    }

    /// Queue a VCPU for its one-time real-time initialization run.
    pub fn enqueue_rt_init(&mut self, handle: VcpuHandle) {
        self.rt_pending.push_back(handle);
    }

    /// Next VCPU awaiting initialization. Released VCPUs are skipped.
    pub fn dequeue_rt_init(&mut self) -> Option<VcpuHandle> {
        while let Some(handle) = self.rt_pending.pop_front() {
            if self.is_live(handle) {
                return Some(handle);
            }
        }
        None
    }

    #[inline]
    pub fn rt_pending(&self) -> usize {
        self.rt_pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryRegion;
    use vzhal::addressing::{Gpa, Pa};

    fn config(name: &'static str, vcpus: usize) -> MachineConfig {
        MachineConfig {
            name,
            vcpus,
            entry: 0x9d00_0000,
            memory: MemoryRegion {
                guest_base: Gpa::new(0),
                host_base: Pa::new(0x0100_0000),
                size: 0x4000,
            },
        }
    }

    #[test]
    fn vcpus_belong_to_their_vm() {
        let mut registry = Registry::new();
        let a = registry.insert_vm(MachineKind::General, &config("a", 2), GuestId::new(1));
        let b = registry.insert_vm(MachineKind::RealTime, &config("b", 1), GuestId::new(2));

        assert_eq!(registry.vm_count(), 2);
        assert_eq!(registry.vcpu_count(), 3);
        for h in registry.vm(a).unwrap().vcpus() {
            assert_eq!(registry.vcpu_vm(*h), Ok(a));
        }
        let ids: Vec<u32> = registry
            .vm(a)
            .unwrap()
            .vcpus()
            .iter()
            .chain(registry.vm(b).unwrap().vcpus())
            .map(|h| registry.vcpu(*h).unwrap().id())
            .collect();
        assert_eq!(ids, [1, 2, 3]);
        let names: Vec<&str> = registry.vms().map(|(_, vm)| vm.name()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn stale_handles_do_not_resolve() {
        let mut registry = Registry::new();
        let vm = registry.insert_vm(MachineKind::General, &config("a", 1), GuestId::new(1));
        let vcpu = registry.vm(vm).unwrap().vcpus()[0];

        assert_eq!(registry.remove_vm(vm).unwrap_err(), HvError::VmNotEmpty);
        registry.remove_vcpu(vcpu).unwrap();
        assert_eq!(registry.remove_vcpu(vcpu).unwrap_err(), HvError::StaleVcpu);
        assert!(registry.vm(vm).unwrap().vcpus().is_empty());
        registry.remove_vm(vm).unwrap();
        assert_eq!(registry.vm(vm).unwrap_err(), HvError::StaleVm);

        // The freed slots are reused without reviving the old handles.
        let again = registry.insert_vm(MachineKind::General, &config("c", 1), GuestId::new(2));
        assert_ne!(again, vm);
        assert!(registry.vcpu(vcpu).is_err());
        assert_eq!(registry.vm(again).unwrap().name(), "c");
    }

    #[test]
    fn rt_queue_is_fifo_and_skips_released() {
        let mut registry = Registry::new();
        let vm = registry.insert_vm(MachineKind::RealTime, &config("rt", 3), GuestId::new(1));
        let vcpus = registry.vm(vm).unwrap().vcpus().to_vec();
        for h in &vcpus {
            registry.enqueue_rt_init(*h);
        }
        registry.remove_vcpu(vcpus[1]).unwrap();

        assert_eq!(registry.dequeue_rt_init(), Some(vcpus[0]));
        assert_eq!(registry.dequeue_rt_init(), Some(vcpus[2]));
        assert_eq!(registry.dequeue_rt_init(), None);
    }
}
