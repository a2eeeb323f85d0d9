//! Shadow TLB.
//!
//! Guests never see the root TLB. When a guest access misses in it, the
//! hypervisor takes a TLB refill exception in root mode, computes the mapping
//! from the VM's static memory partition and installs it, tagged with the VM's
//! guest id, so the retried access hits.
//!
//! The mapper keeps its own copy of every entry it wrote. The copy decides which
//! slot to reuse and is what gets invalidated when a VM goes away. [`Probe`]
//! answers from the memory partition itself, so a page needs no fault to be
//! translated.
use crate::{probe::Probe, vm::Vm, HvError};
use alloc::{collections::BTreeMap, vec::Vec};
use log::debug;
use vzhal::{
    addressing::{Gpa, Pa, PAGE_SHIFT, PAGE_SIZE, VPN2_SHIFT},
    tlb::{EntryLo, EntryLoFlags, GuestId, TlbEntry},
    Hal,
};

/// Result of resolving a fault.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ShadowMapping {
    /// Root TLB index written.
    pub index: usize,
    pub entry: TlbEntry,
}

/// Software copy of the guest part of the root TLB.
#[derive(Debug)]
pub struct ShadowTlb {
    slots: Vec<Option<TlbEntry>>,
    wired: usize,
    next_victim: usize,
    /// (guest id, guest page number) -> host frame.
    frames: BTreeMap<(GuestId, u32), Pa>,
}

impl ShadowTlb {
    /// Manage a root TLB of `entries` entries whose first `wired` entries are
    /// reserved. At least one entry is always left to the guests.
    pub fn new(entries: usize, wired: usize) -> Self {
        let wired = wired.min(entries.saturating_sub(1));
        let mut slots = Vec::with_capacity(entries);
        slots.resize(entries, None);
        Self {
            slots,
            wired,
            next_victim: wired,
            frames: BTreeMap::new(),
        }
    }

    fn half(&mut self, vm: &Vm, page: Gpa) -> EntryLo {
        match vm.memory().translate(page) {
            Some(pa) => {
                self.frames
                    .insert((vm.guest_id(), page.into_u32() >> PAGE_SHIFT), pa);
                EntryLo::new(
                    pa,
                    EntryLoFlags::VALID | EntryLoFlags::DIRTY | EntryLoFlags::CACHEABLE,
                )
            }
            None => EntryLo::INVALID,
        }
    }

    fn forget(&mut self, entry: &TlbEntry) {
        let first = entry.vpn2() << 1;
        self.frames.remove(&(entry.guest_id, first));
        self.frames.remove(&(entry.guest_id, first + 1));
    }

    fn slot_for(&mut self, guest_id: GuestId, vpn2: u32) -> usize {
        let guest = self.wired..self.slots.len();
        if let Some(idx) = self.slots[guest.clone()]
            .iter()
            .position(|s| matches!(s, Some(e) if e.guest_id == guest_id && e.vpn2() == vpn2))
        {
            return self.wired + idx;
        }
        if let Some(idx) = self.slots[guest.clone()].iter().position(Option::is_none) {
            return self.wired + idx;
        }
        let victim = self.next_victim;
        self.next_victim = if victim + 1 >= guest.end {
            guest.start
        } else {
            victim + 1
        };
        victim
    }

    /// Install the mapping for a guest access to `fault` in `vm`.
    ///
    /// Both pages of the pair are mapped if they belong to the VM; a page outside
    /// the VM is left invalid. Resolving the same pair twice rewrites the same
    /// slot.
    pub fn resolve<H: Hal>(
        &mut self,
        hal: &mut H,
        vm: &Vm,
        fault: Gpa,
    ) -> Result<ShadowMapping, HvError> {
        if !vm.memory().contains(fault) || self.slots.len() <= self.wired {
            return Err(HvError::OutOfRange {
                addr: fault.into_u32(),
            });
        }
        let even = Gpa::new(fault.vpn2() << VPN2_SHIFT);
        let lo0 = self.half(vm, even);
        let lo1 = self.half(vm, even + PAGE_SIZE);
        let entry = TlbEntry::new(vm.guest_id(), fault, lo0, lo1);

        let index = self.slot_for(vm.guest_id(), entry.vpn2());
        if let Some(old) = self.slots[index].take() {
            if old.guest_id != entry.guest_id || old.vpn2() != entry.vpn2() {
                self.forget(&old);
            }
        }
        self.slots[index] = Some(entry);
        hal.tlb_write(index, &entry);
        debug!(
            "Mapped {} of guest {} at TLB index {}: {:?} {:?}",
            fault,
            vm.guest_id(),
            index,
            lo0,
            lo1
        );
        Ok(ShadowMapping { index, entry })
    }

    /// Host address of `gpa` if it is currently mapped for `guest_id`.
    pub fn lookup(&self, guest_id: GuestId, gpa: Gpa) -> Option<Pa> {
        self.frames
            .get(&(guest_id, gpa.into_u32() >> PAGE_SHIFT))
            .map(|frame| *frame + gpa.page_offset())
    }

    /// Drop every mapping of `guest_id`, in the hardware too.
    pub fn flush_guest<H: Hal>(&mut self, hal: &mut H, guest_id: GuestId) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot, Some(e) if e.guest_id == guest_id) {
                *slot = None;
                hal.tlb_invalidate(index);
            }
        }
        self.frames.retain(|(owner, _), _| *owner != guest_id);
    }

    /// Number of entries installed for `guest_id`.
    pub fn entries_of(&self, guest_id: GuestId) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|e| e.guest_id == guest_id)
            .count()
    }
}

impl Probe for ShadowTlb {
    fn gpa2hpa(&self, vm: &Vm, gpa: Gpa) -> Option<Pa> {
        vm.memory().translate(gpa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{MachineConfig, MachineKind, MemoryRegion},
        registry::Registry,
    };
    use vzhal::mock::MockHal;

    fn two_vms(registry: &mut Registry) -> (crate::registry::VmHandle, crate::registry::VmHandle) {
        let config = |name, host| MachineConfig {
            name,
            vcpus: 1,
            entry: 0,
            memory: MemoryRegion {
                guest_base: Gpa::new(0x1d00_0000),
                host_base: Pa::new(host),
                size: 0x3000,
            },
        };
        (
            registry.insert_vm(MachineKind::General, &config("a", 0x0010_0000), GuestId::new(1)),
            registry.insert_vm(MachineKind::General, &config("b", 0x0020_0000), GuestId::new(2)),
        )
    }

    #[test]
    fn resolve_maps_both_halves_inside_the_region() {
        let mut hal = MockHal::new(8);
        let mut registry = Registry::new();
        let (a, _) = two_vms(&mut registry);
        let mut tlb = ShadowTlb::new(8, 1);

        let m = tlb
            .resolve(&mut hal, registry.vm(a).unwrap(), Gpa::new(0x1d00_1008))
            .unwrap();
        assert_eq!(m.index, 1);
        assert_eq!(m.entry.lo0.pa(), Pa::new(0x0010_0000));
        assert_eq!(m.entry.lo1.pa(), Pa::new(0x0010_1000));
        assert_eq!(hal.tlb[1], Some(m.entry));

        // The pair at 0x1d002000 has its odd page past the end of the region.
        let m = tlb
            .resolve(&mut hal, registry.vm(a).unwrap(), Gpa::new(0x1d00_2000))
            .unwrap();
        assert!(m.entry.lo0.is_valid());
        assert!(!m.entry.lo1.is_valid());
        assert_eq!(tlb.lookup(GuestId::new(1), Gpa::new(0x1d00_3000)), None);
    }

    #[test]
    fn resolve_is_idempotent() {
        let mut hal = MockHal::new(8);
        let mut registry = Registry::new();
        let (a, _) = two_vms(&mut registry);
        let mut tlb = ShadowTlb::new(8, 1);
        let vm = registry.vm(a).unwrap();

        let first = tlb.resolve(&mut hal, vm, Gpa::new(0x1d00_0010)).unwrap();
        let second = tlb.resolve(&mut hal, vm, Gpa::new(0x1d00_1ff0)).unwrap();
        assert_eq!(first, second);
        assert_eq!(tlb.entries_of(GuestId::new(1)), 1);
        assert_eq!(hal.tlb_writes, 2);
    }

    #[test]
    fn guests_are_isolated() {
        let mut hal = MockHal::new(8);
        let mut registry = Registry::new();
        let (a, b) = two_vms(&mut registry);
        let mut tlb = ShadowTlb::new(8, 1);
        let gpa = Gpa::new(0x1d00_0040);

        tlb.resolve(&mut hal, registry.vm(a).unwrap(), gpa).unwrap();
        assert_eq!(tlb.lookup(GuestId::new(1), gpa), Some(Pa::new(0x0010_0040)));
        assert_eq!(tlb.lookup(GuestId::new(2), gpa), None);

        tlb.resolve(&mut hal, registry.vm(b).unwrap(), gpa).unwrap();
        assert_eq!(tlb.lookup(GuestId::new(2), gpa), Some(Pa::new(0x0020_0040)));
        assert_eq!(tlb.entries_of(GuestId::new(1)), 1);
        assert_eq!(tlb.entries_of(GuestId::new(2)), 1);

        tlb.flush_guest(&mut hal, GuestId::new(1));
        assert_eq!(tlb.lookup(GuestId::new(1), gpa), None);
        assert_eq!(hal.tlb_entries_of(GuestId::new(1)).count(), 0);
        assert_eq!(hal.tlb_entries_of(GuestId::new(2)).count(), 1);
    }

    #[test]
    fn translation_does_not_need_a_fault() {
        let mut hal = MockHal::new(3);
        let mut registry = Registry::new();
        let (a, b) = two_vms(&mut registry);
        let mut tlb = ShadowTlb::new(3, 1);
        let (a, b) = (registry.vm(a).unwrap(), registry.vm(b).unwrap());

        assert_eq!(
            tlb.gpa2hpa(a, Gpa::new(0x1d00_2010)),
            Some(Pa::new(0x0010_2010))
        );
        assert_eq!(
            tlb.gpa2hpa(b, Gpa::new(0x1d00_2010)),
            Some(Pa::new(0x0020_2010))
        );
        assert_eq!(tlb.gpa2hpa(a, Gpa::new(0x1d00_3000)), None);

        // Evicted pairs still translate.
        tlb.resolve(&mut hal, a, Gpa::new(0x1d00_0000)).unwrap();
        tlb.resolve(&mut hal, a, Gpa::new(0x1d00_2000)).unwrap();
        tlb.resolve(&mut hal, b, Gpa::new(0x1d00_0000)).unwrap();
        assert_eq!(tlb.lookup(GuestId::new(1), Gpa::new(0x1d00_0000)), None);
        assert_eq!(
            tlb.gpa2hpa(a, Gpa::new(0x1d00_0000)),
            Some(Pa::new(0x0010_0000))
        );
    }

    #[test]
    fn faults_outside_the_vm_are_refused() {
        let mut hal = MockHal::new(8);
        let mut registry = Registry::new();
        let (a, _) = two_vms(&mut registry);
        let mut tlb = ShadowTlb::new(8, 1);

        assert_eq!(
            tlb.resolve(&mut hal, registry.vm(a).unwrap(), Gpa::new(0x0010_0000)),
            Err(HvError::OutOfRange { addr: 0x0010_0000 })
        );
        assert_eq!(hal.tlb_writes, 0);
    }

    #[test]
    fn full_tlb_evicts_round_robin_past_wired() {
        let mut hal = MockHal::new(3);
        let mut registry = Registry::new();
        let (a, _) = two_vms(&mut registry);
        let mut tlb = ShadowTlb::new(3, 1);
        let memory = MemoryRegion {
            size: 0x8000,
            ..*registry.vm(a).unwrap().memory()
        };
        let big = crate::vm::Vm::new(9, "big", MachineKind::General, GuestId::new(3), memory);

        let pairs = [0x1d00_0000, 0x1d00_2000, 0x1d00_4000, 0x1d00_6000];
        let idx: Vec<usize> = pairs
            .iter()
            .map(|p| tlb.resolve(&mut hal, &big, Gpa::new(*p)).unwrap().index)
            .collect();
        assert_eq!(idx, [1, 2, 1, 2]);
        assert_eq!(tlb.lookup(GuestId::new(3), Gpa::new(0x1d00_0000)), None);
        assert!(tlb.lookup(GuestId::new(3), Gpa::new(0x1d00_6000)).is_some());
    }
}
