//! Round robin scheduling and guest dispatch.
use crate::{
    registry::{Registry, VcpuHandle, VmHandle},
    shadow_tlb::ShadowTlb,
    HvError,
};
use alloc::collections::VecDeque;
use log::{debug, info};
use vzhal::Hal;

/// Which VCPU runs, and which run next.
#[derive(Debug, Default)]
pub struct Scheduler {
    ready: VecDeque<VcpuHandle>,
    current: Option<VcpuHandle>,
    target: Option<VcpuHandle>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The VCPU owning the CPU.
    #[inline]
    pub fn current(&self) -> Option<VcpuHandle> {
        self.current
    }

    /// Replace the running VCPU without touching the ready queue.
    #[inline]
    pub fn set_current(&mut self, vcpu: Option<VcpuHandle>) {
        self.current = vcpu;
    }

    /// Slot where exit handlers leave the VCPU to switch to.
    #[inline]
    pub fn target_mut(&mut self) -> &mut Option<VcpuHandle> {
        &mut self.target
    }

    /// Make `vcpu` eligible for scheduling.
    pub fn push_ready(&mut self, vcpu: VcpuHandle) {
        self.ready.push_back(vcpu);
    }

    /// Number of VCPUs waiting for the CPU.
    #[inline]
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Round robin: the running VCPU goes to the back of the queue and the
    /// first live VCPU of the queue becomes current.
    pub fn run(&mut self, registry: &Registry) -> Option<VcpuHandle> {
        if let Some(current) = self.current.take() {
            if registry.is_live(current) {
                self.ready.push_back(current);
            }
        }
        while let Some(next) = self.ready.pop_front() {
            if registry.is_live(next) {
                self.current = Some(next);
                return Some(next);
            }
        }
        None
    }

    /// Switch to the VCPU an exit handler asked for.
    pub fn switch_to_target(&mut self, registry: &Registry) -> Result<VcpuHandle, HvError> {
        let target = self.target.take().ok_or(HvError::StaleVcpu)?;
        if !registry.is_live(target) {
            return Err(HvError::StaleVcpu);
        }
        if self.current != Some(target) {
            self.ready.retain(|h| *h != target);
            if let Some(current) = self.current.take() {
                if registry.is_live(current) {
                    self.ready.push_back(current);
                }
            }
            self.current = Some(target);
        }
        Ok(target)
    }

    /// Release the running VCPU, and its VM once it has no VCPU left, then
    /// schedule the next one.
    pub fn end_current_vcpu<H: Hal>(
        &mut self,
        hal: &mut H,
        registry: &mut Registry,
        tlb: &mut ShadowTlb,
    ) -> Result<VcpuHandle, HvError> {
        if let Some(current) = self.current.take() {
            retire_vcpu(hal, registry, tlb, current)?;
        }
        self.run(registry).ok_or(HvError::NoVmLeft)
    }

    /// Tear down the VM of the running VCPU and schedule whatever remains.
    pub fn remove_vm_and_run_best_effort<H: Hal>(
        &mut self,
        hal: &mut H,
        registry: &mut Registry,
        tlb: &mut ShadowTlb,
    ) -> Result<VcpuHandle, HvError> {
        if let Some(current) = self.current.take() {
            let vm = registry.vcpu_vm(current)?;
            teardown_vm(hal, registry, tlb, vm)?;
        }
        self.ready.retain(|h| registry.is_live(*h));
        self.run(registry).ok_or(HvError::NoVmLeft)
    }

    /// Prepare the hardware to enter the running VCPU: its VM's guest id and
    /// `GuestCtl0.GM`.
    pub fn dispatch<H: Hal>(&self, hal: &mut H, registry: &Registry) -> Result<(), HvError> {
        let current = self.current.ok_or(HvError::StaleVcpu)?;
        let vcpu = registry.vcpu(current)?;
        let vm = registry.vm(vcpu.vm())?;
        hal.set_guest_id(vm.guest_id());
        hal.enter_guest_mode();
        debug!(
            "Dispatching VCPU {} of VM {} at 0x{:08x}",
            vcpu.id(),
            vm.name(),
            vcpu.pc
        );
        Ok(())
    }
}

/// Release `vcpu`. Its VM goes too once empty.
pub fn retire_vcpu<H: Hal>(
    hal: &mut H,
    registry: &mut Registry,
    tlb: &mut ShadowTlb,
    vcpu: VcpuHandle,
) -> Result<(), HvError> {
    let vm = registry.remove_vcpu(vcpu)?.vm();
    if registry.vm(vm)?.vcpus().is_empty() {
        release_vm(hal, registry, tlb, vm)?;
    }
    Ok(())
}

/// Release `vm` and all of its VCPUs.
pub fn teardown_vm<H: Hal>(
    hal: &mut H,
    registry: &mut Registry,
    tlb: &mut ShadowTlb,
    vm: VmHandle,
) -> Result<(), HvError> {
    let vcpus = registry.vm(vm)?.vcpus().to_vec();
    for vcpu in vcpus {
        registry.remove_vcpu(vcpu)?;
    }
    release_vm(hal, registry, tlb, vm)
}

fn release_vm<H: Hal>(
    hal: &mut H,
    registry: &mut Registry,
    tlb: &mut ShadowTlb,
    vm: VmHandle,
) -> Result<(), HvError> {
    let vm = registry.remove_vm(vm)?;
    tlb.flush_guest(hal, vm.guest_id());
    info!("VM {} ({}) removed.", vm.id(), vm.name());
    Ok(())
}
