//! Boot sequencing and the trap entry point.
//!
//! The hypervisor goes through two phases. Right after boot, every VCPU of the
//! real-time machines is run once, one after the other, until it reports that
//! its initialization ended. Only then does round robin scheduling of the
//! general machines start. Both phases share [`Hypervisor::handle_trap`] and
//! differ only in how an [`ExitOutcome`] is acted upon.
use crate::{
    config::{HvConfig, MachineKind, Manifest},
    context::{self, TrapCounters, TrapFrame},
    exits::{ExitDispatcher, ExitOutcome, ExitStats, HypercallTable, InstructionEmulator},
    registry::{Registry, VcpuHandle},
    scheduler::{retire_vcpu, Scheduler},
    shadow_tlb::ShadowTlb,
    Feature, HvError,
};
use log::{debug, error, info, warn};
use vzhal::{cp0::Status, tlb::GuestId, Hal};

/// Boot phase.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Phase {
    /// Initializing real-time machines. `started` is false until
    /// [`Hypervisor::start`] ran.
    RtInit { started: bool },
    /// Round robin scheduling.
    Steady,
    /// Nothing left to run, or a fatal error. Terminal.
    Halted,
}

/// What the trap vector does once the core returns.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GuestEntry {
    /// The trap frame holds the next guest; `eret` into it.
    Resume,
    /// Park the CPU with [`Hypervisor::halt_forever`].
    Halt,
}

/// The hypervisor.
pub struct Hypervisor<H: Hal, E: InstructionEmulator> {
    hal: H,
    config: HvConfig,
    registry: Registry,
    scheduler: Scheduler,
    tlb: ShadowTlb,
    exits: ExitDispatcher<E>,
    phase: Phase,
    next_guest_id: u16,
}

impl<H: Hal, E: InstructionEmulator> Hypervisor<H, E> {
    /// Check that the processor can host guests and set up an empty hypervisor.
    pub fn new(mut hal: H, emulator: E, config: HvConfig) -> Result<Self, HvError> {
        if !hal.has_vz() {
            return Err(HvError::MissingFeature(Feature::Vz));
        }
        if !hal.is_root_mode() {
            return Err(HvError::MissingFeature(Feature::RootMode));
        }
        if !hal.has_guest_id() {
            return Err(HvError::MissingFeature(Feature::GuestId));
        }
        if hal.uses_root_asid() {
            return Err(HvError::RootAsidInUse);
        }
        if hal.has_1k_pages() {
            hal.disable_1k_pages();
            info!("1K page support disabled.");
        }
        let tlb = ShadowTlb::new(hal.tlb_entries(), config.wired_tlb_entries);
        info!(
            "TLB entries {} ({} wired), quantum {} ticks.",
            hal.tlb_entries(),
            config.wired_tlb_entries,
            config.quantum_ticks()
        );
        Ok(Self {
            hal,
            config,
            registry: Registry::new(),
            scheduler: Scheduler::new(),
            tlb,
            exits: ExitDispatcher::new(emulator),
            phase: Phase::RtInit { started: false },
            next_guest_id: 1,
        })
    }

    /// Instantiate the machines of `manifest`.
    ///
    /// Each machine gets its own guest id. Real-time VCPUs are queued for
    /// initialization, the others for scheduling.
    pub fn load_manifest(&mut self, manifest: &Manifest<'_>) -> Result<(), HvError> {
        if self.phase != (Phase::RtInit { started: false }) {
            return Err(HvError::InvalidPhase);
        }
        manifest.validate()?;
        let available = (self.config.guest_id_limit as u16 + 1).saturating_sub(self.next_guest_id);
        if manifest.machines().count() > available as usize {
            return Err(HvError::GuestIdExhausted);
        }

        for (kind, machine) in manifest.machines() {
            let guest_id = GuestId::new(self.next_guest_id as u8);
            self.next_guest_id += 1;
            let vm = self.registry.insert_vm(kind, machine, guest_id);
            for vcpu in self.registry.vm(vm)?.vcpus().to_vec() {
                match kind {
                    MachineKind::RealTime => self.registry.enqueue_rt_init(vcpu),
                    MachineKind::General => self.scheduler.push_ready(vcpu),
                }
            }
            info!(
                "VM {} created: {} VCPU(s), guest id {}, {:?}.",
                machine.name, machine.vcpus, guest_id, kind
            );
        }
        Ok(())
    }

    /// Leave the boot path and enter the first guest.
    pub fn start(&mut self, frame: &mut TrapFrame) -> Result<GuestEntry, HvError> {
        if self.phase != (Phase::RtInit { started: false }) {
            return Err(HvError::InvalidPhase);
        }
        self.phase = Phase::RtInit { started: true };
        let mut status = self.hal.status();
        status.insert(Status::EXL);
        self.hal.set_status(status);
        info!("Successfully Initialized");

        Ok(match self.advance_rt() {
            Some(outcome) => self.configure_guest_execution(outcome, frame),
            None => GuestEntry::Halt,
        })
    }

    /// Handle a trap taken while a guest was running.
    ///
    /// `frame` holds the interrupted guest on entry and the guest to resume on
    /// return.
    pub fn handle_trap(&mut self, frame: &mut TrapFrame, counters: TrapCounters) -> GuestEntry {
        match self.phase {
            Phase::Halted => return GuestEntry::Halt,
            Phase::RtInit { started: false } => {
                error!("Trap taken before the hypervisor started.");
                self.phase = Phase::Halted;
                return GuestEntry::Halt;
            }
            Phase::RtInit { started: true } | Phase::Steady => (),
        }

        if let Some(vcpu) = self
            .scheduler
            .current()
            .and_then(|h| self.registry.vcpu_mut(h).ok())
        {
            context::save(&self.hal, frame, counters, vcpu);
        }

        let outcome = self.exits.handle_exception_cause(
            &mut self.hal,
            &mut self.registry,
            &mut self.tlb,
            &mut self.scheduler,
        );
        debug!("Trap outcome {:?} in {:?}", outcome, self.phase);
        if outcome != ExitOutcome::ChangeToTargetVcpu {
            self.scheduler.target_mut().take();
        }

        let next = match self.phase {
            Phase::RtInit { .. } => self.rt_step(outcome),
            Phase::Steady => self.steady_step(outcome),
            Phase::Halted => None,
        };
        match next {
            Some(outcome) => self.configure_guest_execution(outcome, frame),
            None => GuestEntry::Halt,
        }
    }

    fn rt_step(&mut self, outcome: ExitOutcome) -> Option<ExitOutcome> {
        match outcome {
            ExitOutcome::ProgramEnded => {
                if let Some(vcpu) = self.scheduler.current() {
                    self.scheduler.set_current(None);
                    if let Err(e) =
                        retire_vcpu(&mut self.hal, &mut self.registry, &mut self.tlb, vcpu)
                    {
                        warn!("Releasing RT VCPU failed: {}", e);
                    }
                }
                self.advance_rt()
            }
            ExitOutcome::Succeeded => Some(ExitOutcome::Succeeded),
            ExitOutcome::Reschedule => Some(ExitOutcome::Reschedule),
            ExitOutcome::ChangeToTargetVcpu => {
                // RT initialization runs to completion; switches wait for the
                // steady phase.
                self.scheduler.target_mut().take();
                Some(ExitOutcome::Succeeded)
            }
            ExitOutcome::Error => {
                error!("Error on RT services initialization.");
                error!("Hypervisor execution stopped.");
                self.phase = Phase::Halted;
                None
            }
        }
    }

    /// Run the next pending RT VCPU, or start scheduling once none is left.
    fn advance_rt(&mut self) -> Option<ExitOutcome> {
        if let Some(vcpu) = self.registry.dequeue_rt_init() {
            self.scheduler.set_current(Some(vcpu));
            if let Ok(v) = self.registry.vcpu(vcpu) {
                info!("Initializing RT VCPU {}.", v.id());
            }
            return Some(ExitOutcome::Reschedule);
        }
        self.phase = Phase::Steady;
        info!("RT services initialized.");
        match self.scheduler.run(&self.registry) {
            Some(_) => Some(ExitOutcome::Reschedule),
            None => self.no_vm_left(),
        }
    }

    fn steady_step(&mut self, outcome: ExitOutcome) -> Option<ExitOutcome> {
        match outcome {
            ExitOutcome::Succeeded => Some(ExitOutcome::Succeeded),
            ExitOutcome::Reschedule => match self.scheduler.run(&self.registry) {
                Some(_) => Some(ExitOutcome::Reschedule),
                None => self.no_vm_left(),
            },
            ExitOutcome::ChangeToTargetVcpu => {
                match self.scheduler.switch_to_target(&self.registry) {
                    Ok(_) => Some(ExitOutcome::ChangeToTargetVcpu),
                    Err(e) => {
                        warn!("Cannot switch to target VCPU: {}", e);
                        Some(ExitOutcome::Succeeded)
                    }
                }
            }
            ExitOutcome::Error => {
                let r = self.scheduler.remove_vm_and_run_best_effort(
                    &mut self.hal,
                    &mut self.registry,
                    &mut self.tlb,
                );
                self.after_teardown(r)
            }
            ExitOutcome::ProgramEnded => {
                let r = self
                    .scheduler
                    .end_current_vcpu(&mut self.hal, &mut self.registry, &mut self.tlb);
                self.after_teardown(r)
            }
        }
    }

    fn after_teardown(&mut self, result: Result<VcpuHandle, HvError>) -> Option<ExitOutcome> {
        match result {
            Ok(_) => Some(ExitOutcome::Reschedule),
            Err(HvError::NoVmLeft) => self.no_vm_left(),
            Err(e) => {
                error!("Teardown failed: {}", e);
                match self.scheduler.run(&self.registry) {
                    Some(_) => Some(ExitOutcome::Reschedule),
                    None => self.no_vm_left(),
                }
            }
        }
    }

    fn no_vm_left(&mut self) -> Option<ExitOutcome> {
        warn!("The last VM ended!");
        self.print_performance_counters();
        error!("No more VMs to execute.");
        self.phase = Phase::Halted;
        None
    }

    fn print_performance_counters(&self) {
        let (root, guest) = self.hal.perf_counters();
        info!("PERF COUNTER ROOT {}", root);
        info!("PERF COUNTER GUEST {}", guest);
    }

    /// Prepare the hardware and `frame` for entering the current VCPU.
    fn configure_guest_execution(
        &mut self,
        outcome: ExitOutcome,
        frame: &mut TrapFrame,
    ) -> GuestEntry {
        if matches!(
            outcome,
            ExitOutcome::Reschedule | ExitOutcome::ChangeToTargetVcpu
        ) {
            if let Err(e) = self.scheduler.dispatch(&mut self.hal, &self.registry) {
                error!("Dispatch failed: {}", e);
                self.phase = Phase::Halted;
                return GuestEntry::Halt;
            }
        }
        if outcome == ExitOutcome::Reschedule {
            self.hal.arm_timer(self.config.quantum_ticks());
        }
        // Entering anyway matches what the hardware would do with the same state.
        if !self.hal.guest_mode_entry_ready() {
            warn!("Conditions to enter in GuestMode not satisfied!");
        }

        match self
            .scheduler
            .current()
            .ok_or(HvError::StaleVcpu)
            .and_then(|h| self.registry.vcpu_mut(h))
        {
            Ok(vcpu) => {
                context::restore(&mut self.hal, vcpu, frame);
                GuestEntry::Resume
            }
            Err(e) => {
                error!("No VCPU to enter: {}", e);
                self.phase = Phase::Halted;
                GuestEntry::Halt
            }
        }
    }

    /// Spin on `wait` forever.
    pub fn halt_forever(&mut self) -> ! {
        loop {
            self.hal.wait_for_interrupt();
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[inline]
    pub fn config(&self) -> &HvConfig {
        &self.config
    }

    #[inline]
    pub fn hal(&self) -> &H {
        &self.hal
    }

    #[inline]
    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[inline]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[inline]
    pub fn tlb(&self) -> &ShadowTlb {
        &self.tlb
    }

    #[inline]
    pub fn stats(&self) -> &ExitStats {
        self.exits.stats()
    }

    /// Table to register hypercall handlers in.
    #[inline]
    pub fn hypercalls_mut(&mut self) -> &mut HypercallTable {
        self.exits.hypercalls_mut()
    }
}
