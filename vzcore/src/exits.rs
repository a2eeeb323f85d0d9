//! Exception dispatch.
//!
//! Every trap is classified by the root `Cause.ExcCode` and handed to exactly
//! one handler. Handlers report back through [`ExitOutcome`]; it is the only
//! thing the boot sequencer and the scheduler look at.
use crate::{
    probe::Probe,
    registry::{Registry, VcpuHandle},
    scheduler::Scheduler,
    shadow_tlb::ShadowTlb,
    vcpu::Vcpu,
    vm::Vm,
    HvError,
};
use alloc::{boxed::Box, collections::BTreeMap};
use log::{debug, error, warn};
use vzhal::{
    addressing::{Gpa, Pa},
    cp0::{ExceptionCause, GuestExitCause, InterruptLines},
    insn::next_pc,
    Hal,
};

/// Guest register carrying hypercall results.
pub const V0: usize = 2;

/// Returned in `v0` for a hypercall nobody registered.
pub const HCALL_NOT_IMPLEMENTED: u32 = u32::MAX;

/// Result of handling a trap.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExitOutcome {
    /// Resume the same VCPU.
    Succeeded,
    /// The quantum expired; pick the next VCPU.
    Reschedule,
    /// A handler asked to run the VCPU set with [`ExitContext::switch_to`].
    ChangeToTargetVcpu,
    /// The current VCPU finished.
    ProgramEnded,
    /// The current VM cannot continue.
    Error,
}

/// What a handler sees of the trapped VCPU.
pub struct ExitContext<'a> {
    vcpu: &'a mut Vcpu,
    vm: &'a Vm,
    probe: &'a dyn Probe,
    target: &'a mut Option<VcpuHandle>,
    insn: u32,
}

impl<'a> ExitContext<'a> {
    /// Build a context for `vcpu` of `vm` that trapped on `insn`.
    pub fn new(
        vcpu: &'a mut Vcpu,
        vm: &'a Vm,
        probe: &'a dyn Probe,
        target: &'a mut Option<VcpuHandle>,
        insn: u32,
    ) -> Self {
        Self {
            vcpu,
            vm,
            probe,
            target,
            insn,
        }
    }

    #[inline]
    pub fn vcpu(&self) -> &Vcpu {
        self.vcpu
    }

    #[inline]
    pub fn vcpu_mut(&mut self) -> &mut Vcpu {
        self.vcpu
    }

    #[inline]
    pub fn vm(&self) -> &Vm {
        self.vm
    }

    /// The trapping instruction word (`BadInstr`).
    #[inline]
    pub fn instruction(&self) -> u32 {
        self.insn
    }

    /// Saved general purpose register `idx`.
    #[inline]
    pub fn gpr(&self, idx: usize) -> u32 {
        self.vcpu.gpr(idx)
    }

    /// Update saved general purpose register `idx`.
    #[inline]
    pub fn set_gpr(&mut self, idx: usize, value: u32) {
        self.vcpu.set_gpr(idx, value)
    }

    /// Host address of the guest physical address `gpa`, if it belongs to the
    /// VM. The page does not have to be in the TLB.
    pub fn translate(&self, gpa: Gpa) -> Option<Pa> {
        self.probe.gpa2hpa(self.vm, gpa)
    }

    /// Ask for `vcpu` to run next. Takes effect when the handler returns
    /// [`ExitOutcome::ChangeToTargetVcpu`].
    pub fn switch_to(&mut self, vcpu: VcpuHandle) {
        *self.target = Some(vcpu);
    }
}

/// Emulator for guest privileged sensitive instructions.
pub trait InstructionEmulator {
    /// Emulate the instruction at `pc`.
    fn emulate(&mut self, ctx: &mut ExitContext<'_>, pc: u32) -> ExitOutcome;
}

impl<F> InstructionEmulator for F
where
    F: FnMut(&mut ExitContext<'_>, u32) -> ExitOutcome,
{
    fn emulate(&mut self, ctx: &mut ExitContext<'_>, pc: u32) -> ExitOutcome {
        self(ctx, pc)
    }
}

/// Emulator that refuses every instruction.
pub struct NoEmulation;

impl InstructionEmulator for NoEmulation {
    fn emulate(&mut self, ctx: &mut ExitContext<'_>, pc: u32) -> ExitOutcome {
        warn!(
            "No emulation for 0x{:08x} at 0x{:08x} (VM {}).",
            ctx.instruction(),
            pc,
            ctx.vm().id()
        );
        ExitOutcome::Error
    }
}

/// Handler for one hypercall code.
pub trait HypercallHandler {
    fn handle(&mut self, ctx: &mut ExitContext<'_>) -> ExitOutcome;
}

impl<F> HypercallHandler for F
where
    F: FnMut(&mut ExitContext<'_>) -> ExitOutcome,
{
    fn handle(&mut self, ctx: &mut ExitContext<'_>) -> ExitOutcome {
        self(ctx)
    }
}

/// The 10-bit code field of a `hypcall` instruction.
#[inline]
pub const fn hypcall_code(insn: u32) -> u32 {
    (insn >> 11) & 0x3ff
}

/// Hypercall handlers by code.
#[derive(Default)]
pub struct HypercallTable {
    handlers: BTreeMap<u32, Box<dyn HypercallHandler>>,
}

impl HypercallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `code`. Returns false if `code` is taken.
    pub fn register<H: HypercallHandler + 'static>(&mut self, code: u32, handler: H) -> bool {
        if self.handlers.contains_key(&code) {
            return false;
        }
        self.handlers.insert(code, Box::new(handler));
        true
    }

    /// Run the handler of `code`.
    pub fn dispatch(&mut self, ctx: &mut ExitContext<'_>, code: u32) -> ExitOutcome {
        match self.handlers.get_mut(&code) {
            Some(handler) => handler.handle(ctx),
            None => {
                warn!(
                    "Hypercall {} not implemented (VCPU {}).",
                    code,
                    ctx.vcpu().id()
                );
                ctx.set_gpr(V0, HCALL_NOT_IMPLEMENTED);
                ExitOutcome::Succeeded
            }
        }
    }
}

/// Free-running event counters.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ExitStats {
    pub timer_interrupts: u64,
    pub guest_exits: u64,
    pub tlb_misses: u64,
}

/// Routes traps to their handlers.
pub struct ExitDispatcher<E: InstructionEmulator> {
    emulator: E,
    hypercalls: HypercallTable,
    stats: ExitStats,
}

impl<E: InstructionEmulator> ExitDispatcher<E> {
    pub fn new(emulator: E) -> Self {
        Self {
            emulator,
            hypercalls: HypercallTable::new(),
            stats: ExitStats::default(),
        }
    }

    #[inline]
    pub fn hypercalls_mut(&mut self) -> &mut HypercallTable {
        &mut self.hypercalls
    }

    #[inline]
    pub fn stats(&self) -> &ExitStats {
        &self.stats
    }

    /// Classify the pending exception and handle it on behalf of the current
    /// VCPU of `scheduler`.
    pub fn handle_exception_cause<H: Hal>(
        &mut self,
        hal: &mut H,
        registry: &mut Registry,
        tlb: &mut ShadowTlb,
        scheduler: &mut Scheduler,
    ) -> ExitOutcome {
        let code = hal.cause().exc_code();
        let cause = match ExceptionCause::try_from(code) {
            Ok(cause) => cause,
            Err(_) => return unhandled_cause(hal, registry, scheduler, code),
        };
        match cause {
            ExceptionCause::Interrupt => self.handle_interrupt(hal),
            ExceptionCause::GuestExit => {
                let (vcpu, vm) = match current(registry, scheduler) {
                    Ok(pair) => pair,
                    Err(e) => return lost_vcpu(e),
                };
                self.handle_guest_exit(hal, vcpu, vm, &*tlb, scheduler.target_mut())
            }
            ExceptionCause::TlbLoad | ExceptionCause::TlbStore => {
                let (vcpu, vm) = match current(registry, scheduler) {
                    Ok(pair) => pair,
                    Err(e) => return lost_vcpu(e),
                };
                self.stats.tlb_misses += 1;
                warn!("TLB miss: VCPU: {}", vcpu.id());
                let fault = Gpa::new(hal.bad_vaddr());
                match tlb.resolve(hal, vm, fault) {
                    Ok(_) => ExitOutcome::Succeeded,
                    Err(e) => {
                        error!("VM {} ({}): {}", vm.id(), vm.name(), e);
                        ExitOutcome::Error
                    }
                }
            }
            ExceptionCause::TlbModified
            | ExceptionCause::AddressErrorLoad
            | ExceptionCause::AddressErrorStore
            | ExceptionCause::InstructionBusError
            | ExceptionCause::DataBusError
            | ExceptionCause::Syscall
            | ExceptionCause::Breakpoint
            | ExceptionCause::ReservedInstruction
            | ExceptionCause::CoprocessorUnusable
            | ExceptionCause::Overflow
            | ExceptionCause::Trap
            | ExceptionCause::MsaFloatingPoint
            | ExceptionCause::FloatingPoint
            | ExceptionCause::TlbReadInhibit
            | ExceptionCause::TlbExecuteInhibit
            | ExceptionCause::MsaDisabled
            | ExceptionCause::Watch
            | ExceptionCause::MachineCheck
            | ExceptionCause::DspDisabled
            | ExceptionCause::CacheError => unhandled_cause(hal, registry, scheduler, code),
        }
    }

    /// Service every pending hardware interrupt line.
    ///
    /// Each line is masked while it is handled. The timer line asks for a
    /// reschedule; the others are only reported.
    pub fn handle_interrupt<H: Hal>(&mut self, hal: &mut H) -> ExitOutcome {
        let pending = hal.cause().pending();
        let mut outcome = None;
        for (n, line) in InterruptLines::HARDWARE.iter().copied().enumerate() {
            if !pending.contains(line) {
                continue;
            }
            hal.clear_interrupt_mask(line);
            if line == InterruptLines::TIMER {
                self.stats.timer_interrupts += 1;
                outcome = Some(ExitOutcome::Reschedule);
            } else {
                warn!("int{}", n);
                outcome.get_or_insert(ExitOutcome::Succeeded);
            }
            hal.set_interrupt_mask(line);
        }
        outcome.unwrap_or_else(|| {
            warn!("Interrupt handler not implemented.");
            ExitOutcome::Succeeded
        })
    }

    /// Handle a Guest Exit of `vcpu`.
    ///
    /// Whatever the handler decides, the VCPU resumes after the trapping
    /// instruction. A branch owning the delay slot is evaluated before the
    /// handler runs, as the hardware would have.
    pub fn handle_guest_exit<H: Hal>(
        &mut self,
        hal: &mut H,
        vcpu: &mut Vcpu,
        vm: &Vm,
        probe: &dyn Probe,
        target: &mut Option<VcpuHandle>,
    ) -> ExitOutcome {
        self.stats.guest_exits += 1;
        let epc = hal.epc();
        let insn = hal.bad_instr();
        let resume = next_pc(
            epc,
            hal.cause().branch_delay(),
            hal.bad_instr_p(),
            &mut vcpu.context.gpr,
        );
        let mut ctx = ExitContext::new(vcpu, vm, probe, target, insn);

        let outcome = match GuestExitCause::try_from(hal.guest_ctl0().gexc_code()) {
            Ok(GuestExitCause::PrivilegedSensitive) => self.emulator.emulate(&mut ctx, epc),
            Ok(GuestExitCause::Hypercall) => {
                self.hypercalls.dispatch(&mut ctx, hypcall_code(insn))
            }
            other => {
                debug!("Guest exit {:?} at 0x{:08x} ignored.", other.ok(), epc);
                ExitOutcome::Succeeded
            }
        };

        ctx.vcpu_mut().pc = resume;
        outcome
    }
}

fn current<'r>(
    registry: &'r mut Registry,
    scheduler: &Scheduler,
) -> Result<(&'r mut Vcpu, &'r Vm), HvError> {
    let handle = scheduler.current().ok_or(HvError::StaleVcpu)?;
    registry.vcpu_and_vm(handle)
}

/// Causes the hypervisor does not service stop the VM.
fn unhandled_cause<H: Hal>(
    hal: &H,
    registry: &Registry,
    scheduler: &Scheduler,
    code: u32,
) -> ExitOutcome {
    let vm = scheduler
        .current()
        .and_then(|h| registry.vcpu_vm(h).ok())
        .and_then(|h| registry.vm(h).ok())
        .map_or(0, Vm::id);
    error!(
        "VM will be stopped due to error Cause Code 0x{:x}, EPC 0x{:x}, VM ID 0x{:x}",
        code,
        hal.epc(),
        vm
    );
    ExitOutcome::Error
}

fn lost_vcpu(e: HvError) -> ExitOutcome {
    error!("Trap without a running VCPU: {}", e);
    ExitOutcome::Error
}
