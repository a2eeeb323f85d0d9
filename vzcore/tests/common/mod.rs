#![allow(dead_code)]

use log::LevelFilter;
use std::{cell::RefCell, sync::Once};
use vzcore::{
    config::{HvConfig, MachineConfig, MemoryRegion},
    exits::{ExitContext, ExitOutcome},
    Hypervisor,
};
use vzhal::{
    addressing::{Gpa, Pa},
    console::{self, Console},
    mock::MockHal,
};

thread_local! {
    static LOGS: RefCell<String> = RefCell::new(String::new());
}

struct Capture;

impl Console for Capture {
    fn write_str(&self, s: &str) {
        LOGS.with(|logs| logs.borrow_mut().push_str(s));
    }
}

static CAPTURE: Capture = Capture;

/// Install the capturing logger and clear this thread's log.
pub fn init_logging() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        console::init(&CAPTURE, LevelFilter::Debug).expect("logger already installed");
    });
    LOGS.with(|logs| logs.borrow_mut().clear());
}

/// Everything this thread logged since `init_logging`.
pub fn logs() -> String {
    LOGS.with(|logs| logs.borrow().clone())
}

pub const ENTRY: u32 = 0x9d00_0000;
pub const GUEST_BASE: u32 = 0x1d00_0000;
/// `hypcall` with a zero code field.
pub const HYPCALL: u32 = 0x4200_0028;
/// `mtc0 zero, $12` as seen by the emulator.
pub const MTC0_STATUS: u32 = 0x4080_6000;

pub fn hypcall(code: u32) -> u32 {
    HYPCALL | (code << 11)
}

/// A machine whose memory lives in the `slot`-th MiB of host memory.
pub fn machine(name: &'static str, vcpus: usize, slot: u32) -> MachineConfig {
    MachineConfig {
        name,
        vcpus,
        entry: ENTRY,
        memory: MemoryRegion {
            guest_base: Gpa::new(GUEST_BASE),
            host_base: Pa::new(slot << 20),
            size: 0x1_0000,
        },
    }
}

pub type Emulator = Box<dyn FnMut(&mut ExitContext<'_>, u32) -> ExitOutcome>;

pub fn emulator(f: impl FnMut(&mut ExitContext<'_>, u32) -> ExitOutcome + 'static) -> Emulator {
    Box::new(f)
}

/// A hypervisor on a 16-entry TLB whose emulator accepts everything and with
/// hypercall 0 ending the calling VCPU.
pub fn hypervisor() -> Hypervisor<MockHal, Emulator> {
    init_logging();
    let mut hv = Hypervisor::new(
        MockHal::new(16),
        emulator(|_, _| ExitOutcome::Succeeded),
        HvConfig::default(),
    )
    .expect("hypervisor");
    hv.hypercalls_mut()
        .register(0, |_: &mut ExitContext<'_>| ExitOutcome::ProgramEnded);
    hv
}
