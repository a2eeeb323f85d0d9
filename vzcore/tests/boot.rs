mod common;

use common::*;
use vzcore::{
    config::{HvConfig, Manifest},
    context::{TrapCounters, TrapFrame},
    exits::NoEmulation,
    Feature, GuestEntry, HvError, Hypervisor, Phase,
};
use vzhal::{cp0::Status, guest_cp0::GuestCp0Reg, mock::MockHal};

#[test]
fn missing_hardware_support_is_reported() {
    init_logging();
    let cases: [(fn(&mut MockHal), HvError); 4] = [
        (|h| h.vz = false, HvError::MissingFeature(Feature::Vz)),
        (|h| h.root_mode = false, HvError::MissingFeature(Feature::RootMode)),
        (
            |h| h.guest_id_support = false,
            HvError::MissingFeature(Feature::GuestId),
        ),
        (|h| h.root_asid = true, HvError::RootAsidInUse),
    ];
    for (tweak, expected) in cases {
        let mut hal = MockHal::new(16);
        tweak(&mut hal);
        assert_eq!(
            Hypervisor::new(hal, NoEmulation, HvConfig::default()).err(),
            Some(expected)
        );
    }
}

#[test]
fn small_pages_are_turned_off() {
    init_logging();
    let mut hal = MockHal::new(16);
    hal.pages_1k = true;
    let hv = Hypervisor::new(hal, NoEmulation, HvConfig::default()).unwrap();
    assert!(hv.hal().pages_1k_disabled);
    assert!(logs().contains("[INFO] 1K page support disabled."));
}

#[test]
fn manifest_is_checked_before_anything_is_created() {
    let mut hv = hypervisor();
    let mut empty = machine("empty", 1, 2);
    empty.vcpus = 0;
    assert!(matches!(
        hv.load_manifest(&Manifest {
            rt: &[machine("rt", 1, 1)],
            general: &[empty],
        }),
        Err(HvError::InvalidManifest(_))
    ));
    assert_eq!(hv.registry().vm_count(), 0);
    assert_eq!(hv.registry().rt_pending(), 0);

    let many: Vec<_> = (1..=8).map(|i| machine("g", 1, i)).collect();
    assert_eq!(
        hv.load_manifest(&Manifest {
            rt: &[],
            general: &many,
        }),
        Err(HvError::GuestIdExhausted)
    );
    assert_eq!(hv.registry().vm_count(), 0);

    assert_eq!(
        hv.load_manifest(&Manifest {
            rt: &[],
            general: &many[..7],
        }),
        Ok(())
    );
    let ids: Vec<u8> = hv
        .registry()
        .vms()
        .map(|(_, vm)| vm.guest_id().into_u8())
        .collect();
    assert_eq!(ids, [1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn start_enters_the_first_guest_once() {
    let mut hv = hypervisor();
    hv.load_manifest(&Manifest {
        rt: &[],
        general: &[machine("g", 1, 1)],
    })
    .unwrap();
    let mut frame = TrapFrame::default();
    frame.gpr[4] = 0xdead;

    assert_eq!(hv.start(&mut frame), Ok(GuestEntry::Resume));
    assert!(hv.hal().status.contains(Status::EXL));
    assert!(hv.hal().guest_ctl0.guest_mode());
    assert_eq!(frame, TrapFrame::default());
    assert!(!logs().contains("Conditions to enter in GuestMode not satisfied!"));

    assert_eq!(hv.start(&mut frame), Err(HvError::InvalidPhase));
    assert_eq!(
        hv.load_manifest(&Manifest {
            rt: &[],
            general: &[machine("late", 1, 2)],
        }),
        Err(HvError::InvalidPhase)
    );
}

#[test]
fn nothing_to_run_halts_at_start() {
    let mut hv = hypervisor();
    hv.hal_mut().perf = (1234, 5678);
    let mut frame = TrapFrame::default();
    assert_eq!(hv.start(&mut frame), Ok(GuestEntry::Halt));
    assert_eq!(hv.phase(), Phase::Halted);
    let logs = logs();
    assert!(logs.contains("[INFO] PERF COUNTER ROOT 1234"));
    assert!(logs.contains("[INFO] PERF COUNTER GUEST 5678"));
    assert!(logs.contains("[CRITICAL] No more VMs to execute."));
}

#[test]
fn trap_before_start_halts() {
    let mut hv = hypervisor();
    let mut frame = TrapFrame::default();
    assert_eq!(
        hv.handle_trap(&mut frame, TrapCounters::default()),
        GuestEntry::Halt
    );
    assert_eq!(hv.phase(), Phase::Halted);
}

#[test]
fn trap_counters_are_recorded_per_vcpu() {
    let mut hv = hypervisor();
    hv.load_manifest(&Manifest {
        rt: &[],
        general: &[machine("g", 1, 1)],
    })
    .unwrap();
    let mut frame = TrapFrame::default();
    hv.start(&mut frame).unwrap();
    let vcpu = hv.scheduler().current().unwrap();

    for n in 1..=3 {
        // The guest count at the trap is what the next entry restores.
        hv.hal_mut().guest_cp0.set(GuestCp0Reg::Count, 10 * n);
        hv.hal_mut()
            .raise_interrupt(vzhal::cp0::InterruptLines::HW1, ENTRY);
        hv.handle_trap(
            &mut frame,
            TrapCounters {
                root: 100 * n,
                guest: 10 * n,
            },
        );
    }
    let counters = hv.registry().vcpu(vcpu).unwrap().counters;
    assert_eq!(counters.traps, 3);
    assert_eq!(counters.root_count, 300);
    assert_eq!(counters.guest_count, 30);
    assert_eq!(counters.entry_guest_count, 30);
    assert_eq!(counters.guest_ticks, 30);
    assert!(logs().contains("[WARNING] int1"));
}
