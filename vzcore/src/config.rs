//! Hypervisor configuration and the static machine manifest.
use crate::HvError;
use vzhal::addressing::{Gpa, Pa};

/// Tunables of the hypervisor.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HvConfig {
    /// Core clock. `Count` advances every other cycle.
    pub cpu_frequency_hz: u32,
    /// Scheduling quantum in milliseconds.
    pub quantum_ms: u32,
    /// Root TLB entries reserved for the hypervisor itself, starting at index 0.
    pub wired_tlb_entries: usize,
    /// Highest usable guest id.
    pub guest_id_limit: u8,
}

impl Default for HvConfig {
    fn default() -> Self {
        Self {
            cpu_frequency_hz: 200_000_000,
            quantum_ms: 1,
            wired_tlb_entries: 1,
            guest_id_limit: 7,
        }
    }
}

impl HvConfig {
    /// Length of a quantum in `Count` ticks.
    pub const fn quantum_ticks(&self) -> u32 {
        (self.cpu_frequency_hz / 2 / 1000).saturating_mul(self.quantum_ms)
    }
}

/// Statically partitioned guest memory.
///
/// Guest physical `[guest_base, guest_base + size)` is backed by host physical
/// `[host_base, host_base + size)`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MemoryRegion {
    pub guest_base: Gpa,
    pub host_base: Pa,
    pub size: u32,
}

impl MemoryRegion {
    /// Whether `gpa` belongs to the region.
    #[inline]
    pub fn contains(&self, gpa: Gpa) -> bool {
        gpa.into_u32()
            .checked_sub(self.guest_base.into_u32())
            .map_or(false, |offset| offset < self.size)
    }

    /// Host frame backing `gpa`.
    pub fn translate(&self, gpa: Gpa) -> Option<Pa> {
        if self.contains(gpa) {
            Some(self.host_base + (gpa.into_u32() - self.guest_base.into_u32()))
        } else {
            None
        }
    }

    /// Whether the host ranges of `self` and `other` intersect.
    pub fn host_overlaps(&self, other: &MemoryRegion) -> bool {
        let (a, b) = (self.host_base.into_u32() as u64, other.host_base.into_u32() as u64);
        a < b + other.size as u64 && b < a + self.size as u64
    }

    fn validate(&self) -> Result<(), HvError> {
        if self.size == 0 {
            return Err(HvError::InvalidManifest("empty memory region"));
        }
        if !self.guest_base.is_page_aligned()
            || !self.host_base.is_page_aligned()
            || self.size & vzhal::addressing::PAGE_MASK != 0
        {
            return Err(HvError::InvalidManifest("memory region not page aligned"));
        }
        if (self.host_base.into_u32() as u64) + self.size as u64 > 1 << 32
            || (self.guest_base.into_u32() as u64) + self.size as u64 > 1 << 32
        {
            return Err(HvError::InvalidManifest("memory region wraps around"));
        }
        Ok(())
    }
}

/// Class of a machine.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MachineKind {
    /// Real-time services. Each VCPU gets a one-time initialization run at boot,
    /// before anything else is scheduled.
    RealTime,
    /// Regular machine, scheduled round robin from the start.
    General,
}

/// Description of one machine.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MachineConfig {
    pub name: &'static str,
    pub vcpus: usize,
    /// Initial PC of every VCPU.
    pub entry: u32,
    pub memory: MemoryRegion,
}

/// Machines to instantiate at boot.
#[derive(Debug, Clone, Copy)]
pub struct Manifest<'a> {
    pub rt: &'a [MachineConfig],
    pub general: &'a [MachineConfig],
}

impl<'a> Manifest<'a> {
    /// All machines with their kind, real-time ones first.
    pub fn machines(&self) -> impl Iterator<Item = (MachineKind, &'a MachineConfig)> + 'a {
        self.rt
            .iter()
            .map(|m| (MachineKind::RealTime, m))
            .chain(self.general.iter().map(|m| (MachineKind::General, m)))
    }

    /// Check the manifest for inconsistencies.
    pub fn validate(&self) -> Result<(), HvError> {
        for (idx, (_, machine)) in self.machines().enumerate() {
            if machine.vcpus == 0 {
                return Err(HvError::InvalidManifest("machine without VCPU"));
            }
            machine.memory.validate()?;
            if self
                .machines()
                .skip(idx + 1)
                .any(|(_, other)| machine.memory.host_overlaps(&other.memory))
            {
                return Err(HvError::InvalidManifest("machines share host memory"));
            }
        }
        Ok(())
    }
}
