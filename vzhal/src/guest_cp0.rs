//! Guest CP0 context.
//!
//! The VZ module gives each guest its own copy of the CP0 registers. Root software
//! reaches them with `mfgc0`/`mtgc0`; switching VCPUs means saving the outgoing set
//! and loading the incoming one.

/// Guest CP0 registers preserved across a VCPU switch.
///
/// Each value encodes `(register << 3) | select`.
#[allow(missing_docs)]
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum GuestCp0Reg {
    Index = 0 << 3,
    EntryLo0 = 2 << 3,
    EntryLo1 = 3 << 3,
    Context = 4 << 3,
    UserLocal = (4 << 3) | 2,
    PageMask = 5 << 3,
    Wired = 6 << 3,
    HwrEna = 7 << 3,
    BadVAddr = 8 << 3,
    Count = 9 << 3,
    EntryHi = 10 << 3,
    Compare = 11 << 3,
    Status = 12 << 3,
    IntCtl = (12 << 3) | 1,
    Cause = 13 << 3,
    Epc = 14 << 3,
    EBase = (15 << 3) | 1,
    ErrorEpc = 30 << 3,
}

impl GuestCp0Reg {
    /// Number of saved registers.
    pub const COUNT: usize = 18;

    /// Registers in save order.
    pub const SAVED: [GuestCp0Reg; Self::COUNT] = [
        GuestCp0Reg::Index,
        GuestCp0Reg::EntryLo0,
        GuestCp0Reg::EntryLo1,
        GuestCp0Reg::Context,
        GuestCp0Reg::UserLocal,
        GuestCp0Reg::PageMask,
        GuestCp0Reg::Wired,
        GuestCp0Reg::HwrEna,
        GuestCp0Reg::BadVAddr,
        GuestCp0Reg::Count,
        GuestCp0Reg::EntryHi,
        GuestCp0Reg::Compare,
        GuestCp0Reg::Status,
        GuestCp0Reg::IntCtl,
        GuestCp0Reg::Cause,
        GuestCp0Reg::Epc,
        GuestCp0Reg::EBase,
        GuestCp0Reg::ErrorEpc,
    ];

    /// CP0 register number.
    #[inline]
    pub const fn register(self) -> u16 {
        self as u16 >> 3
    }

    /// CP0 select.
    #[inline]
    pub const fn select(self) -> u16 {
        self as u16 & 0x7
    }

    #[inline]
    fn slot(self) -> usize {
        // SAVED is short; a linear scan keeps the encoding the single source of truth.
        Self::SAVED.iter().position(|r| *r == self).unwrap_or(0)
    }
}

/// A saved guest CP0 register set.
#[derive(Clone, Copy, Eq, PartialEq, Default)]
pub struct GuestCp0 {
    regs: [u32; GuestCp0Reg::COUNT],
}

impl GuestCp0 {
    /// Read a saved register.
    #[inline]
    pub fn get(&self, reg: GuestCp0Reg) -> u32 {
        self.regs[reg.slot()]
    }

    /// Update a saved register.
    #[inline]
    pub fn set(&mut self, reg: GuestCp0Reg, value: u32) {
        self.regs[reg.slot()] = value;
    }

    /// Iterate over `(register, value)` pairs in save order.
    pub fn iter(&self) -> impl Iterator<Item = (GuestCp0Reg, u32)> + '_ {
        GuestCp0Reg::SAVED.iter().copied().zip(self.regs.iter().copied())
    }
}

impl core::fmt::Debug for GuestCp0 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding() {
        assert_eq!(GuestCp0Reg::IntCtl.register(), 12);
        assert_eq!(GuestCp0Reg::IntCtl.select(), 1);
        assert_eq!(GuestCp0Reg::SAVED.len(), GuestCp0Reg::COUNT);

        let mut cp0 = GuestCp0::default();
        cp0.set(GuestCp0Reg::Status, 0x1000_0001);
        cp0.set(GuestCp0Reg::ErrorEpc, 0xbfc0_0000);
        assert_eq!(cp0.get(GuestCp0Reg::Status), 0x1000_0001);
        assert_eq!(cp0.get(GuestCp0Reg::ErrorEpc), 0xbfc0_0000);
        assert_eq!(cp0.get(GuestCp0Reg::Index), 0);
    }
}
