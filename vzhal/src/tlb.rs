//! Root TLB entry encodings.
use crate::addressing::{Gpa, Pa, PAGE_SHIFT, VPN2_SHIFT};

/// Guest address-space identifier (`GuestCtl1.ID` / `GuestCtl1.RID`).
///
/// Zero is reserved for root mappings and never handed to a VM.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GuestId(u8);

impl GuestId {
    /// Create a new guest id.
    #[inline]
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    /// Cast into u8.
    #[inline]
    pub const fn into_u8(self) -> u8 {
        self.0
    }
}

impl core::fmt::Display for GuestId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags::bitflags! {
    /// Attribute bits of `EntryLo0`/`EntryLo1`.
    pub struct EntryLoFlags: u32 {
        /// The mapping is valid.
        const VALID = 1 << 1;
        /// The page is writable.
        const DIRTY = 1 << 2;
        /// Cache coherency attribute: cacheable, noncoherent, write-back.
        const CACHEABLE = 3 << 3;
    }
}

/// One half of a root TLB entry.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Default)]
pub struct EntryLo(u32);

impl EntryLo {
    const PFN_SHIFT: u32 = 6;
    const ATTR_MASK: u32 = (1 << Self::PFN_SHIFT) - 1;

    /// An invalid half.
    pub const INVALID: Self = Self(0);

    /// Map `pa` with `flags`.
    #[inline]
    pub const fn new(pa: Pa, flags: EntryLoFlags) -> Self {
        Self((pa.pfn() << Self::PFN_SHIFT) | (flags.bits() & Self::ATTR_MASK))
    }

    /// Attribute bits.
    #[inline]
    pub const fn flags(self) -> EntryLoFlags {
        EntryLoFlags::from_bits_truncate(self.0 & Self::ATTR_MASK)
    }

    /// Whether this half maps anything.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 & EntryLoFlags::VALID.bits() != 0
    }

    /// Base address of the mapped frame.
    #[inline]
    pub const fn pa(self) -> Pa {
        Pa::new((self.0 >> Self::PFN_SHIFT) << PAGE_SHIFT)
    }
}

impl core::fmt::Debug for EntryLo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EntryLo({:?}, {:?})", self.pa(), self.flags())
    }
}

/// A root TLB entry: a page pair tagged with a guest id.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TlbEntry {
    /// Owner of the mapping.
    pub guest_id: GuestId,
    /// `EntryHi`: VPN2 in bits 31..13, ASID zero.
    pub entry_hi: u32,
    /// Even page.
    pub lo0: EntryLo,
    /// Odd page.
    pub lo1: EntryLo,
    /// `PageMask`; zero selects 4KiB pages.
    pub page_mask: u32,
}

impl TlbEntry {
    /// Build an entry for the page pair containing `addr`.
    pub const fn new(guest_id: GuestId, addr: Gpa, lo0: EntryLo, lo1: EntryLo) -> Self {
        Self {
            guest_id,
            entry_hi: addr.vpn2() << VPN2_SHIFT,
            lo0,
            lo1,
            page_mask: 0,
        }
    }

    /// Page-pair number.
    #[inline]
    pub const fn vpn2(&self) -> u32 {
        self.entry_hi >> VPN2_SHIFT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_lo_round_trip_frame() {
        let lo = EntryLo::new(
            Pa::new(0x0123_4000),
            EntryLoFlags::VALID | EntryLoFlags::DIRTY | EntryLoFlags::CACHEABLE,
        );
        assert!(lo.is_valid());
        assert_eq!(lo.pa(), Pa::new(0x0123_4000));
        assert!(lo.flags().contains(EntryLoFlags::CACHEABLE));
        assert!(!EntryLo::INVALID.is_valid());
    }

    #[test]
    fn entry_is_tagged_by_page_pair() {
        let even = EntryLo::new(Pa::new(0x8000), EntryLoFlags::VALID);
        let odd = EntryLo::new(Pa::new(0x9000), EntryLoFlags::VALID);
        let entry = TlbEntry::new(GuestId::new(3), Gpa::new(0x3010), even, odd);
        assert_eq!(entry.vpn2(), 1);
        assert_eq!(entry.entry_hi, 0x2000);
        assert_eq!(entry.page_mask, 0);
    }
}
