//! Memory abstraction.
//!
//! Guest addresses seen by the root TLB are guest physical addresses ([`Gpa`]);
//! the frames backing them are host physical addresses ([`Pa`]). Both are
//! 32-bit on this core. The root TLB maps pages in even/odd pairs, so a
//! translation slot is indexed by the page-pair number (VPN2).

/// Page size.
pub const PAGE_SIZE: u32 = 0x1000;
/// Shift amount to get page index.
pub const PAGE_SHIFT: u32 = 12;
/// Mask for page offset.
pub const PAGE_MASK: u32 = 0xfff;
/// Shift amount to get the page-pair index (VPN2).
pub const VPN2_SHIFT: u32 = PAGE_SHIFT + 1;

/// Host physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Pa(u32);

impl Pa {
    /// Create a new physical address.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Cast into u32.
    #[inline]
    pub const fn into_u32(self) -> u32 {
        self.0
    }

    /// Frame number of this address.
    #[inline]
    pub const fn pfn(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }

    /// Whether the address is aligned to a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }
}

/// Guest physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Gpa(u32);

impl Gpa {
    /// Create a new guest physical address.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Cast into u32.
    #[inline]
    pub const fn into_u32(self) -> u32 {
        self.0
    }

    /// Offset inside the page.
    #[inline]
    pub const fn page_offset(self) -> u32 {
        self.0 & PAGE_MASK
    }

    /// Page-pair number used to tag a root TLB entry.
    #[inline]
    pub const fn vpn2(self) -> u32 {
        self.0 >> VPN2_SHIFT
    }

    /// Whether the address is aligned to a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<u32> for $t {
            type Output = Self;

            fn add(self, other: u32) -> Self::Output {
                Self(self.0.wrapping_add(other))
            }
        }
    };
}

impl_arith!(Gpa);
impl_arith!(Pa);

impl core::fmt::Debug for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}

impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_pair_split() {
        let even = Gpa::new(0x0040_2abc);
        let odd = Gpa::new(0x0040_3abc);
        assert_eq!(even.vpn2(), odd.vpn2());
        assert_ne!(odd.vpn2(), (odd + PAGE_SIZE).vpn2());
        assert_eq!(odd.page_offset(), 0xabc);
        assert!(Pa::new(0x0010_0000).is_page_aligned());
        assert!(!(Pa::new(0x0010_0000) + 4).is_page_aligned());
    }
}
