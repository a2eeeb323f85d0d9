//! Root CP0 registers and exception encodings for the VZ module.
//!
//! ## Details
//! See MIPS32® Architecture for Programmers Volume IV-i: Virtualization Module,
//! and Volume III, 9.2 "CP0 Register Descriptions".
use num_enum::TryFromPrimitive;

bitflags::bitflags! {
    /// Root `Status` register (CP0 register 12, select 0).
    pub struct Status: u32 {
        /// Interrupt enable.
        const IE = 1 << 0;
        /// Exception level. Set by the processor on any exception other than reset,
        /// soft reset, NMI or cache error. `eret` clears it.
        const EXL = 1 << 1;
        /// Error level. Set on reset, soft reset, NMI and cache error.
        const ERL = 1 << 2;
        /// Software interrupt 0 mask.
        const IM0 = 1 << 8;
        /// Software interrupt 1 mask.
        const IM1 = 1 << 9;
        /// Hardware interrupt 0 mask.
        const IM2 = 1 << 10;
        /// Hardware interrupt 1 mask.
        const IM3 = 1 << 11;
        /// Hardware interrupt 2 mask.
        const IM4 = 1 << 12;
        /// Hardware interrupt 3 mask.
        const IM5 = 1 << 13;
        /// Hardware interrupt 4 mask.
        const IM6 = 1 << 14;
        /// Hardware interrupt 5 mask. The compare timer is wired here.
        const IM7 = 1 << 15;
        /// Bootstrap exception vectors.
        const BEV = 1 << 22;
    }
}

bitflags::bitflags! {
    /// Hardware interrupt lines.
    ///
    /// The bit positions are shared by `Cause.IP` (pending) and `Status.IM` (mask),
    /// so the same value is used to test, clear and set a line.
    pub struct InterruptLines: u32 {
        /// Hardware interrupt 0 (IP2).
        const HW0 = 1 << 10;
        /// Hardware interrupt 1 (IP3).
        const HW1 = 1 << 11;
        /// Hardware interrupt 2 (IP4).
        const HW2 = 1 << 12;
        /// Hardware interrupt 3 (IP5).
        const HW3 = 1 << 13;
        /// Hardware interrupt 4 (IP6).
        const HW4 = 1 << 14;
        /// Hardware interrupt 5 (IP7).
        const HW5 = 1 << 15;
        /// The compare timer line.
        const TIMER = Self::HW5.bits();
    }
}

impl InterruptLines {
    /// Every hardware line in priority-independent order, HW0 first.
    pub const HARDWARE: [InterruptLines; 6] = [
        InterruptLines::HW0,
        InterruptLines::HW1,
        InterruptLines::HW2,
        InterruptLines::HW3,
        InterruptLines::HW4,
        InterruptLines::HW5,
    ];
}

/// Root `Cause` register (CP0 register 13, select 0).
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Default)]
pub struct Cause(u32);

impl Cause {
    /// Last exception taken in a branch delay slot.
    pub const BD: u32 = 1 << 31;
    const EXC_CODE_SHIFT: u32 = 2;
    const EXC_CODE_MASK: u32 = 0x1f;

    /// Wrap a raw register value.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw register value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Build a cause value carrying `code` in the ExcCode field.
    #[inline]
    pub const fn with_exc_code(self, code: u32) -> Self {
        Self(
            (self.0 & !(Self::EXC_CODE_MASK << Self::EXC_CODE_SHIFT))
                | ((code & Self::EXC_CODE_MASK) << Self::EXC_CODE_SHIFT),
        )
    }

    /// The ExcCode field.
    #[inline]
    pub const fn exc_code(self) -> u32 {
        (self.0 >> Self::EXC_CODE_SHIFT) & Self::EXC_CODE_MASK
    }

    /// Whether the faulting instruction sits in a branch delay slot.
    #[inline]
    pub const fn branch_delay(self) -> bool {
        self.0 & Self::BD != 0
    }

    /// Pending hardware interrupt lines.
    #[inline]
    pub const fn pending(self) -> InterruptLines {
        InterruptLines::from_bits_truncate(self.0)
    }
}

impl core::fmt::Debug for Cause {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Cause(0x{:x}, ExcCode=0x{:x})", self.0, self.exc_code())
    }
}

/// `GuestCtl0` (CP0 register 12, select 6).
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Default)]
pub struct GuestCtl0(u32);

impl GuestCtl0 {
    /// Guest mode. With `Status.EXL` set, `eret` enters guest mode.
    pub const GM: u32 = 1 << 31;
    const GEXC_CODE_SHIFT: u32 = 2;
    const GEXC_CODE_MASK: u32 = 0x1f;

    /// Wrap a raw register value.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw register value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Build a value carrying `code` in the GExcCode field.
    #[inline]
    pub const fn with_gexc_code(self, code: u32) -> Self {
        Self(
            (self.0 & !(Self::GEXC_CODE_MASK << Self::GEXC_CODE_SHIFT))
                | ((code & Self::GEXC_CODE_MASK) << Self::GEXC_CODE_SHIFT),
        )
    }

    /// The GExcCode field. Valid after a Guest Exit exception.
    #[inline]
    pub const fn gexc_code(self) -> u32 {
        (self.0 >> Self::GEXC_CODE_SHIFT) & Self::GEXC_CODE_MASK
    }

    /// Whether `GM` is set.
    #[inline]
    pub const fn guest_mode(self) -> bool {
        self.0 & Self::GM != 0
    }
}

impl core::fmt::Debug for GuestCtl0 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "GuestCtl0(0x{:x})", self.0)
    }
}

/// Exception codes of the root `Cause.ExcCode` field.
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
pub enum ExceptionCause {
    Interrupt = 0x00,
    TlbModified = 0x01,
    /// TLB miss on load or instruction fetch.
    TlbLoad = 0x02,
    /// TLB miss on store.
    TlbStore = 0x03,
    AddressErrorLoad = 0x04,
    AddressErrorStore = 0x05,
    InstructionBusError = 0x06,
    DataBusError = 0x07,
    Syscall = 0x08,
    Breakpoint = 0x09,
    ReservedInstruction = 0x0a,
    CoprocessorUnusable = 0x0b,
    Overflow = 0x0c,
    Trap = 0x0d,
    MsaFloatingPoint = 0x0e,
    FloatingPoint = 0x0f,
    TlbReadInhibit = 0x13,
    TlbExecuteInhibit = 0x14,
    MsaDisabled = 0x15,
    Watch = 0x17,
    MachineCheck = 0x18,
    DspDisabled = 0x1a,
    /// Guest Exit. The sub-cause is in `GuestCtl0.GExcCode`.
    GuestExit = 0x1b,
    CacheError = 0x1e,
}

/// Guest Exit sub-causes of `GuestCtl0.GExcCode`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
pub enum GuestExitCause {
    /// Guest privileged sensitive instruction.
    PrivilegedSensitive = 0x0,
    /// Guest software field change.
    SoftwareFieldChange = 0x1,
    /// Hypercall (`hypcall` instruction).
    Hypercall = 0x2,
    /// Guest reserved instruction redirect.
    ReservedRedirect = 0x3,
    /// Guest mode initiated root TLB exception (address is a GVA).
    GuestVirtualTlb = 0x8,
    /// Guest hardware field change.
    HardwareFieldChange = 0x9,
    /// Guest mode initiated root TLB exception (address is a GPA).
    GuestPhysicalTlb = 0xa,
}
