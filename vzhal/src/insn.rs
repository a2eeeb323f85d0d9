//! Next-PC computation for instructions that trapped in a branch delay slot.
//!
//! When `Cause.BD` is set, `EPC` points at the branch rather than at the
//! faulting instruction, and `BadInstrP` holds the branch itself. Resuming the
//! guest then means completing the branch on its behalf.

const OP_SPECIAL: u32 = 0x00;
const OP_REGIMM: u32 = 0x01;
const OP_J: u32 = 0x02;
const OP_JAL: u32 = 0x03;
const OP_BEQ: u32 = 0x04;
const OP_BNE: u32 = 0x05;
const OP_BLEZ: u32 = 0x06;
const OP_BGTZ: u32 = 0x07;
const OP_BEQL: u32 = 0x14;
const OP_BNEL: u32 = 0x15;
const OP_BLEZL: u32 = 0x16;
const OP_BGTZL: u32 = 0x17;

const FUNCT_JR: u32 = 0x08;
const FUNCT_JALR: u32 = 0x09;

const RT_BLTZ: u32 = 0x00;
const RT_BGEZ: u32 = 0x01;
const RT_BLTZL: u32 = 0x02;
const RT_BGEZL: u32 = 0x03;
const RT_BLTZAL: u32 = 0x10;
const RT_BGEZAL: u32 = 0x11;
const RT_BLTZALL: u32 = 0x12;
const RT_BGEZALL: u32 = 0x13;

/// Return address register.
pub const RA: usize = 31;

#[derive(Clone, Copy)]
struct Fields(u32);

impl Fields {
    fn opcode(self) -> u32 {
        self.0 >> 26
    }
    fn rs(self) -> usize {
        ((self.0 >> 21) & 0x1f) as usize
    }
    fn rt(self) -> usize {
        ((self.0 >> 16) & 0x1f) as usize
    }
    fn rd(self) -> usize {
        ((self.0 >> 11) & 0x1f) as usize
    }
    fn funct(self) -> u32 {
        self.0 & 0x3f
    }
    fn branch_offset(self) -> u32 {
        (((self.0 & 0xffff) as u16 as i16 as i32) << 2) as u32
    }
    fn jump_index(self) -> u32 {
        (self.0 & 0x03ff_ffff) << 2
    }
}

fn link(gpr: &mut [u32; 32], reg: usize, value: u32) {
    if reg != 0 {
        gpr[reg] = value;
    }
}

/// Address the guest resumes at after the instruction at `epc` is handled.
///
/// Without a delay slot this is `epc + 4`. Otherwise `branch` is evaluated
/// against `gpr`: a taken branch or jump yields its target, a not-taken
/// conditional yields `epc + 8`. Linking forms update `gpr` like the hardware
/// would. An instruction that is not a branch also yields `epc + 8`.
pub fn next_pc(epc: u32, branch_delay: bool, branch: u32, gpr: &mut [u32; 32]) -> u32 {
    if !branch_delay {
        return epc.wrapping_add(4);
    }
    let insn = Fields(branch);
    let slot = epc.wrapping_add(4);
    let fallthrough = epc.wrapping_add(8);
    let relative = slot.wrapping_add(insn.branch_offset());
    let rs = gpr[insn.rs()];
    let rt = gpr[insn.rt()];

    let taken = |cond: bool| if cond { relative } else { fallthrough };

    match insn.opcode() {
        OP_J => (slot & 0xf000_0000) | insn.jump_index(),
        OP_JAL => {
            link(gpr, RA, fallthrough);
            (slot & 0xf000_0000) | insn.jump_index()
        }
        OP_SPECIAL => match insn.funct() {
            FUNCT_JR => rs,
            FUNCT_JALR => {
                link(gpr, insn.rd(), fallthrough);
                rs
            }
            _ => fallthrough,
        },
        OP_BEQ | OP_BEQL => taken(rs == rt),
        OP_BNE | OP_BNEL => taken(rs != rt),
        OP_BLEZ | OP_BLEZL => taken(rs as i32 <= 0),
        OP_BGTZ | OP_BGTZL => taken(rs as i32 > 0),
        OP_REGIMM => match insn.rt() as u32 {
            RT_BLTZ | RT_BLTZL => taken((rs as i32) < 0),
            RT_BGEZ | RT_BGEZL => taken(rs as i32 >= 0),
            RT_BLTZAL | RT_BLTZALL => {
                link(gpr, RA, fallthrough);
                taken((rs as i32) < 0)
            }
            RT_BGEZAL | RT_BGEZALL => {
                link(gpr, RA, fallthrough);
                taken(rs as i32 >= 0)
            }
            _ => fallthrough,
        },
        _ => fallthrough,
    }
}
