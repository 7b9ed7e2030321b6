//! VIR instruction definitions.

use std::fmt;
use std::slice;

use crate::reg::{RegSet, Vreg};

/// A basic block label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vlabel(pub u32);

impl Vlabel {
    /// Sentinel for a branch target that has not been wired up yet.
    pub const INVALID: Vlabel = Vlabel(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Vlabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Index of a register tuple in [`crate::unit::Vunit::tuples`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vtuple(pub u32);

impl Vtuple {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Opaque key naming a translation exit outside the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitKey(pub u64);

/// Code area a block belongs to. Cold blocks sort after main blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Area {
    Main,
    Cold,
}

/// Condition codes for conditional branches and exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionCode {
    E,
    Ne,
    L,
    Le,
    G,
    Ge,
    B,
    Be,
    A,
    Ae,
    S,
    Ns,
}

/// Segment override for memory operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Fs,
}

/// A memory operand: `seg:[base + index*scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vptr {
    pub base: Option<Vreg>,
    pub index: Option<Vreg>,
    pub scale: u8,
    pub disp: i32,
    pub seg: Option<Segment>,
}

impl Vptr {
    pub fn base_disp(base: impl Into<Vreg>, disp: i32) -> Vptr {
        Vptr {
            base: Some(base.into()),
            index: None,
            scale: 1,
            disp,
            seg: None,
        }
    }

    pub fn baseless(disp: i32) -> Vptr {
        Vptr {
            base: None,
            index: None,
            scale: 1,
            disp,
            seg: None,
        }
    }

    pub fn seg(mut self, seg: Segment) -> Vptr {
        self.seg = Some(seg);
        self
    }
}

/// Kind of a compile-time constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VconstKind {
    Byte,
    Long,
    Quad,
    Double,
    /// Offset into thread-local storage; reloaded with a segment load.
    ThreadLocal,
}

/// A compile-time constant bound to a Vreg via the unit's constant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vconst {
    pub kind: VconstKind,
    pub val: u64,
    pub undef: bool,
}

impl Vconst {
    pub fn byte(val: u8) -> Vconst {
        Vconst {
            kind: VconstKind::Byte,
            val: val as u64,
            undef: false,
        }
    }

    pub fn long(val: i32) -> Vconst {
        Vconst {
            kind: VconstKind::Long,
            val: val as u32 as u64,
            undef: false,
        }
    }

    pub fn quad(val: u64) -> Vconst {
        Vconst {
            kind: VconstKind::Quad,
            val,
            undef: false,
        }
    }

    pub fn double(bits: u64) -> Vconst {
        Vconst {
            kind: VconstKind::Double,
            val: bits,
            undef: false,
        }
    }

    /// A value whose contents are never observed; materializes no load.
    pub fn undef() -> Vconst {
        Vconst {
            kind: VconstKind::Quad,
            val: 0,
            undef: true,
        }
    }
}

/// An instruction plus the linear position assigned by the allocator.
///
/// Positions are even; odd positions between instructions are reserved for
/// inserted copies and spills.
#[derive(Debug, Clone)]
pub struct Vinstr {
    pub op: Vop,
    pub pos: u32,
}

impl Vinstr {
    pub fn new(op: Vop) -> Vinstr {
        Vinstr { op, pos: 0 }
    }
}

impl From<Vop> for Vinstr {
    fn from(op: Vop) -> Vinstr {
        Vinstr::new(op)
    }
}

/// Instruction opcodes.
///
/// Copy-like instructions (`Copy`, `Copy2`, `Copyargs`, the phi jumps) are
/// lowered by the allocator into parallel copy plans and never survive it.
#[derive(Debug, Clone)]
pub enum Vop {
    // Copies and phis.
    Copy { s: Vreg, d: Vreg },
    Copy2 { s0: Vreg, s1: Vreg, d0: Vreg, d1: Vreg },
    Copyargs { s: Vtuple, d: Vtuple },
    Phijmp { target: Vlabel, uses: Vtuple },
    Phijcc { cc: ConditionCode, sf: Vreg, targets: [Vlabel; 2], uses: Vtuple },
    Phidef { defs: Vtuple },

    // Constant loads.
    Ldimmb { imm: u8, d: Vreg },
    Ldimml { imm: i32, d: Vreg },
    Ldimmq { imm: u64, d: Vreg },

    // Memory.
    Load { s: Vptr, d: Vreg },
    Store { s: Vreg, d: Vptr },
    Loadups { s: Vptr, d: Vreg },
    Storeups { s: Vreg, d: Vptr },
    Lea { s: Vptr, d: Vreg },

    // Arithmetic and flags.
    Addq { s0: Vreg, s1: Vreg, d: Vreg, sf: Vreg },
    Addqi { imm: i32, s1: Vreg, d: Vreg, sf: Vreg },
    Subq { s0: Vreg, s1: Vreg, d: Vreg, sf: Vreg },
    Subqi { imm: i32, s1: Vreg, d: Vreg, sf: Vreg },
    Cmpq { s0: Vreg, s1: Vreg, sf: Vreg },
    Testq { s0: Vreg, s1: Vreg, sf: Vreg },
    Xorl { s0: Vreg, s1: Vreg, d: Vreg, sf: Vreg },
    Xorb { s0: Vreg, s1: Vreg, d: Vreg, sf: Vreg },

    // Stack.
    Push { s: Vreg },
    Pop { d: Vreg },

    // Control flow inside the unit.
    Jmp { target: Vlabel },
    Jcc { cc: ConditionCode, sf: Vreg, targets: [Vlabel; 2] },
    /// Conditional jump to an immediate address; falls through to `target`.
    Jcci { cc: ConditionCode, sf: Vreg, target: Vlabel, taken: u64 },
    Call { target: u64, args: RegSet },
    Ret { args: RegSet },

    // Unit exits.
    Jmpi { target: u64 },
    Fallback { target: ExitKey, args: RegSet },
    Fallbackcc { cc: ConditionCode, sf: Vreg, target: ExitKey },
    Bindjmp { target: ExitKey, args: RegSet },
    Bindjcc { cc: ConditionCode, sf: Vreg, target: ExitKey },

    Ud2,
    Nop,
}

impl Vop {
    /// Whether this instruction ends a basic block.
    ///
    /// `Fallbackcc` and `Bindjcc` exit the unit on a hidden edge but fall
    /// through inside it, so they do not end a block.
    pub fn is_block_end(&self) -> bool {
        matches!(
            self,
            Vop::Jmp { .. }
                | Vop::Jcc { .. }
                | Vop::Jcci { .. }
                | Vop::Phijmp { .. }
                | Vop::Phijcc { .. }
                | Vop::Jmpi { .. }
                | Vop::Fallback { .. }
                | Vop::Bindjmp { .. }
                | Vop::Ret { .. }
                | Vop::Ud2
        )
    }

    /// In-unit successor labels of a block-end instruction.
    pub fn succs(&self) -> &[Vlabel] {
        match self {
            Vop::Jmp { target } | Vop::Phijmp { target, .. } | Vop::Jcci { target, .. } => {
                slice::from_ref(target)
            }
            Vop::Jcc { targets, .. } | Vop::Phijcc { targets, .. } => targets,
            _ => &[],
        }
    }

    /// Mutable view of the successor labels, for edge rewriting.
    pub fn succs_mut(&mut self) -> &mut [Vlabel] {
        match self {
            Vop::Jmp { target } | Vop::Phijmp { target, .. } | Vop::Jcci { target, .. } => {
                slice::from_mut(target)
            }
            Vop::Jcc { targets, .. } | Vop::Phijcc { targets, .. } => targets,
            _ => &mut [],
        }
    }

    /// Mnemonic, for printing.
    pub fn name(&self) -> &'static str {
        match self {
            Vop::Copy { .. } => "copy",
            Vop::Copy2 { .. } => "copy2",
            Vop::Copyargs { .. } => "copyargs",
            Vop::Phijmp { .. } => "phijmp",
            Vop::Phijcc { .. } => "phijcc",
            Vop::Phidef { .. } => "phidef",
            Vop::Ldimmb { .. } => "ldimmb",
            Vop::Ldimml { .. } => "ldimml",
            Vop::Ldimmq { .. } => "ldimmq",
            Vop::Load { .. } => "load",
            Vop::Store { .. } => "store",
            Vop::Loadups { .. } => "loadups",
            Vop::Storeups { .. } => "storeups",
            Vop::Lea { .. } => "lea",
            Vop::Addq { .. } => "addq",
            Vop::Addqi { .. } => "addqi",
            Vop::Subq { .. } => "subq",
            Vop::Subqi { .. } => "subqi",
            Vop::Cmpq { .. } => "cmpq",
            Vop::Testq { .. } => "testq",
            Vop::Xorl { .. } => "xorl",
            Vop::Xorb { .. } => "xorb",
            Vop::Push { .. } => "push",
            Vop::Pop { .. } => "pop",
            Vop::Jmp { .. } => "jmp",
            Vop::Jcc { .. } => "jcc",
            Vop::Jcci { .. } => "jcci",
            Vop::Call { .. } => "call",
            Vop::Ret { .. } => "ret",
            Vop::Jmpi { .. } => "jmpi",
            Vop::Fallback { .. } => "fallback",
            Vop::Fallbackcc { .. } => "fallbackcc",
            Vop::Bindjmp { .. } => "bindjmp",
            Vop::Bindjcc { .. } => "bindjcc",
            Vop::Ud2 => "ud2",
            Vop::Nop => "nop",
        }
    }
}
