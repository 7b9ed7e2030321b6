//! x86-64 ABI description.

use vex_vir::reg::{NUM_GP, PhysReg, RegSet};

pub const RAX: PhysReg = PhysReg(0);
pub const RCX: PhysReg = PhysReg(1);
pub const RDX: PhysReg = PhysReg(2);
pub const RBX: PhysReg = PhysReg(3);
pub const RSP: PhysReg = PhysReg(4);
pub const RBP: PhysReg = PhysReg(5);
pub const RSI: PhysReg = PhysReg(6);
pub const RDI: PhysReg = PhysReg(7);
pub const R8: PhysReg = PhysReg(8);
pub const R9: PhysReg = PhysReg(9);
pub const R10: PhysReg = PhysReg(10);
pub const R11: PhysReg = PhysReg(11);
pub const R12: PhysReg = PhysReg(12);
pub const R13: PhysReg = PhysReg(13);
pub const R14: PhysReg = PhysReg(14);
pub const R15: PhysReg = PhysReg(15);

/// The n-th SIMD register.
pub const fn xmm(n: u8) -> PhysReg {
    PhysReg(NUM_GP + n)
}

/// Register sets and special registers the allocator needs from a target.
#[derive(Debug, Clone)]
pub struct Abi {
    /// General-purpose registers available for allocation.
    pub gp_unreserved: RegSet,
    /// General-purpose registers the allocator must not touch.
    pub gp_reserved: RegSet,
    /// SIMD registers available for allocation.
    pub simd_unreserved: RegSet,
    /// SIMD registers the allocator must not touch.
    pub simd_reserved: RegSet,
    /// Registers destroyed by a call.
    pub calls_clobber: RegSet,
    /// The flags singleton, as a set.
    pub sf: RegSet,
    /// Stack pointer.
    pub sp: PhysReg,
    /// Whether the unit may use the stack spill area.
    pub can_spill: bool,
}

impl Abi {
    /// All allocatable registers, flags included.
    pub fn unreserved(&self) -> RegSet {
        self.gp_unreserved | self.simd_unreserved | self.sf
    }
}

/// The standard x86-64 ABI: rsp and rbp reserved, everything else
/// allocatable. Caller-saved registers follow the SysV convention; all
/// SIMD registers are caller-saved.
pub fn abi() -> Abi {
    let gp_reserved = RegSet::from_regs(&[RSP, RBP]);
    let gp_all = RegSet::from_regs(&[
        RAX, RCX, RDX, RBX, RSP, RBP, RSI, RDI, R8, R9, R10, R11, R12, R13, R14, R15,
    ]);
    let simd_all = {
        let mut set = RegSet::EMPTY;
        for n in 0..16 {
            set.add(xmm(n));
        }
        set
    };
    let gp_caller_saved = RegSet::from_regs(&[RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11]);

    Abi {
        gp_unreserved: gp_all - gp_reserved,
        gp_reserved,
        simd_unreserved: simd_all,
        simd_reserved: RegSet::EMPTY,
        calls_clobber: gp_caller_saved | simd_all,
        sf: RegSet::EMPTY.with(PhysReg::SF),
        sp: RSP,
        can_spill: true,
    }
}

/// Architectures the allocator can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    #[default]
    X64,
    Ppc64,
}

/// The register reserved for breaking parallel-copy cycles.
pub fn scratch(target: Target) -> PhysReg {
    match target {
        Target::X64 => xmm(15),
        Target::Ppc64 => unimplemented!("ppc64 backend"),
    }
}
