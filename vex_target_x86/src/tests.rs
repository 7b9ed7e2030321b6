//! Unit tests for the target description.

use vex_vir::inst::{Vinstr, Vop};
use vex_vir::reg::{PhysReg, RegSet};

use crate::abi::{RAX, RBX, RSP, abi, scratch, Target, xmm};
use crate::effects::effects;
use crate::slot_offset;

#[test]
fn abi_reserves_stack_registers() {
    let abi = abi();
    assert!(!abi.gp_unreserved.contains(RSP));
    assert!(abi.gp_unreserved.contains(RAX));
    assert!(abi.gp_unreserved.contains(RBX));
    assert!(abi.sf.contains(PhysReg::SF));
    assert_eq!(abi.sp, RSP);
}

#[test]
fn calls_clobber_caller_saved_only() {
    let abi = abi();
    let call = Vinstr::new(Vop::Call {
        target: 0x1000,
        args: RegSet::EMPTY,
    });
    let eff = effects(&abi, &call);
    assert!(eff.defs.contains(RAX));
    assert!(!eff.defs.contains(RBX));
    assert!(eff.defs.contains(xmm(0)));

    let nop = Vinstr::new(Vop::Nop);
    assert!(effects(&abi, &nop).defs.is_empty());
}

#[test]
fn scratch_is_simd() {
    assert_eq!(scratch(Target::X64), xmm(15));
}

#[test]
fn slot_offsets_are_dense() {
    assert_eq!(slot_offset(0), 0);
    assert_eq!(slot_offset(3), 24);
}
