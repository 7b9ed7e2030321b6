//! Post-allocation cleanup.
//!
//! Runs before spill-space allocation, which may change the CFG.

use vex_vir::inst::{Vinstr, Vop};
use vex_vir::reg::Vreg;
use vex_vir::unit::Vunit;

use crate::XlsContext;

fn match_xchg(inst: &Vinstr) -> Option<(Vreg, Vreg)> {
    if let Vop::Copy2 { s0, s1, d0, d1 } = inst.op {
        if s0 == d1 && s1 == d0 {
            return Some((s0, s1));
        }
    }
    None
}

fn is_trivial_nop(inst: &Vinstr) -> bool {
    match inst.op {
        Vop::Nop => true,
        Vop::Copy { s, d } => s == d,
        Vop::Copy2 { s0, s1, d0, d1 } => s0 == d0 && s1 == d1,
        _ => false,
    }
}

/// Collapse adjacent swap pairs that cancel each other, then drop trivial
/// nops and the phidef markers whose effect edge copies absorbed.
pub(crate) fn peephole(unit: &mut Vunit, ctx: &XlsContext) {
    for &b in &ctx.blocks {
        let code = &mut unit.blocks[b.index()].code;
        let mut i = 0;
        while i + 1 < code.len() {
            if let (Some((r0, r1)), Some((r2, r3))) = (match_xchg(&code[i]), match_xchg(&code[i + 1]))
            {
                if (r0 == r2 && r1 == r3) || (r0 == r3 && r1 == r2) {
                    code[i].op = Vop::Nop;
                    code[i + 1].op = Vop::Nop;
                    i += 1;
                }
            }
            i += 1;
        }
        code.retain(|inst| !is_trivial_nop(inst) && !matches!(inst.op, Vop::Phidef { .. }));
    }
}
