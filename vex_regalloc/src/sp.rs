//! Stack-pointer offset analysis.

use vex_vir::inst::{Vinstr, Vlabel, Vop};
use vex_vir::reg::{PhysReg, Vreg};
use vex_vir::unit::Vunit;
use vex_vir::visit::visit_defs;

/// The effect this instruction has on the value of `sp`.
///
/// Asserts if an instruction mutates `sp` in an untrackable way.
pub(crate) fn sp_effect(unit: &Vunit, inst: &Vinstr, sp: PhysReg) -> i32 {
    let sp = Vreg::from(sp);
    match &inst.op {
        Vop::Push { .. } => -8,
        Vop::Pop { .. } => 8,
        Vop::Addqi { imm, s1, d, .. } if *d == sp => {
            assert_eq!(*s1, sp);
            *imm
        }
        Vop::Subqi { imm, s1, d, .. } if *d == sp => {
            assert_eq!(*s1, sp);
            -*imm
        }
        Vop::Lea { s, d } if *d == sp => {
            assert!(s.base == Some(sp) && s.index.is_none());
            s.disp
        }
        _ => {
            if cfg!(debug_assertions) {
                visit_defs(unit, inst, |r| {
                    assert!(r != sp, "untracked sp mutation by {}", inst.op.name())
                });
            }
            0
        }
    }
}

/// Offset from `sp` to the spill area at each block entry.
///
/// Propagated in block order; an already-visited successor must agree on
/// the offset, otherwise the unit is malformed.
pub(crate) fn analyze_sp(unit: &Vunit, blocks: &[Vlabel], sp: PhysReg) -> Vec<i32> {
    let mut visited = vec![false; unit.blocks.len()];
    let mut spill_offsets = vec![0i32; unit.blocks.len()];

    for &b in blocks {
        let mut offset = if visited[b.index()] {
            spill_offsets[b.index()]
        } else {
            0
        };
        for inst in &unit.blocks[b.index()].code {
            offset -= sp_effect(unit, inst, sp);
        }
        for &s in vex_vir::cfg::succs(&unit.blocks[b.index()]) {
            if visited[s.index()] {
                assert_eq!(
                    offset,
                    spill_offsets[s.index()],
                    "sp mismatch on edge {b}->{s}",
                );
            } else {
                spill_offsets[s.index()] = offset;
                visited[s.index()] = true;
            }
        }
    }
    spill_offsets
}
