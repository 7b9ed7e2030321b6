//! Operand renaming and copy/spill materialization.
//!
//! Renaming replaces every Vreg operand with the physical register of the
//! chain child covering the instruction's position. Materialization turns
//! the resolution plan into real instructions: stores for spills, a
//! sequenced series of moves and swaps for register copies, and direct
//! loads for constants and spill slots. Inserting destroys the position
//! numbering, so nothing may consult interval positions afterwards.

use vex_target_x86::slot_offset;
use vex_vir::inst::{Segment, Vinstr, Vop, Vptr};
use vex_vir::reg::{PhysReg, RegClass, Vreg};
use vex_vir::unit::Vunit;

use crate::XlsContext;
use crate::interval::{IntervalId, Intervals};
use crate::moves::{MoveKind, MovePlan, do_reg_moves};
use crate::resolve::{CopyPlan, ResolutionPlan};
use crate::sp::sp_effect;

/// Rewrite every virtual operand to its assigned physical register.
pub(crate) fn rename_operands(unit: &mut Vunit, ctx: &XlsContext, intervals: &Intervals) {
    for &b in &ctx.blocks {
        let mut pos = ctx.block_ranges[b.index()].start;
        let mut code = std::mem::take(&mut unit.blocks[b.index()].code);
        for inst in &mut code {
            vex_vir::visit::visit_regs_mut(inst, &mut |r: &mut Vreg, class: RegClass| {
                *r = lookup(intervals, *r, class, pos);
            });
            pos += 2;
        }
        unit.blocks[b.index()].code = code;
    }
}

fn lookup(intervals: &Intervals, r: Vreg, class: RegClass, pos: u32) -> Vreg {
    if class == RegClass::Sf {
        return PhysReg::SF.into();
    }
    if r.is_phys() {
        return r;
    }
    let Some(root) = intervals.for_vreg(r) else {
        return r;
    };
    let child = intervals
        .child_at(root, pos)
        .expect("operand has no live child at its position");
    let reg = intervals
        .get(child)
        .reg
        .expect("operand not in a register");
    debug_assert!(match class {
        RegClass::Gpr => reg.is_gp(),
        RegClass::Simd | RegClass::SimdWide => reg.is_simd(),
        RegClass::Sf => reg.is_sf(),
        RegClass::Any => true,
    });
    reg.into()
}

/// Emit stores for the spill plan at `pos` into `out`.
fn insert_spills_at(
    out: &mut Vec<Vinstr>,
    plan: &CopyPlan,
    intervals: &Intervals,
    sp: PhysReg,
    sp_offset: i32,
    pos: u32,
) {
    for (src, id) in plan.iter() {
        let ivl = intervals.get(id);
        let slot = intervals
            .get(intervals.leader(id))
            .slot
            .expect("spill store without a slot");
        debug_assert_eq!(ivl.reg, Some(src));
        let ptr = Vptr::base_disp(sp, sp_offset + slot_offset(slot));
        if !ivl.wide {
            assert!(!src.is_sf(), "tried to spill the flags register");
            out.push(Vinstr {
                op: Vop::Store { s: src.into(), d: ptr },
                pos,
            });
        } else {
            debug_assert!(src.is_simd());
            out.push(Vinstr {
                op: Vop::Storeups { s: src.into(), d: ptr },
                pos,
            });
        }
    }
}

/// Emit register moves, constant loads, and slot reloads for the copy plan
/// at `pos` into `out`.
fn insert_copies_at(
    out: &mut Vec<Vinstr>,
    plan: &CopyPlan,
    intervals: &Intervals,
    ctx: &XlsContext,
    sp_offset: i32,
    pos: u32,
    sf_root: Option<IntervalId>,
) {
    // A zero load may become xor only where flags are dead.
    let sf_live = sf_root.is_some_and(|id| {
        let ivl = intervals.get(id);
        !ivl.ranges.is_empty() && ivl.covers(pos)
    });

    let mut moves: MovePlan = [None; vex_vir::reg::NUM_PHYS];
    let mut loads: Vec<Vop> = Vec::new();

    for (dst, id) in plan.iter() {
        let ivl = intervals.get(id);
        if let Some(src) = ivl.reg {
            moves[dst.index()] = Some(src);
        } else if ivl.constant {
            let val = ivl.val.expect("constant interval without a value");
            if val.undef {
                continue;
            }
            let use_xor = val.val == 0 && dst.is_gp() && !sf_live;
            let sf = Vreg::from(PhysReg::SF);
            match val.kind {
                vex_vir::inst::VconstKind::Quad | vex_vir::inst::VconstKind::Double => {
                    if use_xor {
                        // A 32-bit op zeroes the upper bits.
                        loads.push(Vop::Xorl {
                            s0: dst.into(),
                            s1: dst.into(),
                            d: dst.into(),
                            sf,
                        });
                    } else {
                        loads.push(Vop::Ldimmq { imm: val.val, d: dst.into() });
                    }
                }
                vex_vir::inst::VconstKind::Long => {
                    if use_xor {
                        loads.push(Vop::Xorl {
                            s0: dst.into(),
                            s1: dst.into(),
                            d: dst.into(),
                            sf,
                        });
                    } else {
                        loads.push(Vop::Ldimml {
                            imm: val.val as i32,
                            d: dst.into(),
                        });
                    }
                }
                vex_vir::inst::VconstKind::Byte => {
                    if use_xor {
                        loads.push(Vop::Xorb {
                            s0: dst.into(),
                            s1: dst.into(),
                            d: dst.into(),
                            sf,
                        });
                    } else {
                        loads.push(Vop::Ldimmb {
                            imm: val.val as u8,
                            d: dst.into(),
                        });
                    }
                }
                vex_vir::inst::VconstKind::ThreadLocal => {
                    loads.push(Vop::Load {
                        s: Vptr::baseless(val.val as i32).seg(Segment::Fs),
                        d: dst.into(),
                    });
                }
            }
        } else {
            debug_assert!(ivl.spilled());
            let slot = ivl.slot.expect("reload without a slot");
            let ptr = Vptr::base_disp(ctx.sp, sp_offset + slot_offset(slot));
            if !ivl.wide {
                loads.push(Vop::Load { s: ptr, d: dst.into() });
            } else {
                debug_assert!(dst.is_simd());
                loads.push(Vop::Loadups { s: ptr, d: dst.into() });
            }
        }
    }

    for how in do_reg_moves(moves, ctx.tmp) {
        let op = match how.kind {
            MoveKind::Move => Vop::Copy {
                s: how.src.into(),
                d: how.dst.into(),
            },
            MoveKind::Xchg => Vop::Copy2 {
                s0: how.src.into(),
                s1: how.dst.into(),
                d0: how.dst.into(),
                d1: how.src.into(),
            },
        };
        out.push(Vinstr { op, pos });
    }
    for op in loads {
        out.push(Vinstr { op, pos });
    }
}

/// Materialize the resolution plan into the instruction stream.
pub(crate) fn insert_copies(
    unit: &mut Vunit,
    ctx: &XlsContext,
    intervals: &Intervals,
    plan: &ResolutionPlan,
) {
    // The flags singleton interval, for the xor rewrite.
    let sf_root = intervals.for_vreg(PhysReg::SF.into());

    // Copies and spills inside blocks. Spills were recorded one past the
    // def, so they are inserted before the following instruction.
    for &b in &ctx.blocks {
        let bi = b.index();
        let deltas: Vec<i32> = unit.blocks[bi]
            .code
            .iter()
            .map(|inst| sp_effect(unit, inst, ctx.sp))
            .collect();

        let code = std::mem::take(&mut unit.blocks[bi].code);
        let mut out = Vec::with_capacity(code.len());
        let mut pos = ctx.block_ranges[bi].start;
        let mut offset = ctx.spill_offsets[bi];

        for (j, inst) in code.into_iter().enumerate() {
            if pos > 0 {
                if let Some(spills) = plan.spills.get(&(pos - 1)) {
                    insert_spills_at(&mut out, spills, intervals, ctx.sp, offset, pos - 1);
                }
                if let Some(copies) = plan.copies.get(&(pos - 1)) {
                    insert_copies_at(&mut out, copies, intervals, ctx, offset, pos - 1, sf_root);
                }
            }
            if let Some(copies) = plan.copies.get(&pos) {
                insert_copies_at(&mut out, copies, intervals, ctx, offset, pos, sf_root);
            }
            offset -= deltas[j];
            out.push(inst);
            pos += 2;
        }
        unit.blocks[bi].code = out;
    }

    // Copies on edges: a lone successor takes them at the end of the
    // source block; otherwise they go to the front of each successor,
    // which critical-edge splitting has made sole-predecessor.
    for &b in &ctx.blocks {
        let succlist: Vec<_> = vex_vir::cfg::succs(&unit.blocks[b.index()]).to_vec();
        if succlist.len() == 1 {
            if let Some(copies) = plan.edge_copies.get(&(b, 0)) {
                let mut insts = Vec::new();
                insert_copies_at(
                    &mut insts,
                    copies,
                    intervals,
                    ctx,
                    ctx.spill_offsets[succlist[0].index()],
                    ctx.block_ranges[b.index()].end - 1,
                    sf_root,
                );
                let code = &mut unit.blocks[b.index()].code;
                let at = code.len() - 1;
                code.splice(at..at, insts);
            }
        } else {
            for (i, &s) in succlist.iter().enumerate() {
                if let Some(copies) = plan.edge_copies.get(&(b, i as u32)) {
                    let mut insts = Vec::new();
                    insert_copies_at(
                        &mut insts,
                        copies,
                        intervals,
                        ctx,
                        ctx.spill_offsets[s.index()],
                        ctx.block_ranges[s.index()].start,
                        sf_root,
                    );
                    let code = &mut unit.blocks[s.index()].code;
                    code.splice(0..0, insts);
                }
            }
        }
    }
}
