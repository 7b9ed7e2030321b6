//! Iterative backward liveness analysis.
//!
//! Live-in sets feed two passes: interval construction builds precise
//! intervals with lifetime holes in a single backward sweep, and edge
//! resolution discovers which split intervals need copies on control-flow
//! edges.

use std::collections::VecDeque;

use bitvec::vec::BitVec;

use vex_target_x86::abi::Abi;
use vex_target_x86::effects::effects;
use vex_vir::cfg::{compute_preds, succs};
use vex_vir::inst::{Vlabel, Vtuple};
use vex_vir::reg::{PhysReg, RegClass, Vreg};
use vex_vir::unit::Vunit;
use vex_vir::visit::{OperandVisitor, visit_operands};

/// Bitset over Vreg IDs.
pub(crate) type LiveSet = BitVec;

fn renamed(r: Vreg, class: RegClass) -> Vreg {
    // Eagerly rename virtual flags to the singleton.
    if class == RegClass::Sf {
        Vreg::from(PhysReg::SF)
    } else {
        r
    }
}

struct LiveDefVisitor<'a> {
    tuples: &'a [Vec<Vreg>],
    live: &'a mut LiveSet,
}

impl OperandVisitor for LiveDefVisitor<'_> {
    fn def_reg(&mut self, r: Vreg, class: RegClass) {
        self.live.set(renamed(r, class).index(), false);
    }

    fn def_tuple(&mut self, t: Vtuple) {
        let tuples = self.tuples;
        for &r in &tuples[t.index()] {
            self.live.set(r.index(), false);
        }
    }
}

struct LiveUseVisitor<'a> {
    tuples: &'a [Vec<Vreg>],
    live: &'a mut LiveSet,
}

impl OperandVisitor for LiveUseVisitor<'_> {
    fn use_reg(&mut self, r: Vreg, class: RegClass) {
        self.live.set(renamed(r, class).index(), true);
    }

    fn across(&mut self, r: Vreg, class: RegClass) {
        self.use_reg(r, class);
    }

    fn use_tuple(&mut self, t: Vtuple) {
        let tuples = self.tuples;
        for &r in &tuples[t.index()] {
            self.live.set(r.index(), true);
        }
    }
}

/// Compute the live-in set of every block with a worklist over reverse
/// post-order, re-enqueueing predecessors whenever a live-in set grows.
pub(crate) fn compute_liveness(unit: &Vunit, abi: &Abi, blocks: &[Vlabel]) -> Vec<LiveSet> {
    let nv = unit.next_vreg as usize;
    let mut livein = vec![LiveSet::repeat(false, nv); unit.blocks.len()];
    let preds = compute_preds(unit);

    let mut worklist: VecDeque<Vlabel> = blocks.iter().rev().copied().collect();
    let mut queued = vec![true; unit.blocks.len()];

    while let Some(b) = worklist.pop_front() {
        queued[b.index()] = false;
        let block = &unit.blocks[b.index()];

        // Start with the union of the successor live-in sets.
        let mut live = LiveSet::repeat(false, nv);
        for &s in succs(block) {
            for i in livein[s.index()].iter_ones() {
                live.set(i, true);
            }
        }

        // Walk the block backward: defs kill, then uses (and across) gen.
        for inst in block.code.iter().rev() {
            let eff = effects(abi, inst);

            let mut dv = LiveDefVisitor {
                tuples: &unit.tuples,
                live: &mut live,
            };
            visit_operands(inst, &mut dv);
            dv.def_regset(eff.defs);

            let mut uv = LiveUseVisitor {
                tuples: &unit.tuples,
                live: &mut live,
            };
            visit_operands(inst, &mut uv);
            uv.use_regset(eff.uses);
            for r in eff.across.iter() {
                uv.across(r.into(), RegClass::Any);
            }
        }

        if live != livein[b.index()] {
            livein[b.index()] = live;
            for &p in &preds[b.index()] {
                if !queued[p.index()] {
                    queued[p.index()] = true;
                    worklist.push_back(p);
                }
            }
        }
    }

    livein
}
