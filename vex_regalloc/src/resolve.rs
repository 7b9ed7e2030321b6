//! Lifetime resolution: decide where copies and spill stores must go.
//!
//! After allocation, a split lifetime may change location between adjacent
//! sub-intervals and across control-flow edges. Three passes fill a
//! [`ResolutionPlan`]: split resolution (stores after spilled defs, copies
//! between adjacent children inside a block), copy lowering (explicit
//! copy instructions become plan entries and nops), and edge resolution
//! (phi jumps and live-in reconciliation). Copies recorded at one position
//! are parallel: all sources read before any destination is written.

use std::collections::HashMap;

use vex_vir::inst::{Vlabel, Vop, Vtuple};
use vex_vir::reg::{NUM_PHYS, PhysReg, Vreg};
use vex_vir::unit::Vunit;

use crate::XlsContext;
use crate::interval::{IntervalId, Intervals};

/// Copies required at one position or edge: destination register to source
/// interval (register, constant, or spill slot).
#[derive(Clone)]
pub(crate) struct CopyPlan([Option<IntervalId>; NUM_PHYS]);

impl Default for CopyPlan {
    fn default() -> CopyPlan {
        CopyPlan([None; NUM_PHYS])
    }
}

impl CopyPlan {
    pub fn get(&self, r: PhysReg) -> Option<IntervalId> {
        self.0[r.index()]
    }

    pub fn set(&mut self, r: PhysReg, src: IntervalId) {
        self.0[r.index()] = Some(src);
    }

    pub fn iter(&self) -> impl Iterator<Item = (PhysReg, IntervalId)> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, id)| id.map(|id| (PhysReg(i as u8), id)))
    }
}

/// Where copies and spills must be inserted.
#[derive(Default)]
pub(crate) struct ResolutionPlan {
    /// Copies between instructions, keyed by position.
    pub copies: HashMap<u32, CopyPlan>,
    /// Spill stores, keyed by position (one past each spilled def).
    pub spills: HashMap<u32, CopyPlan>,
    /// Copies on edges, keyed by source block and successor index.
    pub edge_copies: HashMap<(Vlabel, u32), CopyPlan>,
}

/// Record a store one position after the def of a spilled chain. SSA means
/// there is exactly one such position.
fn insert_spill(ctx: &XlsContext, plan: &mut ResolutionPlan, intervals: &Intervals, root: IntervalId) {
    let ivl = intervals.get(root);
    let pos = ivl.def_pos + 1;
    debug_assert!(pos % 2 == 1);
    debug_assert!({
        let range = ctx.block_ranges[ctx.block_for(pos).index()];
        pos - 1 >= range.start && pos + 1 < range.end
    });
    let src = ivl.reg.expect("spilled def not in a register");
    plan.spills.entry(pos).or_default().set(src, root);
}

/// Spill stores and copies connecting sub-intervals split inside a block.
fn resolve_splits(ctx: &XlsContext, intervals: &Intervals, plan: &mut ResolutionPlan) {
    for root in intervals.roots() {
        if intervals.get(root).slot.is_some() {
            insert_spill(ctx, plan, intervals, root);
        }

        let mut i1 = root;
        while let Some(i2) = intervals.get(i1).next {
            let a = intervals.get(i1);
            let b = intervals.get(i2);
            let pos = b.start();
            // A copy is needed only for directly adjacent children where
            // the later one is in a (different) register; holes reload at
            // the next use instead.
            if a.end() == pos
                && b.reg.is_some()
                && b.reg != a.reg
            {
                let label = ctx.block_for(pos);
                let range = ctx.block_ranges[label.index()];
                if pos % 2 == 0 {
                    // An even position needing a copy must be a block edge,
                    // which edge resolution handles.
                    debug_assert_eq!(pos, range.start);
                } else {
                    debug_assert!(pos > range.start);
                    if pos + 1 != range.end {
                        plan.copies.entry(pos).or_default().set(b.reg.unwrap(), i1);
                    }
                    // else: the copy belongs on the successor edge.
                }
            }
            i1 = i2;
        }
    }
}

/// Lower explicit copy instructions into plan entries at their positions.
fn lower_copies(
    unit: &mut Vunit,
    ctx: &XlsContext,
    intervals: &Intervals,
    plan: &mut ResolutionPlan,
) {
    let lower = |plan: &mut ResolutionPlan, pos: u32, s: Vreg, d: Vreg| {
        let i1 = intervals.for_vreg(s).expect("copy source has no interval");
        let i2 = intervals.for_vreg(d).expect("copy dest has no interval");
        debug_assert!(intervals.get(i2).parent.is_none());
        debug_assert!(intervals.get(i2).fixed() || intervals.get(i2).def_pos == pos);

        let i1 = if intervals.get(i1).fixed() {
            i1
        } else {
            intervals.child_at(i1, pos).expect("copy source not live")
        };

        let s_reg = intervals.get(i1).reg;
        let d_reg = intervals.get(i2).reg;
        if d_reg != s_reg {
            let d_reg = d_reg.expect("copy dest not in a register");
            let at = plan.copies.entry(pos).or_default();
            debug_assert!(at.get(d_reg).is_none());
            at.set(d_reg, i1);
        }
    };

    for &b in &ctx.blocks {
        let mut pos = ctx.block_ranges[b.index()].start;
        for j in 0..unit.blocks[b.index()].code.len() {
            match unit.blocks[b.index()].code[j].op.clone() {
                Vop::Copyargs { s, d } => {
                    for k in 0..unit.tuples[s.index()].len() {
                        let (sr, dr) = (unit.tuples[s.index()][k], unit.tuples[d.index()][k]);
                        lower(plan, pos, sr, dr);
                    }
                    unit.blocks[b.index()].code[j].op = Vop::Nop;
                }
                Vop::Copy2 { s0, s1, d0, d1 } => {
                    lower(plan, pos, s0, d0);
                    lower(plan, pos, s1, d1);
                    unit.blocks[b.index()].code[j].op = Vop::Nop;
                }
                Vop::Copy { s, d } => {
                    lower(plan, pos, s, d);
                    unit.blocks[b.index()].code[j].op = Vop::Nop;
                }
                _ => {}
            }
            pos += 2;
        }
    }
}

/// The dest tuple of the phidef that must open block `b`.
fn find_phi_defs(unit: &Vunit, b: Vlabel) -> Vtuple {
    match unit.blocks[b.index()].code.first().map(|i| &i.op) {
        Some(Vop::Phidef { defs }) => *defs,
        _ => panic!("phi target {b} does not start with a phidef"),
    }
}

fn add_phi_edge_copies(
    unit: &Vunit,
    ctx: &XlsContext,
    intervals: &Intervals,
    plan: &mut ResolutionPlan,
    block: Vlabel,
    target: Vlabel,
    target_index: u32,
    uses: Vtuple,
) {
    let p1 = ctx.block_ranges[block.index()].end - 2;
    let defs = find_phi_defs(unit, target);

    for k in 0..unit.tuples[uses.index()].len() {
        let s = unit.tuples[uses.index()][k];
        let d = unit.tuples[defs.index()][k];
        let i1 = intervals.for_vreg(s).expect("phi source has no interval");
        let i2 = intervals.for_vreg(d).expect("phi dest has no interval");
        debug_assert!(intervals.get(i2).parent.is_none());

        let i1 = if intervals.get(i1).fixed() {
            i1
        } else {
            intervals.child_at(i1, p1).expect("phi source not live at jump")
        };

        if intervals.get(i2).reg != intervals.get(i1).reg {
            let d_reg = intervals.get(i2).reg.expect("phi dest not in a register");
            let at = plan.edge_copies.entry((block, target_index)).or_default();
            debug_assert!(at.get(d_reg).is_none());
            at.set(d_reg, i1);
        }
    }
}

/// Copy resolutions for phis and live-in sets; phi jumps lower to their
/// non-phi equivalents.
fn resolve_edges(
    unit: &mut Vunit,
    ctx: &XlsContext,
    intervals: &Intervals,
    plan: &mut ResolutionPlan,
) {
    for &b1 in &ctx.blocks {
        let p1 = ctx.block_ranges[b1.index()].end - 2;

        match unit.blocks[b1.index()].code.last().unwrap().op.clone() {
            Vop::Phijmp { target, uses } => {
                add_phi_edge_copies(unit, ctx, intervals, plan, b1, target, 0, uses);
                unit.blocks[b1.index()].code.last_mut().unwrap().op = Vop::Jmp { target };
            }
            Vop::Phijcc { cc, sf, targets, uses } => {
                add_phi_edge_copies(unit, ctx, intervals, plan, b1, targets[0], 0, uses);
                add_phi_edge_copies(unit, ctx, intervals, plan, b1, targets[1], 1, uses);
                unit.blocks[b1.index()].code.last_mut().unwrap().op =
                    Vop::Jcc { cc, sf, targets };
            }
            _ => {}
        }

        let succlist: Vec<Vlabel> = vex_vir::cfg::succs(&unit.blocks[b1.index()]).to_vec();
        for (i, &b2) in succlist.iter().enumerate() {
            let p2 = ctx.block_ranges[b2.index()].start;
            for vr in ctx.livein[b2.index()].iter_ones() {
                let root = intervals
                    .for_vreg(Vreg(vr as u32))
                    .expect("live-in vreg has no interval");
                if intervals.get(root).fixed() {
                    continue;
                }

                let mut i1 = None;
                let mut i2 = None;
                let mut cur = Some(root);
                while let Some(id) = cur {
                    if i1.is_some() && i2.is_some() {
                        break;
                    }
                    let ivl = intervals.get(id);
                    if ivl.covers(p1) {
                        i1 = Some(id);
                    }
                    if ivl.covers(p2) {
                        i2 = Some(id);
                    }
                    cur = ivl.next;
                }
                let i1 = i1.expect("live-in value not live out of predecessor");
                let i2 = i2.expect("live-in value not live into successor");

                // i2 can be unallocated when the value is a constant or
                // spilled; it reloads at its next use instead.
                if let Some(d_reg) = intervals.get(i2).reg {
                    if intervals.get(i1).reg != Some(d_reg) {
                        let at = plan.edge_copies.entry((b1, i as u32)).or_default();
                        debug_assert!(at.get(d_reg).is_none());
                        at.set(d_reg, i1);
                    }
                }
            }
        }
    }
}

/// Account for every point where copies or spills are needed.
pub(crate) fn resolve_lifetimes(
    unit: &mut Vunit,
    ctx: &XlsContext,
    intervals: &Intervals,
) -> ResolutionPlan {
    let mut plan = ResolutionPlan::default();
    resolve_splits(ctx, intervals, &mut plan);
    lower_copies(unit, ctx, intervals, &mut plan);
    resolve_edges(unit, ctx, intervals, &mut plan);
    plan
}
