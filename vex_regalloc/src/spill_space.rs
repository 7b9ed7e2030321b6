//! Spill-space activation.
//!
//! If the unit used any spill slots, stack space must be created before
//! the first instruction that touches it and destroyed before control
//! leaves the unit. Conditional unit-exit instructions hide an edge out of
//! the unit; when one sits in a spill-live region, the edge is made
//! explicit with a conditional branch to a cold stub that frees the space
//! and exits. Allocation is deliberately as late as possible so exits that
//! never see live spill space stay cheap.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use vex_target_x86::slot_offset;
use vex_vir::cfg::succs;
use vex_vir::inst::{Area, Vinstr, Vlabel, Vop, Vptr};
use vex_vir::reg::{PhysReg, RegSet, Vreg};
use vex_vir::unit::Vunit;
use vex_vir::visit::{visit_defs, visit_uses};

use crate::alloc::SpillInfo;
use crate::{Options, XlsContext};

/// State of the spill area before an instruction. Transitions only move to
/// higher values, so merging is `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SpillState {
    /// Block in-states start here.
    Uninit,
    /// Spill space not needed yet; safe to allocate after this point.
    NoSpill,
    /// Spill space must exist at or before this point.
    NeedSpill,
}

use SpillState::*;

#[derive(Debug, Clone, Copy)]
struct SpillStates {
    entry: SpillState,
    exit: SpillState,
}

/// Spill space must exist before any instruction that reads or writes sp.
fn instr_needs_spill(unit: &Vunit, inst: &Vinstr, sp: PhysReg) -> bool {
    if matches!(inst.op, Vop::Push { .. } | Vop::Pop { .. }) {
        return true;
    }
    let sp = Vreg::from(sp);
    let mut found = false;
    visit_defs(unit, inst, |r| {
        if r == sp {
            found = true;
        }
    });
    if found {
        return true;
    }
    visit_uses(unit, inst, |r| {
        if r == sp {
            found = true;
        }
    });
    found
}

/// The state required coming into `inst`. `prev` must not be Uninit.
fn instr_in_state(unit: &Vunit, inst: &Vinstr, prev: SpillState, sp: PhysReg) -> SpillState {
    match prev {
        Uninit => unreachable!("uninitialized spill state"),
        NoSpill => {
            if instr_needs_spill(unit, inst, sp) {
                NeedSpill
            } else {
                NoSpill
            }
        }
        NeedSpill => NeedSpill,
    }
}

fn merge_spill_states(dst: &mut SpillState, src: SpillState) -> bool {
    debug_assert_ne!(src, Uninit);
    if *dst == src {
        return false;
    }
    let old = *dst;
    *dst = (*dst).max(src);
    *dst != old
}

/// Rewrite conditional unit-exits in spill-live regions.
///
/// A `fallbackcc`/`bindjcc` in such a region becomes a `jcc` to a new cold
/// block that frees spill space and performs the unconditional exit; a
/// `jcci` branches to a cold block that frees and jumps to its immediate
/// target. The jcc's fall-through is left invalid and patched by
/// [`fixup_block_jumps`].
fn process_spill_exits(unit: &mut Vunit, label: Vlabel, mut state: SpillState, free: &Vop, sp: PhysReg) {
    let mut need_fixup = false;

    let mut j = 0;
    while j < unit.blocks[label.index()].code.len() {
        state = instr_in_state(unit, &unit.blocks[label.index()].code[j], state, sp);
        if state < NeedSpill {
            j += 1;
            continue;
        }
        let op = unit.blocks[label.index()].code[j].op.clone();
        match op {
            Vop::Fallbackcc { cc, sf, target } => {
                log::trace!("breaking spill exit out of {label}");
                let cold = unit.make_block(Area::Cold);
                unit.block_mut(cold).code.push(Vinstr::new(free.clone()));
                unit.block_mut(cold).code.push(Vinstr::new(Vop::Fallback {
                    target,
                    args: RegSet::EMPTY,
                }));
                unit.blocks[label.index()].code[j].op = Vop::Jcc {
                    cc,
                    sf,
                    targets: [Vlabel::INVALID, cold],
                };
                need_fixup = true;
            }
            Vop::Bindjcc { cc, sf, target } => {
                log::trace!("breaking spill exit out of {label}");
                let cold = unit.make_block(Area::Cold);
                unit.block_mut(cold).code.push(Vinstr::new(free.clone()));
                unit.block_mut(cold).code.push(Vinstr::new(Vop::Bindjmp {
                    target,
                    args: RegSet::EMPTY,
                }));
                unit.blocks[label.index()].code[j].op = Vop::Jcc {
                    cc,
                    sf,
                    targets: [Vlabel::INVALID, cold],
                };
                need_fixup = true;
            }
            Vop::Jcci { cc, sf, target, taken } => {
                log::trace!("breaking spill exit out of {label}");
                let cold = unit.make_block(Area::Cold);
                unit.block_mut(cold).code.push(Vinstr::new(free.clone()));
                unit.block_mut(cold)
                    .code
                    .push(Vinstr::new(Vop::Jmpi { target: taken }));
                // Both targets are known here: the in-unit fall-through
                // stays, the taken side detours through the cold stub.
                unit.blocks[label.index()].code[j].op = Vop::Jcc {
                    cc,
                    sf,
                    targets: [target, cold],
                };
            }
            _ => {}
        }
        j += 1;
    }

    if need_fixup {
        fixup_block_jumps(unit, label);
    }
}

/// Break `label` after every jcc whose fall-through is still invalid,
/// moving the remainder of the block into fresh blocks.
fn fixup_block_jumps(unit: &mut Vunit, label: Vlabel) {
    let orig = std::mem::take(&mut unit.blocks[label.index()].code);
    let mut cur = label;

    for inst in orig {
        let split = matches!(&inst.op, Vop::Jcc { targets, .. } if !targets[0].is_valid());
        unit.blocks[cur.index()].code.push(inst);
        if split {
            let area = unit.blocks[cur.index()].area;
            let next = unit.make_block(area);
            match &mut unit.blocks[cur.index()].code.last_mut().unwrap().op {
                Vop::Jcc { targets, .. } => targets[0] = next,
                _ => unreachable!(),
            }
            cur = next;
        }
    }
}

/// Insert the stack adjustments that create and destroy the spill area.
///
/// Analysis walks blocks in RPO propagating required states; mutation then
/// places `lea sp, [sp-N]` right before spill space is first needed,
/// `lea sp, [sp+N]` before unit exits inside spill-live regions, and
/// rewrites conditional exits via [`process_spill_exits`].
pub(crate) fn allocate_spill_space(
    unit: &mut Vunit,
    ctx: &XlsContext,
    spill_info: &mut SpillInfo,
    opts: &Options,
) {
    if opts.stress_spill && ctx.abi.can_spill {
        let mut rng = StdRng::seed_from_u64(0xface_b00c);
        let extra = rng.gen_range(1..=7);
        log::debug!("stress-spill on; adding {extra} extra slots");
        spill_info.used_spill_slots += extra;
    }
    if spill_info.used_spill_slots == 0 {
        return;
    }
    assert!(ctx.abi.can_spill);

    // Keep the area a multiple of 16 bytes for alignment.
    if spill_info.used_spill_slots % 2 == 1 {
        spill_info.used_spill_slots += 1;
    }
    log::debug!("allocating {} spill slots", spill_info.used_spill_slots);

    let sp = ctx.sp;
    let spill_size = slot_offset(spill_info.used_spill_slots as u32);
    // Pointer adjustment via lea is safe even where flags are live.
    let alloc = Vop::Lea {
        s: Vptr::base_disp(sp, -spill_size),
        d: sp.into(),
    };
    let free = Vop::Lea {
        s: Vptr::base_disp(sp, spill_size),
        d: sp.into(),
    };

    // Analysis: propagate in/out states over the CFG until stable.
    let mut rpo_ids = vec![0u32; unit.blocks.len()];
    for (i, &b) in ctx.blocks.iter().enumerate() {
        rpo_ids[b.index()] = i as u32;
    }
    let mut states = vec![
        SpillStates {
            entry: Uninit,
            exit: Uninit,
        };
        unit.blocks.len()
    ];
    states[unit.entry.index()].entry = NoSpill;

    let mut worklist: std::collections::VecDeque<u32> = std::collections::VecDeque::new();
    let mut queued = vec![false; ctx.blocks.len()];
    worklist.push_back(0);
    queued[0] = true;

    while let Some(i) = worklist.pop_front() {
        queued[i as usize] = false;
        let label = ctx.blocks[i as usize];
        let mut state = states[label.index()].entry;

        if state < NeedSpill {
            for inst in &unit.blocks[label.index()].code {
                state = instr_in_state(unit, inst, state, sp);
                if state == NeedSpill {
                    break;
                }
            }
        }
        states[label.index()].exit = state;

        for &s in succs(&unit.blocks[label.index()]) {
            if merge_spill_states(&mut states[s.index()].entry, state) {
                let id = rpo_ids[s.index()];
                if !queued[id as usize] {
                    queued[id as usize] = true;
                    worklist.push_back(id);
                }
            }
        }
    }

    // Mutation: one pass over the blocks.
    for &label in &ctx.blocks {
        let state = states[label.index()];

        // NoSpill in, NeedSpill out: allocate right before the first
        // instruction that needs the space.
        if state.entry == NoSpill && state.exit == NeedSpill {
            let mut st = NoSpill;
            let mut at = None;
            for (j, inst) in unit.blocks[label.index()].code.iter().enumerate() {
                st = instr_in_state(unit, inst, st, sp);
                if st == NeedSpill {
                    at = Some(j);
                    break;
                }
            }
            if let Some(j) = at {
                log::trace!("allocating spill space inside {label}");
                unit.blocks[label.index()]
                    .code
                    .insert(j, Vinstr::new(alloc.clone()));
            }
        }

        // NoSpill out: allocate on edges into NeedSpill successors.
        let succlist: Vec<Vlabel> = succs(&unit.blocks[label.index()]).to_vec();
        if state.exit == NoSpill {
            for &s in &succlist {
                if states[s.index()].entry == NeedSpill {
                    log::trace!("allocating spill space on edge {label}->{s}");
                    let code = &mut unit.blocks[label.index()].code;
                    let at = code.len() - 1;
                    code.insert(at, Vinstr::new(alloc.clone()));
                }
            }
        }

        // NeedSpill out with no successors: free before the block-end
        // instruction. Traps keep the space so it shows up in core dumps.
        if state.exit == NeedSpill
            && succlist.is_empty()
            && !matches!(unit.blocks[label.index()].code.last().unwrap().op, Vop::Ud2)
        {
            log::trace!("freeing spill space in {label}");
            let code = &mut unit.blocks[label.index()].code;
            let at = code.len() - 1;
            code.insert(at, Vinstr::new(free.clone()));
        }

        // Anything but NoSpill out: hidden exits need explicit frees.
        if state.exit != NoSpill {
            process_spill_exits(unit, label, state.entry, &free, sp);
        }
    }
}
