//! The linear-scan allocation loop.
//!
//! Intervals are processed in start order from a priority queue. The
//! active set holds intervals live at the current position, the inactive
//! set those inside a lifetime hole. Registers are chosen by how far into
//! the future they stay free; when nothing covers the whole interval, it
//! is split and the remainder re-enqueued, and when everything is blocked
//! either the current interval or the victims owning the chosen register
//! are spilled.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use vex_target_x86::NUM_SPILL_SLOTS;
use vex_vir::reg::{NUM_PHYS, PhysReg, RegSet};

use crate::interval::{Constraint, IntervalId, Intervals, MAX_POS, next_intersect};
use crate::{AllocError, Options, XlsContext};

/// Map from physical register to a position.
type PosVec = [u32; NUM_PHYS];

/// The register with the highest position in `posns`.
fn find_farthest(posns: &PosVec) -> PhysReg {
    let mut best = PhysReg(0);
    let mut max = 0;
    for (i, &p) in posns.iter().enumerate() {
        if p > max {
            best = PhysReg(i as u8);
            max = p;
        }
    }
    best
}

/// Spill statistics, consumed by spill-space allocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpillInfo {
    /// Number of intervals spilled.
    pub num_spills: u32,
    /// Number of spill slots used.
    pub used_spill_slots: usize,
}

pub(crate) fn assign_registers(
    ctx: &XlsContext,
    intervals: &mut Intervals,
    opts: &Options,
) -> Result<SpillInfo, AllocError> {
    Xls::new(ctx, intervals, opts).go()
}

struct Xls<'a> {
    ctx: &'a XlsContext,
    intervals: &'a mut Intervals,
    /// Intervals waiting to be processed, ordered by start position.
    pending: BinaryHeap<Reverse<(u32, IntervalId)>>,
    /// Intervals covering the current position.
    active: Vec<IntervalId>,
    /// Started intervals currently inside a lifetime hole.
    inactive: Vec<IntervalId>,
    /// Position at which each slot becomes reusable; MAX_POS while owned.
    spill_slots: [u32; NUM_SPILL_SLOTS],
    spill_info: SpillInfo,
    hints: bool,
}

impl<'a> Xls<'a> {
    fn new(ctx: &'a XlsContext, intervals: &'a mut Intervals, opts: &Options) -> Xls<'a> {
        Xls {
            ctx,
            intervals,
            pending: BinaryHeap::new(),
            active: Vec::new(),
            inactive: Vec::new(),
            spill_slots: [0; NUM_SPILL_SLOTS],
            spill_info: SpillInfo::default(),
            hints: opts.hints,
        }
    }

    fn go(mut self) -> Result<SpillInfo, AllocError> {
        for id in self.intervals.roots() {
            let (fixed, constant, vreg) = {
                let ivl = self.intervals.get(id);
                (ivl.fixed(), ivl.constant, ivl.vreg)
            };
            if fixed {
                self.assign_reg(id, vreg.phys())?;
            } else if constant {
                self.spill(id)?;
            } else {
                self.enqueue(id);
            }
        }
        while let Some(Reverse((start, id))) = self.pending.pop() {
            self.update(start);
            self.allocate(id)?;
        }
        Ok(self.spill_info)
    }

    fn enqueue(&mut self, id: IntervalId) {
        let start = self.intervals.get(id).start();
        self.pending.push(Reverse((start, id)));
    }

    /// Assign the next available spill slot to `ivl`'s chain.
    ///
    /// A slot is reusable once the whole lifetime that owned it ends, so we
    /// track a high-water position per slot and only hand a slot to a chain
    /// starting strictly above it. Wide values take two contiguous slots.
    fn assign_spill(&mut self, id: IntervalId) -> Result<(), AllocError> {
        let (fixed, parent, wide) = {
            let ivl = self.intervals.get(id);
            (ivl.fixed(), ivl.parent, ivl.wide)
        };
        debug_assert!(!fixed);
        let leader = parent.expect("spilling an unsplit root interval");

        if let Some(slot) = self.intervals.get(leader).slot {
            self.intervals.get_mut(id).slot = Some(slot);
            return Ok(());
        }
        let leader_start = self.intervals.get(leader).start();

        if !wide {
            for slot in 0..NUM_SPILL_SLOTS {
                if leader_start >= self.spill_slots[slot] {
                    self.take_slot(id, leader, slot, wide);
                    return Ok(());
                }
            }
        } else {
            let mut slot = 0;
            while slot + 1 < NUM_SPILL_SLOTS {
                if leader_start >= self.spill_slots[slot]
                    && leader_start >= self.spill_slots[slot + 1]
                {
                    self.take_slot(id, leader, slot, wide);
                    return Ok(());
                }
                slot += 2;
            }
        }

        log::trace!("punting: out of spill slots\n{}", self.intervals.dump(self.spill_info.num_spills));
        Err(AllocError::TooManySpills)
    }

    fn take_slot(&mut self, id: IntervalId, leader: IntervalId, slot: usize, wide: bool) {
        self.intervals.get_mut(id).slot = Some(slot as u32);
        self.intervals.get_mut(leader).slot = Some(slot as u32);
        self.spill_info.num_spills += 1;

        self.spill_slots[slot] = MAX_POS;
        if wide {
            self.spill_slots[slot + 1] = MAX_POS;
            self.spill_info.used_spill_slots = self.spill_info.used_spill_slots.max(slot + 2);
        } else {
            self.spill_info.used_spill_slots = self.spill_info.used_spill_slots.max(slot + 1);
        }
    }

    /// Give `r` to `ivl`, or spill it outright if nothing ever reads it.
    fn assign_reg(&mut self, id: IntervalId, r: PhysReg) -> Result<(), AllocError> {
        let (fixed, no_uses, constant) = {
            let ivl = self.intervals.get(id);
            (ivl.fixed(), ivl.uses.is_empty(), ivl.constant)
        };
        if !fixed && no_uses {
            self.intervals.get_mut(id).reg = None;
            if !constant {
                self.assign_spill(id)?;
            }
        } else {
            self.intervals.get_mut(id).reg = Some(r);
            self.active.push(id);
        }
        Ok(())
    }

    /// Spill `ivl` from its start until its first register use; the part
    /// from just before that use onward is re-enqueued.
    fn spill(&mut self, id: IntervalId) -> Result<(), AllocError> {
        let (first_use, start, end) = {
            let ivl = self.intervals.get(id);
            (ivl.first_use(), ivl.start(), ivl.end())
        };
        if first_use <= end {
            let split_pos = self.nearest_split_before(first_use);
            if split_pos <= start {
                // More registers are needed at one position than exist;
                // phi jumps and call arguments can do this.
                log::trace!("punting: cannot split before use at {first_use}");
                return Err(AllocError::RegSpill(first_use));
            }
            let second = self.intervals.split(id, split_pos, false);
            self.enqueue(second);
        }
        let constant = {
            let ivl = self.intervals.get_mut(id);
            ivl.reg = None;
            ivl.constant
        };
        if !constant {
            self.assign_spill(id)?;
        }
        Ok(())
    }

    /// Retire or flip active/inactive intervals for position `pos`, and
    /// release the spill slots of fully-ended chains.
    fn update(&mut self, pos: u32) {
        // Active intervals that ended are retired; ones inside a hole flip
        // to inactive. Inactive intervals flip back when they cover pos.
        let mut i = 0;
        while i < self.active.len() {
            let id = self.active[i];
            let (end, covers, last) = {
                let ivl = self.intervals.get(id);
                (ivl.end(), ivl.covers(pos), ivl.next.is_none())
            };
            if pos >= end {
                self.active.swap_remove(i);
                if last {
                    self.free_spill_slot(id);
                }
            } else if !covers {
                self.active.swap_remove(i);
                self.inactive.push(id);
            } else {
                i += 1;
            }
        }
        let mut i = 0;
        while i < self.inactive.len() {
            let id = self.inactive[i];
            let (end, covers, last) = {
                let ivl = self.intervals.get(id);
                (ivl.end(), ivl.covers(pos), ivl.next.is_none())
            };
            if pos >= end {
                self.inactive.swap_remove(i);
                if last {
                    self.free_spill_slot(id);
                }
            } else if covers {
                self.inactive.swap_remove(i);
                self.active.push(id);
            } else {
                i += 1;
            }
        }
    }

    /// The chain ended; let its slot be reused by lifetimes starting later.
    fn free_spill_slot(&mut self, id: IntervalId) {
        debug_assert!(self.intervals.get(id).next.is_none());
        let leader = self.intervals.leader(id);
        if let Some(slot) = self.intervals.get(leader).slot {
            let end = self.intervals.get(id).end();
            let slot = slot as usize;
            if self.intervals.get(id).wide {
                debug_assert_ne!(self.spill_slots[slot + 1], 0);
                self.spill_slots[slot + 1] = end;
            }
            debug_assert_ne!(self.spill_slots[slot], 0);
            self.spill_slots[slot] = end;
        }
    }

    /// The closest split position on or before `pos`: the block start if
    /// `pos` sits there, else the previous odd (between-instruction) slot.
    fn nearest_split_before(&self, pos: u32) -> u32 {
        let b = self.ctx.block_for(pos);
        let range = self.ctx.block_ranges[b.index()];
        if pos == range.start {
            pos
        } else {
            (pos - 1) | 1
        }
    }

    /// Intersect the allowed register set with each use's class demand.
    ///
    /// Returns the set plus the last position for which it is valid: if
    /// some use's class cannot be satisfied, the interval must split before
    /// it, and the returned position caps the freedom map in allocate().
    fn constrain(&self, id: IntervalId) -> (RegSet, u32) {
        let abi = &self.ctx.abi;
        // Any demand excludes flags.
        let any = abi.unreserved() - abi.sf;
        let mut allow = abi.unreserved();
        for u in &self.intervals.get(id).uses {
            let need = match u.kind {
                Constraint::Simd => abi.simd_unreserved,
                Constraint::Gpr => abi.gp_unreserved,
                Constraint::Sf => abi.sf,
                Constraint::Any | Constraint::CopySrc => any,
            };
            if (allow & need).is_empty() {
                // Cannot satisfy this use; must split before it.
                return (allow, u.pos - 1);
            }
            allow &= need;
        }
        (allow, MAX_POS)
    }

    /// The first hinted register free for the whole of `current`, else the
    /// hinted register free the longest.
    fn find_hint(&self, current: IntervalId, free_until: &PosVec, allow: RegSet) -> Option<PhysReg> {
        let cur = self.intervals.get(current);
        let cur_end = cur.end();
        let def_pos = cur.def_pos;
        let mut ret: Option<PhysReg> = None;

        for u in &cur.uses {
            let Some(hint) = u.hint else { continue };
            let Some(hint_root) = self.intervals.for_vreg(hint) else {
                continue;
            };
            let hint_ivl = self.intervals.get(hint_root);
            let reg = if hint_ivl.fixed() {
                hint_ivl.reg
            } else if u.pos == def_pos {
                // This use is the def, so the hint names our source; take
                // the register its chain holds where the source dies.
                self.chain_reg_ending_at(hint_root, u.pos)
            } else {
                None
            };
            let Some(reg) = reg else { continue };
            if !allow.contains(reg) {
                continue;
            }
            if free_until[reg.index()] >= cur_end {
                return Some(reg);
            }
            if ret.is_none_or(|r| free_until[r.index()] < free_until[reg.index()]) {
                ret = Some(reg);
            }
        }
        ret
    }

    /// Search `leader`'s chain for a child ending at `pos` with a register.
    fn chain_reg_ending_at(&self, leader: IntervalId, pos: u32) -> Option<PhysReg> {
        let mut cur = Some(leader);
        while let Some(id) = cur {
            let ivl = self.intervals.get(id);
            if ivl.end() == pos && ivl.reg.is_some() {
                return ivl.reg;
            }
            cur = ivl.next;
        }
        None
    }

    fn allocate(&mut self, current: IntervalId) -> Result<(), AllocError> {
        // Map each register to the first position at which it is /not/
        // available. Constrained-out registers stay at zero; allowed ones
        // are free until the constraint conflict, unless owned by an
        // active interval (not free at all) or an inactive one (free until
        // the next intersection).
        let mut free_until: PosVec = [0; NUM_PHYS];
        let (allow, conflict) = self.constrain(current);
        for r in allow.iter() {
            free_until[r.index()] = conflict;
        }
        for &id in &self.active {
            let r = self.intervals.get(id).reg.expect("active interval unassigned");
            free_until[r.index()] = 0;
        }
        for &id in &self.inactive {
            let ivl = self.intervals.get(id);
            let r = ivl.reg.expect("inactive interval unassigned");
            if free_until[r.index()] == 0 {
                continue;
            }
            let until = next_intersect(self.intervals.get(current), ivl);
            free_until[r.index()] = free_until[r.index()].min(until);
        }

        let (nranges, start, first_range_end, constant, first_use_pos) = {
            let cur = self.intervals.get(current);
            (
                cur.ranges.len(),
                cur.start(),
                cur.ranges[0].end,
                cur.constant,
                cur.uses.first().map(|u| u.pos),
            )
        };
        if nranges > 1 {
            let blk_range = self.ctx.block_ranges[self.ctx.block_for(start).index()];
            if blk_range.end > first_range_end {
                // The value is not live out of the first range, so nothing
                // connects it to the later ranges; breaking the interval at
                // the block end avoids holding a register across unrelated
                // code (e.g. a constant only used again in a cold exit).
                let second = self.intervals.split(current, blk_range.end, false);
                self.enqueue(second);
            } else if constant && first_use_pos.is_some_and(|p| p >= blk_range.end) {
                // Don't load a constant into a register in a block where it
                // is never read.
                return self.spill(current);
            }
        }

        // Try a hinted register first.
        let hint = if self.hints {
            self.find_hint(current, &free_until, allow)
        } else {
            None
        };
        if let Some(h) = hint {
            if free_until[h.index()] >= self.intervals.get(current).end() {
                return self.assign_reg(current, h);
            }
        }

        // Take the register available furthest into the future if it is
        // free across all of `current`.
        let r = find_farthest(&free_until);
        let pos = free_until[r.index()];
        if pos >= self.intervals.get(current).end() {
            return self.assign_reg(current, r);
        }

        let cur_start = self.intervals.get(current).start();
        if pos > cur_start {
            // `r` is free for the first part of current.
            let prev_use = self.intervals.get(current).last_use_before(pos);
            debug_assert!(prev_use.max(cur_start + 1) <= pos);

            let mut split_pos = self.nearest_split_before(pos);
            if split_pos > cur_start {
                if prev_use > 0 && prev_use < split_pos {
                    // There are uses in earlier blocks but none between the
                    // start of the block holding `split_pos` and the split
                    // itself. Splitting that late would force moves/loads
                    // on the edges into a block that never reads the value;
                    // split at the enclosing range start instead.
                    let cur = self.intervals.get(current);
                    let mut idx = cur.find_range(prev_use);
                    if idx < cur.ranges.len()
                        && cur.ranges[idx].start <= prev_use
                        && cur.ranges[idx].end < split_pos
                    {
                        idx += 1;
                    }
                    if idx < cur.ranges.len()
                        && cur.ranges[idx].start > prev_use
                        && cur.ranges[idx].start < split_pos
                    {
                        split_pos = cur.ranges[idx].start;
                    }
                }

                // Keep uses at the end of the first part: `r` is known free
                // up to and including that position.
                let second = self.intervals.split(current, split_pos, true);
                self.enqueue(second);
                let r = match hint {
                    Some(h) if free_until[h.index()] >= self.intervals.get(current).end() => h,
                    _ => r,
                };
                return self.assign_reg(current, r);
            }
        }

        // Must spill `current` or another interval.
        self.alloc_blocked(current)
    }

    /// All registers are taken: pick the register whose owners' next use
    /// is farthest away, split current before the position where that
    /// register is forcibly owned, and spill the owners.
    fn alloc_blocked(&mut self, current: IntervalId) -> Result<(), AllocError> {
        let (cur_start, cur_end, cur_first_use) = {
            let cur = self.intervals.get(current);
            (cur.start(), cur.end(), cur.first_use())
        };
        let (allow, conflict) = self.constrain(current);

        // used[r]: next position r is read by an interval owning it.
        // blocked[r]: next position r is forcibly owned (fixed intervals
        // and inactive intersections).
        let mut used: PosVec = [0; NUM_PHYS];
        let mut blocked: PosVec = [0; NUM_PHYS];
        for r in allow.iter() {
            used[r.index()] = conflict;
            blocked[r.index()] = conflict;
        }

        for &id in &self.active {
            let ivl = self.intervals.get(id);
            let r = ivl.reg.expect("active interval unassigned");
            if ivl.fixed() {
                blocked[r.index()] = 0;
                used[r.index()] = 0;
            } else {
                let use_pos = ivl.first_use_after(cur_start);
                used[r.index()] = used[r.index()].min(use_pos);
            }
        }

        for &id in &self.inactive {
            let ivl = self.intervals.get(id);
            let r = ivl.reg.expect("inactive interval unassigned");
            if blocked[r.index()] == 0 {
                continue;
            }
            let intersect_pos = next_intersect(self.intervals.get(current), ivl);
            if intersect_pos == MAX_POS {
                continue;
            }
            if ivl.fixed() {
                blocked[r.index()] = blocked[r.index()].min(intersect_pos);
                used[r.index()] = used[r.index()].min(blocked[r.index()]);
            } else {
                let use_pos = ivl.first_use_after(cur_start);
                used[r.index()] = used[r.index()].min(use_pos);
            }
        }

        let r = find_farthest(&used);

        // Every register is read before current's first use: spill current.
        if used[r.index()] < cur_first_use {
            return self.spill(current);
        }

        let block_pos = blocked[r.index()];
        if block_pos < cur_end {
            // Every usable register belongs to an intersecting lifetime;
            // current must split before that point.
            let prev_use = self.intervals.get(current).last_use_before(block_pos);
            debug_assert!(cur_start < prev_use.max(cur_start + 1));
            debug_assert!(prev_use.max(cur_start + 1) <= block_pos);

            let split_pos = self.nearest_split_before(block_pos);
            if split_pos > cur_start {
                let second = self.intervals.split(current, split_pos, true);
                self.enqueue(second);
            }
        }
        self.spill_others(current, r)?;
        self.assign_reg(current, r)
    }

    /// Split every other owner of `r` at current's start and spill the
    /// tails (or the whole victim when the split would precede its start).
    fn spill_others(&mut self, current: IntervalId, r: PhysReg) -> Result<(), AllocError> {
        let cur_start = self.intervals.get(current).start();
        let cur_end = self.intervals.get(current).end();

        let mut i = 0;
        while i < self.active.len() {
            let id = self.active[i];
            let (fixed, reg) = {
                let ivl = self.intervals.get(id);
                (ivl.fixed(), ivl.reg)
            };
            if fixed || reg != Some(r) {
                i += 1;
                continue;
            }
            self.active.swap_remove(i);
            self.spill_after(id, cur_start)?;
        }

        let mut i = 0;
        while i < self.inactive.len() {
            let id = self.inactive[i];
            let (fixed, reg) = {
                let ivl = self.intervals.get(id);
                (ivl.fixed(), ivl.reg)
            };
            if fixed || reg != Some(r) {
                i += 1;
                continue;
            }
            let intersect = next_intersect(self.intervals.get(current), self.intervals.get(id));
            if intersect >= cur_end {
                i += 1;
                continue;
            }
            self.inactive.swap_remove(i);
            self.spill_after(id, cur_start)?;
        }
        Ok(())
    }

    fn spill_after(&mut self, id: IntervalId, cur_start: u32) -> Result<(), AllocError> {
        let split_pos = self.nearest_split_before(cur_start);
        let tail = if split_pos <= self.intervals.get(id).start() {
            id
        } else {
            self.intervals.split(id, split_pos, false)
        };
        self.spill(tail)
    }
}
