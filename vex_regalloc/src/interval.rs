//! Lifetime intervals: construction, queries, and splitting.
//!
//! An interval stores the lifetime of one Vreg as a sorted list of disjoint
//! live ranges and a sorted list of use positions. A split interval becomes
//! a chain: the first interval is the root, the rest are children linked
//! through `next` in start order, all for the same Vreg. The spill slot
//! lives on the root.
//!
//! Every use position lies inside a range or exactly at the end of the
//! last one. We represent an instruction with a single position, so a use
//! at an interval's open end does not conflict with a def of another
//! interval starting at the same position; allowing it keeps splits legal
//! at instructions that also clobber registers (e.g. calls).

use std::fmt;
use std::fmt::Write as _;

use smallvec::SmallVec;

use vex_target_x86::effects::effects;
use vex_vir::inst::{Vconst, Vop, Vtuple};
use vex_vir::reg::{PhysReg, RegClass, Vreg};
use vex_vir::unit::Vunit;
use vex_vir::visit::{OperandVisitor, visit_operands};

use crate::XlsContext;
use crate::liveness::LiveSet;

/// "Infinity" position.
pub(crate) const MAX_POS: u32 = u32::MAX;

/// A closed-open range of positions: `start` is in the range, `end` is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LiveRange {
    pub start: u32,
    pub end: u32,
}

impl LiveRange {
    pub fn contains(self, pos: u32) -> bool {
        pos >= self.start && pos < self.end
    }

    pub fn intersects(self, r: LiveRange) -> bool {
        r.start < self.end && self.start < r.end
    }

    pub fn contains_range(self, r: LiveRange) -> bool {
        r.start >= self.start && r.end <= self.end
    }
}

/// Register-class demand a use places on its interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Constraint {
    Any,
    /// Consumed by a parallel-copy lowering, which can read a constant or a
    /// spill slot directly; the use does not demand a register.
    CopySrc,
    Gpr,
    Simd,
    Sf,
}

pub(crate) fn constraint_of(class: RegClass) -> Constraint {
    match class {
        RegClass::Any => Constraint::Any,
        RegClass::Gpr => Constraint::Gpr,
        RegClass::Simd | RegClass::SimdWide => Constraint::Simd,
        RegClass::Sf => Constraint::Sf,
    }
}

/// A position where an interval is used or defined.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Use {
    pub kind: Constraint,
    pub pos: u32,
    /// If set, try to use the same physical register as this Vreg.
    pub hint: Option<Vreg>,
}

/// Arena index of an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct IntervalId(pub u32);

impl IntervalId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
pub(crate) struct Interval {
    pub vreg: Vreg,
    /// Root of the chain, if this is a split child.
    pub parent: Option<IntervalId>,
    /// Next child in the chain, in start order.
    pub next: Option<IntervalId>,
    pub ranges: SmallVec<[LiveRange; 4]>,
    pub uses: SmallVec<[Use; 4]>,
    /// The single position where the root defines the Vreg.
    pub def_pos: u32,
    pub slot: Option<u32>,
    /// 16-byte value; occupies two spill slots.
    pub wide: bool,
    pub reg: Option<PhysReg>,
    pub constant: bool,
    pub val: Option<Vconst>,
}

impl Interval {
    fn new(vreg: Vreg) -> Interval {
        Interval {
            vreg,
            parent: None,
            next: None,
            ranges: SmallVec::new(),
            uses: SmallVec::new(),
            def_pos: 0,
            slot: None,
            wide: false,
            reg: None,
            constant: false,
            val: None,
        }
    }

    pub fn start(&self) -> u32 {
        self.ranges.first().unwrap().start
    }

    pub fn end(&self) -> u32 {
        self.ranges.last().unwrap().end
    }

    /// Pre-bound to a physical register: unassignable, but participates in
    /// conflicts.
    pub fn fixed(&self) -> bool {
        self.vreg.is_phys()
    }

    pub fn spilled(&self) -> bool {
        self.reg.is_none() && self.slot.is_some()
    }

    /// Index of the first range containing `pos` or strictly above it.
    pub fn find_range(&self, pos: u32) -> usize {
        let mut lo = 0;
        let mut hi = self.ranges.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let r = self.ranges[mid];
            if pos < r.start {
                hi = mid;
            } else if r.end <= pos {
                lo = mid + 1;
            } else {
                return mid;
            }
        }
        debug_assert!(lo == self.ranges.len() || pos < self.ranges[lo].start);
        lo
    }

    /// Index of the first use at `pos` or strictly above it.
    pub fn find_use(&self, pos: u32) -> usize {
        let mut lo = 0;
        let mut hi = self.uses.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let u = self.uses[mid].pos;
            if pos < u {
                hi = mid;
            } else if u < pos {
                lo = mid + 1;
            } else {
                return mid;
            }
        }
        debug_assert!(lo == self.uses.len() || pos < self.uses[lo].pos);
        lo
    }

    pub fn covers(&self, pos: u32) -> bool {
        if pos < self.start() || pos >= self.end() {
            return false;
        }
        let i = self.find_range(pos);
        i < self.ranges.len() && self.ranges[i].contains(pos)
    }

    pub fn used_at(&self, pos: u32) -> bool {
        if pos < self.start() || pos > self.end() {
            return false;
        }
        let i = self.find_use(pos);
        i < self.uses.len() && self.uses[i].pos == pos
    }

    /// First register-demanding use at or after `pos`; CopySrc uses are
    /// ignored.
    pub fn first_use_after(&self, pos: u32) -> u32 {
        for u in &self.uses {
            if u.kind == Constraint::CopySrc {
                continue;
            }
            if u.pos >= pos {
                return u.pos;
            }
        }
        MAX_POS
    }

    /// Last register-demanding use at or before `pos`; 0 if none.
    pub fn last_use_before(&self, pos: u32) -> u32 {
        let mut prev = 0;
        for u in &self.uses {
            if u.kind == Constraint::CopySrc {
                continue;
            }
            if u.pos > pos {
                return prev;
            }
            prev = u.pos;
        }
        prev
    }

    /// First register-demanding use.
    pub fn first_use(&self) -> u32 {
        for u in &self.uses {
            if u.kind != Constraint::CopySrc {
                return u.pos;
            }
        }
        MAX_POS
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut delim = "";
        if let Some(reg) = self.reg {
            write!(f, "{reg}")?;
            delim = " ";
        }
        if self.constant {
            if let Some(val) = self.val {
                write!(f, "{delim}#{:08x}", val.val)?;
                delim = " ";
            }
        }
        if let Some(slot) = self.slot {
            write!(f, "{delim}[%sp+{}]", slot * 8)?;
        }
        write!(f, " [")?;
        delim = "";
        for r in &self.ranges {
            write!(f, "{delim}{}-{}", r.start, r.end)?;
            delim = ",";
        }
        write!(f, ") {{")?;
        delim = "";
        for u in &self.uses {
            let marker = if u.kind == Constraint::CopySrc { "?" } else { "@" };
            match u.hint {
                Some(h) => write!(f, "{delim}{h}={marker}{}", u.pos)?,
                None => write!(f, "{delim}{marker}{}", u.pos)?,
            }
            delim = ",";
        }
        write!(f, "}}")
    }
}

/// Arena of intervals plus the Vreg-to-root map.
pub(crate) struct Intervals {
    ivls: Vec<Interval>,
    by_vreg: Vec<Option<IntervalId>>,
}

impl Intervals {
    pub fn new(next_vreg: u32) -> Intervals {
        Intervals {
            ivls: Vec::new(),
            by_vreg: vec![None; next_vreg as usize],
        }
    }

    pub fn get(&self, id: IntervalId) -> &Interval {
        &self.ivls[id.index()]
    }

    pub fn get_mut(&mut self, id: IntervalId) -> &mut Interval {
        &mut self.ivls[id.index()]
    }

    /// Root interval for `r`, if it has one.
    pub fn for_vreg(&self, r: Vreg) -> Option<IntervalId> {
        self.by_vreg.get(r.index()).copied().flatten()
    }

    /// Root interval for `r`, creating an empty one if needed.
    pub fn ensure(&mut self, r: Vreg) -> IntervalId {
        if let Some(id) = self.by_vreg[r.index()] {
            return id;
        }
        let id = IntervalId(self.ivls.len() as u32);
        self.ivls.push(Interval::new(r));
        self.by_vreg[r.index()] = Some(id);
        id
    }

    pub fn leader(&self, id: IntervalId) -> IntervalId {
        self.get(id).parent.unwrap_or(id)
    }

    /// All root intervals.
    pub fn roots(&self) -> Vec<IntervalId> {
        self.by_vreg.iter().copied().flatten().collect()
    }

    /// The child in `root`'s chain with a use at `pos`, if any.
    pub fn child_at(&self, root: IntervalId, pos: u32) -> Option<IntervalId> {
        debug_assert!(self.get(root).parent.is_none());
        let mut cur = Some(root);
        while let Some(id) = cur {
            let ivl = self.get(id);
            if pos < ivl.start() {
                return None;
            }
            if ivl.used_at(pos) {
                return Some(id);
            }
            cur = ivl.next;
        }
        None
    }

    /// Split the interval at `pos`, returning the new chain successor.
    ///
    /// With `keep_uses`, uses exactly at the end of the first part stay
    /// with it rather than moving to the child; the caller uses this when
    /// it knows the assigned register is free through that position.
    ///
    /// Requires `start < pos < end`, so both parts are non-empty.
    pub fn split(&mut self, id: IntervalId, pos: u32, keep_uses: bool) -> IntervalId {
        let leader = self.leader(id);
        let child_id = IntervalId(self.ivls.len() as u32);

        let ivl = &mut self.ivls[id.index()];
        assert!(pos > ivl.start() && pos < ivl.end());

        // Move the ranges at or above `pos` into the child, splitting the
        // straddling range if any.
        let mut child_ranges: SmallVec<[LiveRange; 4]> = SmallVec::new();
        let mut i = ivl.find_range(pos);
        if i < ivl.ranges.len() && pos > ivl.ranges[i].start {
            child_ranges.push(LiveRange {
                start: pos,
                end: ivl.ranges[i].end,
            });
            ivl.ranges[i].end = pos;
            i += 1;
        }
        child_ranges.extend(ivl.ranges.drain(i..));

        // Move the uses belonging to the child.
        let first_end = ivl.ranges.last().unwrap().end;
        let child_start = child_ranges.first().unwrap().start;
        let mut k = ivl.find_use(first_end);
        if keep_uses {
            while k < ivl.uses.len() && ivl.uses[k].pos <= first_end {
                k += 1;
            }
        } else {
            while k < ivl.uses.len() && ivl.uses[k].pos < child_start {
                k += 1;
            }
        }
        let child_uses: SmallVec<[Use; 4]> = ivl.uses.drain(k..).collect();

        let child = Interval {
            vreg: ivl.vreg,
            parent: Some(leader),
            next: ivl.next,
            ranges: child_ranges,
            uses: child_uses,
            def_pos: ivl.def_pos,
            slot: None,
            wide: ivl.wide,
            reg: None,
            constant: ivl.constant,
            val: ivl.val,
        };
        ivl.next = Some(child_id);
        self.ivls.push(child);
        child_id
    }

    /// Render every chain, for trace logging.
    pub fn dump(&self, num_spills: u32) -> String {
        let mut out = format!("spills {num_spills}\n");
        for root in self.roots() {
            let ivl = self.get(root);
            if ivl.fixed() {
                continue;
            }
            let _ = writeln!(out, "{:4} {}", ivl.vreg.to_string(), ivl);
            let mut cur = ivl.next;
            while let Some(id) = cur {
                let _ = writeln!(out, "     {}", self.get(id));
                cur = self.get(id).next;
            }
        }
        out
    }
}

/// Next intersection point of `current` and `other`, or [`MAX_POS`] if they
/// never intersect.
///
/// If two intervals intersect, the first intersection is the start of one
/// of them: SSA makes every def dominate its uses, hence its live ranges.
pub(crate) fn next_intersect(current: &Interval, other: &Interval) -> u32 {
    debug_assert!(!current.fixed());
    if current.parent.is_none() && other.parent.is_none() && !other.fixed() {
        // Since other is inactive it cannot cover current's start, and
        // current cannot cover other's earlier start, so SSA guarantees no
        // intersection.
        return MAX_POS;
    }
    if current.end() <= other.start() {
        return MAX_POS;
    }
    let mut i1 = 0;
    let mut i2 = other.find_range(current.start());
    while i1 < current.ranges.len() && i2 < other.ranges.len() {
        let r1 = current.ranges[i1];
        let r2 = other.ranges[i2];
        if r1.start < r2.start {
            if r2.start < r1.end {
                return r2.start;
            }
            i1 += 1;
        } else {
            if r1.start < r2.end {
                return r1.start;
            }
            i2 += 1;
        }
    }
    MAX_POS
}

/// Prepend `r` to an interval whose ranges are in reverse order.
///
/// `r` must precede or overlap the most recently added range.
pub(crate) fn add_range(ivl: &mut Interval, r: LiveRange) {
    while let Some(&last) = ivl.ranges.last() {
        if r.contains_range(last) {
            ivl.ranges.pop();
        } else {
            break;
        }
    }
    if ivl.ranges.is_empty() {
        ivl.ranges.push(r);
        return;
    }
    let first = ivl.ranges.last_mut().unwrap();
    if first.contains_range(r) {
        return;
    }
    if r.end >= first.start {
        first.start = r.start;
    } else {
        ivl.ranges.push(r);
    }
}

/// Visits defs of one instruction: kills liveness, trims or seeds ranges,
/// and records a use with any hint.
struct DefVisitor<'a> {
    intervals: &'a mut Intervals,
    tuples: &'a [Vec<Vreg>],
    live: &'a mut LiveSet,
    pos: u32,
}

impl DefVisitor<'_> {
    fn def(&mut self, r: Vreg, kind: Constraint, hint: Option<Vreg>, wide: bool) {
        // Eagerly rename virtual flags to the singleton.
        let r = if kind == Constraint::Sf {
            Vreg::from(PhysReg::SF)
        } else {
            r
        };
        let id = self.intervals.ensure(r);
        let live = self.live[r.index()];
        let ivl = self.intervals.get_mut(id);
        if live {
            self.live.set(r.index(), false);
            ivl.ranges.last_mut().unwrap().start = self.pos;
        } else {
            add_range(
                ivl,
                LiveRange {
                    start: self.pos,
                    end: self.pos + 1,
                },
            );
        }
        if !ivl.fixed() {
            ivl.uses.push(Use {
                kind,
                pos: self.pos,
                hint,
            });
            ivl.wide |= wide;
            ivl.def_pos = self.pos;
        }
    }
}

impl OperandVisitor for DefVisitor<'_> {
    fn def_reg(&mut self, r: Vreg, class: RegClass) {
        self.def(r, constraint_of(class), None, class.is_wide());
    }

    fn def_hint(&mut self, d: Vreg, class: RegClass, hint: Vreg) {
        self.def(d, constraint_of(class), Some(hint), class.is_wide());
    }

    fn def_tuple(&mut self, t: Vtuple) {
        let tuples = self.tuples;
        for &r in &tuples[t.index()] {
            self.def(r, Constraint::Any, None, false);
        }
    }

    fn def_hint_tuple(&mut self, d: Vtuple, hints: Vtuple) {
        let tuples = self.tuples;
        let (defs, hints) = (&tuples[d.index()], &tuples[hints.index()]);
        for (&r, &h) in defs.iter().zip(hints.iter()) {
            self.def(r, Constraint::Any, Some(h), false);
        }
    }
}

/// Visits uses of one instruction: marks liveness, extends ranges, records
/// uses. Sources of copy-like instructions are marked CopySrc since the
/// parallel-copy lowering can read constants and spill slots directly.
struct UseVisitor<'a> {
    intervals: &'a mut Intervals,
    tuples: &'a [Vec<Vreg>],
    live: &'a mut LiveSet,
    /// [block start, instruction position].
    range: LiveRange,
    copy_src: bool,
    copy_src_non_sf: bool,
}

impl UseVisitor<'_> {
    fn use_at(&mut self, r: Vreg, kind: Constraint, end: u32, hint: Option<Vreg>) {
        let r = if kind == Constraint::Sf {
            Vreg::from(PhysReg::SF)
        } else {
            r
        };
        self.live.set(r.index(), true);
        let id = self.intervals.ensure(r);
        let ivl = self.intervals.get_mut(id);
        add_range(
            ivl,
            LiveRange {
                start: self.range.start,
                end,
            },
        );
        if !ivl.fixed() {
            let kind = if self.copy_src || (self.copy_src_non_sf && kind != Constraint::Sf) {
                Constraint::CopySrc
            } else {
                kind
            };
            ivl.uses.push(Use {
                kind,
                pos: self.range.end,
                hint,
            });
        }
    }
}

impl OperandVisitor for UseVisitor<'_> {
    fn use_reg(&mut self, r: Vreg, class: RegClass) {
        self.use_at(r, constraint_of(class), self.range.end, None);
    }

    fn use_hint(&mut self, r: Vreg, class: RegClass, hint: Vreg) {
        self.use_at(r, constraint_of(class), self.range.end, Some(hint));
    }

    /// An across operand is live through the instruction, so its lifetime
    /// conflicts with the defs and it lands in a different register.
    fn across(&mut self, r: Vreg, class: RegClass) {
        self.use_at(r, constraint_of(class), self.range.end + 1, None);
    }

    fn use_tuple(&mut self, t: Vtuple) {
        let tuples = self.tuples;
        for &r in &tuples[t.index()] {
            self.use_at(r, Constraint::Any, self.range.end, None);
        }
    }

    fn use_hint_tuple(&mut self, s: Vtuple, hints: Vtuple) {
        let tuples = self.tuples;
        let (srcs, hints) = (&tuples[s.index()], &tuples[hints.index()]);
        for (&r, &h) in srcs.iter().zip(hints.iter()) {
            self.use_at(r, Constraint::Any, self.range.end, Some(h));
        }
    }
}

/// Compute lifetime intervals and use positions for every Vreg by walking
/// the code bottom-up once.
pub(crate) fn build_intervals(unit: &Vunit, ctx: &XlsContext) -> Intervals {
    let mut intervals = Intervals::new(unit.next_vreg);

    for &b in ctx.blocks.iter().rev() {
        let block = &unit.blocks[b.index()];

        // Initial live set is the union of successor live sets.
        let mut live = LiveSet::repeat(false, unit.next_vreg as usize);
        for &s in vex_vir::cfg::succs(block) {
            for i in ctx.livein[s.index()].iter_ones() {
                live.set(i, true);
            }
        }

        // Every live Vreg gets a range covering the whole block, to be
        // trimmed when its def is seen.
        let block_range = ctx.block_ranges[b.index()];
        for i in live.iter_ones() {
            let id = intervals.ensure(Vreg(i as u32));
            add_range(intervals.get_mut(id), block_range);
        }

        // Visit instructions bottom-up, adding uses and ranges.
        let mut pos = block_range.end;
        for inst in block.code.iter().rev() {
            pos -= 2;
            let eff = effects(&ctx.abi, inst);

            let mut dv = DefVisitor {
                intervals: &mut intervals,
                tuples: &unit.tuples,
                live: &mut live,
                pos,
            };
            visit_operands(inst, &mut dv);
            dv.def_regset(eff.defs);

            let mut uv = UseVisitor {
                intervals: &mut intervals,
                tuples: &unit.tuples,
                live: &mut live,
                range: LiveRange {
                    start: block_range.start,
                    end: pos,
                },
                copy_src: matches!(
                    inst.op,
                    Vop::Copy { .. } | Vop::Copy2 { .. } | Vop::Copyargs { .. } | Vop::Phijmp { .. }
                ),
                copy_src_non_sf: matches!(inst.op, Vop::Phijcc { .. }),
            };
            visit_operands(inst, &mut uv);
            uv.use_regset(eff.uses);
            for r in eff.across.iter() {
                uv.across(r.into(), RegClass::Any);
            }
        }

        debug_assert_eq!(live, ctx.livein[b.index()], "liveness mismatch in {b}");
    }

    // Constants extend back to position 0 and are rematerialized at uses.
    for (&c, &r) in &unit.consts {
        if let Some(id) = intervals.for_vreg(r) {
            let ivl = intervals.get_mut(id);
            ivl.ranges.last_mut().unwrap().start = 0;
            ivl.constant = true;
            ivl.val = Some(c);
        }
    }

    // Ranges and uses were built in reverse order.
    for ivl in &mut intervals.ivls {
        debug_assert!(!ivl.ranges.is_empty());
        ivl.ranges.reverse();
        ivl.uses.reverse();
    }

    if cfg!(debug_assertions) {
        // Only constants and pre-bound registers may be live into entry.
        for i in ctx.livein[unit.entry.index()].iter_ones() {
            let id = intervals.for_vreg(Vreg(i as u32)).unwrap();
            let ivl = intervals.get(id);
            assert!(ivl.constant || ivl.fixed(), "{} live into entry", ivl.vreg);
        }
        for ivl in &intervals.ivls {
            for w in ivl.uses.windows(2) {
                assert!(w[1].pos >= w[0].pos, "non-monotonic uses");
            }
            for w in ivl.ranges.windows(2) {
                assert!(w[0].end > w[0].start, "empty range");
                assert!(w[1].start > w[0].end, "touching ranges");
            }
            if let Some(last) = ivl.ranges.last() {
                assert!(last.end > last.start, "empty range");
            }
        }
    }

    intervals
}
