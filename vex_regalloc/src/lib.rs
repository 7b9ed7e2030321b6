//! Extended linear scan register allocation over VIR units.
//!
//! Based on Wimmer & Franz, "Linear Scan Register Allocation on SSA Form".
//! The pipeline:
//!
//! 1. Sort blocks so every predecessor of B comes before B, except
//!    loop-edge predecessors. Assign an even position to every instruction;
//!    odd positions between instructions receive inserted copies and
//!    spills.
//!
//! 2. Build one lifetime interval per Vreg by walking blocks and
//!    instructions in reverse, carrying liveness. An interval is a sorted
//!    list of disjoint live ranges plus a sorted list of use positions,
//!    each tagged with a register-class constraint and an optional
//!    colocation hint.
//!
//! 3. Process intervals in order of start position, maintaining active and
//!    inactive sets. Prefer the register available furthest into the
//!    future; split the current interval when no register covers all of it
//!    and enqueue the remainder. When everything is blocked, spill either
//!    the current interval or the victims holding the chosen register.
//!
//! 4. Resolve split lifetimes: insert copies between adjacent sub-intervals
//!    inside blocks, and on control-flow edges where the live-in value
//!    changed location. Explicit copy and phi instructions lower into the
//!    same parallel copy plans. A single store after each spilled def keeps
//!    the slot current.
//!
//! 5. Rename every operand to its assigned physical register and
//!    materialize the plans as moves, spill stores, reloads, and immediate
//!    loads, sequencing parallel copies with a reserved scratch register.
//!
//! 6. Clean up cancelling swaps, then run a small dataflow that places
//!    stack adjustments around the regions where the spill area is live.
//!
//! Virtual flags registers are renamed to the flags singleton up front, on
//! the assumption that only one flags value is live at any position; this
//! also lets zero loads lower to `xor` where flags are dead.

use thiserror::Error;

use vex_target_x86::abi::{Abi, Target, scratch};
use vex_vir::cfg::{sort_blocks, split_critical_edges};
use vex_vir::check::check;
use vex_vir::inst::Vlabel;
use vex_vir::reg::PhysReg;
use vex_vir::unit::Vunit;

mod alloc;
mod insert;
mod interval;
mod liveness;
mod moves;
mod peephole;
mod pos;
mod resolve;
mod sp;
mod spill_space;


pub use self::alloc::SpillInfo;

use interval::LiveRange;
use liveness::LiveSet;

/// Capacity or representation failures that abort allocation.
///
/// Neither is recoverable here; the caller discards the unit, which may be
/// partially rewritten.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    /// The stack spill area is out of slots.
    #[error("linear scan ran out of spill slots")]
    TooManySpills,
    /// A split was forced before the interval's first register use, which
    /// happens when one position needs more registers than exist.
    #[error("cannot split interval before its register use at position {0}")]
    RegSpill(u32),
}

/// Allocation knobs.
#[derive(Debug, Clone)]
pub struct Options {
    pub target: Target,
    /// Follow colocation hints (copy sources, pre-colored registers).
    pub hints: bool,
    /// Inflate the used-slot count by a small seeded-random amount, to
    /// exercise spill-space placement on units that barely spill.
    pub stress_spill: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            target: Target::default(),
            hints: true,
            stress_spill: false,
        }
    }
}

/// Inputs and pre-computed analyses shared by the allocation passes.
pub(crate) struct XlsContext {
    pub abi: Abi,
    /// Arch-dependent stack pointer.
    pub sp: PhysReg,
    /// Reserved register for breaking parallel-copy cycles.
    pub tmp: PhysReg,
    /// Sorted blocks.
    pub blocks: Vec<Vlabel>,
    /// [start,end) position of each block, indexed by label.
    pub block_ranges: Vec<LiveRange>,
    /// Offset from sp to the spill area at each block entry.
    pub spill_offsets: Vec<i32>,
    /// Live-in set per block.
    pub livein: Vec<LiveSet>,
}

impl XlsContext {
    fn new(abi: &Abi, target: Target) -> XlsContext {
        let mut abi = abi.clone();
        let tmp = scratch(target);
        abi.simd_unreserved.remove(tmp);
        abi.simd_reserved.add(tmp);
        assert!(!abi.gp_unreserved.contains(abi.sp));
        assert!(!abi.simd_unreserved.contains(tmp));
        let sp = abi.sp;
        XlsContext {
            abi,
            sp,
            tmp,
            blocks: Vec::new(),
            block_ranges: Vec::new(),
            spill_offsets: Vec::new(),
            livein: Vec::new(),
        }
    }

    /// The block enclosing `pos`.
    pub fn block_for(&self, pos: u32) -> Vlabel {
        let mut lo = 0;
        let mut hi = self.blocks.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let r = self.block_ranges[self.blocks[mid].index()];
            if pos < r.start {
                hi = mid;
            } else if pos >= r.end {
                lo = mid + 1;
            } else {
                return self.blocks[mid];
            }
        }
        unreachable!("position {pos} outside every block");
    }
}

/// Allocate registers for `unit` with default options.
pub fn allocate(unit: &mut Vunit, abi: &Abi) -> Result<(), AllocError> {
    allocate_with(unit, abi, &Options::default())
}

/// Allocate registers for `unit`.
///
/// On success every operand refers to a physical register, copy and phi
/// instructions are lowered, spill stores/reloads are in place, and the
/// stack spill area is allocated and freed around the regions that need it.
pub fn allocate_with(unit: &mut Vunit, abi: &Abi, opts: &Options) -> Result<(), AllocError> {
    split_critical_edges(unit);
    if cfg!(debug_assertions) {
        let result = check(unit);
        assert!(result.is_ok(), "{result}");
    }

    // Analysis passes.
    let mut ctx = XlsContext::new(abi, opts.target);
    ctx.blocks = sort_blocks(unit);
    ctx.block_ranges = pos::compute_positions(unit, &ctx.blocks);
    ctx.spill_offsets = sp::analyze_sp(unit, &ctx.blocks, ctx.sp);
    ctx.livein = liveness::compute_liveness(unit, &ctx.abi, &ctx.blocks);

    // Build lifetime intervals and assign registers.
    let mut intervals = interval::build_intervals(unit, &ctx);
    let mut spill_info = alloc::assign_registers(&ctx, &mut intervals, opts)?;

    if log::log_enabled!(log::Level::Trace) {
        log::trace!("{}", intervals.dump(spill_info.num_spills));
    }

    // Resolve split lifetimes, rename operands, and materialize copies.
    let resolution = resolve::resolve_lifetimes(unit, &ctx, &intervals);
    insert::rename_operands(unit, &ctx, &intervals);
    insert::insert_copies(unit, &ctx, &intervals, &resolution);

    // Clean up, then create/destroy spill space where it is live.
    peephole::peephole(unit, &ctx);
    spill_space::allocate_spill_space(unit, &ctx, &mut spill_info, opts);

    Ok(())
}
