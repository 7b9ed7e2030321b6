//! Linear position assignment.

use vex_vir::inst::{Vinstr, Vlabel, Vop};
use vex_vir::unit::Vunit;
use vex_vir::visit::visit_uses;

use crate::interval::LiveRange;

/// Assign an even position to every instruction and record the position
/// range of each block.
///
/// If the first instruction of a block has any use, a nop is prepended so
/// the use does not sit on the block boundary; edge copies can then be
/// inserted ahead of it.
pub(crate) fn compute_positions(unit: &mut Vunit, blocks: &[Vlabel]) -> Vec<LiveRange> {
    let mut block_ranges = vec![LiveRange { start: 0, end: 0 }; unit.blocks.len()];
    let mut pos = 0;

    for &b in blocks {
        let mut front_uses = false;
        if let Some(front) = unit.blocks[b.index()].code.first() {
            visit_uses(unit, front, |_| front_uses = true);
        }
        if front_uses {
            unit.blocks[b.index()].code.insert(0, Vinstr::new(Vop::Nop));
        }

        let start = pos;
        for inst in &mut unit.blocks[b.index()].code {
            inst.pos = pos;
            pos += 2;
        }
        block_ranges[b.index()] = LiveRange { start, end: pos };
    }
    block_ranges
}
