//! Control-flow utilities: successors, predecessors, block ordering, and
//! critical-edge splitting.

use crate::inst::{Vinstr, Vlabel, Vop};
use crate::unit::{Vblock, Vunit};

/// In-unit successors of a block.
pub fn succs(block: &Vblock) -> &[Vlabel] {
    match block.code.last() {
        Some(inst) => inst.op.succs(),
        None => &[],
    }
}

/// Predecessor lists for every block, indexed by label.
pub fn compute_preds(unit: &Vunit) -> Vec<Vec<Vlabel>> {
    let mut preds = vec![Vec::new(); unit.blocks.len()];
    for (b, block) in unit.blocks.iter().enumerate() {
        for &s in succs(block) {
            preds[s.index()].push(Vlabel(b as u32));
        }
    }
    preds
}

/// Reachable blocks in reverse post-order, with main-area blocks before
/// cold ones. Predecessors of a loop head may follow it; all other blocks
/// come after every predecessor.
pub fn sort_blocks(unit: &Vunit) -> Vec<Vlabel> {
    let mut postorder = Vec::with_capacity(unit.blocks.len());
    let mut visited = vec![false; unit.blocks.len()];
    // Iterative DFS; the explicit stack carries (label, next successor index).
    let mut stack = vec![(unit.entry, 0usize)];
    visited[unit.entry.index()] = true;
    while let Some(&(b, next)) = stack.last() {
        let ss = succs(unit.block(b));
        if next < ss.len() {
            stack.last_mut().unwrap().1 += 1;
            let s = ss[next];
            if !visited[s.index()] {
                visited[s.index()] = true;
                stack.push((s, 0));
            }
        } else {
            postorder.push(b);
            stack.pop();
        }
    }
    postorder.reverse();
    postorder.sort_by_key(|b| unit.block(*b).area);
    postorder
}

/// Split critical edges so the allocator can place copies on any edge.
///
/// An edge is critical when its source has several successors and its
/// target several predecessors. A plain critical edge gets a forwarding
/// block holding a `jmp`. A `phijcc` with a critical out-edge is rewritten
/// into a `jcc` whose targets are forwarding blocks carrying `phijmp`s, so
/// phi values still flow on every edge.
pub fn split_critical_edges(unit: &mut Vunit) {
    let npreds: Vec<usize> = compute_preds(unit).iter().map(|p| p.len()).collect();

    for b in 0..unit.blocks.len() {
        let nsuccs = succs(&unit.blocks[b]).len();
        if nsuccs <= 1 {
            continue;
        }
        let critical = succs(&unit.blocks[b])
            .iter()
            .any(|s| npreds[s.index()] > 1);
        if !critical {
            continue;
        }

        let phijcc = match unit.blocks[b].code.last().map(|i| &i.op) {
            Some(Vop::Phijcc { cc, sf, targets, uses }) => Some((*cc, *sf, *targets, *uses)),
            _ => None,
        };
        if let Some((cc, sf, targets, uses)) = phijcc {
            // Both edges must carry the phi values, so both get phijmp
            // forwarding blocks and the phijcc itself becomes a jcc.
            let mut middles = [Vlabel::INVALID; 2];
            for (i, t) in targets.iter().enumerate() {
                let area = unit.block(*t).area;
                let m = unit.make_block(area);
                unit.block_mut(m)
                    .code
                    .push(Vinstr::new(Vop::Phijmp { target: *t, uses }));
                middles[i] = m;
            }
            *unit.blocks[b].code.last_mut().unwrap() = Vinstr::new(Vop::Jcc {
                cc,
                sf,
                targets: middles,
            });
            continue;
        }

        for i in 0..nsuccs {
            let s = succs(&unit.blocks[b])[i];
            if npreds[s.index()] <= 1 {
                continue;
            }
            let area = unit.block(s).area;
            let m = unit.make_block(area);
            unit.block_mut(m)
                .code
                .push(Vinstr::new(Vop::Jmp { target: s }));
            unit.blocks[b].code.last_mut().unwrap().op.succs_mut()[i] = m;
        }
    }
}
