//! Parallel-copy sequencing.
//!
//! A move plan maps destination registers to source registers, all copies
//! notionally happening at once. Sequencing walks the induced permutation:
//! chains emit as plain moves from the free end backward; cycles emit as
//! hardware swaps for general-purpose registers, or rotate through the
//! reserved scratch register otherwise.

use vex_vir::reg::{NUM_PHYS, PhysReg};

/// Destination-indexed map of parallel moves.
pub(crate) type MovePlan = [Option<PhysReg>; NUM_PHYS];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MoveKind {
    Move,
    Xchg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MoveInfo {
    pub kind: MoveKind,
    pub src: PhysReg,
    pub dst: PhysReg,
}

/// Order `moves` into a sequence of copies and swaps whose net effect is
/// the parallel assignment, breaking cycles with `tmp`.
pub(crate) fn do_reg_moves(mut moves: MovePlan, tmp: PhysReg) -> Vec<MoveInfo> {
    let mut out = Vec::new();

    // How many pending moves read each register.
    let mut readers = [0u32; NUM_PHYS];
    for dst in 0..NUM_PHYS {
        match moves[dst] {
            Some(src) if src.index() == dst => moves[dst] = None,
            Some(src) => readers[src.index()] += 1,
            None => {}
        }
    }

    // Chains: a destination nobody reads can be written immediately, which
    // may in turn free its source.
    let mut progress = true;
    while progress {
        progress = false;
        for dst in 0..NUM_PHYS {
            let Some(src) = moves[dst] else { continue };
            if readers[dst] != 0 {
                continue;
            }
            out.push(MoveInfo {
                kind: MoveKind::Move,
                src,
                dst: PhysReg(dst as u8),
            });
            moves[dst] = None;
            readers[src.index()] -= 1;
            progress = true;
        }
    }

    // Whatever remains is a union of cycles.
    for start in 0..NUM_PHYS {
        let Some(first) = moves[start].take() else {
            continue;
        };
        let mut cycle = vec![PhysReg(start as u8)];
        let mut cur = first;
        while cur.index() != start {
            cycle.push(cur);
            cur = moves[cur.index()].take().expect("broken move cycle");
        }

        if cycle.iter().all(|r| r.is_gp()) {
            // Rotate with swaps: after xchg(c0,c1), c0 holds its final
            // value; repeat down the cycle.
            for w in cycle.windows(2) {
                out.push(MoveInfo {
                    kind: MoveKind::Xchg,
                    src: w[0],
                    dst: w[1],
                });
            }
        } else {
            // No hardware swap for SIMD; rotate through the scratch.
            out.push(MoveInfo {
                kind: MoveKind::Move,
                src: cycle[0],
                dst: tmp,
            });
            for w in cycle.windows(2) {
                out.push(MoveInfo {
                    kind: MoveKind::Move,
                    src: w[1],
                    dst: w[0],
                });
            }
            out.push(MoveInfo {
                kind: MoveKind::Move,
                src: tmp,
                dst: *cycle.last().unwrap(),
            });
        }
    }

    out
}
