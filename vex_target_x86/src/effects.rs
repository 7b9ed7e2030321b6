//! Implicit register side effects per instruction.

use vex_vir::inst::{Vinstr, Vop};
use vex_vir::reg::RegSet;

use crate::abi::Abi;

/// Registers an instruction implicitly touches, beyond its visible
/// operands. `across` registers behave as uses that also conflict with the
/// instruction's defs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Effects {
    pub uses: RegSet,
    pub across: RegSet,
    pub defs: RegSet,
}

/// Look up the implicit effects of `inst` under `abi`.
pub fn effects(abi: &Abi, inst: &Vinstr) -> Effects {
    match &inst.op {
        Vop::Call { .. } => Effects {
            uses: RegSet::EMPTY,
            across: RegSet::EMPTY,
            defs: abi.calls_clobber,
        },
        _ => Effects::default(),
    }
}
