//! Structural checks on units.
//!
//! Collects all errors rather than stopping at the first one. The register
//! allocator debug-asserts `check` on its input; callers may also use it
//! directly after building a unit.

use std::collections::HashMap;
use std::fmt;

use crate::inst::{Vlabel, Vop};
use crate::reg::{RegClass, Vreg};
use crate::unit::Vunit;
use crate::visit::{OperandVisitor, visit_operands};

/// A single check failure.
#[derive(Debug, Clone)]
pub struct CheckError {
    pub block: Vlabel,
    pub inst: Option<usize>,
    pub message: String,
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inst {
            Some(i) => write!(f, "[{} inst {}] {}", self.block, i, self.message),
            None => write!(f, "[{}] {}", self.block, self.message),
        }
    }
}

/// Collected check results.
#[derive(Debug, Default)]
pub struct CheckResult {
    pub errors: Vec<CheckError>,
}

impl CheckResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, block: Vlabel, inst: Option<usize>, message: impl Into<String>) {
        self.errors.push(CheckError {
            block,
            inst,
            message: message.into(),
        });
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "unit check passed");
        }
        writeln!(f, "unit check failed with {} error(s):", self.errors.len())?;
        for e in &self.errors {
            writeln!(f, "  {e}")?;
        }
        Ok(())
    }
}

struct DefSites<'a> {
    tuples: &'a [Vec<Vreg>],
    sites: Vec<(Vreg, RegClass)>,
}

impl OperandVisitor for DefSites<'_> {
    fn def_reg(&mut self, r: Vreg, class: RegClass) {
        self.sites.push((r, class));
    }
    fn def_tuple(&mut self, t: crate::inst::Vtuple) {
        for &r in &self.tuples[t.index()] {
            self.sites.push((r, RegClass::Any));
        }
    }
}

/// Check structural integrity of a unit.
pub fn check(unit: &Vunit) -> CheckResult {
    let mut result = CheckResult::default();
    let mut def_count: HashMap<Vreg, usize> = HashMap::new();

    for (bi, block) in unit.blocks.iter().enumerate() {
        let b = Vlabel(bi as u32);
        if block.code.is_empty() {
            result.error(b, None, "empty block");
            continue;
        }
        if !block.code.last().unwrap().op.is_block_end() {
            result.error(b, None, "block does not end in a terminator");
        }
        for (i, inst) in block.code.iter().enumerate() {
            if inst.op.is_block_end() && i + 1 != block.code.len() {
                result.error(b, Some(i), format!("{} in block interior", inst.op.name()));
            }
            if matches!(inst.op, Vop::Phidef { .. }) && i != 0 {
                result.error(b, Some(i), "phidef not at block front");
            }
            for &s in inst.op.succs() {
                if s.index() >= unit.blocks.len() {
                    result.error(b, Some(i), format!("branch to unknown block {s}"));
                }
            }
            let mut defs = DefSites {
                tuples: &unit.tuples,
                sites: Vec::new(),
            };
            visit_operands(inst, &mut defs);
            for (r, class) in defs.sites {
                // Physical and flags registers are exempt from single-def.
                if r.is_phys() || class == RegClass::Sf {
                    continue;
                }
                *def_count.entry(r).or_insert(0) += 1;
            }
        }
        // Phi arity: a phijmp/phijcc tuple must match the target's phidef.
        if let Some(inst) = block.code.last() {
            let (uses, targets): (Option<crate::inst::Vtuple>, &[Vlabel]) = match &inst.op {
                Vop::Phijmp { target, uses } => (Some(*uses), std::slice::from_ref(target)),
                Vop::Phijcc { targets, uses, .. } => (Some(*uses), targets),
                _ => (None, &[]),
            };
            if let Some(uses) = uses {
                for &t in targets {
                    if t.index() >= unit.blocks.len() {
                        continue;
                    }
                    match unit.block(t).code.first().map(|i| &i.op) {
                        Some(Vop::Phidef { defs }) => {
                            if unit.tuple(*defs).len() != unit.tuple(uses).len() {
                                result.error(b, None, format!("phi arity mismatch on edge to {t}"));
                            }
                        }
                        _ => result.error(b, None, format!("phi target {t} lacks a phidef")),
                    }
                }
            }
        }
    }

    for (r, count) in def_count {
        if count > 1 {
            result.error(
                unit.entry,
                None,
                format!("{r} defined {count} times; unit is not in SSA form"),
            );
        }
    }

    result
}
