//! Polymorphic operand visitation.
//!
//! [`OperandVisitor`] has one callback per operand role; all default to
//! empty (or forward to the plain variant), so a visitor implements only
//! the roles it cares about. Tuple operands are passed as indices; visitors
//! that need their contents hold a reference to the unit's tuple table.

use crate::inst::{Vinstr, Vop, Vptr, Vtuple};
use crate::reg::{RegClass, RegSet, Vreg};
use crate::unit::Vunit;

pub trait OperandVisitor {
    fn imm(&mut self, _val: u64) {}

    fn use_reg(&mut self, _r: Vreg, _class: RegClass) {}
    fn use_hint(&mut self, r: Vreg, class: RegClass, _hint: Vreg) {
        self.use_reg(r, class);
    }
    fn across(&mut self, _r: Vreg, _class: RegClass) {}

    fn def_reg(&mut self, _r: Vreg, _class: RegClass) {}
    fn def_hint(&mut self, d: Vreg, class: RegClass, _hint: Vreg) {
        self.def_reg(d, class);
    }

    fn use_tuple(&mut self, _t: Vtuple) {}
    fn def_tuple(&mut self, _t: Vtuple) {}
    fn use_hint_tuple(&mut self, s: Vtuple, _hints: Vtuple) {
        self.use_tuple(s);
    }
    fn def_hint_tuple(&mut self, d: Vtuple, _hints: Vtuple) {
        self.def_tuple(d);
    }

    fn use_regset(&mut self, rs: RegSet) {
        for r in rs.iter() {
            self.use_reg(r.into(), RegClass::Any);
        }
    }
    fn def_regset(&mut self, rs: RegSet) {
        for r in rs.iter() {
            self.def_reg(r.into(), RegClass::Any);
        }
    }

    fn use_ptr(&mut self, m: &Vptr) {
        if let Some(base) = m.base {
            self.use_reg(base, RegClass::Gpr);
        }
        if let Some(index) = m.index {
            self.use_reg(index, RegClass::Gpr);
        }
    }
}

/// Dispatch every operand of `inst` to `v` with its role and static class.
pub fn visit_operands<V: OperandVisitor>(inst: &Vinstr, v: &mut V) {
    use RegClass::*;
    match &inst.op {
        Vop::Copy { s, d } => {
            v.use_hint(*s, Any, *d);
            v.def_hint(*d, Any, *s);
        }
        Vop::Copy2 { s0, s1, d0, d1 } => {
            v.use_hint(*s0, Any, *d0);
            v.use_hint(*s1, Any, *d1);
            v.def_hint(*d0, Any, *s0);
            v.def_hint(*d1, Any, *s1);
        }
        Vop::Copyargs { s, d } => {
            v.use_hint_tuple(*s, *d);
            v.def_hint_tuple(*d, *s);
        }
        Vop::Phijmp { uses, .. } => v.use_tuple(*uses),
        Vop::Phijcc { sf, uses, .. } => {
            v.use_reg(*sf, Sf);
            v.use_tuple(*uses);
        }
        Vop::Phidef { defs } => v.def_tuple(*defs),
        Vop::Ldimmb { imm, d } => {
            v.imm(*imm as u64);
            v.def_reg(*d, Any);
        }
        Vop::Ldimml { imm, d } => {
            v.imm(*imm as u32 as u64);
            v.def_reg(*d, Any);
        }
        Vop::Ldimmq { imm, d } => {
            v.imm(*imm);
            v.def_reg(*d, Any);
        }
        Vop::Load { s, d } => {
            v.use_ptr(s);
            v.def_reg(*d, Any);
        }
        Vop::Store { s, d } => {
            v.use_reg(*s, Any);
            v.use_ptr(d);
        }
        Vop::Loadups { s, d } => {
            v.use_ptr(s);
            v.def_reg(*d, SimdWide);
        }
        Vop::Storeups { s, d } => {
            v.use_reg(*s, SimdWide);
            v.use_ptr(d);
        }
        Vop::Lea { s, d } => {
            v.use_ptr(s);
            v.def_reg(*d, Gpr);
        }
        Vop::Addq { s0, s1, d, sf } | Vop::Subq { s0, s1, d, sf } => {
            v.use_reg(*s0, Gpr);
            v.use_reg(*s1, Gpr);
            v.def_reg(*d, Gpr);
            v.def_reg(*sf, Sf);
        }
        Vop::Addqi { imm, s1, d, sf } | Vop::Subqi { imm, s1, d, sf } => {
            v.imm(*imm as u32 as u64);
            v.use_reg(*s1, Gpr);
            v.def_reg(*d, Gpr);
            v.def_reg(*sf, Sf);
        }
        Vop::Cmpq { s0, s1, sf } | Vop::Testq { s0, s1, sf } => {
            v.use_reg(*s0, Gpr);
            v.use_reg(*s1, Gpr);
            v.def_reg(*sf, Sf);
        }
        Vop::Xorl { s0, s1, d, sf } | Vop::Xorb { s0, s1, d, sf } => {
            v.use_reg(*s0, Gpr);
            v.use_reg(*s1, Gpr);
            v.def_reg(*d, Gpr);
            v.def_reg(*sf, Sf);
        }
        Vop::Push { s } => v.use_reg(*s, Gpr),
        Vop::Pop { d } => v.def_reg(*d, Gpr),
        Vop::Jmp { .. } => {}
        Vop::Jcc { sf, .. } => v.use_reg(*sf, Sf),
        Vop::Jcci { sf, taken, .. } => {
            v.use_reg(*sf, Sf);
            v.imm(*taken);
        }
        Vop::Call { target, args } => {
            v.imm(*target);
            v.use_regset(*args);
        }
        Vop::Ret { args } => v.use_regset(*args),
        Vop::Jmpi { target } => v.imm(*target),
        Vop::Fallback { args, .. } => v.use_regset(*args),
        Vop::Fallbackcc { sf, .. } => v.use_reg(*sf, Sf),
        Vop::Bindjmp { args, .. } => v.use_regset(*args),
        Vop::Bindjcc { sf, .. } => v.use_reg(*sf, Sf),
        Vop::Ud2 | Vop::Nop => {}
    }
}

/// Apply `f` to every register operand in place, regardless of role.
///
/// Tuple operands are skipped; phi tuples are resolved by edge resolution,
/// not by renaming. Register sets already name physical registers.
pub fn visit_regs_mut(inst: &mut Vinstr, f: &mut impl FnMut(&mut Vreg, RegClass)) {
    use RegClass::*;
    let mut ptr = |m: &mut Vptr, f: &mut dyn FnMut(&mut Vreg, RegClass)| {
        if let Some(base) = m.base.as_mut() {
            f(base, Gpr);
        }
        if let Some(index) = m.index.as_mut() {
            f(index, Gpr);
        }
    };
    match &mut inst.op {
        Vop::Copy { s, d } => {
            f(s, Any);
            f(d, Any);
        }
        Vop::Copy2 { s0, s1, d0, d1 } => {
            f(s0, Any);
            f(s1, Any);
            f(d0, Any);
            f(d1, Any);
        }
        Vop::Copyargs { .. } | Vop::Phijmp { .. } | Vop::Phidef { .. } => {}
        Vop::Phijcc { sf, .. } => f(sf, Sf),
        Vop::Ldimmb { d, .. } | Vop::Ldimml { d, .. } | Vop::Ldimmq { d, .. } => f(d, Any),
        Vop::Load { s, d } => {
            ptr(s, &mut *f);
            f(d, Any);
        }
        Vop::Store { s, d } => {
            f(s, Any);
            ptr(d, &mut *f);
        }
        Vop::Loadups { s, d } => {
            ptr(s, &mut *f);
            f(d, SimdWide);
        }
        Vop::Storeups { s, d } => {
            f(s, SimdWide);
            ptr(d, &mut *f);
        }
        Vop::Lea { s, d } => {
            ptr(s, &mut *f);
            f(d, Gpr);
        }
        Vop::Addq { s0, s1, d, sf } | Vop::Subq { s0, s1, d, sf } => {
            f(s0, Gpr);
            f(s1, Gpr);
            f(d, Gpr);
            f(sf, Sf);
        }
        Vop::Addqi { s1, d, sf, .. } | Vop::Subqi { s1, d, sf, .. } => {
            f(s1, Gpr);
            f(d, Gpr);
            f(sf, Sf);
        }
        Vop::Cmpq { s0, s1, sf } | Vop::Testq { s0, s1, sf } => {
            f(s0, Gpr);
            f(s1, Gpr);
            f(sf, Sf);
        }
        Vop::Xorl { s0, s1, d, sf } | Vop::Xorb { s0, s1, d, sf } => {
            f(s0, Gpr);
            f(s1, Gpr);
            f(d, Gpr);
            f(sf, Sf);
        }
        Vop::Push { s } => f(s, Gpr),
        Vop::Pop { d } => f(d, Gpr),
        Vop::Jcc { sf, .. } | Vop::Jcci { sf, .. } => f(sf, Sf),
        Vop::Fallbackcc { sf, .. } | Vop::Bindjcc { sf, .. } => f(sf, Sf),
        Vop::Jmp { .. }
        | Vop::Call { .. }
        | Vop::Ret { .. }
        | Vop::Jmpi { .. }
        | Vop::Fallback { .. }
        | Vop::Bindjmp { .. }
        | Vop::Ud2
        | Vop::Nop => {}
    }
}

struct UseCollector<'a, F> {
    tuples: &'a [Vec<Vreg>],
    f: F,
}

impl<F: FnMut(Vreg)> OperandVisitor for UseCollector<'_, F> {
    fn use_reg(&mut self, r: Vreg, _class: RegClass) {
        (self.f)(r);
    }
    fn across(&mut self, r: Vreg, _class: RegClass) {
        (self.f)(r);
    }
    fn use_tuple(&mut self, t: Vtuple) {
        for &r in &self.tuples[t.index()] {
            (self.f)(r);
        }
    }
}

struct DefCollector<'a, F> {
    tuples: &'a [Vec<Vreg>],
    f: F,
}

impl<F: FnMut(Vreg)> OperandVisitor for DefCollector<'_, F> {
    fn def_reg(&mut self, r: Vreg, _class: RegClass) {
        (self.f)(r);
    }
    fn def_tuple(&mut self, t: Vtuple) {
        for &r in &self.tuples[t.index()] {
            (self.f)(r);
        }
    }
}

/// Call `f` for every used register (including across uses and tuples).
pub fn visit_uses(unit: &Vunit, inst: &Vinstr, f: impl FnMut(Vreg)) {
    let mut v = UseCollector {
        tuples: &unit.tuples,
        f,
    };
    visit_operands(inst, &mut v);
}

/// Call `f` for every defined register (including tuples).
pub fn visit_defs(unit: &Vunit, inst: &Vinstr, f: impl FnMut(Vreg)) {
    let mut v = DefCollector {
        tuples: &unit.tuples,
        f,
    };
    visit_operands(inst, &mut v);
}
