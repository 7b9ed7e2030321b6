//! Fluent construction of units, used by tests and examples.

use crate::inst::{
    Area, ConditionCode, ExitKey, Vconst, Vinstr, Vlabel, Vop, Vptr, Vtuple,
};
use crate::reg::{RegSet, Vreg};
use crate::unit::Vunit;

/// Builds a [`Vunit`] one block at a time.
///
/// `emit` appends to the currently selected block; helper methods allocate
/// result Vregs and return them so chains of definitions read naturally.
pub struct UnitBuilder {
    pub unit: Vunit,
    cur: Vlabel,
}

impl UnitBuilder {
    pub fn new() -> UnitBuilder {
        let unit = Vunit::new();
        let cur = unit.entry;
        UnitBuilder { unit, cur }
    }

    pub fn vreg(&mut self) -> Vreg {
        self.unit.make_vreg()
    }

    pub fn cnst(&mut self, c: Vconst) -> Vreg {
        self.unit.make_const(c)
    }

    pub fn tuple(&mut self, regs: Vec<Vreg>) -> Vtuple {
        self.unit.make_tuple(regs)
    }

    /// Create a new block without selecting it.
    pub fn block(&mut self, area: Area) -> Vlabel {
        self.unit.make_block(area)
    }

    /// Direct emission into the selected block.
    pub fn emit(&mut self, op: Vop) {
        self.unit.block_mut(self.cur).code.push(Vinstr::new(op));
    }

    pub fn select(&mut self, label: Vlabel) -> &mut Self {
        self.cur = label;
        self
    }

    pub fn ldimmq(&mut self, imm: u64) -> Vreg {
        let d = self.vreg();
        self.emit(Vop::Ldimmq { imm, d });
        d
    }

    pub fn copy(&mut self, s: Vreg) -> Vreg {
        let d = self.vreg();
        self.emit(Vop::Copy { s, d });
        d
    }

    /// `d = s0 + s1`; returns `(d, sf)`.
    pub fn addq(&mut self, s0: Vreg, s1: Vreg) -> (Vreg, Vreg) {
        let d = self.vreg();
        let sf = self.vreg();
        self.emit(Vop::Addq { s0, s1, d, sf });
        (d, sf)
    }

    /// `d = s1 - s0`; returns `(d, sf)`.
    pub fn subq(&mut self, s0: Vreg, s1: Vreg) -> (Vreg, Vreg) {
        let d = self.vreg();
        let sf = self.vreg();
        self.emit(Vop::Subq { s0, s1, d, sf });
        (d, sf)
    }

    /// Compare `s1` against `s0`; returns the flags Vreg.
    pub fn cmpq(&mut self, s0: Vreg, s1: Vreg) -> Vreg {
        let sf = self.vreg();
        self.emit(Vop::Cmpq { s0, s1, sf });
        sf
    }

    pub fn load(&mut self, s: Vptr) -> Vreg {
        let d = self.vreg();
        self.emit(Vop::Load { s, d });
        d
    }

    pub fn store(&mut self, s: Vreg, d: Vptr) {
        self.emit(Vop::Store { s, d });
    }

    pub fn push(&mut self, s: Vreg) {
        self.emit(Vop::Push { s });
    }

    pub fn pop(&mut self) -> Vreg {
        let d = self.vreg();
        self.emit(Vop::Pop { d });
        d
    }

    pub fn call(&mut self, target: u64, args: RegSet) {
        self.emit(Vop::Call { target, args });
    }

    pub fn jmp(&mut self, target: Vlabel) {
        self.emit(Vop::Jmp { target });
    }

    pub fn jcc(&mut self, cc: ConditionCode, sf: Vreg, targets: [Vlabel; 2]) {
        self.emit(Vop::Jcc { cc, sf, targets });
    }

    pub fn phijmp(&mut self, target: Vlabel, uses: Vec<Vreg>) {
        let uses = self.tuple(uses);
        self.emit(Vop::Phijmp { target, uses });
    }

    /// Start `label` with a phidef, returning the defined Vregs.
    pub fn phidef(&mut self, label: Vlabel, n: usize) -> Vec<Vreg> {
        let defs: Vec<Vreg> = (0..n).map(|_| self.vreg()).collect();
        let t = self.tuple(defs.clone());
        self.unit
            .block_mut(label)
            .code
            .push(Vinstr::new(Vop::Phidef { defs: t }));
        defs
    }

    pub fn fallbackcc(&mut self, cc: ConditionCode, sf: Vreg, target: ExitKey) {
        self.emit(Vop::Fallbackcc { cc, sf, target });
    }

    pub fn ret(&mut self, args: RegSet) {
        self.emit(Vop::Ret { args });
    }

    pub fn finish(self) -> Vunit {
        self.unit
    }
}

impl Default for UnitBuilder {
    fn default() -> UnitBuilder {
        UnitBuilder::new()
    }
}
