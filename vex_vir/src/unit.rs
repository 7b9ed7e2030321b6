//! Units: blocks of instructions plus tuple and constant tables.

use std::collections::HashMap;

use crate::inst::{Area, Vconst, Vinstr, Vlabel, Vtuple};
use crate::reg::Vreg;

/// A basic block.
#[derive(Debug)]
pub struct Vblock {
    pub area: Area,
    pub code: Vec<Vinstr>,
}

/// A compilation unit: the input and output of register allocation.
#[derive(Debug)]
pub struct Vunit {
    pub entry: Vlabel,
    pub blocks: Vec<Vblock>,
    /// Register tuples referenced by `Vtuple` operands.
    pub tuples: Vec<Vec<Vreg>>,
    /// Constants bound to Vregs; reloaded at each use by the allocator.
    pub consts: HashMap<Vconst, Vreg>,
    /// Next unallocated Vreg ID.
    pub next_vreg: u32,
}

impl Vunit {
    /// An empty unit whose entry block is already created.
    pub fn new() -> Vunit {
        let mut unit = Vunit {
            entry: Vlabel(0),
            blocks: Vec::new(),
            tuples: Vec::new(),
            consts: HashMap::new(),
            next_vreg: Vreg::V0,
        };
        unit.entry = unit.make_block(Area::Main);
        unit
    }

    pub fn make_vreg(&mut self) -> Vreg {
        let r = Vreg(self.next_vreg);
        self.next_vreg += 1;
        r
    }

    pub fn make_block(&mut self, area: Area) -> Vlabel {
        let label = Vlabel(self.blocks.len() as u32);
        self.blocks.push(Vblock {
            area,
            code: Vec::new(),
        });
        label
    }

    pub fn make_tuple(&mut self, regs: Vec<Vreg>) -> Vtuple {
        let t = Vtuple(self.tuples.len() as u32);
        self.tuples.push(regs);
        t
    }

    /// The Vreg bound to `c`, allocating one on first request.
    pub fn make_const(&mut self, c: Vconst) -> Vreg {
        if let Some(&r) = self.consts.get(&c) {
            return r;
        }
        let r = Vreg(self.next_vreg);
        self.next_vreg += 1;
        self.consts.insert(c, r);
        r
    }

    pub fn block(&self, label: Vlabel) -> &Vblock {
        &self.blocks[label.index()]
    }

    pub fn block_mut(&mut self, label: Vlabel) -> &mut Vblock {
        &mut self.blocks[label.index()]
    }

    pub fn tuple(&self, t: Vtuple) -> &[Vreg] {
        &self.tuples[t.index()]
    }
}

impl Default for Vunit {
    fn default() -> Vunit {
        Vunit::new()
    }
}
