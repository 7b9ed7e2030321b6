//! Text formatting for units and instructions.
//!
//! Output format:
//! ```text
//! B0 (main):
//!     ldimmq 1 => %64
//!     ldimmq 2 => %65
//!     addq %64, %65 => %66, %67
//!     ret {rax}
//! ```

use std::fmt::Write;

use crate::inst::{Vinstr, Vop, Vptr};
use crate::unit::Vunit;

fn fmt_ptr(m: &Vptr) -> String {
    let mut s = String::from("[");
    let mut delim = "";
    if let Some(base) = m.base {
        let _ = write!(s, "{base}");
        delim = " + ";
    }
    if let Some(index) = m.index {
        let _ = write!(s, "{delim}{index} * {}", m.scale);
        delim = " + ";
    }
    if m.disp != 0 || delim.is_empty() {
        let _ = write!(s, "{delim}{:#x}", m.disp);
    }
    s.push(']');
    if m.seg.is_some() {
        format!("fs:{s}")
    } else {
        s
    }
}

fn fmt_tuple(unit: &Vunit, t: crate::inst::Vtuple) -> String {
    let mut s = String::from("{");
    let mut delim = "";
    for r in unit.tuple(t) {
        let _ = write!(s, "{delim}{r}");
        delim = ", ";
    }
    s.push('}');
    s
}

/// Render one instruction.
pub fn show_inst(unit: &Vunit, inst: &Vinstr) -> String {
    let name = inst.op.name();
    match &inst.op {
        Vop::Copy { s, d } => format!("{name} {s} => {d}"),
        Vop::Copy2 { s0, s1, d0, d1 } => format!("{name} {s0}, {s1} => {d0}, {d1}"),
        Vop::Copyargs { s, d } => {
            format!("{name} {} => {}", fmt_tuple(unit, *s), fmt_tuple(unit, *d))
        }
        Vop::Phijmp { target, uses } => format!("{name} {} -> {target}", fmt_tuple(unit, *uses)),
        Vop::Phijcc { cc, sf, targets, uses } => format!(
            "{name} {cc:?} {sf}, {} -> {}, {}",
            fmt_tuple(unit, *uses),
            targets[0],
            targets[1]
        ),
        Vop::Phidef { defs } => format!("{name} => {}", fmt_tuple(unit, *defs)),
        Vop::Ldimmb { imm, d } => format!("{name} {imm} => {d}"),
        Vop::Ldimml { imm, d } => format!("{name} {imm} => {d}"),
        Vop::Ldimmq { imm, d } => format!("{name} {imm} => {d}"),
        Vop::Load { s, d } => format!("{name} {} => {d}", fmt_ptr(s)),
        Vop::Store { s, d } => format!("{name} {s} => {}", fmt_ptr(d)),
        Vop::Loadups { s, d } => format!("{name} {} => {d}", fmt_ptr(s)),
        Vop::Storeups { s, d } => format!("{name} {s} => {}", fmt_ptr(d)),
        Vop::Lea { s, d } => format!("{name} {} => {d}", fmt_ptr(s)),
        Vop::Addq { s0, s1, d, sf } | Vop::Subq { s0, s1, d, sf } => {
            format!("{name} {s0}, {s1} => {d}, {sf}")
        }
        Vop::Addqi { imm, s1, d, sf } | Vop::Subqi { imm, s1, d, sf } => {
            format!("{name} {imm}, {s1} => {d}, {sf}")
        }
        Vop::Cmpq { s0, s1, sf } | Vop::Testq { s0, s1, sf } => {
            format!("{name} {s0}, {s1} => {sf}")
        }
        Vop::Xorl { s0, s1, d, sf } | Vop::Xorb { s0, s1, d, sf } => {
            format!("{name} {s0}, {s1} => {d}, {sf}")
        }
        Vop::Push { s } => format!("{name} {s}"),
        Vop::Pop { d } => format!("{name} => {d}"),
        Vop::Jmp { target } => format!("{name} -> {target}"),
        Vop::Jcc { cc, sf, targets } => {
            format!("{name} {cc:?} {sf} -> {}, {}", targets[0], targets[1])
        }
        Vop::Jcci { cc, sf, target, taken } => {
            format!("{name} {cc:?} {sf} -> {target}, {taken:#x}")
        }
        Vop::Call { target, args } => format!("{name} {target:#x} {args:?}"),
        Vop::Ret { args } => format!("{name} {args:?}"),
        Vop::Jmpi { target } => format!("{name} {target:#x}"),
        Vop::Fallback { target, args } => format!("{name} sk:{} {args:?}", target.0),
        Vop::Fallbackcc { cc, sf, target } => format!("{name} {cc:?} {sf} sk:{}", target.0),
        Vop::Bindjmp { target, args } => format!("{name} sk:{} {args:?}", target.0),
        Vop::Bindjcc { cc, sf, target } => format!("{name} {cc:?} {sf} sk:{}", target.0),
        Vop::Ud2 | Vop::Nop => name.to_string(),
    }
}

/// Render a whole unit, block by block.
pub fn show_unit(unit: &Vunit) -> String {
    let mut out = String::new();
    for (bi, block) in unit.blocks.iter().enumerate() {
        let area = match block.area {
            crate::inst::Area::Main => "main",
            crate::inst::Area::Cold => "cold",
        };
        let _ = writeln!(out, "B{bi} ({area}):");
        for inst in &block.code {
            let _ = writeln!(out, "    {}", show_inst(unit, inst));
        }
    }
    out
}
