//! Unit tests for the VIR: registers, CFG utilities, visitation, checks.

use crate::builder::UnitBuilder;
use crate::cfg::{compute_preds, sort_blocks, split_critical_edges, succs};
use crate::check::check;
use crate::display::show_unit;
use crate::inst::{Area, ConditionCode, Vinstr, Vop};
use crate::reg::{PhysReg, RegClass, RegSet, Vreg};
use crate::visit::{visit_defs, visit_regs_mut, visit_uses};

#[test]
fn vreg_phys_encoding() {
    let r = Vreg::from(PhysReg(3));
    assert!(r.is_phys());
    assert_eq!(r.phys(), PhysReg(3));
    assert!(!Vreg::virt(0).is_phys());
    assert_eq!(Vreg::virt(0).0, Vreg::V0);
}

#[test]
fn regset_ops() {
    let a = RegSet::from_regs(&[PhysReg(0), PhysReg(1), PhysReg(16)]);
    let b = RegSet::from_regs(&[PhysReg(1), PhysReg(16)]);
    assert_eq!((a & b).count(), 2);
    assert_eq!((a - b).count(), 1);
    assert!((a - b).contains(PhysReg(0)));
    assert_eq!((a | b), a);
    let members: Vec<_> = b.iter().collect();
    assert_eq!(members, vec![PhysReg(1), PhysReg(16)]);
}

#[test]
fn physreg_classes() {
    assert!(PhysReg(0).is_gp());
    assert!(PhysReg(16).is_simd());
    assert!(PhysReg::SF.is_sf());
    assert_eq!(PhysReg(0).name(), "rax");
    assert_eq!(PhysReg(31).name(), "xmm15");
}

#[test]
fn rpo_orders_preds_first() {
    // entry -> b1 -> b3, entry -> b2 -> b3
    let mut b = UnitBuilder::new();
    let b1 = b.block(Area::Main);
    let b2 = b.block(Area::Main);
    let b3 = b.block(Area::Main);
    let v = b.ldimmq(1);
    let sf = b.cmpq(v, v);
    b.jcc(ConditionCode::E, sf, [b1, b2]);
    b.select(b1).jmp(b3);
    b.select(b2).jmp(b3);
    b.select(b3).ret(RegSet::EMPTY);
    let unit = b.finish();

    let order = sort_blocks(&unit);
    let pos = |l: crate::inst::Vlabel| order.iter().position(|&x| x == l).unwrap();
    assert_eq!(order[0], unit.entry);
    assert!(pos(b1) < pos(b3));
    assert!(pos(b2) < pos(b3));
}

#[test]
fn cold_blocks_sort_last() {
    let mut b = UnitBuilder::new();
    let cold = b.block(Area::Cold);
    let main = b.block(Area::Main);
    let v = b.ldimmq(1);
    let sf = b.cmpq(v, v);
    b.jcc(ConditionCode::E, sf, [cold, main]);
    b.select(cold).ret(RegSet::EMPTY);
    b.select(main).ret(RegSet::EMPTY);
    let unit = b.finish();

    let order = sort_blocks(&unit);
    assert_eq!(*order.last().unwrap(), cold);
}

#[test]
fn critical_edge_gets_forwarding_block() {
    // entry branches to b1 and b2; both fall into b2 (b2 has two preds and
    // entry has two succs, so entry->b2 is critical).
    let mut b = UnitBuilder::new();
    let b1 = b.block(Area::Main);
    let b2 = b.block(Area::Main);
    let v = b.ldimmq(1);
    let sf = b.cmpq(v, v);
    b.jcc(ConditionCode::E, sf, [b1, b2]);
    b.select(b1).jmp(b2);
    b.select(b2).ret(RegSet::EMPTY);
    let mut unit = b.finish();

    let before = unit.blocks.len();
    split_critical_edges(&mut unit);
    assert_eq!(unit.blocks.len(), before + 1);
    // The new forwarding block holds a single jmp to b2.
    let m = &unit.blocks[before];
    assert_eq!(m.code.len(), 1);
    assert!(matches!(m.code[0].op, Vop::Jmp { target } if target == b2));
    // No multi-succ block reaches a multi-pred block directly anymore.
    let preds = compute_preds(&unit);
    for block in &unit.blocks {
        if succs(block).len() <= 1 {
            continue;
        }
        for s in succs(block) {
            assert_eq!(preds[s.index()].len(), 1);
        }
    }
}

#[test]
fn phijcc_critical_edge_rewrites_to_jcc() {
    let mut b = UnitBuilder::new();
    let join = b.block(Area::Main);
    let other = b.block(Area::Main);
    let vp = b.phidef(join, 1);
    let vo = b.phidef(other, 1);
    let v = b.ldimmq(7);
    let sf = b.cmpq(v, v);
    let uses = b.tuple(vec![v]);
    b.emit(Vop::Phijcc {
        cc: ConditionCode::E,
        sf,
        targets: [join, other],
        uses,
    });
    b.select(other).phijmp(join, vec![vo[0]]);
    b.select(join);
    b.ret(RegSet::EMPTY);
    let _ = vp;
    let mut unit = b.finish();

    split_critical_edges(&mut unit);
    let term = &unit.block(unit.entry).code.last().unwrap().op;
    assert!(matches!(term, Vop::Jcc { .. }));
    for &m in term.succs() {
        let code = &unit.block(m).code;
        assert_eq!(code.len(), 1);
        assert!(matches!(code[0].op, Vop::Phijmp { .. }));
    }
}

#[test]
fn check_rejects_multiple_defs() {
    let mut b = UnitBuilder::new();
    let v = b.ldimmq(1);
    b.emit(Vop::Ldimmq { imm: 2, d: v });
    b.ret(RegSet::EMPTY);
    let unit = b.finish();

    let result = check(&unit);
    assert!(!result.is_ok());
    assert!(result.errors[0].message.contains("SSA"));
}

#[test]
fn check_rejects_missing_terminator() {
    let mut b = UnitBuilder::new();
    b.ldimmq(1);
    let unit = b.finish();
    assert!(!check(&unit).is_ok());
}

#[test]
fn check_accepts_well_formed_unit() {
    let mut b = UnitBuilder::new();
    let v1 = b.ldimmq(1);
    let v2 = b.ldimmq(2);
    let (v3, _) = b.addq(v1, v2);
    b.emit(Vop::Copy {
        s: v3,
        d: PhysReg(0).into(),
    });
    b.ret(RegSet::from_regs(&[PhysReg(0)]));
    let unit = b.finish();
    let result = check(&unit);
    assert!(result.is_ok(), "{result}");
}

#[test]
fn visitors_see_all_operands() {
    let mut b = UnitBuilder::new();
    let v1 = b.ldimmq(1);
    let v2 = b.ldimmq(2);
    let (v3, sf) = b.addq(v1, v2);
    let unit = b.finish();

    let add = &unit.block(unit.entry).code[2];
    let mut uses = Vec::new();
    visit_uses(&unit, add, |r| uses.push(r));
    assert_eq!(uses, vec![v1, v2]);

    let mut defs = Vec::new();
    visit_defs(&unit, add, |r| defs.push(r));
    assert_eq!(defs, vec![v3, sf]);
}

#[test]
fn visit_regs_mut_renames_in_place() {
    let mut inst = Vinstr::new(Vop::Addq {
        s0: Vreg::virt(0),
        s1: Vreg::virt(1),
        d: Vreg::virt(2),
        sf: Vreg::virt(3),
    });
    visit_regs_mut(&mut inst, &mut |r: &mut Vreg, class: RegClass| {
        *r = if class == RegClass::Sf {
            PhysReg::SF.into()
        } else {
            PhysReg(0).into()
        };
    });
    match inst.op {
        Vop::Addq { s0, s1, d, sf } => {
            assert_eq!(s0, PhysReg(0).into());
            assert_eq!(s1, PhysReg(0).into());
            assert_eq!(d, PhysReg(0).into());
            assert_eq!(sf, PhysReg::SF.into());
        }
        _ => unreachable!(),
    }
}

#[test]
fn display_smoke() {
    let mut b = UnitBuilder::new();
    let v1 = b.ldimmq(1);
    let v2 = b.copy(v1);
    b.store(v2, crate::inst::Vptr::base_disp(PhysReg(4), 8));
    b.ret(RegSet::EMPTY);
    let unit = b.finish();

    let text = show_unit(&unit);
    assert!(text.contains("B0 (main):"));
    assert!(text.contains("ldimmq 1 => %64"));
    assert!(text.contains("copy %64 => %65"));
}
