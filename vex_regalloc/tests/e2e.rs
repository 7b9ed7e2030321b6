//! End-to-end allocation scenarios.
//!
//! Each test builds a unit, runs the allocator, and checks the rewritten
//! code both structurally and by executing it in a small interpreter, so
//! the inserted spills, reloads, and parallel copies are proven to
//! preserve the program's meaning.

use std::collections::HashMap;

use vex_regalloc::{AllocError, Options, allocate, allocate_with};
use vex_target_x86::abi::{Abi, R12, RAX, RBX, RCX, abi as x64_abi};
use vex_vir::builder::UnitBuilder;
use vex_vir::inst::{Area, ConditionCode, ExitKey, Vconst, Vlabel, Vop};
use vex_vir::reg::{NUM_PHYS, RegSet, Vreg};
use vex_vir::unit::Vunit;

const STACK_TOP: u64 = 0x8000;

/// How an interpreted unit stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Ret,
    Trap,
    Jmpi(u64),
    Fallback(u64),
    Bindjmp(u64),
}

/// Machine state after interpreting a unit.
struct Machine {
    regs: [u64; NUM_PHYS],
    mem: HashMap<i64, u64>,
    /// Last comparison, as (lhs, rhs).
    flags: (i64, i64),
    exit: Exit,
}

impl Machine {
    fn reg(&self, r: Vreg) -> u64 {
        assert!(r.is_phys(), "interpreting unallocated operand {r}");
        self.regs[r.phys().index()]
    }

    fn set(&mut self, r: Vreg, val: u64) {
        assert!(r.is_phys(), "interpreting unallocated operand {r}");
        self.regs[r.phys().index()] = val;
    }

    fn addr(&self, m: &vex_vir::inst::Vptr) -> i64 {
        assert!(m.seg.is_none(), "segment loads not interpreted");
        let mut addr = m.disp as i64;
        if let Some(base) = m.base {
            addr += self.reg(base) as i64;
        }
        if let Some(index) = m.index {
            addr += self.reg(index) as i64 * m.scale as i64;
        }
        addr
    }

    fn cond(&self, cc: ConditionCode) -> bool {
        let (l, r) = self.flags;
        match cc {
            ConditionCode::E => l == r,
            ConditionCode::Ne => l != r,
            ConditionCode::L => l < r,
            ConditionCode::Le => l <= r,
            ConditionCode::G => l > r,
            ConditionCode::Ge => l >= r,
            ConditionCode::B => (l as u64) < (r as u64),
            ConditionCode::Be => (l as u64) <= (r as u64),
            ConditionCode::A => (l as u64) > (r as u64),
            ConditionCode::Ae => (l as u64) >= (r as u64),
            ConditionCode::S => l.wrapping_sub(r) < 0,
            ConditionCode::Ns => l.wrapping_sub(r) >= 0,
        }
    }
}

/// Execute an allocated unit. Calls scribble over `clobber`.
fn run(unit: &Vunit, clobber: RegSet) -> Machine {
    let mut m = Machine {
        regs: [0; NUM_PHYS],
        mem: HashMap::new(),
        flags: (0, 1),
        exit: Exit::Ret,
    };
    m.regs[x64_abi().sp.index()] = STACK_TOP;

    let mut block = unit.entry;
    let mut steps = 0;
    'blocks: loop {
        let code = &unit.block(block).code;
        assert!(!code.is_empty(), "interpreter entered empty block {block}");
        for inst in code {
            steps += 1;
            assert!(steps < 100_000, "interpreter ran away");
            match &inst.op {
                Vop::Ldimmb { imm, d } => m.set(*d, *imm as u64),
                Vop::Ldimml { imm, d } => m.set(*d, *imm as u32 as u64),
                Vop::Ldimmq { imm, d } => m.set(*d, *imm),
                Vop::Copy { s, d } => {
                    let v = m.reg(*s);
                    m.set(*d, v);
                }
                Vop::Copy2 { s0, s1, d0, d1 } => {
                    let (a, b) = (m.reg(*s0), m.reg(*s1));
                    m.set(*d0, a);
                    m.set(*d1, b);
                }
                Vop::Load { s, d } => {
                    let addr = m.addr(s);
                    let v = *m.mem.get(&addr).unwrap_or_else(|| {
                        panic!("load from uninitialized address {addr:#x}")
                    });
                    m.set(*d, v);
                }
                Vop::Store { s, d } => {
                    let addr = m.addr(d);
                    let v = m.reg(*s);
                    m.mem.insert(addr, v);
                }
                Vop::Lea { s, d } => {
                    let addr = m.addr(s);
                    m.set(*d, addr as u64);
                }
                Vop::Addq { s0, s1, d, .. } => {
                    let v = m.reg(*s0).wrapping_add(m.reg(*s1));
                    m.set(*d, v);
                    m.flags = (v as i64, 0);
                }
                Vop::Addqi { imm, s1, d, .. } => {
                    let v = m.reg(*s1).wrapping_add(*imm as i64 as u64);
                    m.set(*d, v);
                    m.flags = (v as i64, 0);
                }
                Vop::Subq { s0, s1, d, .. } => {
                    let v = m.reg(*s1).wrapping_sub(m.reg(*s0));
                    m.set(*d, v);
                    m.flags = (v as i64, 0);
                }
                Vop::Subqi { imm, s1, d, .. } => {
                    let v = m.reg(*s1).wrapping_sub(*imm as i64 as u64);
                    m.set(*d, v);
                    m.flags = (v as i64, 0);
                }
                Vop::Cmpq { s0, s1, .. } => {
                    m.flags = (m.reg(*s1) as i64, m.reg(*s0) as i64);
                }
                Vop::Testq { s0, s1, .. } => {
                    m.flags = ((m.reg(*s0) & m.reg(*s1)) as i64, 0);
                }
                Vop::Xorl { s0, s1, d, .. } => {
                    let v = (m.reg(*s0) ^ m.reg(*s1)) & 0xffff_ffff;
                    m.set(*d, v);
                    m.flags = (v as i64, 0);
                }
                Vop::Xorb { s0, s1, d, .. } => {
                    let v = (m.reg(*s0) ^ m.reg(*s1)) & 0xff;
                    m.set(*d, v);
                    m.flags = (v as i64, 0);
                }
                Vop::Push { s } => {
                    let sp = x64_abi().sp;
                    let at = m.regs[sp.index()].wrapping_sub(8);
                    m.regs[sp.index()] = at;
                    let v = m.reg(*s);
                    m.mem.insert(at as i64, v);
                }
                Vop::Pop { d } => {
                    let sp = x64_abi().sp;
                    let at = m.regs[sp.index()];
                    let v = *m.mem.get(&(at as i64)).expect("pop from empty stack");
                    m.set(*d, v);
                    m.regs[sp.index()] = at.wrapping_add(8);
                }
                Vop::Call { .. } => {
                    for r in clobber.iter() {
                        m.regs[r.index()] = 0xdead_0000 + r.index() as u64;
                    }
                }
                Vop::Jmp { target } => {
                    block = *target;
                    continue 'blocks;
                }
                Vop::Jcc { cc, targets, .. } => {
                    block = targets[m.cond(*cc) as usize];
                    continue 'blocks;
                }
                Vop::Jcci { cc, target, taken, .. } => {
                    if m.cond(*cc) {
                        m.exit = Exit::Jmpi(*taken);
                        return m;
                    }
                    block = *target;
                    continue 'blocks;
                }
                Vop::Ret { .. } => {
                    m.exit = Exit::Ret;
                    return m;
                }
                Vop::Ud2 => {
                    m.exit = Exit::Trap;
                    return m;
                }
                Vop::Jmpi { target } => {
                    m.exit = Exit::Jmpi(*target);
                    return m;
                }
                Vop::Fallback { target, .. } => {
                    m.exit = Exit::Fallback(target.0);
                    return m;
                }
                Vop::Fallbackcc { cc, target, .. } => {
                    if m.cond(*cc) {
                        m.exit = Exit::Fallback(target.0);
                        return m;
                    }
                }
                Vop::Bindjmp { target, .. } => {
                    m.exit = Exit::Bindjmp(target.0);
                    return m;
                }
                Vop::Bindjcc { cc, target, .. } => {
                    if m.cond(*cc) {
                        m.exit = Exit::Bindjmp(target.0);
                        return m;
                    }
                }
                Vop::Nop => {}
                op => panic!("{} survived allocation", op.name()),
            }
        }
        panic!("control fell off the end of {block}");
    }
}

fn count_ops(unit: &Vunit, pred: impl Fn(&Vop) -> bool) -> usize {
    unit.blocks
        .iter()
        .flat_map(|b| b.code.iter())
        .filter(|i| pred(&i.op))
        .count()
}

/// Two allocatable GPRs, one of them call-clobbered.
fn two_reg_abi() -> Abi {
    let mut abi = x64_abi();
    abi.gp_unreserved = RegSet::from_regs(&[RAX, RBX]);
    abi.calls_clobber = RegSet::from_regs(&[RAX]);
    abi
}

/// Four allocatable GPRs, two of them call-clobbered.
fn four_reg_abi() -> Abi {
    let mut abi = x64_abi();
    abi.gp_unreserved = RegSet::from_regs(&[RAX, RCX, RBX, R12]);
    abi.calls_clobber = RegSet::from_regs(&[RAX, RCX]);
    abi
}

// --- S1: single block, no spill ---

#[test]
fn straight_line_needs_no_memory_traffic() {
    let mut b = UnitBuilder::new();
    let v1 = b.ldimmq(1);
    let v2 = b.ldimmq(2);
    let (v3, _) = b.addq(v1, v2);
    b.emit(Vop::Copy { s: v3, d: RAX.into() });
    b.ret(RegSet::from_regs(&[RAX]));
    let mut unit = b.finish();

    allocate(&mut unit, &x64_abi()).unwrap();

    assert_eq!(count_ops(&unit, |op| matches!(op, Vop::Store { .. })), 0);
    assert_eq!(count_ops(&unit, |op| matches!(op, Vop::Load { .. })), 0);
    let m = run(&unit, RegSet::EMPTY);
    assert_eq!(m.exit, Exit::Ret);
    assert_eq!(m.regs[RAX.index()], 3);
}

// --- S2: register pressure forces spills ---

#[test]
fn call_clobber_forces_one_spill_with_two_regs() {
    // v1 and v2 both live across a call that clobbers rax: exactly one
    // value spills, with one store after its def and one reload.
    let mut b = UnitBuilder::new();
    let v1 = b.ldimmq(7);
    let v2 = b.ldimmq(9);
    b.call(0x1000, RegSet::EMPTY);
    let (v3, _) = b.addq(v1, v2);
    b.emit(Vop::Copy { s: v3, d: RAX.into() });
    b.ret(RegSet::from_regs(&[RAX]));
    let mut unit = b.finish();

    let abi = two_reg_abi();
    allocate(&mut unit, &abi).unwrap();

    assert_eq!(count_ops(&unit, |op| matches!(op, Vop::Store { .. })), 1);
    assert_eq!(count_ops(&unit, |op| matches!(op, Vop::Load { .. })), 1);
    // Spill space is created and destroyed around the spill-live region.
    let leas: Vec<i32> = unit
        .blocks
        .iter()
        .flat_map(|blk| blk.code.iter())
        .filter_map(|i| match &i.op {
            Vop::Lea { s, .. } => Some(s.disp),
            _ => None,
        })
        .collect();
    assert_eq!(leas, vec![-16, 16]);

    let m = run(&unit, abi.calls_clobber);
    assert_eq!(m.exit, Exit::Ret);
    assert_eq!(m.regs[RAX.index()], 16);
    assert_eq!(m.regs[abi.sp.index()], STACK_TOP);
}

#[test]
fn heavy_pressure_spills_and_still_computes() {
    let mut b = UnitBuilder::new();
    let vals: Vec<Vreg> = (1..=5).map(|i| b.ldimmq(i * 10)).collect();
    b.call(0x1000, RegSet::EMPTY);
    let mut acc = vals[0];
    for &v in &vals[1..] {
        acc = b.addq(acc, v).0;
    }
    b.emit(Vop::Copy { s: acc, d: RAX.into() });
    b.ret(RegSet::from_regs(&[RAX]));
    let mut unit = b.finish();

    let abi = four_reg_abi();
    allocate(&mut unit, &abi).unwrap();

    assert!(count_ops(&unit, |op| matches!(op, Vop::Store { .. })) >= 1);
    assert!(count_ops(&unit, |op| matches!(op, Vop::Load { .. })) >= 1);
    let m = run(&unit, abi.calls_clobber);
    assert_eq!(m.exit, Exit::Ret);
    assert_eq!(m.regs[RAX.index()], 150);
    assert_eq!(m.regs[abi.sp.index()], STACK_TOP);
}

// --- S3: phi reconciliation ---

fn phi_unit(cc: ConditionCode) -> (Vunit, Vlabel, Vlabel) {
    let mut b = UnitBuilder::new();
    let left = b.block(Area::Main);
    let right = b.block(Area::Main);
    let join = b.block(Area::Main);
    let vp = b.phidef(join, 1);

    let v0 = b.ldimmq(1);
    let w = b.ldimmq(2);
    let sf = b.cmpq(v0, w);
    b.jcc(cc, sf, [left, right]);

    b.select(left);
    let vl = b.ldimmq(11);
    b.phijmp(join, vec![vl]);

    b.select(right);
    let vr = b.ldimmq(22);
    b.phijmp(join, vec![vr]);

    b.select(join);
    b.emit(Vop::Copy { s: vp[0], d: RAX.into() });
    b.ret(RegSet::from_regs(&[RAX]));
    (b.finish(), left, right)
}

#[test]
fn phi_values_arrive_through_either_edge() {
    // flags are (2, 1): E picks the fall-through arm, Ne the taken arm.
    let (mut unit, _, _) = phi_unit(ConditionCode::E);
    allocate(&mut unit, &x64_abi()).unwrap();
    assert_eq!(count_ops(&unit, |op| matches!(op, Vop::Phijmp { .. })), 0);
    assert_eq!(count_ops(&unit, |op| matches!(op, Vop::Phidef { .. })), 0);
    let m = run(&unit, RegSet::EMPTY);
    assert_eq!(m.regs[RAX.index()], 11);

    let (mut unit, _, _) = phi_unit(ConditionCode::Ne);
    allocate(&mut unit, &x64_abi()).unwrap();
    let m = run(&unit, RegSet::EMPTY);
    assert_eq!(m.regs[RAX.index()], 22);
}

// --- S4: hint following deletes copies ---

#[test]
fn copy_follows_hint_and_disappears() {
    let mut b = UnitBuilder::new();
    let v1 = b.ldimmq(7);
    let v2 = b.copy(v1);
    b.emit(Vop::Copy { s: v2, d: RAX.into() });
    b.ret(RegSet::from_regs(&[RAX]));
    let mut unit = b.finish();

    allocate(&mut unit, &x64_abi()).unwrap();

    // Every copy collapsed: the source was hinted into rax directly.
    assert_eq!(count_ops(&unit, |op| matches!(op, Vop::Copy { .. })), 0);
    let m = run(&unit, RegSet::EMPTY);
    assert_eq!(m.regs[RAX.index()], 7);
}

// --- Constant rematerialization ---

#[test]
fn constants_rematerialize_at_uses() {
    let mut b = UnitBuilder::new();
    let c = b.cnst(Vconst::quad(42));
    let v1 = b.copy(c);
    b.emit(Vop::Copy { s: v1, d: RAX.into() });
    b.ret(RegSet::from_regs(&[RAX]));
    let mut unit = b.finish();

    allocate(&mut unit, &x64_abi()).unwrap();
    assert_eq!(count_ops(&unit, |op| matches!(op, Vop::Ldimmq { .. })), 1);
    let m = run(&unit, RegSet::EMPTY);
    assert_eq!(m.regs[RAX.index()], 42);
}

#[test]
fn zero_constant_lowers_to_xor_when_flags_dead() {
    let mut b = UnitBuilder::new();
    let c = b.cnst(Vconst::quad(0));
    let v1 = b.copy(c);
    b.emit(Vop::Copy { s: v1, d: RAX.into() });
    b.ret(RegSet::from_regs(&[RAX]));
    let mut unit = b.finish();

    allocate(&mut unit, &x64_abi()).unwrap();
    assert_eq!(count_ops(&unit, |op| matches!(op, Vop::Xorl { .. })), 1);
    assert_eq!(count_ops(&unit, |op| matches!(op, Vop::Ldimmq { .. })), 0);
    let m = run(&unit, RegSet::EMPTY);
    assert_eq!(m.regs[RAX.index()], 0);
}

// --- Loops ---

#[test]
fn counting_loop_flows_values_around_the_backedge() {
    let mut b = UnitBuilder::new();
    let header = b.block(Area::Main);
    let body = b.block(Area::Main);
    let exit = b.block(Area::Main);
    let phi = b.phidef(header, 1);
    let i = phi[0];

    let one = b.ldimmq(1);
    let limit = b.ldimmq(5);
    let zero = b.ldimmq(0);
    b.phijmp(header, vec![zero]);

    b.select(header);
    let sf = b.cmpq(limit, i);
    b.jcc(ConditionCode::E, sf, [body, exit]);

    b.select(body);
    let (i2, _) = b.addq(i, one);
    b.phijmp(header, vec![i2]);

    b.select(exit);
    b.emit(Vop::Copy { s: i, d: RAX.into() });
    b.ret(RegSet::from_regs(&[RAX]));
    let mut unit = b.finish();

    allocate(&mut unit, &x64_abi()).unwrap();
    let m = run(&unit, RegSet::EMPTY);
    assert_eq!(m.exit, Exit::Ret);
    assert_eq!(m.regs[RAX.index()], 5);
}

// --- S6: spill activation around a conditional unit exit ---

fn spill_exit_unit(cc: ConditionCode) -> Vunit {
    let mut b = UnitBuilder::new();
    let v1 = b.ldimmq(7);
    let v2 = b.ldimmq(9);
    b.call(0x1000, RegSet::EMPTY);
    let sf = b.cmpq(v2, v2);
    b.fallbackcc(cc, sf, ExitKey(99));
    let (v3, _) = b.addq(v1, v2);
    b.emit(Vop::Copy { s: v3, d: RAX.into() });
    b.ret(RegSet::from_regs(&[RAX]));
    b.finish()
}

#[test]
fn conditional_exit_in_spill_region_detours_through_cold_stub() {
    let mut unit = spill_exit_unit(ConditionCode::E);
    let abi = two_reg_abi();
    allocate(&mut unit, &abi).unwrap();

    // The fallbackcc became a jcc; a cold block frees and exits.
    assert_eq!(count_ops(&unit, |op| matches!(op, Vop::Fallbackcc { .. })), 0);
    let cold = unit
        .blocks
        .iter()
        .find(|blk| {
            blk.area == Area::Cold
                && blk
                    .code
                    .iter()
                    .any(|i| matches!(i.op, Vop::Fallback { .. }))
        })
        .expect("no cold exit stub");
    assert!(
        matches!(&cold.code[0].op, Vop::Lea { s, .. } if s.disp > 0),
        "cold stub must free spill space first"
    );

    // cmp makes flags equal, so E takes the exit; sp must be restored.
    let m = run(&unit, abi.calls_clobber);
    assert_eq!(m.exit, Exit::Fallback(99));
    assert_eq!(m.regs[abi.sp.index()], STACK_TOP);
}

#[test]
fn conditional_exit_not_taken_leaves_spill_region_intact() {
    let mut unit = spill_exit_unit(ConditionCode::Ne);
    let abi = two_reg_abi();
    allocate(&mut unit, &abi).unwrap();

    let m = run(&unit, abi.calls_clobber);
    assert_eq!(m.exit, Exit::Ret);
    assert_eq!(m.regs[RAX.index()], 16);
    assert_eq!(m.regs[abi.sp.index()], STACK_TOP);
}

// --- Stress knob ---

#[test]
fn stress_spill_inflates_the_area_but_preserves_semantics() {
    let mut unit = spill_exit_unit(ConditionCode::Ne);
    let abi = two_reg_abi();
    let opts = Options {
        stress_spill: true,
        ..Options::default()
    };
    allocate_with(&mut unit, &abi, &opts).unwrap();

    let m = run(&unit, abi.calls_clobber);
    assert_eq!(m.exit, Exit::Ret);
    assert_eq!(m.regs[RAX.index()], 16);
    assert_eq!(m.regs[abi.sp.index()], STACK_TOP);
}

// --- Capacity failure ---

#[test]
fn impossible_pressure_at_one_position_punts() {
    // Two simultaneous register demands with a single allocatable GPR.
    let mut b = UnitBuilder::new();
    let v1 = b.ldimmq(1);
    let v2 = b.ldimmq(2);
    let (v3, _) = b.addq(v1, v2);
    b.emit(Vop::Copy { s: v3, d: RBX.into() });
    b.ret(RegSet::from_regs(&[RBX]));
    let mut unit = b.finish();

    let mut abi = x64_abi();
    abi.gp_unreserved = RegSet::from_regs(&[RBX]);
    abi.calls_clobber = RegSet::EMPTY;
    let err = allocate(&mut unit, &abi).unwrap_err();
    assert!(matches!(err, AllocError::RegSpill(_)));
}
