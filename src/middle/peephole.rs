//! The peephole simplifier: a three-instruction sliding window over the
//! linearized stream, run to a fixed point.
//!
//! After a successful rewrite the window is reconstructed from a seed (the
//! instruction just before the surviving statement), so freshly created
//! adjacencies are rewritten in the same pass.  A temporary with a use count
//! of at most one is substitutable; statements flagged `no_combine` never
//! participate in a fusion.

use crate::common::*;
use crate::front::ast::BinOp;
use crate::front::types::TypeTable;
use crate::middle::cfg::Function;
use crate::middle::linearize::linear_order;
use crate::middle::oir::{Body, Cc, Constant, Op};

/// Simplify the whole function until a pass makes no change.
pub fn simplify(func: &mut Function, types: &TypeTable) {
    let order = linear_order(func);
    loop {
        let mut changed = false;
        for &block in &order {
            changed |= simplify_block(&mut func.body, types, block);
        }
        if !changed {
            break;
        }
    }
}

fn simplify_block(body: &mut Body, types: &TypeTable, block: BlockId) -> bool {
    let mut changed = false;
    let mut seed = body.block(block).leader;
    while let Some(i1) = seed {
        match try_window(body, types, i1) {
            Some(new_seed) => {
                changed = true;
                seed = new_seed.or(body.block(block).leader);
            }
            None => seed = body.inst(i1).next,
        }
    }
    changed
}

/// Attempt every rule on the window starting at `i1`.  `Some(seed)` means a
/// rewrite happened and the window restarts from `seed`.
fn try_window(body: &mut Body, types: &TypeTable, i1: InstId) -> Option<Option<InstId>> {
    let i2 = body.inst(i1).next;
    let i3 = i2.and_then(|i| body.inst(i).next);

    if let (Some(i2), Some(i3)) = (i2, i3) {
        if let Some(seed) = rule_read_modify_write(body, i1, i2, i3) {
            return Some(seed);
        }
    }
    if let Some(i2) = i2 {
        if !body.inst(i1).no_combine && !body.inst(i2).no_combine {
            if let Some(seed) = pair_rules(body, types, i1, i2) {
                return Some(seed);
            }
        }
    }
    single_rules(body, types, i1)
}

/// Seed so the rebuilt window also covers the instruction before `survivor`.
fn seed_before(body: &Body, survivor: InstId) -> Option<InstId> {
    Some(body.inst(survivor).prev.unwrap_or(survivor))
}

fn substitutable(body: &Body, var: VarId) -> bool {
    let v = body.var(var);
    v.is_temp && v.use_count <= 1
}

fn same_width(body: &Body, types: &TypeTable, a: VarId, b: VarId) -> bool {
    types.size(body.var(a).ty) == types.size(body.var(b).ty)
}

fn commutative(op: BinOp) -> bool {
    use BinOp::*;
    matches!(
        op,
        Add | Mul | BitAnd | BitOr | BitXor | LogicalAnd | LogicalOr
    )
}

fn fold_with_const(op: BinOp, existing: Constant, incoming: Constant) -> Option<Constant> {
    use BinOp::*;
    Some(match op {
        Add => existing.add_constants(incoming),
        Sub => existing.subtract_constants(incoming),
        Mul => existing.multiply_constants(incoming),
        LogicalAnd => existing.logical_and_constants(incoming),
        LogicalOr => existing.logical_or_constants(incoming),
        _ => return None,
    })
}

/// `t <- a ; y <- t op z ; a <- y`  =>  `a <- a op z`  (same non-temp `a`).
fn rule_read_modify_write(
    body: &mut Body,
    i1: InstId,
    i2: InstId,
    i3: InstId,
) -> Option<Option<InstId>> {
    let Op::Assign { dst: t, src: a } = body.inst(i1).op else {
        return None;
    };
    let Op::Bin {
        op,
        dst: y,
        lhs,
        rhs: z,
    } = body.inst(i2).op
    else {
        return None;
    };
    let Op::Assign { dst: a2, src: y2 } = body.inst(i3).op else {
        return None;
    };
    if lhs != t || y2 != y || a2 != a || z == t {
        return None;
    }
    if body.var(a).is_temp || !substitutable(body, t) || !substitutable(body, y) {
        return None;
    }
    body.rewrite_statement(
        i3,
        Op::Bin {
            op,
            dst: a,
            lhs: a,
            rhs: z,
        },
    );
    body.delete_statement(i1);
    body.delete_statement(i2);
    Some(seed_before(body, i3))
}

fn pair_rules(
    body: &mut Body,
    types: &TypeTable,
    i1: InstId,
    i2: InstId,
) -> Option<Option<InstId>> {
    let op1 = body.inst(i1).op.clone();
    let op2 = body.inst(i2).op.clone();

    match op1 {
        // constant propagation through an adjacent use
        Op::AssignConst { dst: t, src: c } if substitutable(body, t) && !matches!(c, Constant::Str(_)) => {
            match op2 {
                // tk <- c ; x <- tk  =>  x <- c
                Op::Assign { dst, src } if src == t => {
                    body.rewrite_statement(i2, Op::AssignConst { dst, src: c });
                    body.delete_statement(i1);
                    return Some(seed_before(body, i2));
                }
                // t <- c1 ; u <- t op c2  =>  u <- fold(c1 op c2)
                Op::BinConst { op, dst, lhs, imm } if lhs == t => {
                    if let Some(folded) = fold_with_const(op, c, imm) {
                        body.rewrite_statement(i2, Op::AssignConst { dst, src: folded });
                        body.delete_statement(i1);
                        return Some(seed_before(body, i2));
                    }
                }
                // t <- c ; y <- x op t  =>  y <- x op c
                Op::Bin { op, dst, lhs, rhs } if rhs == t && lhs != t => {
                    body.rewrite_statement(
                        i2,
                        Op::BinConst {
                            op,
                            dst,
                            lhs,
                            imm: c,
                        },
                    );
                    body.delete_statement(i1);
                    return Some(seed_before(body, i2));
                }
                // t <- c ; y <- t op z  =>  y <- z op c  (commutative only)
                Op::Bin { op, dst, lhs, rhs } if lhs == t && rhs != t && commutative(op) => {
                    body.rewrite_statement(
                        i2,
                        Op::BinConst {
                            op,
                            dst,
                            lhs: rhs,
                            imm: c,
                        },
                    );
                    body.delete_statement(i1);
                    return Some(seed_before(body, i2));
                }
                // t <- c ; cmp x, t  =>  cmp x, c
                Op::Cmp { lhs, rhs } if rhs == t && lhs != t => {
                    body.rewrite_statement(i2, Op::CmpConst { lhs, imm: c });
                    body.delete_statement(i1);
                    return Some(seed_before(body, i2));
                }
                _ => {}
            }
        }

        // copy substitution into the next statement
        Op::Assign { dst: t, src: a }
            if t != a
                && substitutable(body, t)
                && same_width(body, types, t, a)
                && !matches!(op2, Op::Phi { .. }) =>
        {
            if op2.used_vars().contains(&t) {
                let mut new_op = op2.clone();
                new_op.map_uses(|used| if used == t { a } else { used });
                body.rewrite_statement(i2, new_op);
                body.delete_statement(i1);
                return Some(seed_before(body, i2));
            }
        }

        // load t <- [..] ; u <- t  =>  load u <- [..]
        Op::Load { dst: t, .. }
        | Op::LoadConstOffset { dst: t, .. }
        | Op::LoadVarOffset { dst: t, .. }
            if substitutable(body, t) =>
        {
            if let Op::Assign { dst: u, src } = op2 {
                if src == t && same_width(body, types, t, u) {
                    let mut new_op = body.inst(i1).op.clone();
                    new_op.set_def(u);
                    body.rewrite_statement(i1, new_op);
                    body.delete_statement(i2);
                    return Some(seed_before(body, i1));
                }
            }
        }

        _ => {}
    }

    // address-calculation collapses
    match (op1, op2) {
        // t <- a + c1 ; u <- t + c2  =>  u <- a + (c1+c2)
        (
            Op::BinConst {
                op: BinOp::Add,
                dst: t,
                lhs: a,
                imm: c1,
            },
            Op::BinConst {
                op: BinOp::Add,
                dst: u,
                lhs,
                imm: c2,
            },
        ) if lhs == t && substitutable(body, t) => {
            body.rewrite_statement(
                i2,
                Op::BinConst {
                    op: BinOp::Add,
                    dst: u,
                    lhs: a,
                    imm: c1.add_constants(c2),
                },
            );
            body.delete_statement(i1);
            Some(seed_before(body, i2))
        }
        // t <- &S + o ; u <- t + c  =>  u <- &S + (o+c)
        (
            Op::MemoryAddress {
                dst: t,
                target,
                offset,
            },
            Op::BinConst {
                op: BinOp::Add,
                dst: u,
                lhs,
                imm,
            },
        ) if lhs == t && substitutable(body, t) => {
            body.rewrite_statement(
                i2,
                Op::MemoryAddress {
                    dst: u,
                    target,
                    offset: offset.wrapping_add(imm.value_i64() as i32),
                },
            );
            body.delete_statement(i1);
            Some(seed_before(body, i2))
        }
        // t <- a + b ; store [t] <- v  =>  store [a + b*1] <- v
        (
            Op::Bin {
                op: BinOp::Add,
                dst: t,
                lhs: a,
                rhs: b,
            },
            Op::Store { addr, src },
        ) if addr == t && src != t && substitutable(body, t) => {
            body.rewrite_statement(
                i2,
                Op::StoreVarOffset {
                    base: a,
                    index: b,
                    scale: 1,
                    src,
                },
            );
            body.delete_statement(i1);
            Some(seed_before(body, i2))
        }
        // t <- a + b ; load v <- [t]  =>  load v <- [a + b*1]
        (
            Op::Bin {
                op: BinOp::Add,
                dst: t,
                lhs: a,
                rhs: b,
            },
            Op::Load { dst: v, addr },
        ) if addr == t && substitutable(body, t) => {
            body.rewrite_statement(
                i2,
                Op::LoadVarOffset {
                    dst: v,
                    base: a,
                    index: b,
                    scale: 1,
                },
            );
            body.delete_statement(i1);
            Some(seed_before(body, i2))
        }
        // t <- a + c ; load v <- [t]  =>  load v <- [a + c]
        (
            Op::BinConst {
                op: BinOp::Add,
                dst: t,
                lhs: a,
                imm,
            },
            Op::Load { dst: v, addr },
        ) if addr == t && substitutable(body, t) => {
            body.rewrite_statement(
                i2,
                Op::LoadConstOffset {
                    dst: v,
                    base: a,
                    offset: imm.value_i64() as i32,
                },
            );
            body.delete_statement(i1);
            Some(seed_before(body, i2))
        }
        // t <- a + c ; store [t] <- v  =>  store [a + c] <- v
        (
            Op::BinConst {
                op: BinOp::Add,
                dst: t,
                lhs: a,
                imm,
            },
            Op::Store { addr, src },
        ) if addr == t && src != t && substitutable(body, t) => {
            body.rewrite_statement(
                i2,
                Op::StoreConstOffset {
                    base: a,
                    offset: imm.value_i64() as i32,
                    src,
                },
            );
            body.delete_statement(i1);
            Some(seed_before(body, i2))
        }
        _ => None,
    }
}

fn single_rules(body: &mut Body, types: &TypeTable, i1: InstId) -> Option<Option<InstId>> {
    match body.inst(i1).op.clone() {
        // t <- t
        Op::Assign { dst, src } if dst == src => {
            let seed = body.inst(i1).prev.or(body.inst(i1).next);
            body.delete_statement(i1);
            Some(seed)
        }
        // dead constant load
        Op::AssignConst { dst, .. }
            if body.var(dst).is_temp && body.var(dst).use_count == 0 =>
        {
            let seed = body.inst(i1).prev.or(body.inst(i1).next);
            body.delete_statement(i1);
            Some(seed)
        }
        // zero displacements drop
        Op::LoadConstOffset { dst, base, offset: 0 } => {
            body.rewrite_statement(i1, Op::Load { dst, addr: base });
            Some(seed_before(body, i1))
        }
        Op::StoreConstOffset {
            base,
            offset: 0,
            src,
        } => {
            body.rewrite_statement(i1, Op::Store { addr: base, src });
            Some(seed_before(body, i1))
        }
        Op::BinConst { op, dst, lhs, imm } => bin_const_rules(body, types, i1, op, dst, lhs, imm),
        _ => None,
    }
}

/// Strength and identity rewrites on binary-with-constant statements.
fn bin_const_rules(
    body: &mut Body,
    types: &TypeTable,
    inst: InstId,
    op: BinOp,
    dst: VarId,
    lhs: VarId,
    imm: Constant,
) -> Option<Option<InstId>> {
    use BinOp::*;
    if matches!(imm, Constant::Str(_)) {
        return None;
    }

    // multiplications and divisions by powers of two become shifts
    if imm.is_power_of_two() && !imm.is_one() {
        let unsigned = !types.is_signed(body.var(lhs).ty);
        let shift = Constant::U8(imm.log2() as u8);
        if op == Mul {
            body.rewrite_statement(
                inst,
                Op::BinConst {
                    op: Shl,
                    dst,
                    lhs,
                    imm: shift,
                },
            );
            return Some(seed_before(body, inst));
        }
        if op == Div && unsigned {
            body.rewrite_statement(
                inst,
                Op::BinConst {
                    op: Shr,
                    dst,
                    lhs,
                    imm: shift,
                },
            );
            return Some(seed_before(body, inst));
        }
    }

    // identities on 0 and 1
    if imm.is_zero() {
        match op {
            Add | Sub | BitOr | BitXor | Shl | Shr => {
                body.rewrite_statement(inst, Op::Assign { dst, src: lhs });
                return Some(seed_before(body, inst));
            }
            Mul | BitAnd | LogicalAnd => {
                body.rewrite_statement(inst, Op::AssignConst { dst, src: imm });
                return Some(seed_before(body, inst));
            }
            LogicalOr => {
                // a || 0  =>  a != 0
                let line = body.inst(inst).line;
                body.insert_instruction_before(inst, Op::Test { lhs, rhs: lhs }, line);
                body.rewrite_statement(inst, Op::Set { cc: Cc::Ne, dst });
                return Some(seed_before(body, inst));
            }
            _ => {}
        }
    }
    if imm.is_one() {
        match op {
            Mul | Div => {
                body.rewrite_statement(inst, Op::Assign { dst, src: lhs });
                return Some(seed_before(body, inst));
            }
            Add if dst == lhs => {
                body.rewrite_statement(inst, Op::Inc { dst });
                return Some(seed_before(body, inst));
            }
            Sub if dst == lhs => {
                body.rewrite_statement(inst, Op::Dec { dst });
                return Some(seed_before(body, inst));
            }
            _ => {}
        }
    }

    // logical ops against a known non-zero collapse to a flag materialization
    if !imm.is_zero() {
        match op {
            LogicalAnd => {
                // a && k (k != 0)  =>  a != 0
                let line = body.inst(inst).line;
                body.insert_instruction_before(inst, Op::Test { lhs, rhs: lhs }, line);
                body.rewrite_statement(inst, Op::Set { cc: Cc::Ne, dst });
                return Some(seed_before(body, inst));
            }
            LogicalOr => {
                body.rewrite_statement(
                    inst,
                    Op::AssignConst {
                        dst,
                        src: imm.logical_or_constants(imm),
                    },
                );
                return Some(seed_before(body, inst));
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::types::{Primitive, TypeTable};
    use crate::middle::frame::{AreaPurpose, StackDataArea};

    fn harness() -> (Function, TypeTable, Ctx, BlockId, TypeId) {
        let mut types = TypeTable::new();
        let i32t = types.basic(Primitive::I32);
        let mut ctx = Ctx::new();
        let mut body = Body::new();
        let entry = body.new_block(&mut ctx, FuncId(0));
        let exit_block = body.new_block(&mut ctx, FuncId(0));
        body.block_mut(exit_block).is_exit = true;
        let func = Function {
            id: FuncId(0),
            name: crate::common::id("test"),
            entry,
            exit_block,
            body,
            local_area: StackDataArea::new(AreaPurpose::FunctionLocal),
            param_area: StackDataArea::new(AreaPurpose::ParameterPassing),
            jump_tables: Vec::new(),
            line: 1,
        };
        (func, types, ctx, entry, i32t)
    }

    fn live(func: &Function, block: BlockId) -> Vec<String> {
        func.body
            .block_insts(block)
            .map(|i| func.body.display_inst(i))
            .collect()
    }

    #[test]
    fn constant_assignment_folds_into_one_statement() {
        let (mut func, types, mut ctx, entry, i32t) = harness();
        let t2 = func.body.new_temp(&mut ctx, i32t);
        let x0 = func.body.new_version(crate::front::symtab::VarSymId(0), "x", 0, i32t);
        func.body.add_statement(
            entry,
            Op::AssignConst {
                dst: t2,
                src: Constant::Hex(8),
            },
            1,
        );
        func.body.add_statement(entry, Op::Assign { dst: x0, src: t2 }, 1);
        simplify(&mut func, &types);
        assert_eq!(live(&func, entry), vec!["x.0 <- 0x8"]);
    }

    #[test]
    fn address_calc_store_condenses() {
        let (mut func, types, mut ctx, entry, i32t) = harness();
        let sp = func.body.new_temp(&mut ctx, i32t);
        let t3 = func.body.new_temp(&mut ctx, i32t);
        let t4 = func.body.new_temp(&mut ctx, i32t);
        // keep sp and t3 alive elsewhere so only t4 is substitutable
        func.body.var_mut(sp).is_temp = false;
        func.body.var_mut(t3).is_temp = false;
        func.body.add_statement(
            entry,
            Op::BinConst {
                op: BinOp::Add,
                dst: t4,
                lhs: sp,
                imm: Constant::I32(8),
            },
            1,
        );
        func.body
            .add_statement(entry, Op::Store { addr: t4, src: t3 }, 1);
        simplify(&mut func, &types);
        assert_eq!(live(&func, entry).len(), 1);
        let only = func.body.block(entry).leader.unwrap();
        assert!(matches!(
            func.body.inst(only).op,
            Op::StoreConstOffset { offset: 8, .. }
        ));
    }

    #[test]
    fn chained_address_offsets_accumulate() {
        let (mut func, types, mut ctx, entry, i32t) = harness();
        let a = func.body.new_temp(&mut ctx, i32t);
        func.body.var_mut(a).is_temp = false;
        let t = func.body.new_temp(&mut ctx, i32t);
        let u = func.body.new_temp(&mut ctx, i32t);
        func.body.var_mut(u).is_temp = false;
        func.body.add_statement(
            entry,
            Op::BinConst {
                op: BinOp::Add,
                dst: t,
                lhs: a,
                imm: Constant::I32(8),
            },
            1,
        );
        func.body.add_statement(
            entry,
            Op::BinConst {
                op: BinOp::Add,
                dst: u,
                lhs: t,
                imm: Constant::I32(4),
            },
            1,
        );
        simplify(&mut func, &types);
        let only = func.body.block(entry).leader.unwrap();
        assert!(matches!(
            func.body.inst(only).op,
            Op::BinConst {
                op: BinOp::Add,
                imm: Constant::I32(12),
                ..
            }
        ));
    }

    #[test]
    fn multiply_by_power_of_two_becomes_shift() {
        let (mut func, types, mut ctx, entry, i32t) = harness();
        let a = func.body.new_temp(&mut ctx, i32t);
        let d = func.body.new_temp(&mut ctx, i32t);
        func.body.var_mut(a).is_temp = false;
        func.body.var_mut(d).is_temp = false;
        func.body.add_statement(
            entry,
            Op::BinConst {
                op: BinOp::Mul,
                dst: d,
                lhs: a,
                imm: Constant::I32(8),
            },
            1,
        );
        simplify(&mut func, &types);
        let only = func.body.block(entry).leader.unwrap();
        assert!(matches!(
            func.body.inst(only).op,
            Op::BinConst {
                op: BinOp::Shl,
                imm: Constant::U8(3),
                ..
            }
        ));
    }

    #[test]
    fn logical_and_with_zero_is_constant_zero() {
        let (mut func, types, mut ctx, entry, i32t) = harness();
        let a = func.body.new_temp(&mut ctx, i32t);
        let d = func.body.new_temp(&mut ctx, i32t);
        func.body.var_mut(a).is_temp = false;
        func.body.var_mut(d).is_temp = false;
        func.body.add_statement(
            entry,
            Op::BinConst {
                op: BinOp::LogicalAnd,
                dst: d,
                lhs: a,
                imm: Constant::I32(0),
            },
            1,
        );
        simplify(&mut func, &types);
        let only = func.body.block(entry).leader.unwrap();
        assert!(matches!(
            func.body.inst(only).op,
            Op::AssignConst {
                src: Constant::I32(0),
                ..
            }
        ));
    }

    #[test]
    fn logical_and_with_nonzero_materializes_the_flag() {
        let (mut func, types, mut ctx, entry, i32t) = harness();
        let a = func.body.new_temp(&mut ctx, i32t);
        let d = func.body.new_temp(&mut ctx, i32t);
        func.body.var_mut(a).is_temp = false;
        func.body.var_mut(d).is_temp = false;
        func.body.add_statement(
            entry,
            Op::BinConst {
                op: BinOp::LogicalAnd,
                dst: d,
                lhs: a,
                imm: Constant::I32(5),
            },
            1,
        );
        simplify(&mut func, &types);
        let ops: Vec<Op> = func
            .body
            .block_insts(entry)
            .map(|i| func.body.inst(i).op.clone())
            .collect();
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], Op::Test { .. }));
        assert!(matches!(ops[1], Op::Set { cc: Cc::Ne, .. }));
    }

    #[test]
    fn no_combine_blocks_fusion() {
        let (mut func, types, mut ctx, entry, i32t) = harness();
        let t = func.body.new_temp(&mut ctx, i32t);
        let x = func.body.new_temp(&mut ctx, i32t);
        func.body.var_mut(x).is_temp = false;
        let first = func.body.add_statement(
            entry,
            Op::AssignConst {
                dst: t,
                src: Constant::I32(3),
            },
            1,
        );
        func.body.add_statement(entry, Op::Assign { dst: x, src: t }, 1);
        func.body.inst_mut(first).no_combine = true;
        simplify(&mut func, &types);
        assert_eq!(live(&func, entry).len(), 2);
    }

    #[test]
    fn simplifier_reaches_a_fixed_point_twice() {
        let (mut func, types, mut ctx, entry, i32t) = harness();
        let a = func.body.new_temp(&mut ctx, i32t);
        func.body.var_mut(a).is_temp = false;
        let t1 = func.body.new_temp(&mut ctx, i32t);
        let t2 = func.body.new_temp(&mut ctx, i32t);
        let out = func.body.new_temp(&mut ctx, i32t);
        func.body.var_mut(out).is_temp = false;
        func.body.add_statement(
            entry,
            Op::BinConst {
                op: BinOp::Add,
                dst: t1,
                lhs: a,
                imm: Constant::I32(4),
            },
            1,
        );
        func.body.add_statement(
            entry,
            Op::BinConst {
                op: BinOp::Add,
                dst: t2,
                lhs: t1,
                imm: Constant::I32(4),
            },
            1,
        );
        func.body
            .add_statement(entry, Op::Load { dst: out, addr: t2 }, 1);
        simplify(&mut func, &types);
        let first: Vec<String> = live(&func, entry);
        simplify(&mut func, &types);
        assert_eq!(first, live(&func, entry));
        assert_eq!(first.len(), 1);
        let only = func.body.block(entry).leader.unwrap();
        assert!(matches!(
            func.body.inst(only).op,
            Op::LoadConstOffset { offset: 8, .. }
        ));
    }
}
