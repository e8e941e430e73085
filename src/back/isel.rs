//! The instruction selector: pattern-matches windows of simplified OIR into
//! x86-64 instructions.
//!
//! Composite patterns run first (division and remainder through `rdx:rax`,
//! one-operand unsigned multiply, logical connectives via test/set, compare
//! plus assignment via `setcc`/`movzx`), then the single-statement mappings
//! keyed by statement type, signedness, and operand size.
//!
//! x86's two-operand arithmetic is modeled by inserting `mov lhs -> dst`
//! and rewriting the operation to read and write `dst`; the coalescer folds
//! the move away whenever the operands' live ranges allow it.  ABI-fixed
//! registers (`rax`/`rdx` around division, `cl` shift counts, argument and
//! return registers) are pinned on the inserted moves, never on user
//! variables, so the allocator sees them as ordinary precolored ranges.

use crate::back::asm::*;
use crate::common::*;
use crate::front::ast::BinOp;
use crate::front::types::{Primitive, TypeTable};
use crate::middle::cfg::Function;
use crate::middle::linearize::linear_order;
use crate::middle::oir::{Body, Cc, Op};

/// Select machine instructions for the whole function, in layout order.
pub fn select(func: &mut Function, types: &mut TypeTable, ctx: &mut Ctx) {
    let order = linear_order(func);
    for &block in &order {
        let insts: Vec<InstId> = func.body.block_insts(block).collect();
        for inst in insts {
            if func.body.inst(inst).deleted || func.body.inst(inst).mach.is_some() {
                continue;
            }
            select_inst(&mut func.body, types, ctx, inst);
        }
    }
    delete_fallthrough_jumps(func, &order);
}

/// Drop unconditional jumps to the very next block in the layout.
fn delete_fallthrough_jumps(func: &mut Function, order: &[BlockId]) {
    for &block in order {
        let Some(exit) = func.body.block(block).exit else {
            continue;
        };
        if let Op::Jump { target } = func.body.inst(exit).op {
            if func.body.block(block).direct_successor == Some(target) {
                func.body.delete_statement(exit);
            }
        }
    }
}

fn size_of_var(body: &Body, types: &TypeTable, var: VarId) -> OpSize {
    OpSize::from_bytes(types.size(body.var(var).ty).max(1))
}

fn signed_var(body: &Body, types: &TypeTable, var: VarId) -> bool {
    types.is_signed(body.var(var).ty)
}

fn tag(body: &mut Body, inst: InstId, mach: Mach) {
    body.inst_mut(inst).mach = Some(mach);
}

/// Insert `dst <- src` tagged as a plain move, optionally pinned.
fn insert_mov_before(
    body: &mut Body,
    anchor: InstId,
    dst: VarId,
    src: VarId,
    size: OpSize,
    pin: Option<Register>,
) -> InstId {
    let line = body.inst(anchor).line;
    let mov = body.insert_instruction_before(anchor, Op::Assign { dst, src }, line);
    body.inst_mut(mov).mach = Some(Mach {
        dst_reg: pin,
        ..Mach::plain(Mnemonic::Mov, size)
    });
    mov
}

fn select_inst(body: &mut Body, types: &mut TypeTable, ctx: &mut Ctx, inst: InstId) {
    let op = body.inst(inst).op.clone();
    match op {
        Op::Bin { op: bop, dst, lhs, rhs } => match bop {
            BinOp::Div | BinOp::Mod => select_division(body, types, ctx, inst, bop, dst, lhs, rhs),
            BinOp::Mul if !signed_var(body, types, dst) => {
                select_unsigned_mul(body, types, ctx, inst, dst, lhs, rhs)
            }
            BinOp::LogicalAnd | BinOp::LogicalOr => {
                select_logical(body, types, ctx, inst, bop, dst, lhs, rhs)
            }
            BinOp::Shl | BinOp::Shr => select_shift(body, types, ctx, inst, bop, dst, lhs, rhs),
            _ => select_two_address(body, types, inst, bop, dst, lhs, rhs),
        },
        Op::BinConst { op: bop, dst, lhs, imm } => {
            // divisions and one-operand multiplies have no immediate form:
            // materialize the constant and take the composite path
            if matches!(bop, BinOp::Div | BinOp::Mod)
                || (bop == BinOp::Mul && !signed_var(body, types, dst))
            {
                let ty = body.var(lhs).ty;
                let t_imm = body.new_temp(ctx, ty);
                let line = body.inst(inst).line;
                let load = body.insert_instruction_before(
                    inst,
                    Op::AssignConst {
                        dst: t_imm,
                        src: imm,
                    },
                    line,
                );
                let size = size_of_var(body, types, t_imm);
                body.inst_mut(load).mach = Some(Mach::plain(Mnemonic::Mov, size));
                body.rewrite_statement(
                    inst,
                    Op::Bin {
                        op: bop,
                        dst,
                        lhs,
                        rhs: t_imm,
                    },
                );
                select_inst(body, types, ctx, inst);
                return;
            }
            // constant shifts take an immediate count; everything else is
            // the plain two-address form with an immediate source
            let size = size_of_var(body, types, dst);
            if lhs != dst {
                insert_mov_before(body, inst, dst, lhs, size, None);
            }
            let mut new_op = body.inst(inst).op.clone();
            if let Op::BinConst { lhs, .. } = &mut new_op {
                *lhs = dst;
            }
            body.rewrite_statement(inst, new_op);
            let mach = Mach::plain(mnemonic_for(bop, signed_var(body, types, dst)), size);
            tag(body, inst, mach);
        }
        Op::Assign { dst, src } => {
            let mach = move_mach(body, types, dst, src);
            tag(body, inst, mach);
        }
        Op::AssignConst { dst, .. } => {
            let size = size_of_var(body, types, dst);
            tag(body, inst, Mach::plain(Mnemonic::Mov, size));
        }
        Op::Cast { dst, src } => {
            let mach = move_mach(body, types, dst, src);
            tag(body, inst, mach);
        }
        Op::Negate { dst, src } => {
            let size = size_of_var(body, types, dst);
            insert_mov_before(body, inst, dst, src, size, None);
            body.rewrite_statement(inst, Op::Negate { dst, src: dst });
            tag(body, inst, Mach::plain(Mnemonic::Neg, size));
        }
        Op::BitNot { dst, src } => {
            let size = size_of_var(body, types, dst);
            insert_mov_before(body, inst, dst, src, size, None);
            body.rewrite_statement(inst, Op::BitNot { dst, src: dst });
            tag(body, inst, Mach::plain(Mnemonic::Not, size));
        }
        Op::LogicalNot { dst, src } => {
            // test src,src ; sete ; movzx
            let line = body.inst(inst).line;
            let test = body.insert_instruction_before(inst, Op::Test { lhs: src, rhs: src }, line);
            let mach = Mach::plain(Mnemonic::Test, size_of_var(body, types, src));
            tag(body, test, mach);
            materialize_flag(body, types, ctx, inst, Cc::E, dst);
        }
        Op::Lea { dst, .. } | Op::MemoryAddress { dst, .. } => {
            let size = size_of_var(body, types, dst);
            tag(body, inst, Mach::plain(Mnemonic::Lea, size));
        }
        Op::Inc { dst } => {
            let size = size_of_var(body, types, dst);
            tag(body, inst, Mach::plain(Mnemonic::Inc, size));
        }
        Op::Dec { dst } => {
            let size = size_of_var(body, types, dst);
            tag(body, inst, Mach::plain(Mnemonic::Dec, size));
        }
        Op::Test { lhs, .. } => {
            let size = size_of_var(body, types, lhs);
            tag(body, inst, Mach::plain(Mnemonic::Test, size));
        }
        Op::Cmp { lhs, rhs } => {
            let size = size_of_var(body, types, lhs).max(size_of_var(body, types, rhs));
            tag(body, inst, Mach::plain(Mnemonic::Cmp, size));
        }
        Op::CmpConst { lhs, .. } => {
            let size = size_of_var(body, types, lhs);
            tag(body, inst, Mach::plain(Mnemonic::Cmp, size));
        }
        Op::Load { dst, .. } | Op::LoadConstOffset { dst, .. } => {
            let size = size_of_var(body, types, dst);
            tag(body, inst, Mach::plain(Mnemonic::Mov, size));
        }
        Op::LoadVarOffset { dst, index, .. } => {
            widen_index(body, types, ctx, inst, index);
            let size = size_of_var(body, types, dst);
            tag(body, inst, Mach::plain(Mnemonic::Mov, size));
        }
        Op::Store { src, .. } | Op::StoreConstOffset { src, .. } => {
            let size = size_of_var(body, types, src);
            tag(body, inst, Mach::plain(Mnemonic::Mov, size));
        }
        Op::StoreVarOffset { src, index, .. } => {
            widen_index(body, types, ctx, inst, index);
            let size = size_of_var(body, types, src);
            tag(body, inst, Mach::plain(Mnemonic::Mov, size));
        }
        Op::Jump { .. } => {
            tag(body, inst, Mach::plain(Mnemonic::Jmp, OpSize::QuadWord));
        }
        Op::Branch { cc, ff, .. } => {
            // jcc if-side, jmp else-side; the fall-through pass deletes the
            // jmp when the layout already places the else block next
            tag(
                body,
                inst,
                Mach::with_cc(Mnemonic::Jcc, OpSize::QuadWord, cc),
            );
            let line = body.inst(inst).line;
            let jmp = body.insert_instruction_after(inst, Op::Jump { target: ff }, line);
            tag(body, jmp, Mach::plain(Mnemonic::Jmp, OpSize::QuadWord));
        }
        Op::IndirectJumpCalc { index, .. } => {
            widen_index(body, types, ctx, inst, index);
            tag(body, inst, Mach::plain(Mnemonic::Mov, OpSize::QuadWord));
        }
        Op::IndirectJump { .. } => {
            tag(body, inst, Mach::plain(Mnemonic::Jmp, OpSize::QuadWord));
        }
        Op::Call { dst, args, .. } | Op::IndirectCall { dst, args, .. } => {
            // pin the first six arguments into their ABI registers
            let line = body.inst(inst).line;
            let mut new_args = args.clone();
            for (n, arg) in args.iter().enumerate().take(ARG_REGISTERS.len()) {
                let ty = body.var(*arg).ty;
                let pinned = body.new_temp(ctx, ty);
                let size = size_of_var(body, types, *arg);
                insert_mov_before(body, inst, pinned, *arg, size, Some(ARG_REGISTERS[n]));
                new_args[n] = pinned;
            }
            let mut new_op = body.inst(inst).op.clone();
            match &mut new_op {
                Op::Call { args, .. } | Op::IndirectCall { args, .. } => *args = new_args,
                _ => unreachable!(),
            }
            body.rewrite_statement(inst, new_op);
            tag(
                body,
                inst,
                Mach {
                    dst_reg: Some(Register::Rax),
                    ..Mach::plain(Mnemonic::Call, OpSize::QuadWord)
                },
            );
            // the result leaves rax through a separate, uncombinable move
            if let Some(dst) = dst {
                let ty = body.var(dst).ty;
                let t_ret = body.new_temp(ctx, ty);
                let mut new_op = body.inst(inst).op.clone();
                new_op.set_def(t_ret);
                body.rewrite_statement(inst, new_op);
                let size = size_of_var(body, types, dst);
                let mov =
                    body.insert_instruction_after(inst, Op::Assign { dst, src: t_ret }, line);
                body.inst_mut(mov).mach = Some(Mach::plain(Mnemonic::Mov, size));
                body.inst_mut(mov).no_combine = true;
            }
        }
        Op::Set { cc, dst } => {
            materialize_flag(body, types, ctx, inst, cc, dst);
        }
        Op::Return { value } => {
            if let Some(value) = value {
                let ty = body.var(value).ty;
                let t_ret = body.new_temp(ctx, ty);
                let size = size_of_var(body, types, value);
                insert_mov_before(body, inst, t_ret, value, size, Some(Register::Rax));
                body.rewrite_statement(
                    inst,
                    Op::Return {
                        value: Some(t_ret),
                    },
                );
            }
            tag(body, inst, Mach::plain(Mnemonic::Ret, OpSize::QuadWord));
        }
        Op::Nop => {
            tag(body, inst, Mach::plain(Mnemonic::Nop, OpSize::QuadWord));
        }
        Op::InlineAsm { .. } => {
            // passed through; the emitter prints the payload verbatim
            tag(body, inst, Mach::plain(Mnemonic::Nop, OpSize::QuadWord));
        }
        Op::Phi { .. } => {
            panic!("invariant violated: phi reached the instruction selector")
        }
    }
}

/// Plain or extending move depending on the operand widths.
fn move_mach(body: &Body, types: &TypeTable, dst: VarId, src: VarId) -> Mach {
    let dst_ty = body.var(dst).ty;
    let src_ty = body.var(src).ty;
    if types.is_expanding_move_required(dst_ty, src_ty) {
        let src_size = size_of_var(body, types, src);
        if types.is_signed(src_ty) {
            Mach {
                src_size: Some(src_size),
                ..Mach::plain(Mnemonic::Movsx, size_of_var(body, types, dst))
            }
        } else if src_size == OpSize::DoubleWord {
            // a 32-bit mov already zero-extends into the upper half
            Mach::plain(Mnemonic::Mov, OpSize::DoubleWord)
        } else {
            Mach {
                src_size: Some(src_size),
                ..Mach::plain(Mnemonic::Movzx, size_of_var(body, types, dst))
            }
        }
    } else {
        Mach::plain(Mnemonic::Mov, size_of_var(body, types, dst))
    }
}

fn mnemonic_for(op: BinOp, signed: bool) -> Mnemonic {
    use BinOp::*;
    match (op, signed) {
        (Add, _) => Mnemonic::Add,
        (Sub, _) => Mnemonic::Sub,
        (Mul, _) => Mnemonic::Imul,
        (BitAnd, _) => Mnemonic::And,
        (BitOr, _) => Mnemonic::Or,
        (BitXor, _) => Mnemonic::Xor,
        (Shl, true) => Mnemonic::Sal,
        (Shl, false) => Mnemonic::Shl,
        (Shr, true) => Mnemonic::Sar,
        (Shr, false) => Mnemonic::Shr,
        _ => panic!("invariant violated: {op} has no direct mnemonic"),
    }
}

/// The general two-address expansion: `mov lhs -> dst ; op rhs -> dst`.
fn select_two_address(
    body: &mut Body,
    types: &TypeTable,
    inst: InstId,
    bop: BinOp,
    dst: VarId,
    lhs: VarId,
    rhs: VarId,
) {
    let size = size_of_var(body, types, dst);
    if lhs != dst {
        insert_mov_before(body, inst, dst, lhs, size, None);
    }
    body.rewrite_statement(
        inst,
        Op::Bin {
            op: bop,
            dst,
            lhs: dst,
            rhs,
        },
    );
    let mach = Mach::plain(mnemonic_for(bop, signed_var(body, types, dst)), size);
    tag(body, inst, mach);
}

/// DIV/IDIV: dividend into `rax`, sign- or zero-extend into `rdx`, divide,
/// then move the quotient (`rax`) or remainder (`rdx`) out through an
/// uncombinable move.
fn select_division(
    body: &mut Body,
    types: &mut TypeTable,
    ctx: &mut Ctx,
    inst: InstId,
    bop: BinOp,
    dst: VarId,
    lhs: VarId,
    rhs: VarId,
) {
    let signed = signed_var(body, types, dst);
    let size = size_of_var(body, types, dst);
    let line = body.inst(inst).line;
    let ty = body.var(lhs).ty;

    let t_acc = body.new_temp(ctx, ty);
    let acc_mov = insert_mov_before(body, inst, t_acc, lhs, size, Some(Register::Rax));
    body.inst_mut(acc_mov).no_combine = true;

    if signed {
        // cbw/cwd/cdq/cqo populate rdx (or ah) from rax
        let ext = body.insert_instruction_before(inst, Op::Nop, line);
        let mach = Mach::plain(Mnemonic::SignExtendAcc, size);
        body.inst_mut(ext).mach = Some(mach);
        body.inst_mut(ext).no_combine = true;
    } else {
        let t_zero = body.new_temp(ctx, types.basic(Primitive::U64));
        let zero = body.insert_instruction_before(
            inst,
            Op::AssignConst {
                dst: t_zero,
                src: crate::middle::oir::Constant::U64(0),
            },
            line,
        );
        body.inst_mut(zero).mach = Some(Mach {
            dst_reg: Some(Register::Rdx),
            ..Mach::plain(Mnemonic::Mov, size)
        });
        body.inst_mut(zero).no_combine = true;
    }

    // the divide defines a temp pinned to the result register
    let result_reg = if bop == BinOp::Div {
        Register::Rax
    } else {
        Register::Rdx
    };
    let t_res = body.new_temp(ctx, ty);
    body.rewrite_statement(
        inst,
        Op::Bin {
            op: bop,
            dst: t_res,
            lhs: t_acc,
            rhs,
        },
    );
    let mnemonic = if signed { Mnemonic::Idiv } else { Mnemonic::Div };
    body.inst_mut(inst).mach = Some(Mach {
        dst_reg: Some(result_reg),
        ..Mach::plain(mnemonic, size)
    });
    body.inst_mut(inst).no_combine = true;

    let out = body.insert_instruction_after(inst, Op::Assign { dst, src: t_res }, line);
    body.inst_mut(out).mach = Some(Mach::plain(Mnemonic::Mov, size));
    body.inst_mut(out).no_combine = true;
}

/// One-operand unsigned multiply: `mov rhs -> rax ; mul lhs ; mov rax -> dst`.
fn select_unsigned_mul(
    body: &mut Body,
    types: &mut TypeTable,
    ctx: &mut Ctx,
    inst: InstId,
    dst: VarId,
    lhs: VarId,
    rhs: VarId,
) {
    let size = size_of_var(body, types, dst);
    let line = body.inst(inst).line;
    let ty = body.var(rhs).ty;

    let t_acc = body.new_temp(ctx, ty);
    let acc_mov = insert_mov_before(body, inst, t_acc, rhs, size, Some(Register::Rax));
    body.inst_mut(acc_mov).no_combine = true;

    let t_res = body.new_temp(ctx, ty);
    body.rewrite_statement(
        inst,
        Op::Bin {
            op: BinOp::Mul,
            dst: t_res,
            lhs,
            rhs: t_acc,
        },
    );
    body.inst_mut(inst).mach = Some(Mach {
        dst_reg: Some(Register::Rax),
        ..Mach::plain(Mnemonic::Mul, size)
    });
    body.inst_mut(inst).no_combine = true;

    let out = body.insert_instruction_after(inst, Op::Assign { dst, src: t_res }, line);
    body.inst_mut(out).mach = Some(Mach::plain(Mnemonic::Mov, size));
    body.inst_mut(out).no_combine = true;
}

/// Logical AND/OR over booleans: normalize both sides with test/set, then
/// combine with the bitwise instruction and widen.
fn select_logical(
    body: &mut Body,
    types: &mut TypeTable,
    ctx: &mut Ctx,
    inst: InstId,
    bop: BinOp,
    dst: VarId,
    lhs: VarId,
    rhs: VarId,
) {
    let line = body.inst(inst).line;
    let byte = types.basic(Primitive::U8);
    let normalize = |body: &mut Body, ctx: &mut Ctx, operand: VarId, anchor: InstId| {
        let t = body.new_temp(ctx, byte);
        let size = OpSize::from_bytes(types.size(body.var(operand).ty).max(1));
        let test = body.insert_instruction_before(
            anchor,
            Op::Test {
                lhs: operand,
                rhs: operand,
            },
            line,
        );
        body.inst_mut(test).mach = Some(Mach::plain(Mnemonic::Test, size));
        let set = body.insert_instruction_before(anchor, Op::Set { cc: Cc::Ne, dst: t }, line);
        body.inst_mut(set).mach = Some(Mach::with_cc(Mnemonic::Set, OpSize::Byte, Cc::Ne));
        t
    };
    let t_l = normalize(body, ctx, lhs, inst);
    let t_r = normalize(body, ctx, rhs, inst);

    // combine the byte flags, then widen into the destination
    let t_comb = body.new_temp(ctx, byte);
    let mov = insert_mov_before(body, inst, t_comb, t_l, OpSize::Byte, None);
    body.inst_mut(mov).no_combine = true;
    let combine = body.insert_instruction_before(
        inst,
        Op::Bin {
            op: if bop == BinOp::LogicalAnd {
                BinOp::BitAnd
            } else {
                BinOp::BitOr
            },
            dst: t_comb,
            lhs: t_comb,
            rhs: t_r,
        },
        line,
    );
    body.inst_mut(combine).mach = Some(Mach::plain(
        if bop == BinOp::LogicalAnd {
            Mnemonic::And
        } else {
            Mnemonic::Or
        },
        OpSize::Byte,
    ));
    body.rewrite_statement(inst, Op::Cast { dst, src: t_comb });
    let mach = move_mach(body, types, dst, t_comb);
    tag(body, inst, mach);
}

/// Variable shifts: the count travels through a fresh temporary pinned to
/// `cl`.
fn select_shift(
    body: &mut Body,
    types: &mut TypeTable,
    ctx: &mut Ctx,
    inst: InstId,
    bop: BinOp,
    dst: VarId,
    lhs: VarId,
    rhs: VarId,
) {
    let size = size_of_var(body, types, dst);
    let count_size = size_of_var(body, types, rhs);
    let ty = body.var(rhs).ty;
    let t_count = body.new_temp(ctx, ty);
    insert_mov_before(body, inst, t_count, rhs, count_size, Some(Register::Rcx));
    insert_mov_before(body, inst, dst, lhs, size, None);
    body.rewrite_statement(
        inst,
        Op::Bin {
            op: bop,
            dst,
            lhs: dst,
            rhs: t_count,
        },
    );
    let signed = signed_var(body, types, dst);
    body.inst_mut(inst).mach = Some(Mach {
        src_reg: Some(Register::Rcx),
        ..Mach::plain(mnemonic_for(bop, signed), size)
    });
}

/// `setcc` writes one byte; the value continues at the destination's width
/// through a zero-extending move.
fn materialize_flag(
    body: &mut Body,
    types: &mut TypeTable,
    ctx: &mut Ctx,
    inst: InstId,
    cc: Cc,
    dst: VarId,
) {
    let dst_size = size_of_var(body, types, dst);
    if dst_size == OpSize::Byte {
        body.rewrite_statement(inst, Op::Set { cc, dst });
        tag(body, inst, Mach::with_cc(Mnemonic::Set, OpSize::Byte, cc));
        return;
    }
    let byte = types.basic(Primitive::U8);
    let t_flag = body.new_temp(ctx, byte);
    let line = body.inst(inst).line;
    let set = body.insert_instruction_before(inst, Op::Set { cc, dst: t_flag }, line);
    body.inst_mut(set).mach = Some(Mach::with_cc(Mnemonic::Set, OpSize::Byte, cc));
    body.rewrite_statement(inst, Op::Cast { dst, src: t_flag });
    tag(
        body,
        inst,
        Mach {
            src_size: Some(OpSize::Byte),
            ..Mach::plain(Mnemonic::Movzx, dst_size)
        },
    );
}

/// x86 effective addresses take 32- or 64-bit index registers; narrower
/// indices get a widening move first.
fn widen_index(body: &mut Body, types: &mut TypeTable, ctx: &mut Ctx, inst: InstId, index: VarId) {
    let ty = body.var(index).ty;
    if types.is_address_calculation_compatible(ty) {
        return;
    }
    let wide_ty = if types.is_signed(ty) {
        types.basic(Primitive::I32)
    } else {
        types.basic(Primitive::U32)
    };
    let t_wide = body.new_temp(ctx, wide_ty);
    let line = body.inst(inst).line;
    let widen = body.insert_instruction_before(inst, Op::Cast { dst: t_wide, src: index }, line);
    let mach = move_mach(body, types, t_wide, index);
    body.inst_mut(widen).mach = Some(mach);
    let mut new_op = body.inst(inst).op.clone();
    match &mut new_op {
        Op::LoadVarOffset { index, .. }
        | Op::StoreVarOffset { index, .. }
        | Op::IndirectJumpCalc { index, .. } => *index = t_wide,
        _ => {}
    }
    body.rewrite_statement(inst, new_op);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::types::TypeTable;
    use crate::middle::frame::{AreaPurpose, StackDataArea};
    use crate::middle::oir::Constant;

    fn harness(prim: Primitive) -> (Function, TypeTable, Ctx, BlockId, TypeId) {
        let mut types = TypeTable::new();
        let ty = types.basic(prim);
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
        (func, types, ctx, entry, ty)
    }

    fn mnemonics(func: &Function, block: BlockId) -> Vec<Mnemonic> {
        func.body
            .block_insts(block)
            .map(|i| func.body.inst(i).mach.expect("selected").mnemonic)
            .collect()
    }

    #[test]
    fn unsigned_multiplication_expands_through_rax() {
        let (mut func, mut types, mut ctx, entry, u32t) = harness(Primitive::U32);
        let a = func.body.new_temp(&mut ctx, u32t);
        let b = func.body.new_temp(&mut ctx, u32t);
        let x = func.body.new_temp(&mut ctx, u32t);
        func.body.add_statement(
            entry,
            Op::Bin {
                op: BinOp::Mul,
                dst: x,
                lhs: a,
                rhs: b,
            },
            1,
        );
        select(&mut func, &mut types, &mut ctx);
        let ms = mnemonics(&func, entry);
        assert_eq!(ms, vec![Mnemonic::Mov, Mnemonic::Mul, Mnemonic::Mov]);
        let insts: Vec<InstId> = func.body.block_insts(entry).collect();
        assert_eq!(
            func.body.inst(insts[0]).mach.unwrap().dst_reg,
            Some(Register::Rax)
        );
        assert!(func.body.inst(insts[2]).no_combine);
    }

    #[test]
    fn signed_division_extends_and_pins() {
        let (mut func, mut types, mut ctx, entry, i32t) = harness(Primitive::I32);
        let a = func.body.new_temp(&mut ctx, i32t);
        let b = func.body.new_temp(&mut ctx, i32t);
        let q = func.body.new_temp(&mut ctx, i32t);
        func.body.add_statement(
            entry,
            Op::Bin {
                op: BinOp::Div,
                dst: q,
                lhs: a,
                rhs: b,
            },
            1,
        );
        select(&mut func, &mut types, &mut ctx);
        let ms = mnemonics(&func, entry);
        assert_eq!(
            ms,
            vec![
                Mnemonic::Mov,
                Mnemonic::SignExtendAcc,
                Mnemonic::Idiv,
                Mnemonic::Mov
            ]
        );
        let insts: Vec<InstId> = func.body.block_insts(entry).collect();
        // cdq for a 32-bit dividend
        assert_eq!(
            func.body.inst(insts[1]).mach.unwrap().opcode_text(),
            "cdq"
        );
        assert_eq!(
            func.body.inst(insts[2]).mach.unwrap().dst_reg,
            Some(Register::Rax)
        );
    }

    #[test]
    fn remainder_leaves_through_rdx() {
        let (mut func, mut types, mut ctx, entry, i32t) = harness(Primitive::I32);
        let a = func.body.new_temp(&mut ctx, i32t);
        let b = func.body.new_temp(&mut ctx, i32t);
        let r = func.body.new_temp(&mut ctx, i32t);
        func.body.add_statement(
            entry,
            Op::Bin {
                op: BinOp::Mod,
                dst: r,
                lhs: a,
                rhs: b,
            },
            1,
        );
        select(&mut func, &mut types, &mut ctx);
        let insts: Vec<InstId> = func.body.block_insts(entry).collect();
        let div = insts
            .iter()
            .find(|&&i| func.body.inst(i).mach.unwrap().mnemonic == Mnemonic::Idiv)
            .unwrap();
        assert_eq!(
            func.body.inst(*div).mach.unwrap().dst_reg,
            Some(Register::Rdx)
        );
    }

    #[test]
    fn variable_shift_count_is_pinned_to_cl() {
        let (mut func, mut types, mut ctx, entry, i32t) = harness(Primitive::I32);
        let a = func.body.new_temp(&mut ctx, i32t);
        let n = func.body.new_temp(&mut ctx, i32t);
        let x = func.body.new_temp(&mut ctx, i32t);
        func.body.add_statement(
            entry,
            Op::Bin {
                op: BinOp::Shl,
                dst: x,
                lhs: a,
                rhs: n,
            },
            1,
        );
        select(&mut func, &mut types, &mut ctx);
        let insts: Vec<InstId> = func.body.block_insts(entry).collect();
        assert_eq!(
            func.body.inst(insts[0]).mach.unwrap().dst_reg,
            Some(Register::Rcx)
        );
        let shift = func.body.inst(*insts.last().unwrap()).mach.unwrap();
        assert_eq!(shift.mnemonic, Mnemonic::Sal);
        assert_eq!(shift.src_reg, Some(Register::Rcx));
    }

    #[test]
    fn comparison_assignment_uses_setcc_and_movzx() {
        let (mut func, mut types, mut ctx, entry, i32t) = harness(Primitive::I32);
        let a = func.body.new_temp(&mut ctx, i32t);
        let b = func.body.new_temp(&mut ctx, i32t);
        let x = func.body.new_temp(&mut ctx, i32t);
        func.body.add_statement(entry, Op::Cmp { lhs: a, rhs: b }, 1);
        func.body.add_statement(entry, Op::Set { cc: Cc::L, dst: x }, 1);
        select(&mut func, &mut types, &mut ctx);
        let ms = mnemonics(&func, entry);
        assert_eq!(ms, vec![Mnemonic::Cmp, Mnemonic::Set, Mnemonic::Movzx]);
    }

    #[test]
    fn branch_expands_to_jcc_plus_jmp_and_fallthrough_drops() {
        let (mut func, mut types, mut ctx, entry, i32t) = harness(Primitive::I32);
        let tt = func.body.new_block(&mut ctx, FuncId(0));
        let ff = func.body.new_block(&mut ctx, FuncId(0));
        let a = func.body.new_temp(&mut ctx, i32t);
        func.body.add_statement(
            entry,
            Op::CmpConst {
                lhs: a,
                imm: Constant::I32(0),
            },
            1,
        );
        func.body
            .add_statement(entry, Op::Branch { cc: Cc::E, tt, ff }, 1);
        func.body
            .add_statement(tt, Op::Return { value: None }, 1);
        func.body
            .add_statement(ff, Op::Return { value: None }, 1);
        // layout: entry, ff, tt  (else side falls through)
        func.body.block_mut(entry).direct_successor = Some(ff);
        func.body.block_mut(ff).direct_successor = Some(tt);
        select(&mut func, &mut types, &mut ctx);
        let ms = mnemonics(&func, entry);
        // the jmp to ff was deleted as a fall-through
        assert_eq!(ms, vec![Mnemonic::Cmp, Mnemonic::Jcc]);
    }

    #[test]
    fn narrow_index_is_widened_before_address_use() {
        let (mut func, mut types, mut ctx, entry, _) = harness(Primitive::I32);
        let u8t = types.basic(Primitive::U8);
        let u64t = types.basic(Primitive::U64);
        let base = func.body.new_temp(&mut ctx, u64t);
        let idx = func.body.new_temp(&mut ctx, u8t);
        let out = func.body.new_temp(&mut ctx, u64t);
        func.body.add_statement(
            entry,
            Op::LoadVarOffset {
                dst: out,
                base,
                index: idx,
                scale: 8,
            },
            1,
        );
        select(&mut func, &mut types, &mut ctx);
        let insts: Vec<InstId> = func.body.block_insts(entry).collect();
        assert_eq!(insts.len(), 2);
        let widen = func.body.inst(insts[0]).mach.unwrap();
        assert_eq!(widen.mnemonic, Mnemonic::Movzx);
        match &func.body.inst(insts[1]).op {
            Op::LoadVarOffset { index, .. } => {
                assert_ne!(*index, idx);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
