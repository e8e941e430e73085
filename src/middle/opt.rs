//! The SSA optimizer: unreachable-block removal, sparse constant
//! propagation and folding, copy propagation, and dead-code elimination,
//! iterated to a fixed point.
//!
//! The optimizer may rewrite and delete statements freely but only changes
//! the block graph by discarding unreachable blocks; calls, stores, returns
//! and inline assembly are never removed.

use crate::common::*;
use crate::front::types::TypeTable;
use crate::middle::cfg::{reverse_postorder, Function, Module};
use crate::middle::oir::{Constant, Op};

/// Optimize every function in the module.
pub fn optimize(module: &mut Module, types: &TypeTable) {
    for func in &mut module.funcs {
        optimize_function(func, types);
    }
}

pub fn optimize_function(func: &mut Function, types: &TypeTable) {
    remove_unreachable_blocks(func);
    // each pass may expose work for the others; iterate until quiet
    loop {
        let mut changed = false;
        changed |= propagate_constants(func);
        changed |= propagate_copies(func, types);
        func.body.recount_uses();
        changed |= eliminate_dead_code(func);
        if !changed {
            break;
        }
    }
}

/// Drop blocks with no path from the entry: unlink their statements, detach
/// their edges, and prune phi operands that named them.
fn remove_unreachable_blocks(func: &mut Function) {
    let reachable: Set<BlockId> = reverse_postorder(&func.body, func.entry)
        .into_iter()
        .collect();
    let all: Vec<BlockId> = func.body.blocks.iter().map(|b| b.id).collect();
    let mut removed = Vec::new();
    for block in all {
        if reachable.contains(&block) || func.body.block(block).is_exit {
            continue;
        }
        let insts: Vec<InstId> = func.body.block_insts(block).collect();
        for inst in insts {
            func.body.delete_statement(inst);
        }
        func.body.block_mut(block).succs.clear();
        func.body.block_mut(block).preds.clear();
        removed.push(block);
    }
    for &gone in &removed {
        for block in &mut func.body.blocks {
            block.preds.remove(gone);
            block.succs.remove(gone);
        }
    }
    // phi operands for edges that no longer exist
    for idx in 0..func.body.insts.len() {
        if func.body.insts[idx].deleted {
            continue;
        }
        if let Op::Phi { args, .. } = &mut func.body.insts[idx].op {
            args.retain(|(pred, _)| reachable.contains(pred));
        }
    }
    func.body.recount_uses();
}

/// Sparse conditional-constant style folding: gather known constants, fold
/// statements whose operands are all known, repeat until no new facts.
fn propagate_constants(func: &mut Function) -> bool {
    let mut changed = false;
    loop {
        let mut known: Map<VarId, Constant> = Map::new();
        for inst in func.body.insts.iter().filter(|i| !i.deleted) {
            if let Op::AssignConst { dst, src } = inst.op {
                if !matches!(src, Constant::Str(_)) {
                    known.insert(dst, src);
                }
            }
        }

        let mut folded = false;
        for idx in 0..func.body.insts.len() {
            if func.body.insts[idx].deleted {
                continue;
            }
            let inst_id = InstId(idx as u32);
            let op = func.body.insts[idx].op.clone();
            let new_op = match op {
                Op::Bin { op, dst, lhs, rhs } => {
                    match (known.get(&lhs), known.get(&rhs)) {
                        (Some(&l), Some(&r)) => {
                            fold(op, l, r).map(|src| Op::AssignConst { dst, src })
                        }
                        _ => None,
                    }
                }
                Op::BinConst { op, dst, lhs, imm } => known
                    .get(&lhs)
                    .and_then(|&l| fold(op, l, imm))
                    .map(|src| Op::AssignConst { dst, src }),
                Op::Negate { dst, src } => known.get(&src).map(|&c| Op::AssignConst {
                    dst,
                    src: c.rewrapped_negation(),
                }),
                _ => None,
            };
            if let Some(new_op) = new_op {
                func.body.rewrite_statement(inst_id, new_op);
                folded = true;
                changed = true;
            }
        }
        if !folded {
            return changed;
        }
    }
}

fn fold(op: crate::front::ast::BinOp, lhs: Constant, rhs: Constant) -> Option<Constant> {
    use crate::front::ast::BinOp::*;
    Some(match op {
        Add => lhs.add_constants(rhs),
        Sub => lhs.subtract_constants(rhs),
        Mul => lhs.multiply_constants(rhs),
        LogicalAnd => lhs.logical_and_constants(rhs),
        LogicalOr => lhs.logical_or_constants(rhs),
        _ => return None,
    })
}

impl Constant {
    /// `0 - self`, in self's own width.
    pub fn rewrapped_negation(self) -> Constant {
        self.subtract_constants(self).subtract_constants(self)
    }
}

/// Replace uses of SSA copies with their source when no widening is needed.
fn propagate_copies(func: &mut Function, types: &TypeTable) -> bool {
    let mut replacement: Map<VarId, VarId> = Map::new();
    for inst in func.body.insts.iter().filter(|i| !i.deleted) {
        if let Op::Assign { dst, src } = inst.op {
            let dst_ty = func.body.var(dst).ty;
            let src_ty = func.body.var(src).ty;
            if !types.is_expanding_move_required(dst_ty, src_ty)
                && !types.is_expanding_move_required(src_ty, dst_ty)
            {
                replacement.insert(dst, src);
            }
        }
    }
    if replacement.is_empty() {
        return false;
    }
    // chase chains so a <- b <- c lands on c directly
    let resolve = |mut var: VarId| {
        let mut hops = 0;
        while let Some(&next) = replacement.get(&var) {
            var = next;
            hops += 1;
            if hops > replacement.len() {
                panic!("invariant violated: cyclic copy chain");
            }
        }
        var
    };

    let mut changed = false;
    for idx in 0..func.body.insts.len() {
        if func.body.insts[idx].deleted {
            continue;
        }
        let mut op = func.body.insts[idx].op.clone();
        // the copy's own source must keep its use so the def stays honest
        let skip = matches!(op, Op::Assign { .. });
        if skip {
            continue;
        }
        let mut touched = false;
        op.map_uses(|used| {
            let to = resolve(used);
            if to != used {
                touched = true;
            }
            to
        });
        if let Op::Phi { args, .. } = &mut op {
            for (_, arg) in args.iter_mut() {
                let to = resolve(*arg);
                if to != *arg {
                    touched = true;
                }
                *arg = to;
            }
        }
        if touched {
            func.body.insts[idx].op = op;
            changed = true;
        }
    }
    changed
}

/// Delete side-effect-free statements whose result is never used, cascading
/// through operands as counts drop to zero.
fn eliminate_dead_code(func: &mut Function) -> bool {
    let mut changed = false;
    loop {
        let mut deleted = false;
        for idx in 0..func.body.insts.len() {
            let inst = &func.body.insts[idx];
            if inst.deleted || inst.op.has_side_effects() {
                continue;
            }
            let Some(dst) = inst.op.defined_var() else {
                // a nop or a flag-setter feeding a still-live consumer; the
                // peephole window owns those
                continue;
            };
            if func.body.var(dst).use_count == 0 {
                func.body.delete_statement(InstId(idx as u32));
                deleted = true;
                changed = true;
            }
        }
        if !deleted {
            return changed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse::parse;
    use crate::middle::cfg::build_cfg;

    fn optimized(source: &str) -> (crate::front::parse::Unit, Module) {
        let mut unit = parse(source);
        assert!(!unit.root.is_err(), "{:?}", unit.root);
        let mut module = build_cfg(&mut unit);
        optimize(&mut module, &unit.types);
        (unit, module)
    }

    fn live_ops(func: &Function) -> Vec<Op> {
        reverse_postorder(&func.body, func.entry)
            .into_iter()
            .flat_map(|b| func.body.block_insts(b).collect::<Vec<_>>())
            .map(|i| func.body.inst(i).op.clone())
            .collect()
    }

    #[test]
    fn constants_fold_through_arithmetic() {
        let (_unit, module) = optimized("fn f() -> i32 { return 2 + 3 * 4; }");
        let ops = live_ops(&module.funcs[0]);
        assert!(
            ops.iter()
                .any(|op| matches!(op, Op::AssignConst { src, .. } if src.value_i64() == 14)),
            "{:?}",
            ops
        );
        assert!(!ops.iter().any(|op| matches!(op, Op::Bin { .. })));
    }

    #[test]
    fn copies_and_dead_temps_disappear() {
        let (_unit, module) = optimized(
            "fn f(a: i32) -> i32 {\n\
               let x: i32 = a;\n\
               let y: i32 = x;\n\
               return y;\n\
             }\n",
        );
        let func = &module.funcs[0];
        let ops = live_ops(func);
        // everything collapses onto the parameter
        let assigns = ops
            .iter()
            .filter(|op| matches!(op, Op::Assign { .. }))
            .count();
        assert_eq!(assigns, 0, "{}", func.print_oir());
        assert!(matches!(ops.last(), Some(Op::Return { value: Some(_) })));
    }

    #[test]
    fn unreachable_code_is_removed() {
        let (_unit, module) = optimized(
            "fn f() -> i32 {\n\
               return 1;\n\
               return 2;\n\
             }\n",
        );
        let func = &module.funcs[0];
        let returns = func
            .body
            .insts
            .iter()
            .filter(|i| !i.deleted && matches!(i.op, Op::Return { .. }))
            .count();
        assert_eq!(returns, 1);
    }

    #[test]
    fn optimizer_keeps_calls_and_stores() {
        let (_unit, module) = optimized(
            "fn f(p: *mut i32) {\n\
               *p = 7;\n\
               g();\n\
             }\n",
        );
        let ops = live_ops(&module.funcs[0]);
        assert!(ops.iter().any(|op| matches!(op, Op::Store { .. })));
        assert!(ops.iter().any(|op| matches!(op, Op::Call { .. })));
    }

    #[test]
    fn second_run_is_idempotent() {
        let mut unit = parse("fn f(a: i32) -> i32 { let x: i32 = a + 0; return x * 1; }");
        let mut module = build_cfg(&mut unit);
        optimize(&mut module, &unit.types);
        let first = module.funcs[0].print_oir();
        optimize(&mut module, &unit.types);
        let second = module.funcs[0].print_oir();
        assert_eq!(first, second);
    }
}
