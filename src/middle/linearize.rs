//! The block linearizer: breadth-first layout of each function's blocks.
//!
//! A block ending in a direct jump enqueues its target first, so the target
//! tends to become the block's direct successor and the jump a deletion
//! candidate (the selector decides).  Branches enqueue their else block
//! first for the same reason: the conditional jump goes to the if side and
//! falls through to the else side.

use std::collections::VecDeque;

use crate::common::*;
use crate::middle::cfg::Function;
use crate::middle::oir::Op;

/// Lay the function's blocks out and wire the `direct_successor` chain.
/// Returns the layout order.  Idempotent: visited state is reset up front.
pub fn linearize(func: &mut Function) -> Vec<BlockId> {
    for block in &mut func.body.blocks {
        block.visited = false;
        block.direct_successor = None;
    }

    // the empty function-exit block is visited up front, never chained
    let exit_block = func.exit_block;
    if func.body.block(exit_block).leader.is_none() {
        func.body.block_mut(exit_block).visited = true;
    }

    let mut order = Vec::new();
    let mut queue: VecDeque<BlockId> = VecDeque::new();
    func.body.block_mut(func.entry).visited = true;
    queue.push_back(func.entry);

    while let Some(block) = queue.pop_front() {
        order.push(block);

        // preferred fall-through first, then the remaining successors
        let mut to_enqueue: Vec<BlockId> = Vec::new();
        let exit_op = func
            .body
            .block(block)
            .exit
            .map(|exit| func.body.inst(exit).op.clone());
        match exit_op {
            Some(Op::Jump { target }) => to_enqueue.push(target),
            Some(Op::Branch { ff, tt, .. }) => {
                to_enqueue.push(ff);
                to_enqueue.push(tt);
            }
            _ => {}
        }
        for &succ in func.body.block(block).succs.iter() {
            if !to_enqueue.contains(&succ) {
                to_enqueue.push(succ);
            }
        }
        for succ in to_enqueue {
            let b = func.body.block_mut(succ);
            if b.visited {
                continue;
            }
            b.visited = true;
            if b.is_exit && b.leader.is_none() {
                // empty function-exit block: visited, never chained
                continue;
            }
            queue.push_back(succ);
        }
    }

    for pair in order.windows(2) {
        func.body.block_mut(pair[0]).direct_successor = Some(pair[1]);
    }
    order
}

/// The layout order recorded by [linearize], read back off the chain.
pub fn linear_order(func: &Function) -> Vec<BlockId> {
    let mut order = vec![func.entry];
    let mut cursor = func.entry;
    while let Some(next) = func.body.block(cursor).direct_successor {
        order.push(next);
        cursor = next;
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse::parse;
    use crate::middle::cfg::build_cfg;
    use crate::middle::oir::Op;

    fn lowered(source: &str) -> Function {
        let mut unit = parse(source);
        assert!(!unit.root.is_err(), "{:?}", unit.root);
        build_cfg(&mut unit).funcs.remove(0)
    }

    #[test]
    fn chain_matches_layout_order() {
        let mut func = lowered(
            "fn f(a: i32) -> i32 {\n\
               if (a > 0) { return 1; }\n\
               return 0;\n\
             }\n",
        );
        let order = linearize(&mut func);
        assert_eq!(order, linear_order(&func));
        assert_eq!(order[0], func.entry);
        // every block but the last points at the next one
        for pair in order.windows(2) {
            assert_eq!(func.body.block(pair[0]).direct_successor, Some(pair[1]));
        }
        assert_eq!(
            func.body.block(*order.last().unwrap()).direct_successor,
            None
        );
    }

    #[test]
    fn branch_else_side_falls_through() {
        let mut func = lowered(
            "fn f(a: i32) -> i32 {\n\
               let mut x: i32 = 0;\n\
               if (a > 0) { x = 1; } else { x = 2; }\n\
               return x;\n\
             }\n",
        );
        let order = linearize(&mut func);
        // the entry's branch: its ff block must be laid out right after
        let exit = func.body.block(func.entry).exit.unwrap();
        let Op::Branch { ff, .. } = func.body.inst(exit).op else {
            panic!("entry must end in a branch");
        };
        let entry_pos = order.iter().position(|&b| b == func.entry).unwrap();
        assert_eq!(order[entry_pos + 1], ff);
        assert_eq!(func.body.block(func.entry).direct_successor, Some(ff));
    }

    #[test]
    fn empty_exit_block_is_visited_but_unchained() {
        let mut func = lowered("fn f() -> i32 { return 4; }");
        let order = linearize(&mut func);
        assert!(!order.contains(&func.exit_block));
        assert!(func.body.block(func.exit_block).visited);
    }

    #[test]
    fn linearizer_is_idempotent() {
        let mut func = lowered(
            "fn f(n: i32) -> i32 {\n\
               let mut s: i32 = 0;\n\
               let mut i: i32 = 0;\n\
               while (i < n) { s = s + i; i = i + 1; }\n\
               return s;\n\
             }\n",
        );
        let first = linearize(&mut func);
        let second = linearize(&mut func);
        assert_eq!(first, second);
    }
}
