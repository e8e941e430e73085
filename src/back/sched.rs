//! Per-block data-dependence DAG and list scheduler.
//!
//! Nodes are the block's instructions; edges encode read-after-write,
//! write-after-read and write-after-write dependences over variables, over
//! memory (stores serialize against loads and stores), and over the flags
//! register (compares and arithmetic write it, `setcc` and branches read
//! it).  Pinned and uncombinable instructions and control transfers are
//! barriers that keep their position relative to everything else.
//!
//! Priorities are longest-path-to-a-root with load-biased latencies; ready
//! nodes drain from a max-priority queue, ties broken by estimated spill
//! cost and then original program order.

use crate::back::asm::Mnemonic;
use crate::common::*;
use crate::containers::MaxQueue;
use crate::middle::cfg::Function;
use crate::middle::linearize::linear_order;
use crate::middle::oir::{Body, Op};

/// Schedule every block of the function.
pub fn schedule(func: &mut Function) {
    for block in linear_order(func) {
        schedule_block(&mut func.body, block);
    }
}

/// The dependence DAG of one block: node array plus adjacency matrix.
pub struct DepDag {
    pub nodes: Vec<InstId>,
    width: usize,
    matrix: Vec<u8>,
    pred_count: Vec<u32>,
    succs: Vec<Vec<usize>>,
}

impl DepDag {
    /// Build the DAG for `block`'s current instruction order.
    pub fn build(body: &Body, block: BlockId) -> DepDag {
        let nodes: Vec<InstId> = body.block_insts(block).collect();
        let width = nodes.len();
        let mut dag = DepDag {
            nodes,
            width,
            matrix: vec![0; width * width],
            pred_count: vec![0; width],
            succs: vec![Vec::new(); width],
        };
        for later in 0..width {
            for earlier in 0..later {
                if dag.depends(body, earlier, later) {
                    dag.add_edge(earlier, later);
                }
            }
        }
        dag
    }

    fn add_edge(&mut self, from: usize, to: usize) {
        if self.matrix[from * self.width + to] == 0 {
            self.matrix[from * self.width + to] = 1;
            self.pred_count[to] += 1;
            self.succs[from].push(to);
        }
    }

    pub fn has_edge(&self, from: usize, to: usize) -> bool {
        self.matrix[from * self.width + to] == 1
    }

    /// Warshall closure of the edge matrix, for reachability queries.
    pub fn transitive_closure(&self) -> Vec<u8> {
        let mut closure = self.matrix.clone();
        let n = self.width;
        for k in 0..n {
            for i in 0..n {
                if closure[i * n + k] == 0 {
                    continue;
                }
                for j in 0..n {
                    if closure[k * n + j] == 1 {
                        closure[i * n + j] = 1;
                    }
                }
            }
        }
        closure
    }

    fn depends(&self, body: &Body, earlier: usize, later: usize) -> bool {
        let a = body.inst(self.nodes[earlier]);
        let b = body.inst(self.nodes[later]);

        if is_barrier(&a.op) || a.no_combine || is_pinned(body, self.nodes[earlier]) {
            return true;
        }
        if is_barrier(&b.op) || b.no_combine || is_pinned(body, self.nodes[later]) {
            return true;
        }

        let a_def = a.op.defined_var();
        let b_def = b.op.defined_var();
        let a_uses = a.op.used_vars();
        let b_uses = b.op.used_vars();

        // RAW: b reads what a wrote
        if let Some(d) = a_def {
            if b_uses.contains(&d) {
                return true;
            }
        }
        // WAR: b overwrites what a read
        if let Some(d) = b_def {
            if a_uses.contains(&d) {
                return true;
            }
        }
        // WAW
        if a_def.is_some() && a_def == b_def {
            return true;
        }

        // memory: stores serialize against every other memory access
        let a_mem = memory_access(&a.op);
        let b_mem = memory_access(&b.op);
        if (a_mem == Some(MemAccess::Write) && b_mem.is_some())
            || (b_mem == Some(MemAccess::Write) && a_mem.is_some())
        {
            return true;
        }

        // flags: writers against readers and writers
        let a_flags = flags_effect(body, self.nodes[earlier]);
        let b_flags = flags_effect(body, self.nodes[later]);
        match (a_flags, b_flags) {
            (FlagsEffect::Write, FlagsEffect::Read | FlagsEffect::Write)
            | (FlagsEffect::Read, FlagsEffect::Write) => return true,
            _ => {}
        }

        false
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MemAccess {
    Read,
    Write,
}

fn memory_access(op: &Op) -> Option<MemAccess> {
    match op {
        Op::Load { .. } | Op::LoadConstOffset { .. } | Op::LoadVarOffset { .. } => {
            Some(MemAccess::Read)
        }
        Op::Store { .. } | Op::StoreConstOffset { .. } | Op::StoreVarOffset { .. } => {
            Some(MemAccess::Write)
        }
        _ => None,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FlagsEffect {
    None,
    Read,
    Write,
}

fn flags_effect(body: &Body, inst: InstId) -> FlagsEffect {
    match &body.inst(inst).op {
        Op::Set { .. } | Op::Branch { .. } => FlagsEffect::Read,
        Op::Cmp { .. } | Op::CmpConst { .. } | Op::Test { .. } => FlagsEffect::Write,
        _ => match body.inst(inst).mach.map(|m| m.mnemonic) {
            Some(
                Mnemonic::Add
                | Mnemonic::Sub
                | Mnemonic::Imul
                | Mnemonic::Mul
                | Mnemonic::Idiv
                | Mnemonic::Div
                | Mnemonic::And
                | Mnemonic::Or
                | Mnemonic::Xor
                | Mnemonic::Neg
                | Mnemonic::Sal
                | Mnemonic::Sar
                | Mnemonic::Shl
                | Mnemonic::Shr
                | Mnemonic::Inc
                | Mnemonic::Dec,
            ) => FlagsEffect::Write,
            _ => FlagsEffect::None,
        },
    }
}

fn is_barrier(op: &Op) -> bool {
    matches!(
        op,
        Op::Call { .. }
            | Op::IndirectCall { .. }
            | Op::InlineAsm { .. }
            | Op::Jump { .. }
            | Op::Branch { .. }
            | Op::IndirectJump { .. }
            | Op::Return { .. }
    )
}

fn is_pinned(body: &Body, inst: InstId) -> bool {
    body.inst(inst)
        .mach
        .map(|m| m.src_reg.is_some() || m.dst_reg.is_some())
        .unwrap_or(false)
}

/// Cycle estimate per node; loads are biased up for possible cache misses.
fn latency(body: &Body, inst: InstId) -> i64 {
    match &body.inst(inst).op {
        Op::Load { .. } | Op::LoadConstOffset { .. } | Op::LoadVarOffset { .. } => 5,
        _ => match body.inst(inst).mach.map(|m| m.mnemonic) {
            Some(Mnemonic::Idiv | Mnemonic::Div) => 20,
            Some(Mnemonic::Imul | Mnemonic::Mul) => 3,
            _ => 1,
        },
    }
}

fn schedule_block(body: &mut Body, block: BlockId) {
    let dag = DepDag::build(body, block);
    let n = dag.width;
    if n < 2 {
        return;
    }

    // longest path to a root, computed backward over the program order
    // (edges always point forward)
    let mut priority = vec![0i64; n];
    for i in (0..n).rev() {
        let own = latency(body, dag.nodes[i]);
        let downstream = dag.succs[i].iter().map(|&s| priority[s]).max().unwrap_or(0);
        priority[i] = own + downstream;
    }

    let mut remaining = dag.pred_count.clone();
    let mut ready: MaxQueue<usize> = MaxQueue::new();
    for i in 0..n {
        if remaining[i] == 0 {
            ready.push(ready_key(body, &dag, &priority, i), i);
        }
    }

    let mut order: Vec<InstId> = Vec::with_capacity(n);
    while let Some(node) = ready.pop() {
        order.push(dag.nodes[node]);
        for &succ in &dag.succs[node] {
            remaining[succ] -= 1;
            if remaining[succ] == 0 {
                ready.push(ready_key(body, &dag, &priority, succ), succ);
            }
        }
    }
    if order.len() != n {
        panic!("invariant violated: dependence graph has a cycle");
    }

    // relink the block's list in the scheduled order
    for pair in order.windows(2) {
        body.inst_mut(pair[0]).next = Some(pair[1]);
        body.inst_mut(pair[1]).prev = Some(pair[0]);
    }
    body.inst_mut(order[0]).prev = None;
    body.inst_mut(*order.last().unwrap()).next = None;
    body.block_mut(block).leader = Some(order[0]);
    body.block_mut(block).exit = Some(*order.last().unwrap());
}

/// Queue key: path priority first, spill-cost estimate second; insertion
/// order (program order) breaks the remaining ties.
fn ready_key(body: &Body, dag: &DepDag, priority: &[i64], node: usize) -> i64 {
    let weight = body
        .inst(dag.nodes[node])
        .op
        .defined_var()
        .map(|v| body.var(v).weight as i64)
        .unwrap_or(0);
    priority[node] * 1_000 + weight.min(999)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::types::{Primitive, TypeTable};
    use crate::middle::frame::{AreaPurpose, StackDataArea};
    use crate::middle::oir::Constant;

    fn harness() -> (Function, Ctx, BlockId, TypeId) {
        let mut types = TypeTable::new();
        let i64t = types.basic(Primitive::I64);
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
        (func, ctx, entry, i64t)
    }

    #[test]
    fn loads_hoist_above_cheap_independent_work() {
        let (mut func, mut ctx, entry, i64t) = harness();
        let p = func.body.new_temp(&mut ctx, i64t);
        let x = func.body.new_temp(&mut ctx, i64t);
        let l = func.body.new_temp(&mut ctx, i64t);
        let cheap = func.body.add_statement(
            entry,
            Op::AssignConst {
                dst: x,
                src: Constant::I64(1),
            },
            1,
        );
        let load = func
            .body
            .add_statement(entry, Op::Load { dst: l, addr: p }, 1);
        schedule_block(&mut func.body, entry);
        let order: Vec<InstId> = func.body.block_insts(entry).collect();
        assert_eq!(order, vec![load, cheap]);
    }

    #[test]
    fn raw_dependences_are_preserved() {
        let (mut func, mut ctx, entry, i64t) = harness();
        let a = func.body.new_temp(&mut ctx, i64t);
        let b = func.body.new_temp(&mut ctx, i64t);
        let def = func.body.add_statement(
            entry,
            Op::AssignConst {
                dst: a,
                src: Constant::I64(3),
            },
            1,
        );
        let useit = func
            .body
            .add_statement(entry, Op::Assign { dst: b, src: a }, 1);
        schedule_block(&mut func.body, entry);
        let order: Vec<InstId> = func.body.block_insts(entry).collect();
        assert_eq!(order, vec![def, useit]);
    }

    #[test]
    fn stores_never_swap() {
        let (mut func, mut ctx, entry, i64t) = harness();
        let p = func.body.new_temp(&mut ctx, i64t);
        let v1 = func.body.new_temp(&mut ctx, i64t);
        let v2 = func.body.new_temp(&mut ctx, i64t);
        let s1 = func
            .body
            .add_statement(entry, Op::Store { addr: p, src: v1 }, 1);
        let s2 = func
            .body
            .add_statement(entry, Op::Store { addr: p, src: v2 }, 1);
        schedule_block(&mut func.body, entry);
        let order: Vec<InstId> = func.body.block_insts(entry).collect();
        assert_eq!(order, vec![s1, s2]);
    }

    #[test]
    fn terminator_stays_last() {
        let (mut func, mut ctx, entry, i64t) = harness();
        let target = func.body.new_block(&mut ctx, FuncId(0));
        let a = func.body.new_temp(&mut ctx, i64t);
        func.body
            .add_statement(entry, Op::Jump { target }, 1);
        // a statement appended after the jump must not migrate above it once
        // scheduled (the jump is a barrier)
        let extra = func.body.add_statement(
            entry,
            Op::AssignConst {
                dst: a,
                src: Constant::I64(9),
            },
            1,
        );
        schedule_block(&mut func.body, entry);
        let order: Vec<InstId> = func.body.block_insts(entry).collect();
        assert_eq!(order.last(), Some(&extra));
        assert!(matches!(func.body.inst(order[0]).op, Op::Jump { .. }));
    }

    #[test]
    fn closure_answers_reachability() {
        let (mut func, mut ctx, entry, i64t) = harness();
        let a = func.body.new_temp(&mut ctx, i64t);
        let b = func.body.new_temp(&mut ctx, i64t);
        let c = func.body.new_temp(&mut ctx, i64t);
        func.body.add_statement(
            entry,
            Op::AssignConst {
                dst: a,
                src: Constant::I64(1),
            },
            1,
        );
        func.body
            .add_statement(entry, Op::Assign { dst: b, src: a }, 1);
        func.body
            .add_statement(entry, Op::Assign { dst: c, src: b }, 1);
        let dag = DepDag::build(&func.body, entry);
        let closure = dag.transitive_closure();
        assert_eq!(closure[2], 1, "node 0 reaches node 2 transitively");
    }
}
