//! The CFG builder: lowers the AST into basic blocks of OIR, computes
//! dominance, inserts phi functions at dominance frontiers, and renames
//! variables into SSA form (Cytron's construction).

use crate::common::*;
use crate::containers::{NestingLevel, NestingStack, VecSet};
use crate::front::ast::*;
use crate::front::parse::Unit;
use crate::front::symtab::{Membership, VarSymId, VariableTable};
use crate::front::types::{Primitive, TypeKind, TypeTable};
use crate::middle::frame::{AreaPurpose, StackDataArea};
use crate::middle::oir::*;

/// Integer-class parameters beyond this many arrive on the stack.
pub const PARAM_REGISTER_QUOTA: usize = 6;

/// A module-level variable definition, printed after the functions.
#[derive(Debug)]
pub struct GlobalVar {
    pub sym: VarSymId,
    pub name: Id,
    pub ty: TypeId,
    pub init: Option<i64>,
    pub line: u32,
}

/// A lowered function: the IR arenas plus the two stack data areas and the
/// switch jump tables.
#[derive(Debug)]
pub struct Function {
    pub id: FuncId,
    pub name: Id,
    pub entry: BlockId,
    /// The (empty) function-exit block; the linearizer marks it visited
    /// without chaining it.
    pub exit_block: BlockId,
    pub body: Body,
    pub local_area: StackDataArea,
    pub param_area: StackDataArea,
    pub jump_tables: Vec<JumpTable>,
    pub line: u32,
}

/// A lowered compilation unit.
#[derive(Debug)]
pub struct Module {
    pub funcs: Vec<Function>,
    pub globals: Vec<GlobalVar>,
}

/// Lower the unit's AST into one CFG per function.
///
/// Panics if the root is an error node; the driver must refuse to run the
/// back-end on a failed parse.
pub fn build_cfg(unit: &mut Unit) -> Module {
    let items = match &unit.root {
        Root::Err { .. } => panic!("invariant violated: building a CFG from an error-tainted AST"),
        Root::Unit(items) => items,
    };

    let mut funcs = Vec::new();
    let mut globals = Vec::new();
    for item in items {
        match item {
            Item::Global { var, init, line } => {
                let record = unit.variables.record(*var);
                globals.push(GlobalVar {
                    sym: *var,
                    name: record.name,
                    ty: record.ty,
                    init: *init,
                    line: *line,
                });
            }
            Item::Function { func, body, line } => {
                let lowered = lower_function(
                    &mut unit.ctx,
                    &mut unit.types,
                    &mut unit.functions,
                    &mut unit.variables,
                    *func,
                    body,
                    *line,
                );
                funcs.push(lowered);
            }
        }
    }
    Module { funcs, globals }
}

fn lower_function(
    ctx: &mut Ctx,
    types: &mut TypeTable,
    functions: &mut crate::front::symtab::FunctionTable,
    variables: &mut VariableTable,
    func_id: FuncId,
    stmts: &[Stmt],
    line: u32,
) -> Function {
    let record = functions.record(func_id);
    let name = record.name;
    let params = record.params.clone();

    mark_address_taken(variables, stmts);

    let mut func = Function {
        id: func_id,
        name,
        entry: BlockId(0),
        exit_block: BlockId(0),
        body: Body::new(),
        local_area: StackDataArea::new(AreaPurpose::FunctionLocal),
        param_area: StackDataArea::new(AreaPurpose::ParameterPassing),
        jump_tables: Vec::new(),
        line,
    };
    let entry = func.body.new_block(ctx, func_id);
    func.entry = entry;

    let mut lower = Lowerer {
        ctx,
        types,
        functions,
        variables,
        func,
        cur: entry,
        nesting: NestingStack::new(),
        defers: Vec::new(),
        base: Map::new(),
        defs: Map::new(),
        terminated: false,
    };
    lower.nesting.push(NestingLevel::Function);
    lower.lower_params(&params, line);
    lower.lower_stmts(stmts);
    if !lower.terminated {
        lower.run_defers();
        lower.emit(Op::Return { value: None }, line);
        lower.terminated = true;
    }
    let exit_block = lower.new_block();
    lower.func.body.block_mut(exit_block).is_exit = true;

    let Lowerer {
        mut func,
        defs,
        base,
        variables,
        ..
    } = lower;
    func.exit_block = exit_block;

    compute_dominance(&mut func.body, func.entry);
    insert_phi_functions(&mut func.body, variables, &base, &defs);
    rename_into_ssa(&mut func.body, variables, &base, func.entry, &params);
    func.body.recount_uses();
    func
}

/// Mark every symbol whose address is taken anywhere in the body; those stay
/// memory-resident and out of SSA.
fn mark_address_taken(variables: &mut VariableTable, stmts: &[Stmt]) {
    fn walk_expr(variables: &mut VariableTable, expr: &Expr) {
        match &expr.kind {
            ExprKind::AddrOf(inner) => {
                if let ExprKind::Var(sym) = inner.kind {
                    variables.record_mut(sym).address_taken = true;
                }
                walk_expr(variables, inner);
            }
            ExprKind::Unary { operand, .. } => walk_expr(variables, operand),
            ExprKind::Binary { lhs, rhs, .. } => {
                walk_expr(variables, lhs);
                walk_expr(variables, rhs);
            }
            ExprKind::Call { args, .. } => args.iter().for_each(|a| walk_expr(variables, a)),
            ExprKind::Index { base, index } => {
                walk_expr(variables, base);
                walk_expr(variables, index);
            }
            ExprKind::Member { base, .. } => walk_expr(variables, base),
            ExprKind::Deref(inner) | ExprKind::Cast(inner) => walk_expr(variables, inner),
            ExprKind::Int { .. } | ExprKind::Str(_) | ExprKind::Var(_) => {}
        }
    }
    fn walk_stmts(variables: &mut VariableTable, stmts: &[Stmt]) {
        for stmt in stmts {
            match stmt {
                Stmt::Let { init, .. } => {
                    if let Some(init) = init {
                        walk_expr(variables, init)
                    }
                }
                Stmt::Assign { place, value, .. } => {
                    walk_expr(variables, place);
                    walk_expr(variables, value);
                }
                Stmt::If { guard, tt, ff, .. } => {
                    walk_expr(variables, guard);
                    walk_stmts(variables, tt);
                    walk_stmts(variables, ff);
                }
                Stmt::While { guard, body, .. } | Stmt::DoWhile { body, guard, .. } => {
                    walk_expr(variables, guard);
                    walk_stmts(variables, body);
                }
                Stmt::Switch {
                    scrutinee,
                    cases,
                    default,
                    ..
                } => {
                    walk_expr(variables, scrutinee);
                    for (_, body) in cases {
                        walk_stmts(variables, body);
                    }
                    walk_stmts(variables, default);
                }
                Stmt::Return { value, .. } => {
                    if let Some(value) = value {
                        walk_expr(variables, value)
                    }
                }
                Stmt::Expr(expr) => walk_expr(variables, expr),
                Stmt::Asm { .. } => {}
                Stmt::Defer { body, .. } | Stmt::Block(body) => walk_stmts(variables, body),
            }
        }
    }
    walk_stmts(variables, stmts);
}

struct Lowerer<'t, 'ast> {
    ctx: &'t mut Ctx,
    types: &'t mut TypeTable,
    functions: &'t mut crate::front::symtab::FunctionTable,
    variables: &'t mut VariableTable,
    func: Function,
    cur: BlockId,
    nesting: NestingStack,
    /// Deferred statement lists, run last-in-first-out at function exit.
    defers: Vec<&'ast [Stmt]>,
    /// Pre-SSA variable for each renameable symbol.
    base: Map<VarSymId, VarId>,
    /// Blocks containing a definition of each renameable symbol.
    defs: Map<VarSymId, VecSet<BlockId>>,
    terminated: bool,
}

impl<'t, 'ast> Lowerer<'t, 'ast> {
    fn new_block(&mut self) -> BlockId {
        self.func.body.new_block(self.ctx, self.func.id)
    }

    fn start_block(&mut self, block: BlockId) {
        self.cur = block;
        self.terminated = false;
    }

    fn new_temp(&mut self, ty: TypeId) -> VarId {
        self.func.body.new_temp(self.ctx, ty)
    }

    fn emit(&mut self, op: Op, line: u32) -> InstId {
        let freq = self.nesting.estimated_frequency();
        let id = self.func.body.add_statement(self.cur, op, line);
        let op = self.func.body.inst(id).op.clone();
        for touched in op.used_vars().into_iter().chain(op.defined_var()) {
            let var = self.func.body.var_mut(touched);
            var.weight = var.weight.saturating_add(freq);
        }
        id
    }

    fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.func.body.block_mut(from).succs.insert(to);
        self.func.body.block_mut(to).preds.insert(from);
    }

    fn emit_jump(&mut self, target: BlockId, line: u32) {
        let from = self.cur;
        self.emit(Op::Jump { target }, line);
        self.add_edge(from, target);
        self.terminated = true;
    }

    fn emit_branch(&mut self, cc: Cc, tt: BlockId, ff: BlockId, line: u32) {
        let from = self.cur;
        self.emit(Op::Branch { cc, tt, ff }, line);
        self.add_edge(from, tt);
        self.add_edge(from, ff);
        self.terminated = true;
    }

    // Parameters: the first six arrive in registers and become SSA entry
    // versions; the rest are loaded from the parameter-passing area.
    fn lower_params(&mut self, params: &[VarSymId], line: u32) {
        for (index, &sym) in params.iter().enumerate() {
            let record = self.variables.record(sym);
            let ty = record.ty;
            let name = record.name.to_string();
            let var = self.func.body.new_version(sym, &name, 0, ty);
            self.func.body.var_mut(var).param_index = Some(index as u32);
            self.base.insert(sym, var);
            self.defs.entry(sym).or_default().insert(self.cur);
            if index >= PARAM_REGISTER_QUOTA {
                let region = self
                    .func
                    .param_area
                    .create_stack_region_for_type(self.types, ty);
                self.func.param_area.add_variable(var);
                let ptr = self.pointer_ty(ty);
                let addr = self.new_temp(ptr);
                self.emit(
                    Op::MemoryAddress {
                        dst: addr,
                        target: MemTarget::Param(region),
                        offset: 0,
                    },
                    line,
                );
                self.emit(Op::Load { dst: var, addr }, line);
            }
            if self.variables.record(sym).address_taken {
                let region = self.ensure_region(sym);
                let ptr = self.pointer_ty(ty);
                let addr = self.new_temp(ptr);
                self.emit(
                    Op::MemoryAddress {
                        dst: addr,
                        target: MemTarget::Local(region),
                        offset: 0,
                    },
                    line,
                );
                self.emit(Op::Store { addr, src: var }, line);
            }
        }
    }

    fn pointer_ty(&mut self, elem: TypeId) -> TypeId {
        self.types
            .pointer_to(elem, crate::front::types::Mutability::Immutable)
    }

    /// Symbols that stay in memory: globals, aggregates, address-taken.
    fn is_memory_sym(&self, sym: VarSymId) -> bool {
        let record = self.variables.record(sym);
        record.membership == Membership::Global
            || record.address_taken
            || !self.types.is_scalar(record.ty)
    }

    /// The pre-SSA variable backing a renameable symbol.
    fn base_var(&mut self, sym: VarSymId) -> VarId {
        if let Some(&var) = self.base.get(&sym) {
            return var;
        }
        let record = self.variables.record(sym);
        let name = record.name.to_string();
        let ty = record.ty;
        let var = self.func.body.new_version(sym, &name, 0, ty);
        self.base.insert(sym, var);
        var
    }

    /// Region backing a memory-resident local, created on first touch.
    /// Address-taken regions are important: they survive compaction.
    fn ensure_region(&mut self, sym: VarSymId) -> RegionId {
        if let Some(region) = self.variables.record(sym).region {
            return region;
        }
        let ty = self.variables.record(sym).ty;
        let region = self
            .func
            .local_area
            .create_stack_region_for_type(self.types, ty);
        if self.variables.record(sym).address_taken {
            self.func.local_area.mark_important(region);
        }
        self.variables.record_mut(sym).region = Some(region);
        region
    }

    /// The address of a memory-resident symbol, as a fresh temporary.
    fn address_of_sym(&mut self, sym: VarSymId, line: u32) -> VarId {
        let (membership, name, ty) = {
            let record = self.variables.record(sym);
            (record.membership, record.name, record.ty)
        };
        let target = if membership == Membership::Global {
            MemTarget::Global(name)
        } else {
            MemTarget::Local(self.ensure_region(sym))
        };
        let ptr = self.pointer_ty(ty);
        let addr = self.new_temp(ptr);
        self.emit(
            Op::MemoryAddress {
                dst: addr,
                target,
                offset: 0,
            },
            line,
        );
        addr
    }

    /// Read a scalar symbol's current value.
    fn read_sym(&mut self, sym: VarSymId, line: u32) -> VarId {
        self.variables.record_mut(sym).use_count += 1;
        if self.is_memory_sym(sym) {
            let ty = self.variables.record(sym).ty;
            if let Some(region) = self.variables.record(sym).region {
                self.func.local_area.note_read(region);
            }
            let addr = self.address_of_sym(sym, line);
            let value = self.new_temp(ty);
            self.emit(Op::Load { dst: value, addr }, line);
            value
        } else {
            self.base_var(sym)
        }
    }

    /// Write a scalar symbol.
    fn write_sym(&mut self, sym: VarSymId, value: VarId, line: u32) {
        {
            let record = self.variables.record_mut(sym);
            if record.initialized {
                record.mutated = true;
            }
            record.initialized = true;
        }
        if self.is_memory_sym(sym) {
            let addr = self.address_of_sym(sym, line);
            self.emit(Op::Store { addr, src: value }, line);
        } else {
            let dst = self.base_var(sym);
            self.emit(Op::Assign { dst, src: value }, line);
            self.defs.entry(sym).or_default().insert(self.cur);
        }
    }

    fn constant_for(&self, value: i64, hex: bool, ty: TypeId) -> Constant {
        if hex {
            return Constant::Hex(value as u64);
        }
        match self.types.kind(ty) {
            TypeKind::Basic { prim, .. } => match prim {
                Primitive::I8 => Constant::I8(value as i8),
                Primitive::I16 => Constant::I16(value as i16),
                Primitive::I32 => Constant::I32(value as i32),
                Primitive::I64 => Constant::I64(value),
                Primitive::U8 => Constant::U8(value as u8),
                Primitive::U16 => Constant::U16(value as u16),
                Primitive::U32 => Constant::U32(value as u32),
                Primitive::U64 => Constant::U64(value as u64),
                Primitive::Char => Constant::Char(value as u8),
                _ => Constant::I64(value),
            },
            _ => Constant::I64(value),
        }
    }

    fn lower_stmts(&mut self, stmts: &'ast [Stmt]) {
        for stmt in stmts {
            if self.terminated {
                // unreachable code after a return; park it in a dangling
                // block for the optimizer to discard
                let dangling = self.new_block();
                self.start_block(dangling);
            }
            self.lower_stmt(stmt);
        }
    }

    fn lower_stmt(&mut self, stmt: &'ast Stmt) {
        match stmt {
            Stmt::Let { var, init, line } => {
                if self.is_memory_sym(*var) {
                    self.ensure_region(*var);
                }
                if let Some(init) = init {
                    let value = self.lower_expr(init);
                    self.write_sym(*var, value, *line);
                }
            }
            Stmt::Assign { place, value, line } => {
                let value = self.lower_expr(value);
                self.lower_store(place, value, *line);
            }
            Stmt::If {
                guard,
                tt,
                ff,
                line,
            } => {
                let then_b = self.new_block();
                let merge = self.new_block();
                let else_b = if ff.is_empty() { merge } else { self.new_block() };
                self.lower_guard(guard, then_b, else_b);
                self.start_block(then_b);
                self.nesting.push(NestingLevel::If);
                self.lower_stmts(tt);
                self.nesting.pop();
                if !self.terminated {
                    self.emit_jump(merge, *line);
                }
                if !ff.is_empty() {
                    self.start_block(else_b);
                    self.nesting.push(NestingLevel::If);
                    self.lower_stmts(ff);
                    self.nesting.pop();
                    if !self.terminated {
                        self.emit_jump(merge, *line);
                    }
                }
                self.start_block(merge);
            }
            Stmt::While { guard, body, line } => {
                let head = self.new_block();
                let body_b = self.new_block();
                let exit = self.new_block();
                self.emit_jump(head, *line);
                self.start_block(head);
                self.lower_guard(guard, body_b, exit);
                self.start_block(body_b);
                self.nesting.push(NestingLevel::Loop);
                self.lower_stmts(body);
                self.nesting.pop();
                if !self.terminated {
                    self.emit_jump(head, *line);
                }
                self.start_block(exit);
            }
            Stmt::DoWhile { body, guard, line } => {
                let body_b = self.new_block();
                let exit = self.new_block();
                self.emit_jump(body_b, *line);
                self.start_block(body_b);
                self.nesting.push(NestingLevel::Loop);
                self.lower_stmts(body);
                self.nesting.pop();
                if !self.terminated {
                    self.lower_guard(guard, body_b, exit);
                }
                self.start_block(exit);
            }
            Stmt::Switch {
                scrutinee,
                cases,
                default,
                line,
            } => self.lower_switch(scrutinee, cases, default, *line),
            Stmt::Return { value, line } => {
                self.run_defers();
                let value = value.as_ref().map(|v| self.lower_expr(v));
                self.emit(Op::Return { value }, *line);
                self.terminated = true;
            }
            Stmt::Expr(expr) => {
                self.lower_expr(expr);
            }
            Stmt::Asm { text, line } => {
                self.emit(Op::InlineAsm { text: *text }, *line);
            }
            Stmt::Defer { body, .. } => {
                self.defers.push(body);
            }
            Stmt::Block(stmts) => self.lower_stmts(stmts),
        }
    }

    /// Run deferred bodies, most recent first, at a function exit point.
    fn run_defers(&mut self) {
        let defers: Vec<&'ast [Stmt]> = self.defers.clone();
        for body in defers.iter().rev() {
            self.nesting.push(NestingLevel::Defer);
            self.lower_stmts(body);
            self.nesting.pop();
        }
    }

    fn lower_switch(
        &mut self,
        scrutinee: &'ast Expr,
        cases: &'ast [(i64, Vec<Stmt>)],
        default: &'ast [Stmt],
        line: u32,
    ) {
        if cases.is_empty() {
            // degenerate switch: only the default arm exists
            self.nesting.push(NestingLevel::Case);
            self.lower_expr(scrutinee);
            self.lower_stmts(default);
            self.nesting.pop();
            return;
        }
        let scr = self.lower_expr(scrutinee);
        let base = cases.iter().map(|(v, _)| *v).min().unwrap();
        let max = cases.iter().map(|(v, _)| *v).max().unwrap();
        let span = (max - base + 1) as u64;

        let dispatch = self.new_block();
        let default_b = self.new_block();
        let merge = self.new_block();
        let case_blocks: Vec<(i64, BlockId)> =
            cases.iter().map(|(v, _)| (*v, self.func.body.new_block(self.ctx, self.func.id))).collect();

        // rebase the index so the table starts at zero
        let index = if base != 0 {
            let rebased = self.new_temp(self.func.body.var(scr).ty);
            self.emit(
                Op::BinConst {
                    op: BinOp::Sub,
                    dst: rebased,
                    lhs: scr,
                    imm: Constant::I64(base),
                },
                line,
            );
            rebased
        } else {
            scr
        };

        // unsigned bounds check routes out-of-range values to the default
        self.emit(
            Op::CmpConst {
                lhs: index,
                imm: Constant::U64(span),
            },
            line,
        );
        self.emit_branch(Cc::Ae, default_b, dispatch, line);

        // dense table over [base, max], holes filled with the default
        let table = self.func.jump_tables.len() as u32;
        let mut targets = Vec::with_capacity(span as usize);
        for value in base..=max {
            let target = case_blocks
                .iter()
                .find(|(v, _)| *v == value)
                .map(|(_, b)| *b)
                .unwrap_or(default_b);
            targets.push(target);
        }
        self.func.jump_tables.push(JumpTable {
            id: table,
            base,
            targets: targets.clone(),
            default: default_b,
        });

        self.start_block(dispatch);
        self.func.body.block_mut(dispatch).jump_table = Some(table);
        let u64t = self.types.basic(Primitive::U64);
        let target_addr = self.new_temp(u64t);
        self.emit(
            Op::IndirectJumpCalc {
                dst: target_addr,
                table,
                index,
                scale: 8,
            },
            line,
        );
        let from = self.cur;
        self.emit(
            Op::IndirectJump {
                table,
                addr: target_addr,
            },
            line,
        );
        for target in targets.iter().copied().chain(Some(default_b)) {
            self.add_edge(from, target);
        }
        self.terminated = true;

        for ((_, body), (_, block)) in cases.iter().zip(&case_blocks) {
            self.start_block(*block);
            self.nesting.push(NestingLevel::Case);
            self.lower_stmts(body);
            self.nesting.pop();
            if !self.terminated {
                self.emit_jump(merge, line);
            }
        }
        self.start_block(default_b);
        self.nesting.push(NestingLevel::Case);
        self.lower_stmts(default);
        self.nesting.pop();
        if !self.terminated {
            self.emit_jump(merge, line);
        }
        self.start_block(merge);
    }

    fn lower_guard(&mut self, guard: &'ast Expr, tt: BlockId, ff: BlockId) {
        match &guard.kind {
            ExprKind::Binary { op, lhs, rhs } if op.is_comparison() => {
                let l = self.lower_expr(lhs);
                let r = self.lower_expr(rhs);
                let signed = self.types.is_signed(lhs.ty) || self.types.is_signed(rhs.ty);
                self.emit(Op::Cmp { lhs: l, rhs: r }, guard.line);
                self.emit_branch(Cc::for_comparison(*op, signed), tt, ff, guard.line);
            }
            _ => {
                let g = self.lower_expr(guard);
                self.emit(
                    Op::CmpConst {
                        lhs: g,
                        imm: Constant::I64(0),
                    },
                    guard.line,
                );
                self.emit_branch(Cc::Ne, tt, ff, guard.line);
            }
        }
    }

    fn lower_expr(&mut self, expr: &'ast Expr) -> VarId {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Int { value, hex } => {
                let dst = self.new_temp(expr.ty);
                let src = self.constant_for(*value, *hex, expr.ty);
                self.emit(Op::AssignConst { dst, src }, line);
                dst
            }
            ExprKind::Str(text) => {
                let dst = self.new_temp(expr.ty);
                self.emit(
                    Op::AssignConst {
                        dst,
                        src: Constant::Str(*text),
                    },
                    line,
                );
                dst
            }
            ExprKind::Var(sym) => {
                let ty = self.variables.record(*sym).ty;
                if !self.types.is_scalar(ty) {
                    // aggregates decay to their address
                    self.variables.record_mut(*sym).use_count += 1;
                    self.address_of_sym(*sym, line)
                } else {
                    self.read_sym(*sym, line)
                }
            }
            ExprKind::Unary { op, operand } => {
                let src = self.lower_expr(operand);
                let dst = self.new_temp(expr.ty);
                let op = match op {
                    UnOp::Negate => Op::Negate { dst, src },
                    UnOp::BitNot => Op::BitNot { dst, src },
                    UnOp::LogicalNot => Op::LogicalNot { dst, src },
                };
                self.emit(op, line);
                dst
            }
            ExprKind::Binary { op, lhs, rhs } if op.is_comparison() => {
                let l = self.lower_expr(lhs);
                let r = self.lower_expr(rhs);
                let signed = self.types.is_signed(lhs.ty) || self.types.is_signed(rhs.ty);
                self.emit(Op::Cmp { lhs: l, rhs: r }, line);
                let dst = self.new_temp(expr.ty);
                self.emit(
                    Op::Set {
                        cc: Cc::for_comparison(*op, signed),
                        dst,
                    },
                    line,
                );
                dst
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let l = self.lower_expr(lhs);
                let r = self.lower_expr(rhs);
                let dst = self.new_temp(expr.ty);
                self.emit(
                    Op::Bin {
                        op: *op,
                        dst,
                        lhs: l,
                        rhs: r,
                    },
                    line,
                );
                dst
            }
            ExprKind::Call { func, args } => {
                let args: Vec<VarId> = args.iter().map(|a| self.lower_expr(a)).collect();
                let record = self.functions.record(*func);
                let ret = record.ret;
                let void = self.types.size(ret) == 0;
                let dst = if void { None } else { Some(self.new_temp(ret)) };
                self.emit(
                    Op::Call {
                        dst,
                        func: *func,
                        args,
                    },
                    line,
                );
                // call-graph edge and called flag
                let caller = self.func.id;
                self.functions.record_mut(caller).calls.insert(*func);
                self.functions.record_mut(*func).called = true;
                dst.unwrap_or_else(|| self.new_temp(ret))
            }
            ExprKind::Index { base, index } => {
                let addr = self.lower_element_addr(base, index, expr.ty, line);
                let dst = self.new_temp(expr.ty);
                self.emit(Op::Load { dst, addr }, line);
                dst
            }
            ExprKind::Member {
                base,
                field: _,
                offset,
            } => {
                let addr = self.lower_address(base);
                let dst = self.new_temp(expr.ty);
                if *offset == 0 {
                    self.emit(Op::Load { dst, addr }, line);
                } else {
                    let shifted = self.new_temp(self.func.body.var(addr).ty);
                    self.emit(
                        Op::BinConst {
                            op: BinOp::Add,
                            dst: shifted,
                            lhs: addr,
                            imm: Constant::U64(*offset as u64),
                        },
                        line,
                    );
                    self.emit(Op::Load { dst, addr: shifted }, line);
                }
                dst
            }
            ExprKind::AddrOf(inner) => match &inner.kind {
                ExprKind::Var(sym) => self.address_of_sym(*sym, line),
                ExprKind::Index { base, index } => {
                    self.lower_element_addr(base, index, inner.ty, line)
                }
                _ => panic!("invariant violated: address-of a non-place expression"),
            },
            ExprKind::Deref(inner) => {
                let addr = self.lower_expr(inner);
                let dst = self.new_temp(expr.ty);
                self.emit(Op::Load { dst, addr }, line);
                dst
            }
            ExprKind::Cast(inner) => {
                let src = self.lower_expr(inner);
                let dst = self.new_temp(expr.ty);
                self.emit(Op::Cast { dst, src }, line);
                dst
            }
        }
    }

    /// Address of `base[index]`, scaling the index by the element size.
    fn lower_element_addr(
        &mut self,
        base: &'ast Expr,
        index: &'ast Expr,
        elem_ty: TypeId,
        line: u32,
    ) -> VarId {
        let base_addr = self.lower_address(base);
        let idx = self.lower_expr(index);
        let size = self.types.size(elem_ty).max(1);
        let addr_ty = self.func.body.var(base_addr).ty;
        let scaled = if size == 1 {
            idx
        } else {
            let scaled = self.new_temp(self.func.body.var(idx).ty);
            self.emit(
                Op::BinConst {
                    op: BinOp::Mul,
                    dst: scaled,
                    lhs: idx,
                    imm: Constant::U64(size as u64),
                },
                line,
            );
            scaled
        };
        let addr = self.new_temp(addr_ty);
        self.emit(
            Op::Bin {
                op: BinOp::Add,
                dst: addr,
                lhs: base_addr,
                rhs: scaled,
            },
            line,
        );
        addr
    }

    /// The address an lvalue expression denotes.
    fn lower_address(&mut self, expr: &'ast Expr) -> VarId {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Var(sym) => {
                let ty = self.variables.record(*sym).ty;
                if self.types.is_pointerish(ty) && !self.is_memory_sym(*sym) {
                    // a pointer value is itself the address
                    self.read_sym(*sym, line)
                } else {
                    self.variables.record_mut(*sym).use_count += 1;
                    self.address_of_sym(*sym, line)
                }
            }
            ExprKind::Deref(inner) => self.lower_expr(inner),
            ExprKind::Member { base, offset, .. } => {
                let addr = self.lower_address(base);
                if *offset == 0 {
                    addr
                } else {
                    let shifted = self.new_temp(self.func.body.var(addr).ty);
                    self.emit(
                        Op::BinConst {
                            op: BinOp::Add,
                            dst: shifted,
                            lhs: addr,
                            imm: Constant::U64(*offset as u64),
                        },
                        line,
                    );
                    shifted
                }
            }
            ExprKind::Index { base, index } => {
                self.lower_element_addr(base, index, expr.ty, line)
            }
            _ => panic!("invariant violated: taking the address of a non-place expression"),
        }
    }

    /// Store `value` into the place `place` denotes.
    fn lower_store(&mut self, place: &'ast Expr, value: VarId, line: u32) {
        match &place.kind {
            ExprKind::Var(sym) => self.write_sym(*sym, value, line),
            ExprKind::Deref(inner) => {
                let addr = self.lower_expr(inner);
                self.emit(Op::Store { addr, src: value }, line);
            }
            ExprKind::Index { base, index } => {
                let addr = self.lower_element_addr(base, index, place.ty, line);
                self.emit(Op::Store { addr, src: value }, line);
            }
            ExprKind::Member { base, offset, .. } => {
                let addr = self.lower_address(base);
                if *offset == 0 {
                    self.emit(Op::Store { addr, src: value }, line);
                } else {
                    self.emit(
                        Op::StoreConstOffset {
                            base: addr,
                            offset: *offset as i32,
                            src: value,
                        },
                        line,
                    );
                }
            }
            _ => panic!("invariant violated: assignment to a non-place expression"),
        }
    }
}

/// Blocks reachable from `entry`, in reverse postorder.
pub fn reverse_postorder(body: &Body, entry: BlockId) -> Vec<BlockId> {
    let mut postorder = Vec::new();
    let mut state = vec![0u8; body.blocks.len()]; // 0 unseen, 1 open, 2 done
    let mut stack = vec![entry];
    while let Some(&top) = stack.last() {
        match state[top.index()] {
            0 => {
                state[top.index()] = 1;
                for &succ in body.block(top).succs.iter() {
                    if state[succ.index()] == 0 {
                        stack.push(succ);
                    }
                }
            }
            1 => {
                state[top.index()] = 2;
                postorder.push(top);
                stack.pop();
            }
            _ => {
                stack.pop();
            }
        }
    }
    postorder.reverse();
    postorder
}

/// Immediate dominators (iterative Cooper-Harvey-Kennedy) and Cytron
/// dominance frontiers.
pub fn compute_dominance(body: &mut Body, entry: BlockId) {
    let rpo = reverse_postorder(body, entry);
    let mut number: Map<BlockId, usize> = Map::new();
    for (i, &b) in rpo.iter().enumerate() {
        number.insert(b, i);
    }

    let mut idom: Vec<Option<BlockId>> = vec![None; body.blocks.len()];
    idom[entry.index()] = Some(entry);

    let intersect = |idom: &[Option<BlockId>], number: &Map<BlockId, usize>, a: BlockId, b: BlockId| {
        let (mut a, mut b) = (a, b);
        while a != b {
            while number[&a] > number[&b] {
                a = idom[a.index()].expect("invariant violated: missing idom during intersect");
            }
            while number[&b] > number[&a] {
                b = idom[b.index()].expect("invariant violated: missing idom during intersect");
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo.iter().skip(1) {
            let mut new_idom: Option<BlockId> = None;
            for &p in body.block(b).preds.iter() {
                if !number.contains_key(&p) || idom[p.index()].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(cur) => intersect(&idom, &number, p, cur),
                });
            }
            if let Some(new_idom) = new_idom {
                if idom[b.index()] != Some(new_idom) {
                    idom[b.index()] = Some(new_idom);
                    changed = true;
                }
            }
        }
    }

    for block in &mut body.blocks {
        block.idom = None;
        block.frontier.clear();
    }
    for &b in rpo.iter().skip(1) {
        body.block_mut(b).idom = idom[b.index()];
    }

    // dominance frontiers: join points walk up to their idom
    for &b in &rpo {
        if body.block(b).preds.len() < 2 {
            continue;
        }
        let b_idom = idom[b.index()];
        let preds: Vec<BlockId> = body.block(b).preds.iter().copied().collect();
        for p in preds {
            if !number.contains_key(&p) {
                continue;
            }
            let mut runner = p;
            while Some(runner) != b_idom {
                body.block_mut(runner).frontier.insert(b);
                match idom[runner.index()] {
                    Some(next) if next != runner => runner = next,
                    _ => break,
                }
            }
        }
    }
}

/// Place phi functions at the iterated dominance frontier of each renameable
/// symbol's definition blocks.
fn insert_phi_functions(
    body: &mut Body,
    variables: &VariableTable,
    base: &Map<VarSymId, VarId>,
    defs: &Map<VarSymId, VecSet<BlockId>>,
) {
    for (&sym, def_blocks) in defs {
        let record = variables.record(sym);
        // memory-resident symbols never rename
        if record.address_taken || record.membership == Membership::Global {
            continue;
        }
        let Some(&base_var) = base.get(&sym) else {
            continue;
        };
        let mut placed: Set<BlockId> = Set::new();
        let mut worklist: Vec<BlockId> = def_blocks.iter().copied().collect();
        while let Some(block) = worklist.pop() {
            let frontier: Vec<BlockId> =
                body.block(block).frontier.iter().copied().collect();
            for join in frontier {
                if !placed.insert(join) {
                    continue;
                }
                let args: Vec<(BlockId, VarId)> = body
                    .block(join)
                    .preds
                    .iter()
                    .map(|&p| (p, base_var))
                    .collect();
                let phi = Op::Phi {
                    dst: base_var,
                    args,
                };
                match body.block(join).leader {
                    Some(leader) => {
                        body.insert_instruction_before(leader, phi, 0);
                    }
                    None => {
                        body.add_statement(join, phi, 0);
                    }
                }
                if !def_blocks.contains(join) {
                    worklist.push(join);
                }
            }
        }
    }
}

/// Cytron renaming over the dominator tree, using the per-symbol renaming
/// stacks in the variable table.
fn rename_into_ssa(
    body: &mut Body,
    variables: &mut VariableTable,
    base: &Map<VarSymId, VarId>,
    entry: BlockId,
    params: &[VarSymId],
) {
    // dominator-tree children
    let mut children: Vec<Vec<BlockId>> = vec![Vec::new(); body.blocks.len()];
    for block in &body.blocks {
        if block.id != entry {
            if let Some(idom) = block.idom {
                children[idom.index()].push(block.id);
            }
        }
    }

    // reset stacks and generations; parameters enter as version 0
    for (&sym, _) in base {
        let record = variables.record_mut(sym);
        record.rename_stack.clear();
        record.ssa_generation = 1;
    }
    for &sym in params {
        if let Some(&var) = base.get(&sym) {
            variables.record_mut(sym).rename_stack.push(var);
        }
    }

    let renameable = |variables: &VariableTable, body: &Body, var: VarId| -> Option<VarSymId> {
        let sym = body.var(var).sym?;
        let record = variables.record(sym);
        if record.address_taken || record.membership == Membership::Global {
            None
        } else {
            Some(sym)
        }
    };

    // explicit stack walk of the dominator tree
    enum Step {
        Enter(BlockId),
        Leave(BlockId, Vec<VarSymId>),
    }
    let mut walk = vec![Step::Enter(entry)];
    while let Some(step) = walk.pop() {
        match step {
            Step::Leave(_, pushed) => {
                for sym in pushed {
                    variables.record_mut(sym).rename_stack.pop();
                }
            }
            Step::Enter(block) => {
                let mut pushed: Vec<VarSymId> = Vec::new();
                let insts: Vec<InstId> = body.block_insts(block).collect();
                for inst in insts {
                    let mut op = body.inst(inst).op.clone();
                    let is_phi = matches!(op, Op::Phi { .. });
                    if !is_phi {
                        op.map_uses(|used| match renameable(variables, body, used) {
                            Some(sym) => *variables
                                .record(sym)
                                .rename_stack
                                .last()
                                .unwrap_or(&used),
                            None => used,
                        });
                    }
                    if let Some(dst) = op.defined_var() {
                        if let Some(sym) = renameable(variables, body, dst) {
                            let generation = {
                                let record = variables.record_mut(sym);
                                let g = record.ssa_generation;
                                record.ssa_generation += 1;
                                g
                            };
                            let name = variables.record(sym).name.to_string();
                            let ty = body.var(dst).ty;
                            let version = body.new_version(sym, &name, generation, ty);
                            op.set_def(version);
                            variables.record_mut(sym).rename_stack.push(version);
                            pushed.push(sym);
                        }
                    }
                    body.inst_mut(inst).op = op;
                }

                // fill phi operands in CFG successors for the edge from here
                let succs: Vec<BlockId> = body.block(block).succs.iter().copied().collect();
                for succ in succs {
                    let phis: Vec<InstId> = body
                        .block_insts(succ)
                        .take_while(|&i| matches!(body.inst(i).op, Op::Phi { .. }))
                        .collect();
                    for phi in phis {
                        let sym = body
                            .inst(phi)
                            .op
                            .defined_var()
                            .and_then(|d| body.var(d).sym);
                        let Some(sym) = sym else { continue };
                        let top = variables.record(sym).rename_stack.last().copied();
                        let replacement = match top {
                            Some(v) => v,
                            None => base[&sym],
                        };
                        if let Op::Phi { args, .. } = &mut body.inst_mut(phi).op {
                            for (pred, arg) in args.iter_mut() {
                                if *pred == block {
                                    *arg = replacement;
                                }
                            }
                        }
                    }
                }

                walk.push(Step::Leave(block, pushed));
                let mut kids = children[block.index()].clone();
                kids.reverse();
                for kid in kids {
                    walk.push(Step::Enter(kid));
                }
            }
        }
    }
}

/// Leave SSA form: replace every phi with copies in the predecessor blocks.
///
/// Copies go through fresh temporaries (`tmp <- arg` at the predecessor's
/// tail, `dst <- tmp` replacing the phi), so simultaneous phis at a join
/// never clobber each other's operands.  The register allocator later
/// coalesces the copies away.
pub fn eliminate_phis(ctx: &mut Ctx, func: &mut Function) {
    let blocks: Vec<BlockId> = func.body.blocks.iter().map(|b| b.id).collect();
    for block in blocks {
        let phis: Vec<InstId> = func
            .body
            .block_insts(block)
            .take_while(|&i| matches!(func.body.inst(i).op, Op::Phi { .. }))
            .collect();
        for phi in phis {
            let Op::Phi { dst, args } = func.body.inst(phi).op.clone() else {
                unreachable!()
            };
            let line = func.body.inst(phi).line;
            let ty = func.body.var(dst).ty;
            let tmp = func.body.new_temp(ctx, ty);
            for (pred, arg) in args {
                let copy = Op::Assign { dst: tmp, src: arg };
                match func.body.block(pred).exit {
                    Some(exit) if func.body.inst(exit).op.is_block_ender() => {
                        func.body.insert_instruction_before(exit, copy, line);
                    }
                    _ => {
                        func.body.add_statement(pred, copy, line);
                    }
                }
            }
            func.body.rewrite_statement(phi, Op::Assign { dst, src: tmp });
        }
    }
    func.body.recount_uses();
}

impl Function {
    /// Render the function's OIR, blocks in id order.
    pub fn print_oir(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("fn {} {{\n", self.name));
        for block in &self.body.blocks {
            if block.is_exit && block.leader.is_none() {
                continue;
            }
            out.push_str(&format!(".B{}:\n", block.id.0));
            for inst in self.body.block_insts(block.id) {
                out.push_str(&format!("    {}\n", self.body.display_inst(inst)));
            }
        }
        out.push_str("}\n");
        out
    }

    /// Check the instruction-list invariants: leaders have no predecessor
    /// link, exits no successor link, and every live statement sits in
    /// exactly one block's list.
    pub fn verify_lists(&self) {
        let mut seen = vec![0u32; self.body.insts.len()];
        for block in &self.body.blocks {
            if let Some(leader) = block.leader {
                assert!(self.body.inst(leader).prev.is_none(), "leader has a prev link");
            }
            if let Some(exit) = block.exit {
                assert!(self.body.inst(exit).next.is_none(), "exit has a next link");
            }
            for inst in self.body.block_insts(block.id) {
                assert_eq!(self.body.inst(inst).block, block.id);
                seen[inst.index()] += 1;
            }
        }
        for (idx, inst) in self.body.insts.iter().enumerate() {
            let expected = if inst.deleted { 0 } else { 1 };
            assert_eq!(
                seen[idx], expected,
                "statement {idx} appears {} times",
                seen[idx]
            );
        }
    }

    /// Check the SSA single-definition property over reachable blocks.
    pub fn verify_ssa(&self) {
        let mut defs = vec![0u32; self.body.vars.len()];
        for &block in &reverse_postorder(&self.body, self.entry) {
            for inst in self.body.block_insts(block) {
                if let Some(dst) = self.body.inst(inst).op.defined_var() {
                    defs[dst.index()] += 1;
                }
            }
        }
        for (idx, &count) in defs.iter().enumerate() {
            assert!(
                count <= 1,
                "variable {} has {count} definitions",
                self.body.vars[idx].name
            );
        }
    }
}

impl Module {
    pub fn print_oir(&self) -> String {
        let mut out = String::new();
        for func in &self.funcs {
            out.push_str(&func.print_oir());
        }
        for global in &self.globals {
            match global.init {
                Some(init) => out.push_str(&format!("global {} = {init}\n", global.name)),
                None => out.push_str(&format!("global {}\n", global.name)),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse::parse;

    fn lower(source: &str) -> (Unit, Module) {
        let mut unit = parse(source);
        assert!(!unit.root.is_err(), "parse failed: {:?}", unit.root);
        let module = build_cfg(&mut unit);
        (unit, module)
    }

    #[test]
    fn diamond_gets_a_phi_at_the_join() {
        let (_unit, module) = lower(
            "fn max(a: i32, b: i32) -> i32 {\n\
               let mut m: i32 = a;\n\
               if (b > a) { m = b; }\n\
               return m;\n\
             }\n",
        );
        let f = &module.funcs[0];
        f.verify_lists();
        f.verify_ssa();
        let phis = f
            .body
            .insts
            .iter()
            .filter(|i| !i.deleted && matches!(i.op, Op::Phi { .. }))
            .count();
        assert_eq!(phis, 1, "{}", f.print_oir());
    }

    #[test]
    fn dominance_of_a_diamond() {
        let (_unit, module) = lower(
            "fn f(a: i32) -> i32 {\n\
               let mut x: i32 = 0;\n\
               if (a > 0) { x = 1; } else { x = 2; }\n\
               return x;\n\
             }\n",
        );
        let f = &module.funcs[0];
        // entry dominates both arms and the join
        let entry = f.entry;
        for block in &f.body.blocks {
            if block.id == entry || block.leader.is_none() {
                continue;
            }
            let mut runner = block.idom;
            let mut hops = 0;
            while let Some(b) = runner {
                if b == entry {
                    break;
                }
                runner = f.body.block(b).idom;
                hops += 1;
                assert!(hops < 64, "idom chain does not reach the entry");
            }
        }
    }

    #[test]
    fn while_loop_phi_and_backedge() {
        let (_unit, module) = lower(
            "fn sum(n: i32) -> i32 {\n\
               let mut s: i32 = 0;\n\
               let mut i: i32 = 0;\n\
               while (i < n) { s = s + i; i = i + 1; }\n\
               return s;\n\
             }\n",
        );
        let f = &module.funcs[0];
        f.verify_lists();
        f.verify_ssa();
        let phis = f
            .body
            .insts
            .iter()
            .filter(|i| !i.deleted && matches!(i.op, Op::Phi { .. }))
            .count();
        // one phi per variable (s, i) at the loop head
        assert_eq!(phis, 2, "{}", f.print_oir());
        // some block has a back edge to an earlier block
        let has_backedge = f
            .body
            .blocks
            .iter()
            .any(|b| b.succs.iter().any(|s| s.0 <= b.id.0));
        assert!(has_backedge);
    }

    #[test]
    fn switch_builds_a_dense_jump_table() {
        let (_unit, module) = lower(
            "fn pick(x: i32) -> i32 {\n\
               switch (x) {\n\
                 case 1: return 10;\n\
                 case 4: return 40;\n\
                 default: return 0;\n\
               }\n\
             }\n",
        );
        let f = &module.funcs[0];
        assert_eq!(f.jump_tables.len(), 1);
        let table = &f.jump_tables[0];
        assert_eq!(table.base, 1);
        assert_eq!(table.targets.len(), 4); // 1..=4, holes -> default
        assert_eq!(table.targets[1], table.default);
        assert_eq!(table.targets[2], table.default);
        // the dispatch block carries the table and ends in an indirect jump
        let dispatch = f
            .body
            .blocks
            .iter()
            .find(|b| b.jump_table == Some(0))
            .expect("a dispatch block");
        let exit = dispatch.exit.expect("dispatch has statements");
        assert!(matches!(f.body.inst(exit).op, Op::IndirectJump { .. }));
    }

    #[test]
    fn exit_statements_end_blocks() {
        let (_unit, module) = lower(
            "fn f(a: i32) -> i32 {\n\
               if (a > 0) { return 1; }\n\
               return 0;\n\
             }\n",
        );
        let f = &module.funcs[0];
        for &block in &reverse_postorder(&f.body, f.entry) {
            let Some(exit) = f.body.block(block).exit else {
                continue;
            };
            assert!(
                f.body.inst(exit).op.is_block_ender(),
                "block .B{} ends in {}",
                block.0,
                f.body.display_inst(exit)
            );
        }
    }

    #[test]
    fn globals_are_collected() {
        let (_unit, module) = lower(
            "global counter: i64 = 5;\n\
             fn main() -> i32 { return 0; }\n",
        );
        assert_eq!(module.globals.len(), 1);
        assert_eq!(module.globals[0].init, Some(5));
    }
}
