//! OIR, the three-address intermediate representation.
//!
//! Statements are one tagged union ([Op]); the peephole simplifier and the
//! instruction selector rely on exhaustive matches over it.  Instructions,
//! SSA variables and basic blocks live in per-function arenas ([Body]) and
//! refer to each other by index, so the doubly-linked instruction list and
//! the block graph carry no pointers.

use derive_more::Display;

use crate::back::asm::Mach;
use crate::common::*;
use crate::containers::VecSet;
use crate::front::ast::BinOp;
use crate::front::symtab::VarSymId;

/// A typed constant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Constant {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Char(u8),
    Float(f64),
    /// A long literal forced unsigned by suffix.
    ULong(u64),
    /// A hex literal; prints back in hex.
    Hex(u64),
    Str(Id),
}

impl Constant {
    pub fn value_i64(self) -> i64 {
        use Constant::*;
        match self {
            I8(v) => v as i64,
            I16(v) => v as i64,
            I32(v) => v as i64,
            I64(v) => v,
            U8(v) => v as i64,
            U16(v) => v as i64,
            U32(v) => v as i64,
            U64(v) => v as i64,
            Char(v) => v as i64,
            Float(v) => v as i64,
            ULong(v) => v as i64,
            Hex(v) => v as i64,
            Str(_) => panic!("invariant violated: string constant used as a number"),
        }
    }

    pub fn is_zero(self) -> bool {
        !matches!(self, Constant::Str(_)) && self.value_i64() == 0
    }

    pub fn is_one(self) -> bool {
        !matches!(self, Constant::Str(_)) && self.value_i64() == 1
    }

    pub fn is_power_of_two(self) -> bool {
        if matches!(self, Constant::Str(_)) {
            return false;
        }
        let v = self.value_i64();
        v > 0 && (v & (v - 1)) == 0
    }

    pub fn log2(self) -> u32 {
        debug_assert!(self.is_power_of_two());
        (self.value_i64() as u64).trailing_zeros()
    }

    /// Re-wrap an i64 result into this constant's own variant, truncating.
    fn rewrap(self, value: i64) -> Constant {
        use Constant::*;
        match self {
            I8(_) => I8(value as i8),
            I16(_) => I16(value as i16),
            I32(_) => I32(value as i32),
            I64(_) => I64(value),
            U8(_) => U8(value as u8),
            U16(_) => U16(value as u16),
            U32(_) => U32(value as u32),
            U64(_) => U64(value as u64),
            Char(_) => Char(value as u8),
            Float(_) => Float(value as f64),
            ULong(_) => ULong(value as u64),
            Hex(_) => Hex(value as u64),
            Str(_) => panic!("invariant violated: string constant in arithmetic"),
        }
    }

    pub fn add_constants(self, incoming: Constant) -> Constant {
        if let (Constant::Float(a), Constant::Float(b)) = (self, incoming) {
            return Constant::Float(a + b);
        }
        self.rewrap(self.value_i64().wrapping_add(incoming.value_i64()))
    }

    /// `existing − incoming`, in that order.
    pub fn subtract_constants(self, incoming: Constant) -> Constant {
        if let (Constant::Float(a), Constant::Float(b)) = (self, incoming) {
            return Constant::Float(a - b);
        }
        self.rewrap(self.value_i64().wrapping_sub(incoming.value_i64()))
    }

    pub fn multiply_constants(self, incoming: Constant) -> Constant {
        if let (Constant::Float(a), Constant::Float(b)) = (self, incoming) {
            return Constant::Float(a * b);
        }
        self.rewrap(self.value_i64().wrapping_mul(incoming.value_i64()))
    }

    /// Boolean AND: 1 when both are non-zero.
    pub fn logical_and_constants(self, incoming: Constant) -> Constant {
        self.rewrap((!self.is_zero() && !incoming.is_zero()) as i64)
    }

    /// Boolean OR: 1 when either is non-zero.
    pub fn logical_or_constants(self, incoming: Constant) -> Constant {
        self.rewrap((!self.is_zero() || !incoming.is_zero()) as i64)
    }
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Constant::*;
        match self {
            Hex(v) => write!(f, "0x{v:x}"),
            Char(v) => write!(f, "'{}'", *v as char),
            Float(v) => write!(f, "{v}"),
            Str(s) => write!(f, "{s:?}"),
            U64(v) | ULong(v) => write!(f, "{v}"),
            U8(v) => write!(f, "{v}"),
            U16(v) => write!(f, "{v}"),
            U32(v) => write!(f, "{v}"),
            I8(v) => write!(f, "{v}"),
            I16(v) => write!(f, "{v}"),
            I32(v) => write!(f, "{v}"),
            I64(v) => write!(f, "{v}"),
        }
    }
}

/// Branch kinds, one byte each in the original encoding.  These are exactly
/// the x86 condition-code suffixes the selector prints.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum Cc {
    #[display("a")]
    A,
    #[display("ae")]
    Ae,
    #[display("b")]
    B,
    #[display("be")]
    Be,
    #[display("e")]
    E,
    #[display("ne")]
    Ne,
    #[display("z")]
    Z,
    #[display("nz")]
    Nz,
    #[display("g")]
    G,
    #[display("ge")]
    Ge,
    #[display("l")]
    L,
    #[display("le")]
    Le,
}

impl Cc {
    /// The condition for `lhs op rhs`, given operand signedness.
    pub fn for_comparison(op: BinOp, signed: bool) -> Cc {
        use BinOp::*;
        match (op, signed) {
            (Eq, _) => Cc::E,
            (Ne, _) => Cc::Ne,
            (Lt, true) => Cc::L,
            (Le, true) => Cc::Le,
            (Gt, true) => Cc::G,
            (Ge, true) => Cc::Ge,
            (Lt, false) => Cc::B,
            (Le, false) => Cc::Be,
            (Gt, false) => Cc::A,
            (Ge, false) => Cc::Ae,
            _ => panic!("invariant violated: {op} is not a comparison"),
        }
    }

    pub fn inverse(self) -> Cc {
        use Cc::*;
        match self {
            A => Be,
            Ae => B,
            B => Ae,
            Be => A,
            E => Ne,
            Ne => E,
            Z => Nz,
            Nz => Z,
            G => Le,
            Ge => L,
            L => Ge,
            Le => G,
        }
    }
}

/// x86-64 effective-address forms an address calculation can take.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum AddrMode {
    #[display("offset")]
    OffsetOnly,
    #[display("regs")]
    RegistersOnly,
    #[display("regs+offset")]
    RegistersAndOffset,
    #[display("regs+offset+scale")]
    RegistersOffsetScale,
    #[display("global")]
    GlobalVar,
    #[display("deref-src")]
    DerefSource,
    #[display("deref-dst")]
    DerefDest,
}

/// What a memory-address statement takes the address of.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MemTarget {
    /// A region in the function-local stack data area.
    Local(RegionId),
    /// A region in the parameter-passing stack data area.
    Param(RegionId),
    Global(Id),
}

/// OIR statement kinds, exhaustive.  Operands are SSA variables ([VarId]),
/// constants, or block references for the control statements.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Assign {
        dst: VarId,
        src: VarId,
    },
    AssignConst {
        dst: VarId,
        src: Constant,
    },
    Bin {
        op: BinOp,
        dst: VarId,
        lhs: VarId,
        rhs: VarId,
    },
    BinConst {
        op: BinOp,
        dst: VarId,
        lhs: VarId,
        imm: Constant,
    },
    /// Width- or signedness-changing move.
    Cast {
        dst: VarId,
        src: VarId,
    },
    Negate {
        dst: VarId,
        src: VarId,
    },
    BitNot {
        dst: VarId,
        src: VarId,
    },
    LogicalNot {
        dst: VarId,
        src: VarId,
    },
    /// Address calculation: `dst = base + index*scale + offset`.
    Lea {
        dst: VarId,
        base: VarId,
        index: Option<VarId>,
        scale: u8,
        offset: i32,
    },
    Inc {
        dst: VarId,
    },
    Dec {
        dst: VarId,
    },
    Test {
        lhs: VarId,
        rhs: VarId,
    },
    Cmp {
        lhs: VarId,
        rhs: VarId,
    },
    CmpConst {
        lhs: VarId,
        imm: Constant,
    },
    Load {
        dst: VarId,
        addr: VarId,
    },
    LoadConstOffset {
        dst: VarId,
        base: VarId,
        offset: i32,
    },
    LoadVarOffset {
        dst: VarId,
        base: VarId,
        index: VarId,
        scale: u8,
    },
    Store {
        addr: VarId,
        src: VarId,
    },
    StoreConstOffset {
        base: VarId,
        offset: i32,
        src: VarId,
    },
    StoreVarOffset {
        base: VarId,
        index: VarId,
        scale: u8,
        src: VarId,
    },
    /// Materialize the address of a stack region or a global:
    /// `dst = &target + offset`.
    MemoryAddress {
        dst: VarId,
        target: MemTarget,
        offset: i32,
    },
    Jump {
        target: BlockId,
    },
    Branch {
        cc: Cc,
        tt: BlockId,
        ff: BlockId,
    },
    /// Jump through a jump table: target address already computed into `addr`.
    IndirectJump {
        table: u32,
        addr: VarId,
    },
    /// Compute a jump-table target: `dst = table_base + index*scale`.
    IndirectJumpCalc {
        dst: VarId,
        table: u32,
        index: VarId,
        scale: u8,
    },
    Phi {
        dst: VarId,
        /// One operand per predecessor edge.
        args: Vec<(BlockId, VarId)>,
    },
    Call {
        dst: Option<VarId>,
        func: FuncId,
        args: Vec<VarId>,
    },
    IndirectCall {
        dst: Option<VarId>,
        target: VarId,
        args: Vec<VarId>,
    },
    /// Materialize the last comparison's condition as 0/1.
    Set {
        cc: Cc,
        dst: VarId,
    },
    Return {
        value: Option<VarId>,
    },
    Nop,
    InlineAsm {
        text: Id,
    },
}

impl Op {
    /// The variable this statement defines, if any.
    pub fn defined_var(&self) -> Option<VarId> {
        use Op::*;
        match self {
            Assign { dst, .. }
            | AssignConst { dst, .. }
            | Bin { dst, .. }
            | BinConst { dst, .. }
            | Cast { dst, .. }
            | Negate { dst, .. }
            | BitNot { dst, .. }
            | LogicalNot { dst, .. }
            | Lea { dst, .. }
            | Inc { dst }
            | Dec { dst }
            | Load { dst, .. }
            | LoadConstOffset { dst, .. }
            | LoadVarOffset { dst, .. }
            | MemoryAddress { dst, .. }
            | IndirectJumpCalc { dst, .. }
            | Phi { dst, .. }
            | Set { dst, .. } => Some(*dst),
            Call { dst, .. } | IndirectCall { dst, .. } => *dst,
            _ => None,
        }
    }

    /// Every variable this statement reads.
    pub fn used_vars(&self) -> Vec<VarId> {
        use Op::*;
        match self {
            Assign { src, .. }
            | Cast { src, .. }
            | Negate { src, .. }
            | BitNot { src, .. }
            | LogicalNot { src, .. } => vec![*src],
            AssignConst { .. } | MemoryAddress { .. } | Jump { .. } | Branch { .. } | Nop
            | InlineAsm { .. } => vec![],
            Bin { lhs, rhs, .. } => vec![*lhs, *rhs],
            BinConst { lhs, .. } => vec![*lhs],
            // inc/dec read and write their operand
            Inc { dst } | Dec { dst } => vec![*dst],
            Test { lhs, rhs } | Cmp { lhs, rhs } => vec![*lhs, *rhs],
            CmpConst { lhs, .. } => vec![*lhs],
            Lea { base, index, .. } => {
                let mut used = vec![*base];
                used.extend(index.iter().copied());
                used
            }
            Load { addr, .. } => vec![*addr],
            LoadConstOffset { base, .. } => vec![*base],
            LoadVarOffset { base, index, .. } => vec![*base, *index],
            Store { addr, src } => vec![*addr, *src],
            StoreConstOffset { base, src, .. } => vec![*base, *src],
            StoreVarOffset {
                base, index, src, ..
            } => vec![*base, *index, *src],
            IndirectJump { addr, .. } => vec![*addr],
            IndirectJumpCalc { index, .. } => vec![*index],
            Phi { args, .. } => args.iter().map(|(_, v)| *v).collect(),
            Call { args, .. } => args.clone(),
            IndirectCall { target, args, .. } => {
                let mut used = vec![*target];
                used.extend(args.iter().copied());
                used
            }
            Set { .. } => vec![],
            Return { value } => value.iter().copied().collect(),
        }
    }

    /// Statements that legally end a basic block.
    pub fn is_block_ender(&self) -> bool {
        matches!(
            self,
            Op::Jump { .. } | Op::Branch { .. } | Op::IndirectJump { .. } | Op::Return { .. }
        )
    }

    /// Effects observable outside the function: never deleted by DCE.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Op::Store { .. }
                | Op::StoreConstOffset { .. }
                | Op::StoreVarOffset { .. }
                | Op::Call { .. }
                | Op::IndirectCall { .. }
                | Op::Return { .. }
                | Op::InlineAsm { .. }
                | Op::Jump { .. }
                | Op::Branch { .. }
                | Op::IndirectJump { .. }
        )
    }

    /// Rewrite every used variable through `f`.  Definitions are untouched.
    pub fn map_uses(&mut self, mut f: impl FnMut(VarId) -> VarId) {
        use Op::*;
        match self {
            Assign { src, .. }
            | Cast { src, .. }
            | Negate { src, .. }
            | BitNot { src, .. }
            | LogicalNot { src, .. } => *src = f(*src),
            AssignConst { .. } | MemoryAddress { .. } | Jump { .. } | Branch { .. } | Nop
            | InlineAsm { .. } | Set { .. } => {}
            Bin { lhs, rhs, .. } => {
                *lhs = f(*lhs);
                *rhs = f(*rhs);
            }
            BinConst { lhs, .. } => *lhs = f(*lhs),
            Inc { .. } | Dec { .. } => {}
            Test { lhs, rhs } | Cmp { lhs, rhs } => {
                *lhs = f(*lhs);
                *rhs = f(*rhs);
            }
            CmpConst { lhs, .. } => *lhs = f(*lhs),
            Lea { base, index, .. } => {
                *base = f(*base);
                if let Some(index) = index {
                    *index = f(*index);
                }
            }
            Load { addr, .. } => *addr = f(*addr),
            LoadConstOffset { base, .. } => *base = f(*base),
            LoadVarOffset { base, index, .. } => {
                *base = f(*base);
                *index = f(*index);
            }
            Store { addr, src } => {
                *addr = f(*addr);
                *src = f(*src);
            }
            StoreConstOffset { base, src, .. } => {
                *base = f(*base);
                *src = f(*src);
            }
            StoreVarOffset {
                base, index, src, ..
            } => {
                *base = f(*base);
                *index = f(*index);
                *src = f(*src);
            }
            IndirectJump { addr, .. } => *addr = f(*addr),
            IndirectJumpCalc { index, .. } => *index = f(*index),
            // Phi operands are renamed per predecessor edge, never here.
            Phi { .. } => {}
            Call { args, .. } => {
                for arg in args {
                    *arg = f(*arg);
                }
            }
            IndirectCall { target, args, .. } => {
                *target = f(*target);
                for arg in args {
                    *arg = f(*arg);
                }
            }
            Return { value } => {
                if let Some(value) = value {
                    *value = f(*value);
                }
            }
        }
    }

    /// Replace the defined variable.
    pub fn set_def(&mut self, new: VarId) {
        use Op::*;
        match self {
            Assign { dst, .. }
            | AssignConst { dst, .. }
            | Bin { dst, .. }
            | BinConst { dst, .. }
            | Cast { dst, .. }
            | Negate { dst, .. }
            | BitNot { dst, .. }
            | LogicalNot { dst, .. }
            | Lea { dst, .. }
            | Inc { dst }
            | Dec { dst }
            | Load { dst, .. }
            | LoadConstOffset { dst, .. }
            | LoadVarOffset { dst, .. }
            | MemoryAddress { dst, .. }
            | IndirectJumpCalc { dst, .. }
            | Phi { dst, .. }
            | Set { dst, .. } => *dst = new,
            Call { dst, .. } | IndirectCall { dst, .. } => *dst = Some(new),
            _ => panic!("invariant violated: statement defines no variable"),
        }
    }

    /// The effective-address form of this statement's memory access, if any.
    pub fn addr_mode(&self) -> Option<AddrMode> {
        use Op::*;
        match self {
            MemoryAddress {
                target: MemTarget::Global(_),
                ..
            } => Some(AddrMode::GlobalVar),
            MemoryAddress { .. } => Some(AddrMode::OffsetOnly),
            Lea {
                index: Some(_),
                offset: 0,
                ..
            } => Some(AddrMode::RegistersOnly),
            Lea { index: Some(_), .. } => Some(AddrMode::RegistersOffsetScale),
            Lea { .. } => Some(AddrMode::RegistersAndOffset),
            Load { .. } | Store { .. } => Some(AddrMode::DerefSource),
            LoadConstOffset { .. } | StoreConstOffset { .. } => Some(AddrMode::RegistersAndOffset),
            LoadVarOffset { .. } | StoreVarOffset { .. } => Some(AddrMode::RegistersOffsetScale),
            _ => None,
        }
    }
}

/// One OIR statement in the arena: payload plus list links and the machine
/// annotation the selector fills in.
#[derive(Debug)]
pub struct Inst {
    pub op: Op,
    pub block: BlockId,
    pub prev: Option<InstId>,
    pub next: Option<InstId>,
    pub line: u32,
    /// Set on the pieces of multi-instruction expansions (DIV, MUL) so the
    /// peephole window never fuses across them.
    pub no_combine: bool,
    /// Machine annotation, present after instruction selection.
    pub mach: Option<Mach>,
    /// Deleted statements stay in the arena but are unlinked and inert.
    pub deleted: bool,
}

/// An SSA variable.
#[derive(Debug)]
pub struct Var {
    /// The source symbol this is a version of; `None` for temporaries.
    pub sym: Option<VarSymId>,
    /// Printable name: `x.2` for version 2 of `x`, `t7` for a temporary.
    pub name: String,
    pub generation: u32,
    pub ty: TypeId,
    pub is_temp: bool,
    pub use_count: u32,
    /// Accumulated execution-frequency weight of this variable's uses, from
    /// the nesting stack at lowering time.  Feeds spill costs.
    pub weight: u32,
    pub def_inst: Option<InstId>,
    pub live_range: Option<LiveRangeId>,
    pub region: Option<RegionId>,
    /// Parameter slot (0-based) when this variable enters in a register or
    /// on the parameter-passing stack.
    pub param_index: Option<u32>,
}

/// A basic block.
#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    pub leader: Option<InstId>,
    pub exit: Option<InstId>,
    pub preds: VecSet<BlockId>,
    pub succs: VecSet<BlockId>,
    /// Dominance frontier, filled by the CFG builder.
    pub frontier: VecSet<BlockId>,
    pub idom: Option<BlockId>,
    /// Index into the function's jump tables when this block heads a switch.
    pub jump_table: Option<u32>,
    pub func: FuncId,
    /// Set only by the linearizer: the block laid out immediately after.
    pub direct_successor: Option<BlockId>,
    /// Per-pass scratch flag; reset before each traversal.
    pub visited: bool,
    /// An empty function-exit block the linearizer must not chain.
    pub is_exit: bool,
}

impl Block {
    pub fn new(id: BlockId, func: FuncId) -> Self {
        Self {
            id,
            leader: None,
            exit: None,
            preds: VecSet::new(),
            succs: VecSet::new(),
            frontier: VecSet::new(),
            idom: None,
            jump_table: None,
            func,
            direct_successor: None,
            visited: false,
            is_exit: false,
        }
    }
}

/// A switch jump table: dense targets over `[base, base + targets.len())`,
/// holes filled with the default block.
#[derive(Debug)]
pub struct JumpTable {
    pub id: u32,
    pub base: i64,
    pub targets: Vec<BlockId>,
    pub default: BlockId,
}

/// The per-function IR container: instruction, variable and block arenas.
#[derive(Debug, Default)]
pub struct Body {
    pub insts: Vec<Inst>,
    pub vars: Vec<Var>,
    pub blocks: Vec<Block>,
}

impl Body {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.insts[id.index()]
    }

    pub fn var(&self, id: VarId) -> &Var {
        &self.vars[id.index()]
    }

    pub fn var_mut(&mut self, id: VarId) -> &mut Var {
        &mut self.vars[id.index()]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn new_block(&mut self, ctx: &mut Ctx, func: FuncId) -> BlockId {
        let _ = ctx.fresh_block();
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(id, func));
        id
    }

    /// Create a fresh temporary of the given type.
    pub fn new_temp(&mut self, ctx: &mut Ctx, ty: TypeId) -> VarId {
        let n = ctx.fresh_temp();
        let id = VarId(self.vars.len() as u32);
        self.vars.push(Var {
            sym: None,
            name: format!("t{n}"),
            generation: 0,
            ty,
            is_temp: true,
            use_count: 0,
            weight: 0,
            def_inst: None,
            live_range: None,
            region: None,
            param_index: None,
        });
        id
    }

    /// Create a named SSA variable (a version of a source symbol).
    pub fn new_version(&mut self, sym: VarSymId, name: &str, generation: u32, ty: TypeId) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(Var {
            sym: Some(sym),
            name: format!("{name}.{generation}"),
            generation,
            ty,
            is_temp: false,
            use_count: 0,
            weight: 0,
            def_inst: None,
            live_range: None,
            region: None,
            param_index: None,
        });
        id
    }

    fn adjust_uses(&mut self, op: &Op, delta: i32) {
        for used in op.used_vars() {
            let var = self.var_mut(used);
            if delta > 0 {
                var.use_count += delta as u32;
            } else {
                var.use_count = var.use_count.saturating_sub((-delta) as u32);
            }
        }
    }

    fn link_def(&mut self, inst: InstId) {
        if let Some(dst) = self.inst(inst).op.defined_var() {
            self.var_mut(dst).def_inst = Some(inst);
        }
    }

    /// Append a statement at the block's tail.
    pub fn add_statement(&mut self, block: BlockId, op: Op, line: u32) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.adjust_uses(&op, 1);
        let tail = self.block(block).exit;
        self.insts.push(Inst {
            op,
            block,
            prev: tail,
            next: None,
            line,
            no_combine: false,
            mach: None,
            deleted: false,
        });
        match tail {
            Some(tail) => self.inst_mut(tail).next = Some(id),
            None => self.block_mut(block).leader = Some(id),
        }
        self.block_mut(block).exit = Some(id);
        self.link_def(id);
        id
    }

    /// Insert a new statement immediately before `anchor`.
    pub fn insert_instruction_before(&mut self, anchor: InstId, op: Op, line: u32) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.adjust_uses(&op, 1);
        let block = self.inst(anchor).block;
        let prev = self.inst(anchor).prev;
        self.insts.push(Inst {
            op,
            block,
            prev,
            next: Some(anchor),
            line,
            no_combine: false,
            mach: None,
            deleted: false,
        });
        self.inst_mut(anchor).prev = Some(id);
        match prev {
            Some(prev) => self.inst_mut(prev).next = Some(id),
            None => self.block_mut(block).leader = Some(id),
        }
        self.link_def(id);
        id
    }

    /// Insert a new statement immediately after `anchor`.
    pub fn insert_instruction_after(&mut self, anchor: InstId, op: Op, line: u32) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.adjust_uses(&op, 1);
        let block = self.inst(anchor).block;
        let next = self.inst(anchor).next;
        self.insts.push(Inst {
            op,
            block,
            prev: Some(anchor),
            next,
            line,
            no_combine: false,
            mach: None,
            deleted: false,
        });
        self.inst_mut(anchor).next = Some(id);
        match next {
            Some(next) => self.inst_mut(next).prev = Some(id),
            None => self.block_mut(block).exit = Some(id),
        }
        self.link_def(id);
        id
    }

    /// Unlink a statement from its block.  The arena slot is retired, not
    /// reused.
    pub fn delete_statement(&mut self, inst: InstId) {
        let (block, prev, next) = {
            let i = self.inst(inst);
            if i.deleted {
                panic!("invariant violated: statement deleted twice");
            }
            (i.block, i.prev, i.next)
        };
        let op = self.inst(inst).op.clone();
        self.adjust_uses(&op, -1);
        if let Some(dst) = op.defined_var() {
            if self.var(dst).def_inst == Some(inst) {
                self.var_mut(dst).def_inst = None;
            }
        }
        match prev {
            Some(prev) => self.inst_mut(prev).next = next,
            None => self.block_mut(block).leader = next,
        }
        match next {
            Some(next) => self.inst_mut(next).prev = prev,
            None => self.block_mut(block).exit = prev,
        }
        let i = self.inst_mut(inst);
        i.prev = None;
        i.next = None;
        i.deleted = true;
    }

    /// Replace a statement's payload in place, keeping its list position.
    pub fn rewrite_statement(&mut self, inst: InstId, op: Op) {
        let old = self.inst(inst).op.clone();
        self.adjust_uses(&old, -1);
        if let Some(dst) = old.defined_var() {
            if self.var(dst).def_inst == Some(inst) {
                self.var_mut(dst).def_inst = None;
            }
        }
        self.adjust_uses(&op, 1);
        self.inst_mut(inst).op = op;
        self.link_def(inst);
    }

    /// Recompute every variable's use count and defining instruction from
    /// the live statements.  Run after bulk rewrites such as SSA renaming.
    pub fn recount_uses(&mut self) {
        for var in &mut self.vars {
            var.use_count = 0;
            var.def_inst = None;
        }
        for idx in 0..self.insts.len() {
            if self.insts[idx].deleted {
                continue;
            }
            let id = InstId(idx as u32);
            let op = self.insts[idx].op.clone();
            for used in op.used_vars() {
                self.var_mut(used).use_count += 1;
            }
            if let Some(dst) = op.defined_var() {
                self.var_mut(dst).def_inst = Some(id);
            }
        }
    }

    /// Iterate a block's statements front to back.
    pub fn block_insts(&self, block: BlockId) -> BlockInsts<'_> {
        BlockInsts {
            body: self,
            cursor: self.block(block).leader,
        }
    }

    // Convenience emitters.

    /// Emit a plain move `dst <- src`.
    pub fn emit_mov(&mut self, block: BlockId, dst: VarId, src: VarId, line: u32) -> InstId {
        self.add_statement(block, Op::Assign { dst, src }, line)
    }

    /// Emit `test lhs, rhs` (flags only).
    pub fn emit_test_statement(&mut self, block: BlockId, lhs: VarId, rhs: VarId, line: u32) -> InstId {
        self.add_statement(block, Op::Test { lhs, rhs }, line)
    }

    /// Emit `dst <- setCC` for the comparison token `op`.
    pub fn emit_set_instruction(
        &mut self,
        block: BlockId,
        op: BinOp,
        dst: VarId,
        is_signed: bool,
        line: u32,
    ) -> InstId {
        let cc = Cc::for_comparison(op, is_signed);
        self.add_statement(block, Op::Set { cc, dst }, line)
    }

    /// Emit an unconditional jump directly to `target`.
    pub fn emit_jump_instruction_directly(
        &mut self,
        block: BlockId,
        target: BlockId,
        line: u32,
    ) -> InstId {
        self.add_statement(block, Op::Jump { target }, line)
    }

    /// Printable name of a variable.
    pub fn var_name(&self, id: VarId) -> &str {
        &self.var(id).name
    }

    /// Render one statement in the three-address format.
    pub fn display_inst(&self, id: InstId) -> String {
        use Op::*;
        let v = |id: &VarId| self.var_name(*id).to_string();
        match &self.inst(id).op {
            Assign { dst, src } => format!("{} <- {}", v(dst), v(src)),
            AssignConst { dst, src } => format!("{} <- {src}", v(dst)),
            Bin { op, dst, lhs, rhs } => {
                format!("{} <- {} {op} {}", v(dst), v(lhs), v(rhs))
            }
            BinConst { op, dst, lhs, imm } => {
                format!("{} <- {} {op} {imm}", v(dst), v(lhs))
            }
            Cast { dst, src } => format!("{} <- cast {}", v(dst), v(src)),
            Negate { dst, src } => format!("{} <- neg {}", v(dst), v(src)),
            BitNot { dst, src } => format!("{} <- not {}", v(dst), v(src)),
            LogicalNot { dst, src } => format!("{} <- lognot {}", v(dst), v(src)),
            Lea {
                dst,
                base,
                index,
                scale,
                offset,
            } => match index {
                Some(index) => format!(
                    "{} <- lea {} + {}*{scale} + {offset}",
                    v(dst),
                    v(base),
                    v(index)
                ),
                None => format!("{} <- lea {} + {offset}", v(dst), v(base)),
            },
            Inc { dst } => format!("inc {}", v(dst)),
            Dec { dst } => format!("dec {}", v(dst)),
            Test { lhs, rhs } => format!("test {}, {}", v(lhs), v(rhs)),
            Cmp { lhs, rhs } => format!("cmp {}, {}", v(lhs), v(rhs)),
            CmpConst { lhs, imm } => format!("cmp {}, {imm}", v(lhs)),
            Load { dst, addr } => format!("{} <- [{}]", v(dst), v(addr)),
            LoadConstOffset { dst, base, offset } => {
                format!("{} <- [{} + {offset}]", v(dst), v(base))
            }
            LoadVarOffset {
                dst,
                base,
                index,
                scale,
            } => format!("{} <- [{} + {}*{scale}]", v(dst), v(base), v(index)),
            Store { addr, src } => format!("[{}] <- {}", v(addr), v(src)),
            StoreConstOffset { base, offset, src } => {
                format!("[{} + {offset}] <- {}", v(base), v(src))
            }
            StoreVarOffset {
                base,
                index,
                scale,
                src,
            } => format!("[{} + {}*{scale}] <- {}", v(base), v(index), v(src)),
            MemoryAddress {
                dst,
                target,
                offset,
            } => match target {
                MemTarget::Local(region) => {
                    format!("{} <- &S{} + {offset}", v(dst), region.0)
                }
                MemTarget::Param(region) => {
                    format!("{} <- &P{} + {offset}", v(dst), region.0)
                }
                MemTarget::Global(name) => format!("{} <- &{name} + {offset}", v(dst)),
            },
            Jump { target } => format!("jmp .B{}", target.0),
            Branch { cc, tt, ff } => format!("br{cc} .B{} .B{}", tt.0, ff.0),
            IndirectJump { table, addr } => format!("ijmp .JT{table}[{}]", v(addr)),
            IndirectJumpCalc {
                dst,
                table,
                index,
                scale,
            } => format!("{} <- .JT{table} + {}*{scale}", v(dst), v(index)),
            Phi { dst, args } => {
                let args: Vec<String> = args
                    .iter()
                    .map(|(block, var)| format!(".B{}: {}", block.0, v(var)))
                    .collect();
                format!("{} <- phi({})", v(dst), args.join(", "))
            }
            Call { dst, func, args } => {
                let args: Vec<String> = args.iter().map(v).collect();
                match dst {
                    Some(dst) => format!("{} <- call f{}({})", v(dst), func.0, args.join(", ")),
                    None => format!("call f{}({})", func.0, args.join(", ")),
                }
            }
            IndirectCall { dst, target, args } => {
                let args: Vec<String> = args.iter().map(v).collect();
                match dst {
                    Some(dst) => format!("{} <- icall [{}]({})", v(dst), v(target), args.join(", ")),
                    None => format!("icall [{}]({})", v(target), args.join(", ")),
                }
            }
            Set { cc, dst } => format!("{} <- set{cc}", v(dst)),
            Return { value } => match value {
                Some(value) => format!("ret {}", v(value)),
                None => "ret".to_string(),
            },
            Nop => "nop".to_string(),
            InlineAsm { text } => format!("asm {:?}", text.as_str()),
        }
    }
}

/// Forward iterator over one block's statement list.
pub struct BlockInsts<'a> {
    body: &'a Body,
    cursor: Option<InstId>,
}

impl Iterator for BlockInsts<'_> {
    type Item = InstId;

    fn next(&mut self) -> Option<InstId> {
        let id = self.cursor?;
        self.cursor = self.body.inst(id).next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::types::{Primitive, TypeTable};

    fn body_with_block() -> (Body, Ctx, BlockId, TypeId) {
        let mut types = TypeTable::new();
        let i32t = types.basic(Primitive::I32);
        let mut ctx = Ctx::new();
        let mut body = Body::new();
        let block = body.new_block(&mut ctx, FuncId(0));
        (body, ctx, block, i32t)
    }

    #[test]
    fn constant_predicates() {
        assert!(Constant::I32(0).is_zero());
        assert!(Constant::Hex(1).is_one());
        assert!(Constant::U64(64).is_power_of_two());
        assert!(!Constant::I32(-8).is_power_of_two());
        assert!(!Constant::I32(12).is_power_of_two());
        assert_eq!(Constant::I64(256).log2(), 8);
    }

    #[test]
    fn subtract_is_existing_minus_incoming() {
        let existing = Constant::I32(10);
        let incoming = Constant::I32(3);
        assert_eq!(existing.subtract_constants(incoming), Constant::I32(7));
    }

    #[test]
    fn combinators_keep_the_receiver_kind() {
        assert_eq!(
            Constant::Hex(0xf).add_constants(Constant::I32(1)),
            Constant::Hex(0x10)
        );
        assert_eq!(
            Constant::U8(200).multiply_constants(Constant::U8(2)),
            Constant::U8(144)
        );
        assert_eq!(
            Constant::I32(5).logical_and_constants(Constant::I32(0)),
            Constant::I32(0)
        );
        assert_eq!(
            Constant::I32(0).logical_or_constants(Constant::I32(9)),
            Constant::I32(1)
        );
    }

    #[test]
    fn list_insertion_maintains_leader_and_exit() {
        let (mut body, _ctx, block, i32t) = body_with_block();
        let mut ctx = Ctx::new();
        let a = body.new_temp(&mut ctx, i32t);
        let b = body.new_temp(&mut ctx, i32t);
        let first = body.add_statement(
            block,
            Op::AssignConst {
                dst: a,
                src: Constant::I32(1),
            },
            1,
        );
        let last = body.add_statement(block, Op::Assign { dst: b, src: a }, 2);
        assert_eq!(body.block(block).leader, Some(first));
        assert_eq!(body.block(block).exit, Some(last));
        assert_eq!(body.inst(first).prev, None);
        assert_eq!(body.inst(last).next, None);

        let mid = body.insert_instruction_after(first, Op::Inc { dst: a }, 1);
        assert_eq!(body.inst(first).next, Some(mid));
        assert_eq!(body.inst(last).prev, Some(mid));

        let front = body.insert_instruction_before(first, Op::Nop, 1);
        assert_eq!(body.block(block).leader, Some(front));
        assert_eq!(body.inst(first).prev, Some(front));

        let order: Vec<InstId> = body.block_insts(block).collect();
        assert_eq!(order, vec![front, first, mid, last]);
    }

    #[test]
    fn delete_statement_relinks_and_fixes_use_counts() {
        let (mut body, mut ctx, block, i32t) = body_with_block();
        let a = body.new_temp(&mut ctx, i32t);
        let b = body.new_temp(&mut ctx, i32t);
        body.add_statement(
            block,
            Op::AssignConst {
                dst: a,
                src: Constant::I32(4),
            },
            1,
        );
        let copy = body.add_statement(block, Op::Assign { dst: b, src: a }, 2);
        assert_eq!(body.var(a).use_count, 1);
        body.delete_statement(copy);
        assert_eq!(body.var(a).use_count, 0);
        assert_eq!(body.var(b).def_inst, None);
        let order: Vec<InstId> = body.block_insts(block).collect();
        assert_eq!(order.len(), 1);
        assert_eq!(body.block(block).exit, body.block(block).leader);
    }

    #[test]
    fn display_is_stable() {
        let (mut body, mut ctx, block, i32t) = body_with_block();
        let a = body.new_temp(&mut ctx, i32t);
        let b = body.new_temp(&mut ctx, i32t);
        let k = body.add_statement(
            block,
            Op::AssignConst {
                dst: a,
                src: Constant::Hex(8),
            },
            1,
        );
        let add = body.add_statement(
            block,
            Op::Bin {
                op: BinOp::Add,
                dst: b,
                lhs: a,
                rhs: a,
            },
            1,
        );
        assert_eq!(body.display_inst(k), "t0 <- 0x8");
        assert_eq!(body.display_inst(add), "t1 <- t0 + t0");
    }

    #[test]
    fn cc_inversion_and_selection() {
        assert_eq!(Cc::for_comparison(BinOp::Lt, true), Cc::L);
        assert_eq!(Cc::for_comparison(BinOp::Lt, false), Cc::B);
        assert_eq!(Cc::for_comparison(BinOp::Ge, false), Cc::Ae);
        assert_eq!(Cc::L.inverse(), Cc::Ge);
        assert_eq!(Cc::E.inverse(), Cc::Ne);
    }
}
