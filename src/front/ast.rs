//! The abstract syntax tree handed to the back-end.
//!
//! Nodes are class-tagged enum variants carrying their inferred type and
//! source line.  The root is [Root::Err] iff parsing failed; the back-end
//! refuses to run on an error root.

use derive_more::Display;

use crate::common::*;
use crate::front::symtab::VarSymId;

/// The AST root.  `Err` is a value, not an exception: it short-circuits the
/// pipeline in the driver.
#[derive(Debug)]
pub enum Root {
    /// Parsing failed; the payload is the first error, for the summary.
    Err { line: u32, message: String },
    /// A parsed compilation unit.
    Unit(Vec<Item>),
}

impl Root {
    pub fn is_err(&self) -> bool {
        matches!(self, Root::Err { .. })
    }
}

/// Top-level declarations, in source order.
#[derive(Debug)]
pub enum Item {
    /// A function definition.  The interface lives in the function table;
    /// only the body shape is kept here.
    Function {
        func: FuncId,
        body: Vec<Stmt>,
        line: u32,
    },
    /// A global variable definition with an optional constant initializer.
    Global {
        var: VarSymId,
        init: Option<i64>,
        line: u32,
    },
}

/// Statements.
#[derive(Debug)]
pub enum Stmt {
    Let {
        var: VarSymId,
        init: Option<Expr>,
        line: u32,
    },
    /// `place = value`.  The place is restricted to the assignable expression
    /// classes (variable, deref, index, member).
    Assign {
        place: Expr,
        value: Expr,
        line: u32,
    },
    If {
        guard: Expr,
        tt: Vec<Stmt>,
        ff: Vec<Stmt>,
        line: u32,
    },
    While {
        guard: Expr,
        body: Vec<Stmt>,
        line: u32,
    },
    DoWhile {
        body: Vec<Stmt>,
        guard: Expr,
        line: u32,
    },
    Switch {
        scrutinee: Expr,
        /// (case value, case body), in source order.
        cases: Vec<(i64, Vec<Stmt>)>,
        default: Vec<Stmt>,
        line: u32,
    },
    Return {
        value: Option<Expr>,
        line: u32,
    },
    /// An expression evaluated for effect (in practice: a call).
    Expr(Expr),
    /// Raw assembly passed through unchanged.
    Asm { text: Id, line: u32 },
    /// Deferred statements, run at scope exit.
    Defer { body: Vec<Stmt>, line: u32 },
    Block(Vec<Stmt>),
}

/// An expression: class tag plus inferred type plus source line.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: TypeId,
    pub line: u32,
}

/// Expression classes.
#[derive(Debug, Clone)]
pub enum ExprKind {
    /// Integer-valued literal (decimal, hex, or char).
    Int { value: i64, hex: bool },
    Str(Id),
    Var(VarSymId),
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        func: FuncId,
        args: Vec<Expr>,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Member {
        base: Box<Expr>,
        field: Id,
        /// Byte offset of the field, filled in during type inference.
        offset: u32,
    },
    AddrOf(Box<Expr>),
    Deref(Box<Expr>),
    Cast(Box<Expr>),
}

/// Unary operators.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum UnOp {
    #[display("-")]
    Negate,
    #[display("~")]
    BitNot,
    #[display("!")]
    LogicalNot,
}

/// Binary operators.  These double as the opcode tokens on OIR statements,
/// which the constant folder switches over.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum BinOp {
    #[display("+")]
    Add,
    #[display("-")]
    Sub,
    #[display("*")]
    Mul,
    #[display("/")]
    Div,
    #[display("%")]
    Mod,
    #[display("<<")]
    Shl,
    #[display(">>")]
    Shr,
    #[display("&")]
    BitAnd,
    #[display("|")]
    BitOr,
    #[display("^")]
    BitXor,
    #[display("&&")]
    LogicalAnd,
    #[display("||")]
    LogicalOr,
    #[display("==")]
    Eq,
    #[display("!=")]
    Ne,
    #[display("<")]
    Lt,
    #[display("<=")]
    Le,
    #[display(">")]
    Gt,
    #[display(">=")]
    Ge,
}

impl BinOp {
    /// Comparison operators produce a condition, not a value, until the
    /// selector turns them into SETcc.
    pub fn is_comparison(self) -> bool {
        use BinOp::*;
        matches!(self, Eq | Ne | Lt | Le | Gt | Ge)
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::LogicalAnd | BinOp::LogicalOr)
    }

    /// Operators whose two-operand x86 form overwrites the first operand.
    pub fn overwrites_op1(self) -> bool {
        !self.is_comparison()
    }
}
