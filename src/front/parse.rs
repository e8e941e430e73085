//! The parser: recursive descent over the token stream, populating the
//! symbol tables as declarations are seen and typing expressions on the way
//! up.  A failed parse produces an error AST root, never a panic.

use std::fmt::Debug;

use derive_more::derive::Display;

use super::ast::*;
use super::lex::*;
use super::symtab::*;
use super::types::*;
use crate::common::*;

#[derive(Display)]
#[display("Parse error at line {line}: {message}")]
pub struct ParseError {
    pub line: u32,
    pub message: String,
}

impl Debug for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

/// Everything one compilation produces and owns: the context, the tables,
/// and the AST root.  The tables outlive all IR built from them.
pub struct Unit {
    pub ctx: Ctx,
    pub types: TypeTable,
    pub functions: FunctionTable,
    pub variables: VariableTable,
    pub type_names: TypeNameTable,
    pub macros: MacroTable,
    pub root: Root,
}

impl Unit {
    fn empty() -> Self {
        Self {
            ctx: Ctx::new(),
            types: TypeTable::new(),
            functions: FunctionTable::new(),
            variables: VariableTable::new(),
            type_names: TypeNameTable::new(),
            macros: MacroTable::new(),
            root: Root::Unit(Vec::new()),
        }
    }
}

/// Parse a source file into a [Unit].  The root is [Root::Err] iff lexing or
/// parsing failed.
pub fn parse(input: &str) -> Unit {
    let mut unit = Unit::empty();
    let tokens = match Lexer::new(input).tokenize() {
        Ok(tokens) => tokens,
        Err(err) => {
            unit.root = Root::Err {
                line: err.0,
                message: err.to_string(),
            };
            return unit;
        }
    };
    let mut parser = Parser {
        tokens,
        pos: 0,
        ctx: &mut unit.ctx,
        types: &mut unit.types,
        functions: &mut unit.functions,
        variables: &mut unit.variables,
        type_names: &mut unit.type_names,
        enum_consts: Map::new(),
    };
    unit.root = match parser.parse_unit() {
        Ok(items) => Root::Unit(items),
        Err(err) => Root::Err {
            line: err.line,
            message: err.message,
        },
    };
    unit
}

type Parse<T> = Result<T, ParseError>;

struct Parser<'src, 'u> {
    tokens: Vec<Token<'src>>,
    pos: usize,
    ctx: &'u mut Ctx,
    types: &'u mut TypeTable,
    functions: &'u mut FunctionTable,
    variables: &'u mut VariableTable,
    type_names: &'u mut TypeNameTable,
    /// Enumerated constants fold to literals at parse time.
    enum_consts: Map<Id, (i64, TypeId)>,
}

impl<'src, 'u> Parser<'src, 'u> {
    fn peek(&self) -> Option<Token<'src>> {
        self.tokens.get(self.pos).copied()
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn line(&self) -> u32 {
        self.peek()
            .map(|t| t.line)
            .or_else(|| self.tokens.last().map(|t| t.line))
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Option<Token<'src>> {
        let token = self.peek();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind() == Some(kind)
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Parse<Token<'src>> {
        match self.peek() {
            Some(token) if token.kind == kind => {
                self.pos += 1;
                Ok(token)
            }
            Some(token) => Err(self.err(format!("expected '{kind}', found '{}'", token.text))),
            None => Err(self.err(format!("expected '{kind}', found end of input"))),
        }
    }

    fn err(&self, message: String) -> ParseError {
        ParseError {
            line: self.line(),
            message,
        }
    }

    // ---- items ----

    fn parse_unit(&mut self) -> Parse<Vec<Item>> {
        let mut items = Vec::new();
        while self.peek().is_some() {
            if let Some(item) = self.parse_item()? {
                items.push(item);
            }
        }
        Ok(items)
    }

    fn parse_item(&mut self) -> Parse<Option<Item>> {
        match self.peek_kind() {
            Some(TokenKind::Struct) => {
                self.parse_struct_decl()?;
                Ok(None)
            }
            Some(TokenKind::Enum) => {
                self.parse_enum_decl()?;
                Ok(None)
            }
            Some(TokenKind::Global) => self.parse_global().map(Some),
            Some(TokenKind::Fn | TokenKind::Priv | TokenKind::Inline) => {
                self.parse_function().map(Some)
            }
            _ => Err(self.err("expected a top-level declaration".to_string())),
        }
    }

    fn parse_struct_decl(&mut self) -> Parse<()> {
        let line = self.line();
        self.expect(TokenKind::Struct)?;
        let name = id(self.expect(TokenKind::Id)?.text);
        self.expect(TokenKind::LBrace)?;
        let mut members = Vec::new();
        while !self.at(TokenKind::RBrace) {
            let field_line = self.line();
            let field = id(self.expect(TokenKind::Id)?.text);
            self.expect(TokenKind::Colon)?;
            let ty = self.parse_type()?;
            self.expect(TokenKind::Semi)?;
            let mut record = VarRecord::new(field, ty, Membership::StructMember, field_line);
            record.initialized = true;
            self.variables.declare(record);
            members.push((field, ty));
        }
        self.expect(TokenKind::RBrace)?;
        let ty = self.types.intern(TypeKind::Construct { name, members });
        self.type_names
            .declare(name, Mutability::Immutable, None, ty, line);
        Ok(())
    }

    fn parse_enum_decl(&mut self) -> Parse<()> {
        let line = self.line();
        self.expect(TokenKind::Enum)?;
        let name = id(self.expect(TokenKind::Id)?.text);
        self.expect(TokenKind::LBrace)?;
        let mut constants = Vec::new();
        let mut next_value: i64 = 0;
        while !self.at(TokenKind::RBrace) {
            let const_line = self.line();
            let constant = id(self.expect(TokenKind::Id)?.text);
            let value = if self.eat(TokenKind::Assign) {
                self.parse_int_literal()?
            } else {
                next_value
            };
            next_value = value + 1;
            constants.push((constant, value));
            let mut record = VarRecord::new(
                constant,
                self.types.basic(Primitive::I32),
                Membership::EnumMember,
                const_line,
            );
            record.initialized = true;
            self.variables.declare(record);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        let ty = self.types.intern(TypeKind::Enumerated { name, constants });
        self.type_names
            .declare(name, Mutability::Immutable, None, ty, line);
        if let TypeKind::Enumerated { constants, .. } = self.types.kind(ty).clone() {
            for (constant, value) in constants {
                self.enum_consts.insert(constant, (value, ty));
            }
        }
        Ok(())
    }

    fn parse_int_literal(&mut self) -> Parse<i64> {
        let negative = self.eat(TokenKind::Minus);
        let token = self.expect(TokenKind::Num)?;
        let value: i64 = token
            .text
            .parse()
            .map_err(|_| self.err(format!("integer literal '{}' out of range", token.text)))?;
        Ok(if negative { -value } else { value })
    }

    fn parse_global(&mut self) -> Parse<Item> {
        let line = self.line();
        self.expect(TokenKind::Global)?;
        let name = id(self.expect(TokenKind::Id)?.text);
        self.expect(TokenKind::Colon)?;
        let ty = self.parse_type()?;
        let init = if self.eat(TokenKind::Assign) {
            Some(self.parse_int_literal()?)
        } else {
            None
        };
        self.expect(TokenKind::Semi)?;
        let mut record = VarRecord::new(name, ty, Membership::Global, line);
        record.initialized = init.is_some();
        let var = self.variables.declare(record);
        Ok(Item::Global { var, init, line })
    }

    fn parse_function(&mut self) -> Parse<Item> {
        let line = self.line();
        let visibility = if self.eat(TokenKind::Priv) {
            Visibility::Private
        } else {
            Visibility::Public
        };
        let inlined = self.eat(TokenKind::Inline);
        self.expect(TokenKind::Fn)?;
        let name = id(self.expect(TokenKind::Id)?.text);

        self.expect(TokenKind::LParen)?;
        self.variables.initialize_scope();
        let mut params = Vec::new();
        let mut param_tys = Vec::new();
        while !self.at(TokenKind::RParen) {
            let param_line = self.line();
            let param = id(self.expect(TokenKind::Id)?.text);
            self.expect(TokenKind::Colon)?;
            let ty = self.parse_type()?;
            if !self.types.is_scalar(ty) {
                return Err(self.err(format!(
                    "parameter '{param}' must have a scalar type; pass aggregates by pointer"
                )));
            }
            let mut record = VarRecord::new(param, ty, Membership::Parameter, param_line);
            record.initialized = true;
            record.param_index = Some(params.len() as u32);
            let sym = self.variables.declare(record);
            params.push(sym);
            param_tys.push(ty);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        let ret = if self.eat(TokenKind::Arrow) {
            self.parse_type()?
        } else {
            self.types.basic(Primitive::Void)
        };
        let signature = self.types.intern(TypeKind::FunctionPointer {
            visibility,
            inline: inlined,
            params: param_tys,
            ret,
            mutability: Mutability::Immutable,
        });

        // A call may have auto-declared this function already.
        let func = match self.functions.lookup(name) {
            Some(existing) => {
                if self.functions.record(existing).defined {
                    self.variables.finalize_scope();
                    return Err(self.err(format!("function '{name}' is defined twice")));
                }
                existing
            }
            None => {
                let record = FunctionRecord::new(name, visibility, ret, signature, line);
                self.functions.declare(self.ctx, record)
            }
        };
        {
            let record = self.functions.record_mut(func);
            record.visibility = visibility;
            record.inlined = inlined;
            record.params = params.clone();
            record.ret = ret;
            record.signature = signature;
            record.defined = true;
            record.line = line;
        }
        for &param in &params {
            self.variables.record_mut(param).declaring_func = Some(func);
        }

        let body = self.parse_block(func)?;
        self.variables.finalize_scope();
        Ok(Item::Function { func, body, line })
    }

    // ---- types ----

    fn parse_type(&mut self) -> Parse<TypeId> {
        match self.peek_kind() {
            Some(TokenKind::Star) => {
                self.advance();
                let mutability = if self.eat(TokenKind::Mut) {
                    Mutability::Mutable
                } else {
                    Mutability::Immutable
                };
                let elem = self.parse_type()?;
                Ok(self.types.pointer_to(elem, mutability))
            }
            Some(TokenKind::Amp) => {
                self.advance();
                let target = self.parse_type()?;
                Ok(self.types.intern(TypeKind::Reference { target }))
            }
            Some(TokenKind::LBracket) => {
                self.advance();
                let elem = self.parse_type()?;
                self.expect(TokenKind::Semi)?;
                let len = self.parse_int_literal()?;
                self.expect(TokenKind::RBracket)?;
                if len <= 0 {
                    return Err(self.err("array length must be positive".to_string()));
                }
                Ok(self
                    .types
                    .array_of(elem, len as u32, Mutability::Immutable))
            }
            Some(TokenKind::Mut) => {
                self.advance();
                let inner = self.parse_type()?;
                Ok(self.types.make_mutable(inner))
            }
            Some(TokenKind::Id) => {
                let token = self.advance().unwrap();
                let name = id(token.text);
                if let Some(prim) = primitive_by_name(token.text) {
                    return Ok(self.types.basic(prim));
                }
                self.type_names
                    .lookup(name, Mutability::Immutable, None)
                    .ok_or_else(|| self.err(format!("unknown type '{name}'")))
            }
            _ => Err(self.err("expected a type".to_string())),
        }
    }

    // ---- statements ----

    fn parse_block(&mut self, func: FuncId) -> Parse<Vec<Stmt>> {
        self.expect(TokenKind::LBrace)?;
        self.variables.initialize_scope();
        let mut stmts = Vec::new();
        while !self.at(TokenKind::RBrace) {
            stmts.push(self.parse_stmt(func)?);
        }
        self.expect(TokenKind::RBrace)?;
        self.variables.finalize_scope();
        Ok(stmts)
    }

    fn parse_stmt(&mut self, func: FuncId) -> Parse<Stmt> {
        match self.peek_kind() {
            Some(TokenKind::Let) => self.parse_let(func),
            Some(TokenKind::If) => self.parse_if(func),
            Some(TokenKind::While) => {
                let line = self.line();
                self.advance();
                self.expect(TokenKind::LParen)?;
                let guard = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                let body = self.parse_block(func)?;
                Ok(Stmt::While { guard, body, line })
            }
            Some(TokenKind::Do) => {
                let line = self.line();
                self.advance();
                let body = self.parse_block(func)?;
                self.expect(TokenKind::While)?;
                self.expect(TokenKind::LParen)?;
                let guard = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::DoWhile { body, guard, line })
            }
            Some(TokenKind::Switch) => self.parse_switch(func),
            Some(TokenKind::Return) => {
                let line = self.line();
                self.advance();
                let value = if self.at(TokenKind::Semi) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Return { value, line })
            }
            Some(TokenKind::Asm) => {
                let line = self.line();
                self.advance();
                self.expect(TokenKind::LParen)?;
                let text = self.expect(TokenKind::Str)?;
                self.expect(TokenKind::RParen)?;
                self.expect(TokenKind::Semi)?;
                // strip the quotes, keep escapes as written
                let payload = &text.text[1..text.text.len() - 1];
                Ok(Stmt::Asm {
                    text: id(payload),
                    line,
                })
            }
            Some(TokenKind::Defer) => {
                let line = self.line();
                self.advance();
                let body = self.parse_block(func)?;
                Ok(Stmt::Defer { body, line })
            }
            Some(TokenKind::LBrace) => Ok(Stmt::Block(self.parse_block(func)?)),
            _ => {
                let line = self.line();
                let expr = self.parse_expr()?;
                if self.eat(TokenKind::Assign) {
                    if !is_place(&expr) {
                        return Err(self.err("left side of '=' is not assignable".to_string()));
                    }
                    let value = self.parse_expr()?;
                    self.expect(TokenKind::Semi)?;
                    Ok(Stmt::Assign {
                        place: expr,
                        value,
                        line,
                    })
                } else {
                    self.expect(TokenKind::Semi)?;
                    Ok(Stmt::Expr(expr))
                }
            }
        }
    }

    fn parse_let(&mut self, func: FuncId) -> Parse<Stmt> {
        let line = self.line();
        self.expect(TokenKind::Let)?;
        let mutable = self.eat(TokenKind::Mut);
        let name = id(self.expect(TokenKind::Id)?.text);
        self.expect(TokenKind::Colon)?;
        let mut ty = self.parse_type()?;
        if mutable {
            ty = self.types.make_mutable(ty);
        }
        let init = if self.eat(TokenKind::Assign) {
            let mut init = self.parse_expr()?;
            // literals take the declared type
            if matches!(init.kind, ExprKind::Int { .. }) && self.types.is_scalar(ty) {
                init.ty = ty;
            }
            Some(init)
        } else {
            None
        };
        self.expect(TokenKind::Semi)?;
        if self.variables.lookup_local(name).is_some() {
            return Err(self.err(format!("variable '{name}' is declared twice in this scope")));
        }
        let mut record = VarRecord::new(name, ty, Membership::Local, line);
        record.declaring_func = Some(func);
        let var = self.variables.declare(record);
        Ok(Stmt::Let { var, init, line })
    }

    fn parse_if(&mut self, func: FuncId) -> Parse<Stmt> {
        let line = self.line();
        self.expect(TokenKind::If)?;
        self.expect(TokenKind::LParen)?;
        let guard = self.parse_expr()?;
        self.expect(TokenKind::RParen)?;
        let tt = self.parse_block(func)?;
        let ff = if self.eat(TokenKind::Else) {
            if self.at(TokenKind::If) {
                vec![self.parse_if(func)?]
            } else {
                self.parse_block(func)?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If {
            guard,
            tt,
            ff,
            line,
        })
    }

    fn parse_switch(&mut self, func: FuncId) -> Parse<Stmt> {
        let line = self.line();
        self.expect(TokenKind::Switch)?;
        self.expect(TokenKind::LParen)?;
        let scrutinee = self.parse_expr()?;
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::LBrace)?;
        let mut cases: Vec<(i64, Vec<Stmt>)> = Vec::new();
        let mut default = Vec::new();
        let mut saw_default = false;
        while !self.at(TokenKind::RBrace) {
            if self.eat(TokenKind::Case) {
                let value = self.parse_int_literal()?;
                self.expect(TokenKind::Colon)?;
                if cases.iter().any(|(v, _)| *v == value) {
                    return Err(self.err(format!("duplicate case value {value}")));
                }
                let body = self.parse_case_body(func)?;
                cases.push((value, body));
            } else if self.eat(TokenKind::Default) {
                self.expect(TokenKind::Colon)?;
                if saw_default {
                    return Err(self.err("duplicate default case".to_string()));
                }
                saw_default = true;
                default = self.parse_case_body(func)?;
            } else {
                return Err(self.err("expected 'case' or 'default'".to_string()));
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Stmt::Switch {
            scrutinee,
            cases,
            default,
            line,
        })
    }

    /// Statements up to the next `case`, `default`, or the closing brace.
    fn parse_case_body(&mut self, func: FuncId) -> Parse<Vec<Stmt>> {
        let mut stmts = Vec::new();
        while !matches!(
            self.peek_kind(),
            Some(TokenKind::Case | TokenKind::Default | TokenKind::RBrace) | None
        ) {
            stmts.push(self.parse_stmt(func)?);
        }
        Ok(stmts)
    }

    // ---- expressions ----

    fn parse_expr(&mut self) -> Parse<Expr> {
        self.parse_binary(0)
    }

    fn parse_binary(&mut self, level: usize) -> Parse<Expr> {
        const LEVELS: [&[(TokenKind, BinOp)]; 10] = [
            &[(TokenKind::OrOr, BinOp::LogicalOr)],
            &[(TokenKind::AndAnd, BinOp::LogicalAnd)],
            &[(TokenKind::Pipe, BinOp::BitOr)],
            &[(TokenKind::Caret, BinOp::BitXor)],
            &[(TokenKind::Amp, BinOp::BitAnd)],
            &[(TokenKind::EqEq, BinOp::Eq), (TokenKind::NotEq, BinOp::Ne)],
            &[
                (TokenKind::Lt, BinOp::Lt),
                (TokenKind::LtEq, BinOp::Le),
                (TokenKind::Gt, BinOp::Gt),
                (TokenKind::GtEq, BinOp::Ge),
            ],
            &[(TokenKind::Shl, BinOp::Shl), (TokenKind::Shr, BinOp::Shr)],
            &[(TokenKind::Plus, BinOp::Add), (TokenKind::Minus, BinOp::Sub)],
            &[
                (TokenKind::Star, BinOp::Mul),
                (TokenKind::Slash, BinOp::Div),
                (TokenKind::Percent, BinOp::Mod),
            ],
        ];
        if level >= LEVELS.len() {
            return self.parse_unary();
        }
        let mut lhs = self.parse_binary(level + 1)?;
        loop {
            let Some(kind) = self.peek_kind() else { break };
            let Some(&(_, op)) = LEVELS[level].iter().find(|(k, _)| *k == kind) else {
                break;
            };
            let line = self.line();
            self.advance();
            let rhs = self.parse_binary(level + 1)?;
            let ty = if op.is_comparison() || op.is_logical() {
                self.types.basic(Primitive::I32)
            } else {
                self.types
                    .types_assignable(lhs.ty, rhs.ty)
                    .unwrap_or(lhs.ty)
            };
            lhs = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                ty,
                line,
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Parse<Expr> {
        let line = self.line();
        match self.peek_kind() {
            Some(TokenKind::Minus) => {
                self.advance();
                let operand = self.parse_unary()?;
                let ty = operand.ty;
                Ok(Expr {
                    kind: ExprKind::Unary {
                        op: UnOp::Negate,
                        operand: Box::new(operand),
                    },
                    ty,
                    line,
                })
            }
            Some(TokenKind::Tilde) => {
                self.advance();
                let operand = self.parse_unary()?;
                let ty = operand.ty;
                Ok(Expr {
                    kind: ExprKind::Unary {
                        op: UnOp::BitNot,
                        operand: Box::new(operand),
                    },
                    ty,
                    line,
                })
            }
            Some(TokenKind::Bang) => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr {
                    kind: ExprKind::Unary {
                        op: UnOp::LogicalNot,
                        operand: Box::new(operand),
                    },
                    ty: self.types.basic(Primitive::I32),
                    line,
                })
            }
            Some(TokenKind::Amp) => {
                self.advance();
                let operand = self.parse_unary()?;
                if !is_place(&operand) {
                    return Err(self.err("cannot take the address of this expression".to_string()));
                }
                let ty = self.types.pointer_to(operand.ty, Mutability::Immutable);
                Ok(Expr {
                    kind: ExprKind::AddrOf(Box::new(operand)),
                    ty,
                    line,
                })
            }
            Some(TokenKind::Star) => {
                self.advance();
                let operand = self.parse_unary()?;
                let ty = self
                    .types
                    .pointee(operand.ty)
                    .ok_or_else(|| self.err("dereference of a non-pointer".to_string()))?;
                Ok(Expr {
                    kind: ExprKind::Deref(Box::new(operand)),
                    ty,
                    line,
                })
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Parse<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek_kind() {
                Some(TokenKind::LBracket) => {
                    let line = self.line();
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(TokenKind::RBracket)?;
                    let elem = self
                        .types
                        .pointee(expr.ty)
                        .ok_or_else(|| self.err("indexing a non-indexable value".to_string()))?;
                    expr = Expr {
                        kind: ExprKind::Index {
                            base: Box::new(expr),
                            index: Box::new(index),
                        },
                        ty: elem,
                        line,
                    };
                }
                Some(TokenKind::Dot) => {
                    let line = self.line();
                    self.advance();
                    let field = id(self.expect(TokenKind::Id)?.text);
                    let (ty, offset) =
                        self.types.member_offset(expr.ty, field).ok_or_else(|| {
                            self.err(format!("no member '{field}' on this type"))
                        })?;
                    expr = Expr {
                        kind: ExprKind::Member {
                            base: Box::new(expr),
                            field,
                            offset,
                        },
                        ty,
                        line,
                    };
                }
                Some(TokenKind::As) => {
                    let line = self.line();
                    self.advance();
                    let ty = self.parse_type()?;
                    expr = Expr {
                        kind: ExprKind::Cast(Box::new(expr)),
                        ty,
                        line,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Parse<Expr> {
        let line = self.line();
        match self.peek_kind() {
            Some(TokenKind::Num) => {
                let token = self.advance().unwrap();
                let value: i64 = token.text.parse().map_err(|_| {
                    self.err(format!("integer literal '{}' out of range", token.text))
                })?;
                let ty = if i32::try_from(value).is_ok() {
                    self.types.basic(Primitive::I32)
                } else {
                    self.types.basic(Primitive::I64)
                };
                Ok(Expr {
                    kind: ExprKind::Int { value, hex: false },
                    ty,
                    line,
                })
            }
            Some(TokenKind::HexNum) => {
                let token = self.advance().unwrap();
                let value = u64::from_str_radix(&token.text[2..], 16).map_err(|_| {
                    self.err(format!("hex literal '{}' out of range", token.text))
                })?;
                Ok(Expr {
                    kind: ExprKind::Int {
                        value: value as i64,
                        hex: true,
                    },
                    ty: self.types.basic(Primitive::U64),
                    line,
                })
            }
            Some(TokenKind::CharLit) => {
                let token = self.advance().unwrap();
                let inner = &token.text[1..token.text.len() - 1];
                let value = unescape_char(inner)
                    .ok_or_else(|| self.err(format!("bad character literal {}", token.text)))?;
                Ok(Expr {
                    kind: ExprKind::Int {
                        value: value as i64,
                        hex: false,
                    },
                    ty: self.types.basic(Primitive::Char),
                    line,
                })
            }
            Some(TokenKind::LParen) => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            Some(TokenKind::Id) => {
                let token = self.advance().unwrap();
                let name = id(token.text);
                if self.at(TokenKind::LParen) {
                    return self.parse_call(name, line);
                }
                if let Some(&(value, ty)) = self.enum_consts.get(&name) {
                    return Ok(Expr {
                        kind: ExprKind::Int { value, hex: false },
                        ty,
                        line,
                    });
                }
                let sym = self
                    .variables
                    .lookup(name)
                    .ok_or_else(|| self.err(format!("undefined variable '{name}'")))?;
                let ty = self.variables.record(sym).ty;
                Ok(Expr {
                    kind: ExprKind::Var(sym),
                    ty,
                    line,
                })
            }
            _ => Err(self.err("expected an expression".to_string())),
        }
    }

    fn parse_call(&mut self, name: Id, line: u32) -> Parse<Expr> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        while !self.at(TokenKind::RParen) {
            args.push(self.parse_expr()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        // calls to names with no definition yet auto-declare the function;
        // the diagnostics pass reports the ones that never materialize
        let func = match self.functions.lookup(name) {
            Some(func) => func,
            None => {
                let ret = self.types.basic(Primitive::I32);
                let signature = self.types.intern(TypeKind::FunctionPointer {
                    visibility: Visibility::Public,
                    inline: false,
                    params: args.iter().map(|a| a.ty).collect(),
                    ret,
                    mutability: Mutability::Immutable,
                });
                let record = FunctionRecord::new(name, Visibility::Public, ret, signature, line);
                self.functions.declare(self.ctx, record)
            }
        };
        let ty = self.functions.record(func).ret;
        Ok(Expr {
            kind: ExprKind::Call { func, args },
            ty,
            line,
        })
    }
}

fn is_place(expr: &Expr) -> bool {
    matches!(
        expr.kind,
        ExprKind::Var(_) | ExprKind::Deref(_) | ExprKind::Index { .. } | ExprKind::Member { .. }
    )
}

fn primitive_by_name(name: &str) -> Option<Primitive> {
    Some(match name {
        "void" => Primitive::Void,
        "i8" => Primitive::I8,
        "i16" => Primitive::I16,
        "i32" => Primitive::I32,
        "i64" => Primitive::I64,
        "u8" => Primitive::U8,
        "u16" => Primitive::U16,
        "u32" => Primitive::U32,
        "u64" => Primitive::U64,
        "char" => Primitive::Char,
        "f32" => Primitive::F32,
        "f64" => Primitive::F64,
        _ => return None,
    })
}

fn unescape_char(inner: &str) -> Option<u8> {
    let mut chars = inner.chars();
    let first = chars.next()?;
    if first != '\\' {
        return (chars.next().is_none() && first.is_ascii()).then_some(first as u8);
    }
    let escaped = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    Some(match escaped {
        'n' => b'\n',
        't' => b'\t',
        'r' => b'\r',
        '0' => 0,
        '\\' => b'\\',
        '\'' => b'\'',
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_function() {
        let unit = parse("fn main() -> i32 { return 0; }");
        let Root::Unit(items) = &unit.root else {
            panic!("parse failed");
        };
        assert_eq!(items.len(), 1);
        let main = unit.functions.lookup(id("main")).unwrap();
        assert!(unit.functions.record(main).defined);
    }

    #[test]
    fn error_root_on_bad_input() {
        let unit = parse("fn main( { }");
        assert!(unit.root.is_err());
    }

    #[test]
    fn undefined_variables_are_errors() {
        let unit = parse("fn f() -> i32 { return nope; }");
        assert!(unit.root.is_err());
    }

    #[test]
    fn calls_auto_declare_their_callee() {
        let unit = parse("fn f() -> i32 { return g(1); }");
        assert!(!unit.root.is_err());
        let g = unit.functions.lookup(id("g")).unwrap();
        let record = unit.functions.record(g);
        assert!(record.called);
        assert!(!record.defined);
    }

    #[test]
    fn struct_members_and_offsets() {
        let mut unit = parse(
            "struct point { x: i32; y: i32; }\n\
             fn f(p: *point) -> i32 { return (*p).y; }\n",
        );
        assert!(!unit.root.is_err(), "{:?}", unit.root);
        let point = unit
            .type_names
            .lookup(id("point"), Mutability::Immutable, None)
            .unwrap();
        let i32t = unit.types.basic(Primitive::I32);
        assert_eq!(unit.types.member_offset(point, id("y")), Some((i32t, 4)));
    }

    #[test]
    fn enum_constants_fold_to_literals() {
        let unit = parse(
            "enum color { red, green = 5, blue, }\n\
             fn f() -> i32 { return blue; }\n",
        );
        assert!(!unit.root.is_err(), "{:?}", unit.root);
    }

    #[test]
    fn duplicate_definitions_are_errors() {
        let unit = parse("fn f() -> i32 { return 0; } fn f() -> i32 { return 1; }");
        assert!(unit.root.is_err());
        let unit = parse("fn f() -> i32 { let x: i32 = 1; let x: i32 = 2; return x; }");
        assert!(unit.root.is_err());
    }

    #[test]
    fn shadowing_in_nested_scopes_is_allowed() {
        let unit = parse(
            "fn f() -> i32 { let x: i32 = 1; { let x: i32 = 2; } return x; }",
        );
        assert!(!unit.root.is_err(), "{:?}", unit.root);
    }
}
