//! Abstract syntax produced by the parser. Variable references are
//! already resolved to `NameRef::Local`/`Upval`/`Global` by the time a
//! node reaches the compiler — scope resolution happens during parsing,
//! not as a separate pass, mirroring the original's `find_local` being
//! called directly as each identifier is parsed.

use crate::error::Location;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Gt,
    Gte,
    Eq,
    Neq,
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

/// Where a resolved name lives. `Local`/`Upval` slots are small indices
/// assigned while parsing the enclosing function; `Global` is a
/// compile-time-unresolved name, looked up in the global table at
/// runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NameRef {
    Local(u16),
    Upval(u16),
    Global(String),
}

/// How a nested function's upvalue is sourced from the *enclosing*
/// scope at `CLOSE` time: either copied from one of the enclosing
/// function's own locals, or forwarded from one of its own upvalues
/// (when the capture needs to propagate through an intermediate scope).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureSource {
    Local(u16),
    Upval(u16),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionNode {
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    /// Total local slots this function's scope allocated (params plus
    /// `var` declarations), used to emit the frame-entry `PUSH n`.
    pub locals_count: u16,
    /// In outer-to-inner declaration order; the compiler reverses this
    /// when emitting the `LOAD`/`LOADUP` + `CLOSE` sequence so the
    /// capture vector matches the callee's expected upvalue order.
    pub captures: Vec<CaptureSource>,
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    Name(NameRef),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
    /// Key expressions are always `Str` or `Number` literals — the
    /// parser restricts table-literal keys to a single token.
    Table(Vec<(Expr, Expr)>),
    Function(Box<FunctionNode>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    /// `(condition, body)` arms in source order, plus an optional
    /// trailing `else` body.
    If(Location, Vec<(Expr, Vec<Stmt>)>, Option<Vec<Stmt>>),
    For { loc: Location, iter_slot: u16, var_slot: u16, iter: Expr, body: Vec<Stmt> },
    While(Location, Expr, Vec<Stmt>),
    Return(Location, Option<Expr>),
    Break(Location),
    VarDecl(Location, u16, Option<Expr>),
    Assign(Location, Expr, Expr),
    Expr(Location, Expr),
}
