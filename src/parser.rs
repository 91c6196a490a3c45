//! Recursive descent for statements with precedence-climbing for
//! expressions — operationally the same family as a two-stack
//! shunting-yard parser (same precedence table, same left-to-right
//! associativity, same output tree), expressed with the call stack doing
//! the work a Rust recursive-descent parser does more naturally than a
//! literal operator/operand stack pair. See DESIGN.md.
//!
//! Scope resolution (locals vs. upvalues vs. globals) happens inline as
//! each identifier is parsed — there is no separate resolver pass over
//! the AST afterward.

use crate::ast::*;
use crate::error::{CompileError, Error, Location, ParseError, Result};
use crate::lexer::{tokenize, Literal, Token, TokenKind};

const MAX_CALL_ARGS: usize = 16;
const MAX_PARAMS: usize = 16;

/// The result of parsing one module: its top-level statements plus the
/// number of local slots its (function-shaped) top-level scope needs.
pub struct Module {
    pub body: Vec<Stmt>,
    pub locals_count: u16,
}

struct FuncScope {
    locals: Vec<String>,
    upvals: Vec<(String, CaptureSource)>,
    hidden_counter: u32,
}

impl FuncScope {
    fn new() -> Self {
        FuncScope { locals: Vec::new(), upvals: Vec::new(), hidden_counter: 0 }
    }
}

pub fn parse(module: &str, src: &str) -> Result<Module> {
    let stream = tokenize(module, src)?;
    let mut parser = Parser {
        module: module.to_string(),
        tokens: stream,
        pos: 0,
        scopes: vec![FuncScope::new()],
    };
    let mut body = Vec::new();
    while !parser.at(TokenKind::Eof) {
        body.push(parser.parse_stmt()?);
    }
    let locals_count = parser.scopes.last().unwrap().locals.len() as u16;
    Ok(Module { body, locals_count })
}

struct Parser {
    module: String,
    tokens: crate::lexer::TokenStream,
    pos: usize,
    scopes: Vec<FuncScope>,
}

impl Parser {
    fn current(&self) -> Token {
        self.tokens.tokens[self.pos]
    }

    fn at(&self, kind: TokenKind) -> bool {
        std::mem::discriminant(&self.current().kind) == std::mem::discriminant(&kind)
    }

    fn loc(&self) -> Location {
        let t = self.current();
        Location::new(self.module.clone(), t.line, t.col)
    }

    fn advance(&mut self) -> Token {
        let t = self.current();
        if !matches!(t.kind, TokenKind::Eof) {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, kind: TokenKind) -> Result<Token> {
        if self.at(kind) {
            Ok(self.advance())
        } else {
            Err(ParseError::UnexpectedToken(self.loc(), format!("{:?}", self.current().kind)).into())
        }
    }

    fn expect_delim(&mut self, kind: TokenKind, name: &'static str) -> Result<()> {
        if self.at(kind) {
            self.advance();
            Ok(())
        } else {
            Err(ParseError::ExpectedDelimiter(self.loc(), name).into())
        }
    }

    fn cur_scope(&mut self) -> &mut FuncScope {
        self.scopes.last_mut().unwrap()
    }

    fn make_local(&mut self, name: &str) -> u16 {
        let scope = self.cur_scope();
        if let Some(i) = scope.locals.iter().position(|n| n == name) {
            return i as u16;
        }
        let idx = scope.locals.len() as u16;
        scope.locals.push(name.to_string());
        idx
    }

    fn make_hidden_local(&mut self) -> u16 {
        let scope = self.cur_scope();
        scope.hidden_counter += 1;
        let name = format!("__iter{}", scope.hidden_counter);
        let idx = scope.locals.len() as u16;
        scope.locals.push(name);
        idx
    }

    fn add_upval(&mut self, scope: usize, name: &str, source: CaptureSource) -> u16 {
        if let Some(i) = self.scopes[scope].upvals.iter().position(|(n, _)| n == name) {
            return i as u16;
        }
        let idx = self.scopes[scope].upvals.len() as u16;
        self.scopes[scope].upvals.push((name.to_string(), source));
        idx
    }

    /// Resolve `name` against the current scope, then walk outward,
    /// propagating an upvalue through every intermediate scope on the
    /// way back in. See DESIGN.md.
    fn find_local(&mut self, name: &str) -> Option<NameRef> {
        let cur = self.scopes.len() - 1;
        if let Some(i) = self.scopes[cur].locals.iter().position(|n| n == name) {
            return Some(NameRef::Local(i as u16));
        }
        if let Some(i) = self.scopes[cur].upvals.iter().position(|(n, _)| n == name) {
            return Some(NameRef::Upval(i as u16));
        }
        for depth in (0..cur).rev() {
            let found = if let Some(i) = self.scopes[depth].locals.iter().position(|n| n == name) {
                Some(CaptureSource::Local(i as u16))
            } else {
                self.scopes[depth]
                    .upvals
                    .iter()
                    .position(|(n, _)| n == name)
                    .map(|i| CaptureSource::Upval(i as u16))
            };
            if let Some(mut source) = found {
                for s in (depth + 1)..=cur {
                    source = CaptureSource::Upval(self.add_upval(s, name, source));
                }
                let CaptureSource::Upval(idx) = source else { unreachable!() };
                return Some(NameRef::Upval(idx));
            }
        }
        None
    }

    fn resolve_name(&mut self, name: &str) -> NameRef {
        self.find_local(name).unwrap_or_else(|| NameRef::Global(name.to_string()))
    }

    // ---- statements ----

    fn parse_block(&mut self) -> Result<Vec<Stmt>> {
        self.expect_delim(TokenKind::LBrace, "{")?;
        let mut stmts = Vec::new();
        while !self.at(TokenKind::RBrace) {
            if self.at(TokenKind::Eof) {
                return Err(ParseError::Unclosed(self.loc(), "{").into());
            }
            stmts.push(self.parse_stmt()?);
        }
        self.advance();
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt> {
        match self.current().kind {
            TokenKind::If => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::While => self.parse_while(),
            TokenKind::Return => self.parse_return(),
            TokenKind::Break => {
                let loc = self.loc();
                self.advance();
                Ok(Stmt::Break(loc))
            }
            TokenKind::Var => self.parse_var(),
            _ => self.parse_expr_or_assign(),
        }
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        let loc = self.loc();
        self.advance(); // `if`
        let mut arms = Vec::new();
        let cond = self.parse_expr(0)?;
        let body = self.parse_block()?;
        arms.push((cond, body));
        while self.at(TokenKind::Elseif) {
            self.advance();
            let cond = self.parse_expr(0)?;
            let body = self.parse_block()?;
            arms.push((cond, body));
        }
        let else_body = if self.at(TokenKind::Else) {
            self.advance();
            let body = self.parse_block()?;
            if self.at(TokenKind::Else) {
                return Err(ParseError::DuplicateElse(self.loc()).into());
            }
            Some(body)
        } else {
            None
        };
        Ok(Stmt::If(loc, arms, else_body))
    }

    fn parse_for(&mut self) -> Result<Stmt> {
        let loc = self.loc();
        self.advance(); // `for`
        let ident_tok = self.eat(TokenKind::Ident(0))?;
        let name = match ident_tok.kind {
            TokenKind::Ident(i) => self.tokens.identifier(i).to_string(),
            _ => unreachable!(),
        };
        self.expect_delim(TokenKind::In, "in")?;
        let iter = self.parse_expr(0)?;
        let iter_slot = self.make_hidden_local();
        let var_slot = self.make_local(&name);
        let body = self.parse_block()?;
        Ok(Stmt::For { loc, iter_slot, var_slot, iter, body })
    }

    fn parse_while(&mut self) -> Result<Stmt> {
        let loc = self.loc();
        self.advance();
        let cond = self.parse_expr(0)?;
        let body = self.parse_block()?;
        Ok(Stmt::While(loc, cond, body))
    }

    fn parse_return(&mut self) -> Result<Stmt> {
        let loc = self.loc();
        self.advance();
        if self.at(TokenKind::RBrace) || self.at(TokenKind::Eof) {
            Ok(Stmt::Return(loc, None))
        } else {
            Ok(Stmt::Return(loc, Some(self.parse_expr(0)?)))
        }
    }

    fn parse_var(&mut self) -> Result<Stmt> {
        let loc = self.loc();
        self.advance();
        let ident_tok = self.eat(TokenKind::Ident(0))?;
        let name = match ident_tok.kind {
            TokenKind::Ident(i) => self.tokens.identifier(i).to_string(),
            _ => unreachable!(),
        };
        let init = if self.at(TokenKind::Assign) {
            self.advance();
            Some(self.parse_expr(0)?)
        } else {
            None
        };
        let slot = self.make_local(&name);
        Ok(Stmt::VarDecl(loc, slot, init))
    }

    fn parse_expr_or_assign(&mut self) -> Result<Stmt> {
        let loc = self.loc();
        let expr = self.parse_expr(0)?;
        if self.at(TokenKind::Assign) {
            self.advance();
            let value = self.parse_expr(0)?;
            Ok(Stmt::Assign(loc, expr, value))
        } else {
            Ok(Stmt::Expr(loc, expr))
        }
    }

    // ---- expressions: precedence climbing ----

    fn binop_precedence(kind: &TokenKind) -> Option<(u8, BinOp)> {
        use TokenKind::*;
        Some(match kind {
            Gt => (2, BinOp::Gt),
            Gte => (2, BinOp::Gte),
            // `<`/`<=` are rewritten to `>`/`>=` with swapped operands
            // at AST-build time, so the VM only ever sees two ordered
            // comparisons.
            Lt => (2, BinOp::Gt),
            Lte => (2, BinOp::Gte),
            Is => (2, BinOp::Eq),
            Isnt => (2, BinOp::Neq),
            And => (1, BinOp::And),
            Or => (1, BinOp::Or),
            Plus => (3, BinOp::Add),
            Minus => (3, BinOp::Sub),
            Star => (4, BinOp::Mul),
            Slash => (4, BinOp::Div),
            _ => return None,
        })
    }

    fn parse_expr(&mut self, min_prec: u8) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        while let Some((prec, op)) = Self::binop_precedence(&self.current().kind) {
            if prec < min_prec {
                break;
            }
            let swapped = matches!(self.current().kind, TokenKind::Lt | TokenKind::Lte);
            self.advance();
            let rhs = self.parse_expr(prec + 1)?;
            lhs = if swapped {
                Expr::Binary(op, Box::new(rhs), Box::new(lhs))
            } else {
                Expr::Binary(op, Box::new(lhs), Box::new(rhs))
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.current().kind {
            TokenKind::Not => {
                self.advance();
                Ok(Expr::Unary(UnOp::Not, Box::new(self.parse_unary()?)))
            }
            TokenKind::Minus => {
                self.advance();
                Ok(Expr::Unary(UnOp::Neg, Box::new(self.parse_unary()?)))
            }
            _ => {
                let primary = self.parse_primary()?;
                self.parse_postfix(primary)
            }
        }
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> Result<Expr> {
        loop {
            match self.current().kind {
                TokenKind::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.at(TokenKind::RParen) {
                        loop {
                            args.push(self.parse_expr(0)?);
                            if self.at(TokenKind::Comma) {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    if args.len() > MAX_CALL_ARGS {
                        return Err(ParseError::TooManyArguments(self.loc()).into());
                    }
                    self.expect_delim(TokenKind::RParen, ")")?;
                    expr = Expr::Call(Box::new(expr), args);
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expr(0)?;
                    self.expect_delim(TokenKind::RBracket, "]")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                TokenKind::Dot => {
                    self.advance();
                    let ident_tok = self.eat(TokenKind::Ident(0))?;
                    let name = match ident_tok.kind {
                        TokenKind::Ident(i) => self.tokens.identifier(i).to_string(),
                        _ => unreachable!(),
                    };
                    expr = Expr::Index(Box::new(expr), Box::new(Expr::Str(name)));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let tok = self.current();
        match tok.kind {
            TokenKind::Number(i) => {
                self.advance();
                let Literal::Number(n) = self.tokens.literal(i) else { unreachable!() };
                Ok(Expr::Number(*n))
            }
            TokenKind::Str(i) => {
                self.advance();
                let Literal::Str(s) = self.tokens.literal(i) else { unreachable!() };
                Ok(Expr::Str(s.clone()))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::True)
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::False)
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Null)
            }
            TokenKind::Ident(i) => {
                self.advance();
                let name = self.tokens.identifier(i).to_string();
                Ok(Expr::Name(self.resolve_name(&name)))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr(0)?;
                self.expect_delim(TokenKind::RParen, ")")?;
                Ok(inner)
            }
            TokenKind::LBracket => self.parse_array_literal(),
            TokenKind::LBrace => self.parse_table_literal(),
            TokenKind::Fn => self.parse_function_literal(),
            _ => Err(ParseError::UnexpectedToken(self.loc(), format!("{:?}", tok.kind)).into()),
        }
    }

    fn parse_array_literal(&mut self) -> Result<Expr> {
        self.advance(); // `[`
        let mut items = Vec::new();
        if !self.at(TokenKind::RBracket) {
            loop {
                items.push(self.parse_expr(0)?);
                if self.at(TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect_delim(TokenKind::RBracket, "]")?;
        Ok(Expr::Array(items))
    }

    fn parse_table_literal(&mut self) -> Result<Expr> {
        self.advance(); // `{`
        let mut pairs = Vec::new();
        if !self.at(TokenKind::RBrace) {
            loop {
                let key = self.parse_table_key()?;
                self.expect_delim(TokenKind::Colon, ":")?;
                let value = self.parse_expr(0)?;
                pairs.push((key, value));
                if self.at(TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect_delim(TokenKind::RBrace, "}")?;
        Ok(Expr::Table(pairs))
    }

    fn parse_table_key(&mut self) -> Result<Expr> {
        match self.current().kind {
            TokenKind::Ident(i) => {
                self.advance();
                Ok(Expr::Str(self.tokens.identifier(i).to_string()))
            }
            TokenKind::Str(i) => {
                self.advance();
                let Literal::Str(s) = self.tokens.literal(i) else { unreachable!() };
                Ok(Expr::Str(s.clone()))
            }
            TokenKind::Number(i) => {
                self.advance();
                let Literal::Number(n) = self.tokens.literal(i) else { unreachable!() };
                Ok(Expr::Number(*n))
            }
            _ => Err(ParseError::InvalidTableKey(self.loc()).into()),
        }
    }

    fn parse_function_literal(&mut self) -> Result<Expr> {
        self.advance(); // `fn`
        self.expect_delim(TokenKind::LParen, "(")?;
        let mut params = Vec::new();
        if !self.at(TokenKind::RParen) {
            loop {
                let ident_tok = self.eat(TokenKind::Ident(0))?;
                let name = match ident_tok.kind {
                    TokenKind::Ident(i) => self.tokens.identifier(i).to_string(),
                    _ => unreachable!(),
                };
                params.push(name);
                if self.at(TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if params.len() > MAX_PARAMS {
            return Err(CompileError::TooManyParameters(self.loc()).into());
        }
        self.expect_delim(TokenKind::RParen, ")")?;

        self.scopes.push(FuncScope::new());
        for p in &params {
            self.make_local(p);
        }
        let body = self.parse_block()?;
        let finished = self.scopes.pop().unwrap();
        let captures = finished.upvals.into_iter().map(|(_, source)| source).collect();

        Ok(Expr::Function(Box::new(FunctionNode {
            params,
            body,
            locals_count: finished.locals.len() as u16,
            captures,
            name: None,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Module {
        parse("test", src).unwrap()
    }

    #[test]
    fn arithmetic_precedence_nests_mul_inside_add() {
        let m = parse_ok("return 2 + 3 * 4");
        match &m.body[0] {
            Stmt::Return(_, Some(Expr::Binary(BinOp::Add, lhs, rhs))) => {
                assert_eq!(**lhs, Expr::Number(2.0));
                assert_eq!(**rhs, Expr::Binary(BinOp::Mul, Box::new(Expr::Number(3.0)), Box::new(Expr::Number(4.0))));
            }
            other => panic!("unexpected ast: {other:?}"),
        }
    }

    #[test]
    fn lt_rewrites_to_gt_with_swapped_operands() {
        let m = parse_ok("return a < b");
        match &m.body[0] {
            Stmt::Return(_, Some(Expr::Binary(BinOp::Gt, lhs, rhs))) => {
                assert_eq!(**lhs, Expr::Name(NameRef::Global("b".into())));
                assert_eq!(**rhs, Expr::Name(NameRef::Global("a".into())));
            }
            other => panic!("unexpected ast: {other:?}"),
        }
    }

    #[test]
    fn var_then_reference_resolves_to_local() {
        let m = parse_ok("var a = 1\nreturn a");
        assert!(matches!(m.body[0], Stmt::VarDecl(_, 0, Some(Expr::Number(_)))));
        assert!(matches!(m.body[1], Stmt::Return(_, Some(Expr::Name(NameRef::Local(0))))));
    }

    #[test]
    fn unresolved_identifier_is_global() {
        let m = parse_ok("return undeclared");
        assert!(matches!(m.body[0], Stmt::Return(_, Some(Expr::Name(NameRef::Global(_))))));
    }

    #[test]
    fn nested_function_captures_outer_local_as_upvalue() {
        let m = parse_ok("var n = 7\nvar g = fn() { return n }\nreturn g");
        match &m.body[1] {
            Stmt::VarDecl(_, _, Some(Expr::Function(f))) => {
                assert_eq!(f.captures, vec![CaptureSource::Local(0)]);
                assert!(matches!(f.body[0], Stmt::Return(_, Some(Expr::Name(NameRef::Upval(0))))));
            }
            other => panic!("unexpected ast: {other:?}"),
        }
    }

    #[test]
    fn capture_propagates_through_an_intermediate_scope() {
        let src = "var n = 1\nvar outer = fn() { var inner = fn() { return n } return inner }\nreturn outer";
        let m = parse_ok(src);
        match &m.body[1] {
            Stmt::VarDecl(_, _, Some(Expr::Function(outer))) => {
                // outer itself must have forwarded `n` as its own upvalue.
                assert_eq!(outer.captures, vec![CaptureSource::Local(0)]);
                match &outer.body[0] {
                    Stmt::VarDecl(_, _, Some(Expr::Function(inner))) => {
                        assert_eq!(inner.captures, vec![CaptureSource::Upval(0)]);
                    }
                    other => panic!("unexpected ast: {other:?}"),
                }
            }
            other => panic!("unexpected ast: {other:?}"),
        }
    }

    #[test]
    fn dot_is_sugar_for_string_index() {
        let m = parse_ok("return t.a");
        match &m.body[0] {
            Stmt::Return(_, Some(Expr::Index(obj, key))) => {
                assert_eq!(**obj, Expr::Name(NameRef::Global("t".into())));
                assert_eq!(**key, Expr::Str("a".into()));
            }
            other => panic!("unexpected ast: {other:?}"),
        }
    }

    #[test]
    fn table_literal_parses_identifier_keys() {
        let m = parse_ok("return { a: 1, b: 2 }");
        match &m.body[0] {
            Stmt::Return(_, Some(Expr::Table(pairs))) => {
                assert_eq!(pairs.len(), 2);
                assert_eq!(pairs[0].0, Expr::Str("a".into()));
            }
            other => panic!("unexpected ast: {other:?}"),
        }
    }

    #[test]
    fn bracket_after_operand_is_index_otherwise_array_literal() {
        let m = parse_ok("var a = [1, 2]\nreturn a[0]");
        assert!(matches!(m.body[0], Stmt::VarDecl(_, 0, Some(Expr::Array(_)))));
        assert!(matches!(m.body[1], Stmt::Return(_, Some(Expr::Index(_, _)))));
    }

    #[test]
    fn call_with_too_many_arguments_is_rejected() {
        let args = (0..17).map(|i| i.to_string()).collect::<Vec<_>>().join(", ");
        let src = format!("return f({args})");
        let err = parse("test", &src).unwrap_err();
        assert!(matches!(err, Error::Parse(ParseError::TooManyArguments(_))));
    }

    #[test]
    fn duplicate_else_is_rejected() {
        let err = parse("test", "if a { } else { } else { }").unwrap_err();
        assert!(matches!(err, Error::Parse(ParseError::DuplicateElse(_))));
    }

    #[test]
    fn unclosed_block_is_rejected() {
        let err = parse("test", "if a { return 1").unwrap_err();
        assert!(matches!(err, Error::Parse(ParseError::Unclosed(_, "{"))));
    }

    #[test]
    fn for_loop_allocates_hidden_iter_and_visible_var_locals() {
        let m = parse_ok("for x in r { }");
        match &m.body[0] {
            Stmt::For { iter_slot, var_slot, .. } => {
                assert_eq!(*iter_slot, 0);
                assert_eq!(*var_slot, 1);
            }
            other => panic!("unexpected ast: {other:?}"),
        }
    }
}
