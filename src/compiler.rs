//! Tree-walk compiler: lowers parsed statements/expressions into
//! `ChunkObj`/`FnObj` code+constants+debug buffers. Locations on
//! statement nodes are carried through to tag every op emitted while
//! compiling that statement, for debug maps and tracebacks; expressions
//! themselves carry no location (the original doesn't track one at that
//! granularity either).

use crate::ast::*;
use crate::bytecode::{encode_offset, Instr, Op};
use crate::config::VmConfig;
use crate::error::{CompileError, Error, Location, Result};
use crate::heap::{FnObj, Heap, ObjectKind};
use crate::parser::Module as ParsedModule;
use crate::strings::Interner;
use crate::value::Value;

struct LoopCtx {
    header: usize,
    break_patches: Vec<usize>,
}

/// One compilation unit's mutable buffers (either the top-level module
/// or one function body).
struct Emitter {
    code: Vec<Instr>,
    constants: Vec<Value>,
    debug: Vec<(u32, u32)>,
    generate_debug: bool,
    loops: Vec<LoopCtx>,
}

impl Emitter {
    fn new(generate_debug: bool) -> Self {
        Emitter { code: Vec::new(), constants: Vec::new(), debug: Vec::new(), generate_debug, loops: Vec::new() }
    }

    fn emit(&mut self, op: Op, arg: u16, loc: &Location) -> usize {
        let index = self.code.len();
        self.code.push(Instr::new(op, arg));
        if self.generate_debug {
            self.debug.push((loc.line, loc.col));
        }
        index
    }

    fn emit_bare(&mut self, op: Op, loc: &Location) -> usize {
        self.emit(op, 0, loc)
    }

    /// Emit a jump with a placeholder argument, returning its index so
    /// the caller can patch it once the target address is known.
    fn emit_jump(&mut self, op: Op, loc: &Location) -> usize {
        self.emit(op, 0, loc)
    }

    fn patch_jump_here(&mut self, at: usize) {
        self.patch_jump_to(at, self.code.len());
    }

    fn patch_jump_to(&mut self, at: usize, target: usize) {
        let offset = (target as isize - (at as isize + 1)) as i16;
        self.code[at].arg = encode_offset(offset);
    }

    /// Deduplicate constants by value equality.
    fn push_constant(&mut self, value: Value) -> u16 {
        if let Some(i) = self.constants.iter().position(|c| *c == value) {
            return i as u16;
        }
        let idx = self.constants.len() as u16;
        self.constants.push(value);
        idx
    }
}

pub struct Compiler<'a> {
    module: String,
    heap: &'a mut Heap,
    interner: &'a mut Interner,
    generate_debug: bool,
}

impl<'a> Compiler<'a> {
    pub fn new(module: &str, heap: &'a mut Heap, interner: &'a mut Interner, config: &VmConfig) -> Self {
        Compiler { module: module.to_string(), heap, interner, generate_debug: config.generate_debug }
    }

    /// Compile a whole parsed module into a top-level chunk. Mirrors
    /// function compilation (leading `PUSH` prelude, trailing `RET 0`
    /// fallback) since the VM executes a chunk's code the same way it
    /// executes a function's, just without an enclosing `CALL`.
    pub fn compile_module(mut self, parsed: &ParsedModule) -> Result<crate::heap::ChunkObj> {
        let mut em = Emitter::new(self.generate_debug);
        let top = Location::new(self.module.clone(), 1, 1);
        if parsed.locals_count > 0 {
            em.emit(Op::Push, parsed.locals_count, &top);
        }
        for stmt in &parsed.body {
            self.compile_stmt(&mut em, stmt)?;
        }
        em.emit_bare(Op::Ret, &top);
        Ok(crate::heap::ChunkObj {
            module: self.module,
            code: em.code,
            constants: em.constants,
            debug: em.debug,
        })
    }

    fn str_constant(&mut self, em: &mut Emitter, s: &str) -> u16 {
        let r = self.interner.intern(s.as_bytes());
        em.push_constant(Value::string(r))
    }

    // ---- statements ----

    fn compile_stmt(&mut self, em: &mut Emitter, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::If(loc, arms, else_body) => self.compile_if(em, loc, arms, else_body),
            Stmt::For { loc, iter_slot, var_slot, iter, body } => {
                self.compile_for(em, loc, *iter_slot, *var_slot, iter, body)
            }
            Stmt::While(loc, cond, body) => self.compile_while(em, loc, cond, body),
            Stmt::Return(loc, value) => self.compile_return(em, loc, value),
            Stmt::Break(loc) => self.compile_break(em, loc),
            Stmt::VarDecl(loc, slot, init) => self.compile_var_decl(em, loc, *slot, init),
            Stmt::Assign(loc, target, value) => self.compile_assign(em, loc, target, value),
            Stmt::Expr(loc, expr) => {
                self.compile_expr(em, loc, expr)?;
                em.emit_bare(Op::Pop, loc);
                Ok(())
            }
        }
    }

    /// `<cond>; JMPC next; <body>; JMP end` per arm, `end` shared across
    /// every arm and the trailing `else`.
    fn compile_if(
        &mut self,
        em: &mut Emitter,
        loc: &Location,
        arms: &[(Expr, Vec<Stmt>)],
        else_body: &Option<Vec<Stmt>>,
    ) -> Result<()> {
        let mut end_patches = Vec::new();
        for (cond, body) in arms {
            self.compile_expr(em, loc, cond)?;
            let skip = em.emit_jump(Op::Jmpc, loc);
            for stmt in body {
                self.compile_stmt(em, stmt)?;
            }
            end_patches.push(em.emit_jump(Op::Jmp, loc));
            em.patch_jump_here(skip);
        }
        if let Some(body) = else_body {
            for stmt in body {
                self.compile_stmt(em, stmt)?;
            }
        }
        for patch in end_patches {
            em.patch_jump_here(patch);
        }
        Ok(())
    }

    /// `header: LOAD __iter; CALL 0; STORE x; LOAD x; JMPN end; <body>;
    /// JMP header; end:`. The iterator is evaluated once up front
    /// and stashed in the hidden `__iter` local.
    fn compile_for(
        &mut self,
        em: &mut Emitter,
        loc: &Location,
        iter_slot: u16,
        var_slot: u16,
        iter: &Expr,
        body: &[Stmt],
    ) -> Result<()> {
        self.compile_expr(em, loc, iter)?;
        em.emit(Op::Store, iter_slot, loc);

        let header = em.code.len();
        em.emit(Op::Load, iter_slot, loc);
        em.emit(Op::Call, 0, loc);
        em.emit(Op::Store, var_slot, loc);
        em.emit(Op::Load, var_slot, loc);
        let end_jump = em.emit_jump(Op::Jmpn, loc);

        em.loops.push(LoopCtx { header, break_patches: Vec::new() });
        for stmt in body {
            self.compile_stmt(em, stmt)?;
        }
        let ctx = em.loops.pop().unwrap();

        let back = em.emit_jump(Op::Jmp, loc);
        em.patch_jump_to(back, header);
        em.patch_jump_here(end_jump);
        for patch in ctx.break_patches {
            em.patch_jump_here(patch);
        }
        Ok(())
    }

    /// `header: <cond>; JMPC end; <body>; JMP header; end:`.
    fn compile_while(&mut self, em: &mut Emitter, loc: &Location, cond: &Expr, body: &[Stmt]) -> Result<()> {
        let header = em.code.len();
        self.compile_expr(em, loc, cond)?;
        let end_jump = em.emit_jump(Op::Jmpc, loc);

        em.loops.push(LoopCtx { header, break_patches: Vec::new() });
        for stmt in body {
            self.compile_stmt(em, stmt)?;
        }
        let ctx = em.loops.pop().unwrap();

        let back = em.emit_jump(Op::Jmp, loc);
        em.patch_jump_to(back, header);
        em.patch_jump_here(end_jump);
        for patch in ctx.break_patches {
            em.patch_jump_here(patch);
        }
        Ok(())
    }

    fn compile_return(&mut self, em: &mut Emitter, loc: &Location, value: &Option<Expr>) -> Result<()> {
        match value {
            Some(expr) => {
                self.compile_expr(em, loc, expr)?;
                em.emit(Op::Ret, 1, loc);
            }
            None => {
                em.emit(Op::Ret, 0, loc);
            }
        }
        Ok(())
    }

    /// `break` outside a loop is a compile error, not a silently
    /// unpatched `JMP 0`.
    fn compile_break(&mut self, em: &mut Emitter, loc: &Location) -> Result<()> {
        if em.loops.is_empty() {
            return Err(Error::Compile(CompileError::BreakOutsideLoop(loc.clone())));
        }
        let patch = em.emit_jump(Op::Jmp, loc);
        em.loops.last_mut().unwrap().break_patches.push(patch);
        Ok(())
    }

    fn compile_var_decl(&mut self, em: &mut Emitter, loc: &Location, slot: u16, init: &Option<Expr>) -> Result<()> {
        match init {
            Some(expr) => self.compile_expr(em, loc, expr)?,
            None => {
                em.emit_bare(Op::PushN, loc);
            }
        }
        em.emit(Op::Store, slot, loc);
        Ok(())
    }

    fn compile_assign(&mut self, em: &mut Emitter, loc: &Location, target: &Expr, value: &Expr) -> Result<()> {
        match target {
            Expr::Name(NameRef::Local(slot)) => {
                self.compile_expr(em, loc, value)?;
                em.emit(Op::Store, *slot, loc);
                Ok(())
            }
            Expr::Name(NameRef::Upval(slot)) => {
                self.compile_expr(em, loc, value)?;
                em.emit(Op::StoreUp, *slot, loc);
                Ok(())
            }
            Expr::Name(NameRef::Global(name)) => {
                Err(Error::Compile(CompileError::AssignToUndeclaredGlobal(loc.clone(), name.clone())))
            }
            Expr::Index(obj, key) => {
                self.compile_expr(em, loc, obj)?;
                self.compile_expr(em, loc, key)?;
                self.compile_expr(em, loc, value)?;
                em.emit_bare(Op::SetT, loc);
                Ok(())
            }
            _ => Err(Error::Compile(CompileError::InvalidAssignTarget(loc.clone()))),
        }
    }

    // ---- expressions ----

    fn compile_expr(&mut self, em: &mut Emitter, loc: &Location, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Number(n) => {
                let idx = em.push_constant(Value::number(*n));
                em.emit(Op::PushC, idx, loc);
            }
            Expr::Str(s) => {
                let idx = self.str_constant(em, s);
                em.emit(Op::PushC, idx, loc);
            }
            Expr::True => {
                em.emit_bare(Op::PushT, loc);
            }
            Expr::False => {
                em.emit_bare(Op::PushF, loc);
            }
            Expr::Null => {
                em.emit_bare(Op::PushN, loc);
            }
            Expr::Name(NameRef::Local(slot)) => {
                em.emit(Op::Load, *slot, loc);
            }
            Expr::Name(NameRef::Upval(slot)) => {
                em.emit(Op::LoadUp, *slot, loc);
            }
            Expr::Name(NameRef::Global(name)) => {
                let idx = self.str_constant(em, name);
                em.emit(Op::PushC, idx, loc);
                em.emit_bare(Op::GetG, loc);
            }
            Expr::Unary(UnOp::Neg, inner) => {
                self.compile_expr(em, loc, inner)?;
                em.emit_bare(Op::Neg, loc);
            }
            Expr::Unary(UnOp::Not, inner) => {
                self.compile_expr(em, loc, inner)?;
                em.emit_bare(Op::Not, loc);
            }
            Expr::Binary(BinOp::And, lhs, rhs) => self.compile_and(em, loc, lhs, rhs)?,
            Expr::Binary(BinOp::Or, lhs, rhs) => self.compile_or(em, loc, lhs, rhs)?,
            Expr::Binary(op, lhs, rhs) => {
                // Left then right, in source order; the VM pops right
                // then left and pushes `left OP right` — functionally
                // identical to the original's right-then-left compile
                // order paired with its `TOP = POP() OP TOP` dispatch
                // idiom, just simpler to read. See DESIGN.md.
                self.compile_expr(em, loc, lhs)?;
                self.compile_expr(em, loc, rhs)?;
                em.emit_bare(Self::binop_op(*op), loc);
            }
            Expr::Call(callee, args) => {
                self.compile_expr(em, loc, callee)?;
                for arg in args {
                    self.compile_expr(em, loc, arg)?;
                }
                em.emit(Op::Call, args.len() as u16, loc);
            }
            Expr::Index(obj, key) => {
                self.compile_expr(em, loc, obj)?;
                self.compile_expr(em, loc, key)?;
                em.emit_bare(Op::GetT, loc);
            }
            Expr::Array(items) => {
                for item in items {
                    self.compile_expr(em, loc, item)?;
                }
                em.emit(Op::MakeA, items.len() as u16, loc);
            }
            Expr::Table(pairs) => {
                for (key, value) in pairs {
                    self.compile_expr(em, loc, key)?;
                    self.compile_expr(em, loc, value)?;
                }
                em.emit(Op::MakeT, pairs.len() as u16, loc);
            }
            Expr::Function(node) => self.compile_function(em, loc, node)?,
        }
        Ok(())
    }

    fn binop_op(op: BinOp) -> Op {
        match op {
            BinOp::Add => Op::Add,
            BinOp::Sub => Op::Sub,
            BinOp::Mul => Op::Mul,
            BinOp::Div => Op::Div,
            BinOp::Gt => Op::Gt,
            BinOp::Gte => Op::Gte,
            BinOp::Eq => Op::Eq,
            BinOp::Neq => Op::Neq,
            BinOp::And | BinOp::Or => unreachable!("and/or short-circuit through compile_and/compile_or"),
        }
    }

    /// Short-circuits via `JMPC`, producing a strict `bool` rather than
    /// either operand's own value.
    fn compile_and(&mut self, em: &mut Emitter, loc: &Location, lhs: &Expr, rhs: &Expr) -> Result<()> {
        self.compile_expr(em, loc, lhs)?;
        let short_circuit = em.emit_jump(Op::Jmpc, loc);
        self.compile_expr(em, loc, rhs)?;
        em.emit_bare(Op::Not, loc);
        em.emit_bare(Op::Not, loc); // coerce rhs to strict bool
        let end = em.emit_jump(Op::Jmp, loc);
        em.patch_jump_here(short_circuit);
        em.emit_bare(Op::PushF, loc);
        em.patch_jump_here(end);
        Ok(())
    }

    /// Short-circuits via `JMPC`/`JMP`, producing a strict `bool` rather
    /// than either operand's own value.
    fn compile_or(&mut self, em: &mut Emitter, loc: &Location, lhs: &Expr, rhs: &Expr) -> Result<()> {
        self.compile_expr(em, loc, lhs)?;
        let to_rhs = em.emit_jump(Op::Jmpc, loc);
        em.emit_bare(Op::PushT, loc);
        let end = em.emit_jump(Op::Jmp, loc);
        em.patch_jump_here(to_rhs);
        self.compile_expr(em, loc, rhs)?;
        em.emit_bare(Op::Not, loc);
        em.emit_bare(Op::Not, loc); // coerce rhs to strict bool
        em.patch_jump_here(end);
        Ok(())
    }

    /// Allocates the `Fn` heap object, compiles its body with a fresh
    /// `Emitter`, and — if it captured anything — pushes the captures
    /// (outer-to-inner order reversed, see DESIGN.md) followed by the
    /// function constant, then `CLOSE k`.
    fn compile_function(&mut self, em: &mut Emitter, loc: &Location, node: &FunctionNode) -> Result<()> {
        let mut inner = Emitter::new(self.generate_debug);
        let arity = node.params.len() as u16;
        let extra_locals = node.locals_count.saturating_sub(arity);
        if extra_locals > 0 {
            inner.emit(Op::Push, extra_locals, loc);
        }
        for stmt in &node.body {
            self.compile_stmt(&mut inner, stmt)?;
        }
        inner.emit_bare(Op::Ret, loc);

        let fn_obj = FnObj {
            module: self.module.clone(),
            arity: arity as u8,
            code: inner.code,
            constants: inner.constants,
            debug: inner.debug,
            locals: node.locals_count,
        };
        let fn_index = self.heap.allocate(ObjectKind::Fn(fn_obj));
        let fn_const = em.push_constant(Value::object(fn_index));

        if node.captures.is_empty() {
            em.emit(Op::PushC, fn_const, loc);
            return Ok(());
        }

        for capture in node.captures.iter().rev() {
            match capture {
                CaptureSource::Local(slot) => {
                    em.emit(Op::Load, *slot, loc);
                }
                CaptureSource::Upval(slot) => {
                    em.emit(Op::LoadUp, *slot, loc);
                }
            }
        }
        em.emit(Op::PushC, fn_const, loc);
        em.emit(Op::Close, node.captures.len() as u16, loc);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Op;
    use crate::parser::parse;

    fn compile_src(src: &str) -> crate::heap::ChunkObj {
        let parsed = parse("test", src).unwrap();
        let mut heap = Heap::new();
        let mut interner = Interner::new(64);
        let config = VmConfig::default();
        Compiler::new("test", &mut heap, &mut interner, &config).compile_module(&parsed).unwrap()
    }

    #[test]
    fn expression_statement_is_followed_by_pop() {
        let chunk = compile_src("1 + 1");
        assert!(chunk.code.iter().any(|i| i.op == Op::Pop));
    }

    #[test]
    fn if_without_else_shares_one_end_label() {
        let chunk = compile_src("if true { return 1 }\nreturn 2");
        // JMPC from the condition, JMP at the end of the body, then the
        // second `return` — three control-flow-relevant ops at least.
        assert!(chunk.code.iter().any(|i| i.op == Op::Jmpc));
        assert!(chunk.code.iter().any(|i| i.op == Op::Jmp));
    }

    #[test]
    fn break_outside_a_loop_is_a_compile_error() {
        let parsed = parse("test", "break").unwrap();
        let mut heap = Heap::new();
        let mut interner = Interner::new(64);
        let config = VmConfig::default();
        let err = Compiler::new("test", &mut heap, &mut interner, &config)
            .compile_module(&parsed)
            .unwrap_err();
        assert!(matches!(err, Error::Compile(CompileError::BreakOutsideLoop(_))));
    }

    #[test]
    fn break_inside_while_patches_to_the_loop_end() {
        let chunk = compile_src("while true { break }");
        // the while's own JMPC-to-end and the break's JMP-to-end should
        // both land past the loop body, i.e. at or after the backward
        // JMP that closes the loop.
        let back_jmp = chunk.code.iter().position(|i| i.op == Op::Jmp).unwrap();
        assert!(back_jmp < chunk.code.len());
    }

    #[test]
    fn assigning_to_an_undeclared_global_is_a_compile_error() {
        let parsed = parse("test", "undeclared = 1").unwrap();
        let mut heap = Heap::new();
        let mut interner = Interner::new(64);
        let config = VmConfig::default();
        let err = Compiler::new("test", &mut heap, &mut interner, &config)
            .compile_module(&parsed)
            .unwrap_err();
        assert!(matches!(err, Error::Compile(CompileError::AssignToUndeclaredGlobal(_, _))));
    }

    #[test]
    fn function_literal_allocates_a_heap_fn_object() {
        let parsed = parse("test", "var f = fn(x) { return x }").unwrap();
        let mut heap = Heap::new();
        let mut interner = Interner::new(64);
        let config = VmConfig::default();
        let before = heap.live_count;
        Compiler::new("test", &mut heap, &mut interner, &config).compile_module(&parsed).unwrap();
        assert_eq!(heap.live_count, before + 1);
    }

    #[test]
    fn captured_local_emits_close_with_capture_count() {
        let parsed = parse("test", "var n = 1\nvar g = fn() { return n }").unwrap();
        let mut heap = Heap::new();
        let mut interner = Interner::new(64);
        let config = VmConfig::default();
        let chunk = Compiler::new("test", &mut heap, &mut interner, &config).compile_module(&parsed).unwrap();
        let close = chunk.code.iter().find(|i| i.op == Op::Close).unwrap();
        assert_eq!(close.arg, 1);
    }

    #[test]
    fn and_or_never_emit_the_eager_and_or_opcodes() {
        let chunk = compile_src("return true and false\nreturn true or false");
        assert!(!chunk.code.iter().any(|i| i.op == Op::And || i.op == Op::Or));
    }
}
