// rillscript: an embeddable, dynamically-typed scripting language.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! The stack-based dispatch loop: a fixed-depth value stack, a
//! fixed-depth frame stack, and a `match` over `Op` that advances `ip`
//! by one unless a jump rewrites it.
//!
//! A frame's code/constants/debug buffers are cloned out of the heap
//! object (`Chunk`/`Fn`) at call time rather than borrowed, which
//! sidesteps holding a `Heap` borrow across the whole dispatch loop
//! (the loop also needs `&mut self.heap` for allocation ops like
//! `MAKET`/`CLOSE`). Captures are the exception: a closure's upvalues
//! stay in its `ClosureObj` on the heap, and a frame running that
//! closure's body only keeps the heap index, not a copy — `LOADUP`/
//! `STOREUP` read and write through that index so a stateful closure
//! (a counter, an iterator) sees its own mutations on the next call.
//! The heap copy of code/constants — reachable through the pinned
//! top-level chunk and, transitively, every nested `Fn`/`Closure` it
//! references — remains the actual GC root; see `collect()` below for
//! why a running frame's own closure index still needs to be rooted too.

use crate::bytecode::{decode_offset, Instr, Op};
use crate::config::VmConfig;
use crate::error::{Error, Location, Result, RuntimeError};
use crate::heap::{ArrayObj, ClosureObj, Heap, ObjectKind, TableObj};
use crate::strings::Interner;
use crate::value::Value;

struct Frame {
    module: String,
    code: Vec<Instr>,
    constants: Vec<Value>,
    debug: Vec<(u32, u32)>,
    /// Heap index of the closure this frame is running, if any. `None`
    /// for a bare `Chunk`/`Fn` call, which has no upvalues to reach.
    closure_index: Option<u32>,
    ip: usize,
    start: usize,
}

impl Frame {
    fn loc(&self) -> Location {
        match self.debug.get(self.ip.saturating_sub(1)) {
            Some((line, col)) => Location::new(self.module.clone(), *line, *col),
            None => Location::new(self.module.clone(), 0, 0),
        }
    }
}

/// What a `dispatch_call` did: either it pushed a new frame that still
/// needs to run to completion, or (a native callback) it already ran
/// inline and left its result count on the stack.
enum CallOutcome {
    Pushed,
    Immediate(u16),
}

pub struct Vm {
    pub(crate) config: VmConfig,
    pub(crate) heap: Heap,
    pub(crate) interner: Interner,
    pub(crate) globals_index: u32,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    /// The `arg` of the most recently executed `RET`, i.e. whether that
    /// return statement carried a value (1) or not (0). `Op::Ret` always
    /// pushes a value (`null` for `RET 0`) so the bytecode stack
    /// discipline that chained expressions rely on never changes depth
    /// unexpectedly; this field lets the embedding boundary
    /// (`call_value`/`exec`) still report the §6 "0 or 1 return values"
    /// contract accurately to the host.
    last_return_count: u16,
    /// The host's fatal-error callback. Invoked with the formatted
    /// traceback right before `loadstring`/`dostring`/`exec` unwind and
    /// report failure to their caller.
    pub(crate) error_hook: Option<Box<dyn Fn(&str)>>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let mut heap = Heap::new();
        let globals_index = heap.allocate(ObjectKind::Table(TableObj::default()));
        heap.nocollect(globals_index);
        Vm {
            interner: Interner::new(config.dedup_table_size),
            heap,
            globals_index,
            config,
            stack: Vec::new(),
            frames: Vec::new(),
            last_return_count: 1,
            error_hook: None,
        }
    }

    pub(crate) fn globals(&self) -> Value {
        Value::object(self.globals_index)
    }

    // ---- raw stack access, shared with embed.rs ----

    pub fn push(&mut self, v: Value) -> Result<()> {
        if self.stack.len() >= self.config.stack_size as usize {
            return Err(Error::Runtime(RuntimeError::StackOverflow(self.current_loc())));
        }
        self.stack.push(v);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| Error::Runtime(RuntimeError::StackUnderflow(self.current_loc())))
    }

    pub(crate) fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn stack_at(&self, index_from_top: usize) -> Option<Value> {
        let len = self.stack.len();
        if index_from_top >= len {
            None
        } else {
            Some(self.stack[len - 1 - index_from_top])
        }
    }

    pub(crate) fn truncate_stack(&mut self, len: usize) {
        self.stack.truncate(len);
    }

    pub(crate) fn current_loc(&self) -> Location {
        match self.frames.last() {
            Some(f) => f.loc(),
            None => Location::new("<top>".to_string(), 0, 0),
        }
    }

    /// Every value reachable right now: the live stack, plus each active
    /// frame's constants and — for a frame running inside a closure —
    /// the closure object itself, which the callee removed from the
    /// stack on entry (see `enter_frame`). Rooting the closure value
    /// transitively reaches its captures and its `Fn` through
    /// `Heap::collect`'s own tracing, so a constant or a captured value
    /// that isn't otherwise referenced once its owning `Closure`/`Chunk`
    /// value is popped off the stack still survives for the duration of
    /// the call.
    pub fn collect(&mut self) -> u32 {
        let mut roots: Vec<Value> = self.stack.clone();
        for frame in &self.frames {
            if let Some(idx) = frame.closure_index {
                roots.push(Value::object(idx));
            }
            roots.extend(frame.constants.iter().copied());
        }
        let globals = self.globals();
        self.heap.collect(&roots, globals, &mut self.interner)
    }

    // ---- calling into script/native callables ----

    /// Call `callee` (an embedding-API value, not itself pushed by the
    /// caller) with the top `argc` stack values as arguments, and run
    /// until that frame (and everything it calls) returns. `callee`
    /// is spliced in just beneath the args to match the internal
    /// `[callee, arg1, .., argN]` layout `Op::Call` builds, since
    /// `dispatch_call`'s frame-entry logic locates the callee by
    /// position rather than by a separately threaded parameter.
    ///
    /// Returns the value left behind (`null` when nothing was returned)
    /// together with the actual return-value count (0 or 1) so the
    /// embedding boundary can honor "return with no expression returns
    /// zero values" rather than always reporting 1.
    pub fn call_value(&mut self, callee: Value, argc: u8) -> Result<(Value, u16)> {
        let stack_base = self.stack.len().saturating_sub(argc as usize);
        self.stack.insert(stack_base, callee);
        let frame_base = self.frames.len();
        let outcome = match self.dispatch_call(callee, argc) {
            Ok(o) => o,
            Err(e) => {
                self.frames.truncate(frame_base);
                self.stack.truncate(stack_base);
                return Err(e);
            }
        };
        let count = match outcome {
            CallOutcome::Immediate(n) => n,
            CallOutcome::Pushed => {
                while self.frames.len() > frame_base {
                    if let Err(e) = self.step() {
                        self.frames.truncate(frame_base);
                        self.stack.truncate(stack_base);
                        return Err(e);
                    }
                }
                self.last_return_count
            }
        };
        let value = self.pop()?;
        Ok((if count == 1 { value } else { Value::NULL }, count))
    }

    /// Run a freshly pushed top-level chunk to completion (used by
    /// `dostring`/`loadstring`'s caller once the initial frame is in
    /// place).
    pub(crate) fn run_to_completion(&mut self) -> Result<Value> {
        let frame_base = self.frames.len().saturating_sub(1);
        while self.frames.len() > frame_base {
            self.step()?;
        }
        self.pop()
    }

    pub(crate) fn push_chunk_frame(&mut self, chunk: &crate::heap::ChunkObj) -> Result<()> {
        if self.frames.len() >= self.config.call_stack_size as usize {
            return Err(Error::Runtime(RuntimeError::CallStackOverflow(
                self.current_loc(),
                self.config.call_stack_size,
            )));
        }
        self.frames.push(Frame {
            module: chunk.module.clone(),
            code: chunk.code.clone(),
            constants: chunk.constants.clone(),
            debug: chunk.debug.clone(),
            closure_index: None,
            ip: 0,
            start: self.stack.len(),
        });
        Ok(())
    }

    /// Resolve `callee`'s object kind and either push a new frame (for a
    /// `Chunk`/`Fn`/`Closure`) or invoke a native callback inline.
    fn dispatch_call(&mut self, callee: Value, argc: u8) -> Result<CallOutcome> {
        let n = argc as usize;
        let Some(index) = callee.as_object() else {
            return Err(Error::Runtime(RuntimeError::NotCallable(self.current_loc())));
        };
        let Some(kind) = self.heap.get(index) else {
            return Err(Error::Runtime(RuntimeError::NotCallable(self.current_loc())));
        };
        match kind {
            ObjectKind::Fn(f) => {
                let (module, code, constants, debug) =
                    (f.module.clone(), f.code.clone(), f.constants.clone(), f.debug.clone());
                self.enter_frame(module, code, constants, debug, None, n)?;
                Ok(CallOutcome::Pushed)
            }
            ObjectKind::Chunk(c) => {
                let (module, code, constants, debug) =
                    (c.module.clone(), c.code.clone(), c.constants.clone(), c.debug.clone());
                self.enter_frame(module, code, constants, debug, None, n)?;
                Ok(CallOutcome::Pushed)
            }
            ObjectKind::Closure(closure) => {
                let fn_index = closure.fn_index;
                let Some(ObjectKind::Fn(f)) = self.heap.get(fn_index) else {
                    return Err(Error::Runtime(RuntimeError::NotCallable(self.current_loc())));
                };
                let (module, code, constants, debug) =
                    (f.module.clone(), f.code.clone(), f.constants.clone(), f.debug.clone());
                // `index` is the closure's own heap slot; LOADUP/STOREUP
                // read and write its captures directly so mutations
                // persist across separate calls to the same closure.
                self.enter_frame(module, code, constants, debug, Some(index), n)?;
                Ok(CallOutcome::Pushed)
            }
            ObjectKind::Native(native) => {
                let callback = native.callback.clone();
                let loc = self.current_loc();
                // remove the callee itself; the callback sees exactly
                // `argc` args as the top of the stack.
                let callee_pos = self.stack.len().saturating_sub(n + 1);
                self.stack.remove(callee_pos);
                let produced = callback(self, argc);
                if produced == 0 {
                    self.push(Value::NULL)?;
                } else if self.stack.is_empty() {
                    return Err(Error::Runtime(RuntimeError::Library(
                        loc,
                        "native callback reported a return value but pushed none".to_string(),
                    )));
                }
                Ok(CallOutcome::Immediate(if produced == 0 { 0 } else { 1 }))
            }
            _ => Err(Error::Runtime(RuntimeError::NotCallable(self.current_loc()))),
        }
    }

    fn enter_frame(
        &mut self,
        module: String,
        code: Vec<Instr>,
        constants: Vec<Value>,
        debug: Vec<(u32, u32)>,
        closure_index: Option<u32>,
        argc: usize,
    ) -> Result<()> {
        if self.frames.len() >= self.config.call_stack_size as usize {
            return Err(Error::Runtime(RuntimeError::CallStackOverflow(
                self.current_loc(),
                self.config.call_stack_size,
            )));
        }
        let callee_pos = self.stack.len().saturating_sub(argc + 1);
        self.stack.remove(callee_pos);
        let start = self.stack.len() - argc;
        self.frames.push(Frame { module, code, constants, debug, closure_index, ip: 0, start });
        Ok(())
    }

    /// Execute exactly one instruction of the topmost frame, handling
    /// `CALL`/`RET` frame transitions inline.
    fn step(&mut self) -> Result<()> {
        let (op, arg, ip, frame_start) = {
            let frame = self.frames.last_mut().expect("step called with no active frame");
            let instr = frame.code.get(frame.ip).copied().unwrap_or(Instr::bare(Op::Ret));
            frame.ip += 1;
            (instr.op, instr.arg, frame.ip, frame.start)
        };
        let loc = self.current_loc();

        match op {
            Op::Nop => {}
            Op::Push => {
                for _ in 0..arg {
                    self.push(Value::NULL)?;
                }
            }
            Op::Dup => {
                let v = self.stack_at(0).ok_or_else(|| Error::Runtime(RuntimeError::StackUnderflow(loc.clone())))?;
                self.push(v)?;
            }
            Op::Pop => {
                self.pop()?;
            }
            Op::PushC => {
                let v = *self
                    .frames
                    .last()
                    .unwrap()
                    .constants
                    .get(arg as usize)
                    .ok_or_else(|| Error::Runtime(RuntimeError::Library(loc.clone(), "constant index out of range".into())))?;
                self.push(v)?;
            }
            Op::PushN => self.push(Value::NULL)?,
            Op::PushT => self.push(Value::TRUE)?,
            Op::PushF => self.push(Value::FALSE)?,
            Op::Add => self.numeric_binop(&loc, |a, b| a + b)?,
            Op::Sub => self.numeric_binop(&loc, |a, b| a - b)?,
            Op::Mul => self.numeric_binop(&loc, |a, b| a * b)?,
            Op::Div => self.numeric_binop(&loc, |a, b| a / b)?,
            Op::Neg => {
                let n = self.pop_number(&loc)?;
                self.push(Value::number(-n))?;
            }
            Op::Eq => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::boolean(a == b))?;
            }
            Op::Neq => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::boolean(a != b))?;
            }
            Op::Gt => {
                let b = self.pop_number(&loc)?;
                let a = self.pop_number(&loc)?;
                self.push(Value::boolean(a > b))?;
            }
            Op::Gte => {
                let b = self.pop_number(&loc)?;
                let a = self.pop_number(&loc)?;
                self.push(Value::boolean(a >= b))?;
            }
            // Kept for ISA parity (native code or a hand-built chunk may
            // still use the eager forms); the compiler never emits
            // these for `and`/`or` keywords — see compiler.rs.
            Op::And => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::boolean(a.is_truthy() && b.is_truthy()))?;
            }
            Op::Or => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::boolean(a.is_truthy() || b.is_truthy()))?;
            }
            Op::Not => {
                let v = self.pop()?;
                self.push(Value::boolean(!v.is_truthy()))?;
            }
            Op::Load => {
                let v = self
                    .stack
                    .get(frame_start + arg as usize)
                    .copied()
                    .ok_or_else(|| Error::Runtime(RuntimeError::StackUnderflow(loc.clone())))?;
                self.push(v)?;
            }
            Op::Store => {
                let v = self.pop()?;
                let slot = frame_start + arg as usize;
                if slot >= self.stack.len() {
                    return Err(Error::Runtime(RuntimeError::StackUnderflow(loc)));
                }
                self.stack[slot] = v;
            }
            Op::LoadUp => {
                let closure_index = self
                    .frames
                    .last()
                    .unwrap()
                    .closure_index
                    .ok_or_else(|| Error::Runtime(RuntimeError::Library(loc.clone(), "no active closure for upvalue access".into())))?;
                let v = match self.heap.get(closure_index) {
                    Some(ObjectKind::Closure(c)) => *c
                        .captures
                        .get(arg as usize)
                        .ok_or_else(|| Error::Runtime(RuntimeError::Library(loc.clone(), "upvalue index out of range".into())))?,
                    _ => return Err(Error::Runtime(RuntimeError::Library(loc, "upvalue index out of range".into()))),
                };
                self.push(v)?;
            }
            Op::StoreUp => {
                let v = self.pop()?;
                let closure_index = self
                    .frames
                    .last()
                    .unwrap()
                    .closure_index
                    .ok_or_else(|| Error::Runtime(RuntimeError::Library(loc.clone(), "no active closure for upvalue access".into())))?;
                match self.heap.get_mut(closure_index) {
                    Some(ObjectKind::Closure(c)) => {
                        if let Some(slot) = c.captures.get_mut(arg as usize) {
                            *slot = v;
                        } else {
                            return Err(Error::Runtime(RuntimeError::Library(loc, "upvalue index out of range".into())));
                        }
                    }
                    _ => return Err(Error::Runtime(RuntimeError::Library(loc, "upvalue index out of range".into()))),
                }
            }
            Op::Close => {
                let k = arg as usize;
                let fn_value = self.pop()?;
                let fn_index = fn_value
                    .as_object()
                    .ok_or_else(|| Error::Runtime(RuntimeError::NotCallable(loc.clone())))?;
                let mut captures = Vec::with_capacity(k);
                for _ in 0..k {
                    captures.push(self.pop()?);
                }
                let idx = self.heap.allocate(ObjectKind::Closure(ClosureObj { fn_index, captures }));
                self.push(Value::object(idx))?;
            }
            Op::Call => {
                let callee_pos = self.stack.len().saturating_sub(arg as usize + 1);
                let callee = *self
                    .stack
                    .get(callee_pos)
                    .ok_or_else(|| Error::Runtime(RuntimeError::StackUnderflow(loc.clone())))?;
                self.dispatch_call(callee, arg as u8)?;
            }
            Op::MakeT => {
                let k = arg as usize;
                let mut pairs = Vec::with_capacity(k);
                for _ in 0..k {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    pairs.push((key, value));
                }
                pairs.reverse();
                let mut table = TableObj::default();
                for (key, value) in pairs {
                    table.set(key, value);
                }
                let idx = self.heap.allocate(ObjectKind::Table(table));
                self.push(Value::object(idx))?;
            }
            Op::MakeA => {
                let k = arg as usize;
                let mut items = Vec::with_capacity(k);
                for _ in 0..k {
                    items.push(self.pop()?);
                }
                items.reverse();
                let idx = self.heap.allocate(ObjectKind::Array(ArrayObj { items }));
                self.push(Value::object(idx))?;
            }
            Op::SetT => {
                let value = self.pop()?;
                let key = self.pop()?;
                let obj = self.pop()?;
                self.table_set(&loc, obj, key, value)?;
            }
            Op::GetT => {
                let key = self.pop()?;
                let obj = self.pop()?;
                let v = self.table_get(&loc, obj, key)?;
                self.push(v)?;
            }
            Op::GetG => {
                let key = self.pop()?;
                let globals_index = self.globals_index;
                let v = match self.heap.get(globals_index) {
                    Some(ObjectKind::Table(t)) => t.get(key),
                    _ => Value::NULL,
                };
                self.push(v)?;
            }
            Op::Jmp => {
                let offset = decode_offset(arg);
                self.set_ip(ip, offset);
            }
            Op::Jmpc => {
                let v = self.pop()?;
                if !v.is_truthy() {
                    self.set_ip(ip, decode_offset(arg));
                }
            }
            Op::Jmpn => {
                let v = self.pop()?;
                if v.is_null() {
                    self.set_ip(ip, decode_offset(arg));
                }
            }
            Op::Ret => {
                let value = if arg == 1 { self.pop()? } else { Value::NULL };
                let frame = self.frames.pop().unwrap();
                self.stack.truncate(frame.start);
                self.push(value)?;
                self.last_return_count = arg;
            }
        }
        Ok(())
    }

    fn set_ip(&mut self, ip_after_instr: usize, offset: i16) {
        let frame = self.frames.last_mut().unwrap();
        frame.ip = (ip_after_instr as isize + offset as isize) as usize;
    }

    fn numeric_binop(&mut self, loc: &Location, f: impl Fn(f64, f64) -> f64) -> Result<()> {
        let b = self.pop_number(loc)?;
        let a = self.pop_number(loc)?;
        self.push(Value::number(f(a, b)))
    }

    fn pop_number(&mut self, loc: &Location) -> Result<f64> {
        let v = self.pop()?;
        v.as_number().ok_or_else(|| {
            Error::Runtime(RuntimeError::Library(loc.clone(), format!("expected a number, found {}", v.type_name())))
        })
    }

    fn table_set(&mut self, loc: &Location, obj: Value, key: Value, value: Value) -> Result<()> {
        let index = obj
            .as_object()
            .ok_or_else(|| Error::Runtime(RuntimeError::Library(loc.clone(), "cannot index into a non-object value".into())))?;
        match self.heap.get_mut(index) {
            Some(ObjectKind::Table(t)) => {
                t.set(key, value);
                Ok(())
            }
            Some(ObjectKind::Array(a)) => {
                let i = key
                    .as_number()
                    .ok_or_else(|| Error::Runtime(RuntimeError::Library(loc.clone(), "array index must be a number".into())))?
                    as usize;
                if i >= a.items.len() {
                    return Err(Error::Runtime(RuntimeError::Library(loc.clone(), "array index out of bounds".into())));
                }
                a.items[i] = value;
                Ok(())
            }
            _ => Err(Error::Runtime(RuntimeError::Library(loc.clone(), "value is not indexable".into()))),
        }
    }

    fn table_get(&mut self, loc: &Location, obj: Value, key: Value) -> Result<Value> {
        let index = obj
            .as_object()
            .ok_or_else(|| Error::Runtime(RuntimeError::Library(loc.clone(), "cannot index into a non-object value".into())))?;
        match self.heap.get(index) {
            Some(ObjectKind::Table(t)) => Ok(t.get(key)),
            Some(ObjectKind::Array(a)) => {
                let i = key
                    .as_number()
                    .ok_or_else(|| Error::Runtime(RuntimeError::Library(loc.clone(), "array index must be a number".into())))?
                    as usize;
                Ok(a.items.get(i).copied().unwrap_or(Value::NULL))
            }
            _ => Err(Error::Runtime(RuntimeError::Library(loc.clone(), "value is not indexable".into()))),
        }
    }

    /// `"<module>|<line>:<col>: <message>\ntraceback:\n(<module>|<line>:<col>)\n…"`,
    /// innermost frame first.
    pub fn format_traceback(&self, err: &Error) -> String {
        let mut out = err.to_string();
        out.push_str("\ntraceback:");
        for frame in self.frames.iter().rev() {
            out.push_str(&format!("\n({})", frame.loc()));
        }
        out
    }
}
