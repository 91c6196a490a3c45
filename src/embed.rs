//! The embedding surface: push/pop/at, table/array builders, native
//! registration, and the `loadstring`/`dostring`/`exec` trio that ties
//! the lexer/parser/compiler/VM pipeline together for a host. Grounded
//! in `vm.rs`'s `push`/`pop`/`stack_at` primitives (the only other
//! caller of those is `vm.rs` itself) plus the teacher's convention of
//! keeping the public API as a thin, `Result`-returning wrapper over the
//! internal engine.

use std::any::Any;
use std::rc::Rc;

use crate::compiler::Compiler;
use crate::error::{Error, Location, Result, RuntimeError};
use crate::heap::{ArrayObj, NativeObj, ObjectKind, PtrObj, TableObj};
use crate::parser::parse;
use crate::value::{KindSet, Value, ValueKindSet};
use crate::vm::Vm;

fn embed_loc() -> Location {
    Location::new("<embed>", 0, 0)
}

fn not_indexable(what: &'static str) -> Error {
    Error::Runtime(RuntimeError::Library(embed_loc(), format!("value is not a {what}")))
}

fn object_index(v: Value) -> Result<u32> {
    v.as_object().ok_or_else(|| Error::Runtime(RuntimeError::Library(embed_loc(), "expected a heap object".into())))
}

impl Vm {
    /// Construct a VM with the host's fatal-error callback. This crate
    /// has no analog of custom allocator hooks — ordinary Rust
    /// allocation plus `Drop` covers that role, see DESIGN.md — so only
    /// the error callback survives as an explicit parameter.
    pub fn open(config: crate::config::VmConfig, error_hook: impl Fn(&str) + 'static) -> Self {
        let mut vm = Vm::new(config);
        vm.error_hook = Some(Box::new(error_hook));
        vm
    }

    /// Explicit teardown, for parity with the original's `destroy` and
    /// because dropping a `Vm` mid-callback needs the same ordering
    /// guarantees as an explicit call. In Rust this is just `drop`;
    /// every owned sub-buffer (code, constants, captures, table
    /// buckets, intern strings, `Ptr` payloads) is released by the
    /// ordinary `Drop` glue the compiler generates, with no separate
    /// arena-destructor call needed on any path.
    pub fn destroy(self) {
        drop(self)
    }

    fn report_error(&mut self, err: &Error) {
        let message = self.format_traceback(err);
        log::error!("{}", message);
        if let Some(hook) = self.error_hook.take() {
            hook(&message);
            self.error_hook = Some(hook);
        }
    }

    // ---- stack access ----

    /// Peek `index_from_top` slots down from the top of the value stack
    /// without popping.
    pub fn at(&self, index_from_top: usize) -> Option<Value> {
        self.stack_at(index_from_top)
    }

    /// Check `v` against a set of acceptable shapes in one call,
    /// producing a single located type-mismatch error instead of a
    /// native callback composing its own ad hoc message. Meant for
    /// native functions validating arguments pulled off the stack via
    /// `at`/`pop`.
    pub fn expect_kind(&self, v: Value, allowed: ValueKindSet) -> Result<Value> {
        if allowed.contains(v.kind()) {
            Ok(v)
        } else {
            Err(Error::Runtime(RuntimeError::TypeMismatch(embed_loc(), KindSet(allowed), v.type_name())))
        }
    }

    // ---- numbers, strings ----

    pub fn make_number(&self, n: f64) -> Value {
        Value::number(n)
    }

    pub fn get_number(&self, v: Value) -> Option<f64> {
        v.as_number()
    }

    pub fn make_string(&mut self, s: &str) -> Value {
        let r = self.interner.intern(s.as_bytes());
        Value::string(r)
    }

    pub fn get_string(&self, v: Value) -> Option<&[u8]> {
        v.as_string().map(|r| self.interner.get(r))
    }

    // ---- tables ----

    pub fn make_table(&mut self) -> Value {
        let idx = self.heap.allocate(ObjectKind::Table(TableObj::default()));
        Value::object(idx)
    }

    pub fn table_set(&mut self, table: Value, key: Value, value: Value) -> Result<()> {
        let idx = object_index(table)?;
        match self.heap.get_mut(idx) {
            Some(ObjectKind::Table(t)) => {
                t.set(key, value);
                Ok(())
            }
            _ => Err(not_indexable("table")),
        }
    }

    pub fn table_get(&self, table: Value, key: Value) -> Result<Value> {
        let idx = object_index(table)?;
        match self.heap.get(idx) {
            Some(ObjectKind::Table(t)) => Ok(t.get(key)),
            _ => Err(not_indexable("table")),
        }
    }

    /// Nulls the value in place without removing the bucket entry.
    pub fn table_pop(&mut self, table: Value, key: Value) -> Result<bool> {
        let idx = object_index(table)?;
        match self.heap.get_mut(idx) {
            Some(ObjectKind::Table(t)) => Ok(t.pop(key)),
            _ => Err(not_indexable("table")),
        }
    }

    // ---- arrays ----

    pub fn make_array(&mut self) -> Value {
        let idx = self.heap.allocate(ObjectKind::Array(ArrayObj::default()));
        Value::object(idx)
    }

    pub fn array_push(&mut self, array: Value, value: Value) -> Result<()> {
        let idx = object_index(array)?;
        match self.heap.get_mut(idx) {
            Some(ObjectKind::Array(a)) => {
                a.items.push(value);
                Ok(())
            }
            _ => Err(not_indexable("array")),
        }
    }

    pub fn array_at(&self, array: Value, index: usize) -> Result<Value> {
        let idx = object_index(array)?;
        match self.heap.get(idx) {
            Some(ObjectKind::Array(a)) => a
                .items
                .get(index)
                .copied()
                .ok_or_else(|| Error::Runtime(RuntimeError::Library(embed_loc(), "array index out of bounds".into()))),
            _ => Err(not_indexable("array")),
        }
    }

    pub fn array_remove(&mut self, array: Value, index: usize) -> Result<Value> {
        let idx = object_index(array)?;
        match self.heap.get_mut(idx) {
            Some(ObjectKind::Array(a)) if index < a.items.len() => Ok(a.items.remove(index)),
            Some(ObjectKind::Array(_)) => {
                Err(Error::Runtime(RuntimeError::Library(embed_loc(), "array index out of bounds".into())))
            }
            _ => Err(not_indexable("array")),
        }
    }

    pub fn array_length(&self, array: Value) -> Result<usize> {
        let idx = object_index(array)?;
        match self.heap.get(idx) {
            Some(ObjectKind::Array(a)) => Ok(a.items.len()),
            _ => Err(not_indexable("array")),
        }
    }

    // ---- native callbacks & opaque host pointers ----

    /// Register a native callback: arguments are the topmost `argc`
    /// stack slots when it runs; it pops them and returns 0 or 1 to
    /// report how many values it pushed back.
    pub fn make_native(&mut self, name: impl Into<String>, f: impl Fn(&mut Vm, u8) -> u8 + 'static) -> Value {
        let idx = self.heap.allocate(ObjectKind::Native(NativeObj { name: name.into(), callback: Rc::new(f) }));
        Value::object(idx)
    }

    pub fn make_ptr(&mut self, payload: Box<dyn Any>) -> Value {
        let idx = self.heap.allocate(ObjectKind::Ptr(PtrObj { payload }));
        Value::object(idx)
    }

    pub fn get_ptr(&self, v: Value) -> Option<&dyn Any> {
        let idx = v.as_object()?;
        match self.heap.get(idx) {
            Some(ObjectKind::Ptr(p)) => Some(p.payload.as_ref()),
            _ => None,
        }
    }

    // ---- GC pinning ----

    pub fn nocollect(&mut self, v: Value) {
        if let Some(idx) = v.as_object() {
            self.heap.nocollect(idx);
        }
    }

    pub fn resumecollect(&mut self, v: Value) {
        if let Some(idx) = v.as_object() {
            self.heap.resumecollect(idx);
        }
    }

    // ---- loading and running source ----

    /// Tokenize, parse, and compile `src`, returning a pinned `Chunk`
    /// value, or `Value::NULL` on any lex/parse/compile failure. The
    /// returned chunk is pinned (`nocollect`) for the caller, who is
    /// responsible for `resumecollect`-ing it once done — a compiled
    /// chunk stays pinned for the lifetime of its compilation unit, and
    /// the top-level chunk is pinned by whoever loaded it.
    pub fn loadstring(&mut self, src: &str, module_name: &str) -> Value {
        match self.try_loadstring(src, module_name) {
            Ok(v) => v,
            Err(e) => {
                self.report_error(&e);
                Value::NULL
            }
        }
    }

    fn try_loadstring(&mut self, src: &str, module_name: &str) -> Result<Value> {
        let parsed = parse(module_name, src)?;
        let chunk = Compiler::new(module_name, &mut self.heap, &mut self.interner, &self.config).compile_module(&parsed)?;
        let idx = self.heap.allocate(ObjectKind::Chunk(chunk));
        self.heap.nocollect(idx);
        Ok(Value::object(idx))
    }

    /// `loadstring` followed by `exec` with zero arguments.
    pub fn dostring(&mut self, src: &str, module_name: &str) -> u16 {
        let chunk = self.loadstring(src, module_name);
        if chunk.is_null() {
            return 0;
        }
        self.exec(chunk, 0)
    }

    /// Call a chunk/function/closure/native with `argc` values already
    /// pushed on the stack. Returns the number of return values left on
    /// the stack: 1 if the call returned an expression, 0 if it returned
    /// with no expression (or never returned at all, falling off the end
    /// of its body) or if the call raised a fatal error, in which case
    /// the VM has already unwound to the state it had before this call.
    pub fn exec(&mut self, callable: Value, argc: u8) -> u16 {
        match self.call_value(callable, argc) {
            Ok((v, count)) => {
                if count == 1 {
                    let _ = self.push(v);
                }
                count
            }
            Err(e) => {
                self.report_error(&e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;

    #[test]
    fn dostring_returns_one_value_for_a_normal_return() {
        let mut vm = Vm::new(VmConfig::default());
        let n = vm.dostring("return 2 + 3 * 4", "test");
        assert_eq!(n, 1);
        assert_eq!(vm.pop().unwrap().as_number(), Some(14.0));
    }

    #[test]
    fn dostring_returns_zero_values_for_a_bare_return() {
        let mut vm = Vm::new(VmConfig::default());
        let n = vm.dostring("var x = 1\nreturn", "test");
        assert_eq!(n, 0);
    }

    #[test]
    fn dostring_returns_zero_values_for_an_empty_program() {
        let mut vm = Vm::new(VmConfig::default());
        let n = vm.dostring("", "test");
        assert_eq!(n, 0);
    }

    #[test]
    fn loadstring_returns_null_on_a_parse_error() {
        let mut vm = Vm::new(VmConfig::default());
        let v = vm.loadstring("if {", "test");
        assert!(v.is_null());
    }

    #[test]
    fn dostring_returns_zero_on_a_runtime_error() {
        let mut vm = Vm::new(VmConfig::default());
        let n = vm.dostring("return null + 1", "test");
        assert_eq!(n, 0);
    }

    #[test]
    fn error_hook_receives_the_traceback_message() {
        let seen = Rc::new(std::cell::RefCell::new(None));
        let seen_clone = Rc::clone(&seen);
        let mut vm = Vm::open(VmConfig::default(), move |msg: &str| {
            *seen_clone.borrow_mut() = Some(msg.to_string());
        });
        vm.dostring("return null + 1", "test");
        assert!(seen.borrow().as_ref().unwrap().contains("traceback"));
    }

    #[test]
    fn table_round_trips_through_the_embedding_api() {
        let mut vm = Vm::new(VmConfig::default());
        let t = vm.make_table();
        let key = vm.make_string("a");
        let value = vm.make_number(42.0);
        vm.table_set(t, key, value).unwrap();
        assert_eq!(vm.table_get(t, key).unwrap(), value);
        assert!(vm.table_pop(t, key).unwrap());
        assert!(vm.table_get(t, key).unwrap().is_null());
    }

    #[test]
    fn array_push_at_remove_length_round_trip() {
        let mut vm = Vm::new(VmConfig::default());
        let a = vm.make_array();
        vm.array_push(a, vm.make_number(1.0)).unwrap();
        vm.array_push(a, vm.make_number(2.0)).unwrap();
        assert_eq!(vm.array_length(a).unwrap(), 2);
        assert_eq!(vm.array_at(a, 0).unwrap().as_number(), Some(1.0));
        let removed = vm.array_remove(a, 0).unwrap();
        assert_eq!(removed.as_number(), Some(1.0));
        assert_eq!(vm.array_at(a, 0).unwrap().as_number(), Some(2.0));
        assert_eq!(vm.array_length(a).unwrap(), 1);
    }

    #[test]
    fn get_string_round_trips_interned_bytes() {
        let mut vm = Vm::new(VmConfig::default());
        let s = vm.make_string("hello");
        assert_eq!(vm.get_string(s), Some(&b"hello"[..]));
    }

    #[test]
    fn native_callback_is_invoked_with_the_expected_argc() {
        let mut vm = Vm::new(VmConfig::default());
        let double = vm.make_native("double", |vm, argc| {
            assert_eq!(argc, 1);
            let n = vm.pop().unwrap().as_number().unwrap();
            vm.push(Value::number(n * 2.0)).unwrap();
            1
        });
        vm.push(Value::number(21.0)).unwrap();
        let n = vm.exec(double, 1);
        assert_eq!(n, 1);
        assert_eq!(vm.pop().unwrap().as_number(), Some(42.0));
    }

    #[test]
    fn expect_kind_accepts_members_of_the_set_and_rejects_others() {
        let mut vm = Vm::new(VmConfig::default());
        let n = vm.make_number(1.0);
        let s = vm.make_string("x");
        let allowed = crate::value::ValueKind::Number | crate::value::ValueKind::String;
        assert!(vm.expect_kind(n, allowed).is_ok());
        assert!(vm.expect_kind(s, allowed).is_ok());
        let err = vm.expect_kind(Value::NULL, allowed).unwrap_err();
        assert!(err.to_string().contains("number or string"));
    }

    #[test]
    fn ptr_round_trips_through_make_ptr_get_ptr() {
        let mut vm = Vm::new(VmConfig::default());
        let p = vm.make_ptr(Box::new(7u32));
        let got = vm.get_ptr(p).unwrap().downcast_ref::<u32>().unwrap();
        assert_eq!(*got, 7);
    }

    #[test]
    fn nocollect_pins_an_object_the_stack_does_not_reach() {
        let mut vm = Vm::new(VmConfig::default());
        let t = vm.make_table();
        vm.nocollect(t);
        vm.collect();
        assert!(vm.table_get(t, vm.make_number(1.0)).is_ok());
        vm.resumecollect(t);
        vm.collect();
        assert!(vm.table_get(t, vm.make_number(1.0)).is_err());
    }
}
