//! Heap objects and the tracing mark-sweep collector. Every object
//! lives in a single slab (`Heap`); a `Value`'s object payload is an
//! index into that slab rather than a raw pointer (see `value.rs` for
//! why).
//!
//! This collector uses the conventional "clear all, set from roots,
//! free unset" scheme rather than the inverted "everything starts
//! marked, tracing clears" convention some tracing GCs use — the two
//! are observationally identical.

use std::collections::HashSet;

use crate::bytecode::Instr;
use crate::value::Value;
use crate::strings::Interner;

pub type NativeCallback = std::rc::Rc<dyn Fn(&mut crate::vm::Vm, u8) -> u8>;

/// Number of fixed hash buckets in a `Table` (original: 16, distinct
/// from the 64-bucket string dedup table).
pub const TABLE_BUCKET_COUNT: usize = 16;

#[derive(Clone, Debug, Default)]
pub struct ChunkObj {
    pub module: String,
    pub code: Vec<Instr>,
    pub constants: Vec<Value>,
    /// Parallel to `code`; present when `VmConfig::generate_debug`.
    pub debug: Vec<(u32, u32)>,
}

#[derive(Clone, Debug, Default)]
pub struct FnObj {
    pub module: String,
    pub arity: u8,
    pub code: Vec<Instr>,
    pub constants: Vec<Value>,
    pub debug: Vec<(u32, u32)>,
    /// Number of locals to reserve on entry (the leading `PUSH n`'s
    /// argument), kept alongside for diagnostics and tests.
    pub locals: u16,
}

#[derive(Clone, Debug)]
pub struct ClosureObj {
    pub fn_index: u32,
    pub captures: Vec<Value>,
}

#[derive(Clone, Debug, Default)]
pub struct TableObj {
    pub buckets: [Vec<(Value, Value)>; TABLE_BUCKET_COUNT],
}

fn table_bucket(key: Value) -> usize {
    (key.to_bits() as usize >> 2) % TABLE_BUCKET_COUNT
}

impl TableObj {
    pub fn set(&mut self, key: Value, value: Value) {
        let bucket = &mut self.buckets[table_bucket(key)];
        if let Some(pair) = bucket.iter_mut().find(|(k, _)| *k == key) {
            pair.1 = value;
        } else {
            bucket.push((key, value));
        }
    }

    pub fn get(&self, key: Value) -> Value {
        self.buckets[table_bucket(key)]
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
            .unwrap_or(Value::NULL)
    }

    /// Sets the value to `null` in place rather than removing the
    /// bucket entry — see DESIGN.md.
    pub fn pop(&mut self, key: Value) -> bool {
        let bucket = &mut self.buckets[table_bucket(key)];
        if let Some(pair) = bucket.iter_mut().find(|(k, _)| *k == key) {
            pair.1 = Value::NULL;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ArrayObj {
    pub items: Vec<Value>,
}

#[derive(Clone)]
pub struct NativeObj {
    pub name: String,
    pub callback: NativeCallback,
}

impl std::fmt::Debug for NativeObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeObj({})", self.name)
    }
}

pub struct PtrObj {
    pub payload: Box<dyn std::any::Any>,
}

impl std::fmt::Debug for PtrObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PtrObj")
    }
}

#[derive(Debug)]
pub enum ObjectKind {
    Chunk(ChunkObj),
    Fn(FnObj),
    Closure(ClosureObj),
    Table(TableObj),
    Array(ArrayObj),
    Native(NativeObj),
    Ptr(PtrObj),
}

impl ObjectKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjectKind::Chunk(_) => "chunk",
            ObjectKind::Fn(_) => "function",
            ObjectKind::Closure(_) => "closure",
            ObjectKind::Table(_) => "table",
            ObjectKind::Array(_) => "array",
            ObjectKind::Native(_) => "native",
            ObjectKind::Ptr(_) => "ptr",
        }
    }
}

struct Record {
    marked: bool,
    kind: ObjectKind,
}

enum Slot {
    Occupied(Record),
    Free(Option<u32>),
}

/// The object heap: a slab of slots indexed by the `Value` object
/// payload, plus a keepalive set of indices pinned against collection
/// (`nocollect` / `resumecollect` in the embedding API).
pub struct Heap {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    keepalive: HashSet<u32>,
    pub live_count: usize,
}

impl Heap {
    pub fn new() -> Self {
        Heap { slots: Vec::new(), free_head: None, keepalive: HashSet::new(), live_count: 0 }
    }

    pub fn allocate(&mut self, kind: ObjectKind) -> u32 {
        let record = Record { marked: false, kind };
        self.live_count += 1;
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            self.free_head = match slot {
                Slot::Free(next) => *next,
                Slot::Occupied(_) => unreachable!(),
            };
            *slot = Slot::Occupied(record);
            index
        } else {
            self.slots.push(Slot::Occupied(record));
            (self.slots.len() - 1) as u32
        }
    }

    pub fn get(&self, index: u32) -> Option<&ObjectKind> {
        match self.slots.get(index as usize) {
            Some(Slot::Occupied(r)) => Some(&r.kind),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut ObjectKind> {
        match self.slots.get_mut(index as usize) {
            Some(Slot::Occupied(r)) => Some(&mut r.kind),
            _ => None,
        }
    }

    pub fn nocollect(&mut self, index: u32) {
        self.keepalive.insert(index);
    }

    pub fn resumecollect(&mut self, index: u32) {
        self.keepalive.remove(&index);
    }

    pub fn is_pinned(&self, index: u32) -> bool {
        self.keepalive.contains(&index)
    }

    /// Run one collection cycle. `roots` is every value currently live
    /// on the VM's value stack and active frames' captures/constants are
    /// reached transitively through those frames' callee objects; the
    /// global table is passed separately since it's always a root.
    pub fn collect(&mut self, roots: &[Value], globals: Value, interner: &mut Interner) -> u32 {
        for slot in &mut self.slots {
            if let Slot::Occupied(r) = slot {
                r.marked = false;
            }
        }
        interner.clear_refcounts();

        let mut worklist: Vec<Value> = roots.to_vec();
        worklist.push(globals);
        worklist.extend(self.keepalive.iter().map(|i| Value::object(*i)));

        while let Some(v) = worklist.pop() {
            self.mark_value(v, interner, &mut worklist);
        }

        let mut freed = 0u32;
        for i in 0..self.slots.len() {
            let should_free = matches!(&self.slots[i], Slot::Occupied(r) if !r.marked);
            if should_free {
                self.slots[i] = Slot::Free(self.free_head);
                self.free_head = Some(i as u32);
                freed += 1;
                self.live_count -= 1;
            }
        }
        freed += interner.sweep_unreferenced();
        log::debug!("gc cycle reclaimed {} objects/strings", freed);
        freed
    }

    fn mark_value(&mut self, v: Value, interner: &mut Interner, worklist: &mut Vec<Value>) {
        if let Some(r) = v.as_string() {
            interner.mark_reachable(r);
            return;
        }
        let Some(index) = v.as_object() else { return };
        let already_marked = match self.slots.get(index as usize) {
            Some(Slot::Occupied(r)) => r.marked,
            _ => return,
        };
        if already_marked {
            return;
        }
        if let Some(Slot::Occupied(r)) = self.slots.get_mut(index as usize) {
            r.marked = true;
        }
        if let Some(Slot::Occupied(r)) = self.slots.get(index as usize) {
            match &r.kind {
                ObjectKind::Table(t) => {
                    for bucket in &t.buckets {
                        for (k, val) in bucket {
                            worklist.push(*k);
                            worklist.push(*val);
                        }
                    }
                }
                ObjectKind::Array(a) => worklist.extend(a.items.iter().copied()),
                ObjectKind::Closure(c) => {
                    worklist.push(Value::object(c.fn_index));
                    worklist.extend(c.captures.iter().copied());
                }
                ObjectKind::Chunk(c) => worklist.extend(c.constants.iter().copied()),
                ObjectKind::Fn(f) => worklist.extend(f.constants.iter().copied()),
                ObjectKind::Native(_) | ObjectKind::Ptr(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_interner() -> Interner {
        Interner::new(64)
    }

    #[test]
    fn allocate_then_collect_with_no_roots_frees_everything() {
        let mut heap = Heap::new();
        let mut interner = fresh_interner();
        heap.allocate(ObjectKind::Array(ArrayObj::default()));
        heap.allocate(ObjectKind::Array(ArrayObj::default()));
        let freed = heap.collect(&[], Value::NULL, &mut interner);
        assert_eq!(freed, 2);
        assert_eq!(heap.live_count, 0);
    }

    #[test]
    fn reachable_object_survives_collection() {
        let mut heap = Heap::new();
        let mut interner = fresh_interner();
        let idx = heap.allocate(ObjectKind::Array(ArrayObj::default()));
        let root = Value::object(idx);
        let freed = heap.collect(&[root], Value::NULL, &mut interner);
        assert_eq!(freed, 0);
        assert!(heap.get(idx).is_some());
    }

    #[test]
    fn pinned_object_survives_without_being_a_root() {
        let mut heap = Heap::new();
        let mut interner = fresh_interner();
        let idx = heap.allocate(ObjectKind::Array(ArrayObj::default()));
        heap.nocollect(idx);
        let freed = heap.collect(&[], Value::NULL, &mut interner);
        assert_eq!(freed, 0);
        heap.resumecollect(idx);
        let freed = heap.collect(&[], Value::NULL, &mut interner);
        assert_eq!(freed, 1);
    }

    #[test]
    fn collect_is_idempotent_with_no_mutation_between_cycles() {
        let mut heap = Heap::new();
        let mut interner = fresh_interner();
        let idx = heap.allocate(ObjectKind::Array(ArrayObj::default()));
        let root = Value::object(idx);
        heap.collect(&[root], Value::NULL, &mut interner);
        let second = heap.collect(&[root], Value::NULL, &mut interner);
        assert_eq!(second, 0);
    }

    #[test]
    fn freeing_an_object_reuses_its_slot_index() {
        let mut heap = Heap::new();
        let mut interner = fresh_interner();
        let first = heap.allocate(ObjectKind::Array(ArrayObj::default()));
        heap.collect(&[], Value::NULL, &mut interner);
        let second = heap.allocate(ObjectKind::Array(ArrayObj::default()));
        assert_eq!(first, second);
    }

    #[test]
    fn table_set_get_and_pop_round_trip() {
        let mut table = TableObj::default();
        let key = Value::number(1.0);
        let val = Value::number(42.0);
        table.set(key, val);
        assert_eq!(table.get(key), val);
        assert!(table.pop(key));
        assert_eq!(table.get(key), Value::NULL);
    }

    #[test]
    fn closure_keeps_its_function_alive_transitively() {
        let mut heap = Heap::new();
        let mut interner = fresh_interner();
        let fn_idx = heap.allocate(ObjectKind::Fn(FnObj::default()));
        let closure_idx = heap.allocate(ObjectKind::Closure(ClosureObj {
            fn_index: fn_idx,
            captures: vec![Value::number(1.0)],
        }));
        let root = Value::object(closure_idx);
        let freed = heap.collect(&[root], Value::NULL, &mut interner);
        assert_eq!(freed, 0);
        assert!(heap.get(fn_idx).is_some());
    }
}
