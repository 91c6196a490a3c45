//! Property-based invariants that hold across the whole pipeline rather
//! than any one module, grounded in the sibling example pack's
//! `faxc-lex`/`fgc` crates, which keep this kind of cross-cutting
//! fuzz/invariant test in a top-level `tests/` directory instead of
//! inline `#[cfg(test)]` modules.

use proptest::prelude::*;

use rillscript::compiler::Compiler;
use rillscript::heap::Heap;
use rillscript::parser::parse;
use rillscript::strings::Interner;
use rillscript::{Vm, VmConfig};

fn compile(src: &str) -> rillscript::heap::ChunkObj {
    let parsed = parse("prop", src).unwrap();
    let config = VmConfig::default();
    let mut heap = Heap::new();
    let mut interner = Interner::new(config.dedup_table_size);
    Compiler::new("prop", &mut heap, &mut interner, &config).compile_module(&parsed).unwrap()
}

proptest! {
    /// Compiling identical source twice, from scratch, must produce
    /// identical code and constants — the compiler has no hidden
    /// non-determinism (no HashMap-ordering leakage, no uninitialized
    /// padding) that would make two runs diverge.
    #[test]
    fn recompiling_the_same_source_is_deterministic(n in 0i64..1000) {
        let src = format!("var x = {n}\nreturn x + 1");
        let a = compile(&src);
        let b = compile(&src);
        prop_assert_eq!(a.code, b.code);
        prop_assert_eq!(a.constants, b.constants);
    }

    /// Any non-null value stored in a table under some key reads back
    /// exactly, for arbitrary numeric keys and values, through the
    /// public embedding API alone.
    #[test]
    fn table_set_then_get_round_trips_for_arbitrary_numbers(key in any::<i32>(), value in any::<i32>()) {
        let mut vm = Vm::new(VmConfig::default());
        let table = vm.make_table();
        let k = vm.make_number(key as f64);
        let v = vm.make_number(value as f64);
        vm.table_set(table, k, v).unwrap();
        let got = vm.table_get(table, k).unwrap();
        prop_assert_eq!(vm.get_number(got), Some(value as f64));
    }

    /// Running the collector with nothing reachable but a table pinned
    /// by `nocollect` must never free that table, regardless of how many
    /// other throwaway tables and strings were allocated first.
    #[test]
    fn nocollect_survives_surrounding_garbage(garbage_count in 0usize..32) {
        let mut vm = Vm::new(VmConfig::default());
        let kept = vm.make_table();
        vm.nocollect(kept);
        let key = vm.make_string("marker");
        vm.table_set(kept, key, vm.make_number(1.0)).unwrap();

        for i in 0..garbage_count {
            let _ = vm.make_table();
            let _ = vm.make_string(&format!("garbage-{i}"));
        }

        vm.collect();
        prop_assert!(vm.table_get(kept, key).unwrap().as_number() == Some(1.0));
    }
}

#[test]
fn collecting_twice_in_a_row_is_idempotent() {
    let mut vm = Vm::new(VmConfig::default());
    let t = vm.make_table();
    vm.nocollect(t);
    let first = vm.collect();
    let second = vm.collect();
    assert_eq!(first, second);
}

#[test]
fn dostring_round_trips_arbitrary_string_literals() {
    let mut vm = Vm::new(VmConfig::default());
    for text in ["", "hello", "with spaces", "123"] {
        let src = format!("return \"{text}\"");
        let n = vm.dostring(&src, "prop");
        assert_eq!(n, 1);
        let v = vm.pop().unwrap();
        assert_eq!(vm.get_string(v), Some(text.as_bytes()));
    }
}
