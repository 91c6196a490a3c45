// Runtime limits for a `Vm`. The original fixes these as compile-time
// `#define`s (`LT_STACK_SIZE`, `LT_CALLSTACK_SIZE`, `LT_DEDUP_TABLE_SIZE`);
// here they're runtime-configurable so embedders can size a VM without
// recompiling the crate.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Fixed value-stack depth (original: `LT_STACK_SIZE`, 256).
    pub stack_size: u16,
    /// Fixed call-stack depth (original: `LT_CALLSTACK_SIZE`, 32).
    pub call_stack_size: u16,
    /// Number of buckets in the string dedup table (original:
    /// `LT_DEDUP_TABLE_SIZE`, 64).
    pub dedup_table_size: u16,
    /// Whether the compiler records a (line, col) per emitted op.
    pub generate_debug: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            stack_size: 256,
            call_stack_size: 32,
            dedup_table_size: 64,
            generate_debug: true,
        }
    }
}
