//! Skein core: the memory-managed universe of the language.
//!
//! Key pieces:
//! - `value`: the ten-variant tagged value model with memoized structural
//!   hashing and total structural equality
//! - `heap`: the two-space copying collector the values live in
//! - `machine`: heap + registry + the frame/scope roots, threaded through
//!   every operation as a single runtime handle
//! - `map`: persistent map operations over alternating key,value buckets
//! - `registry`: reference-counted native-library lifecycle, driven both by
//!   explicit open/close and by collector-discovered unreachability
//! - `print`: the canonical `dump`/`show` renderings
//! - `unicode`: UTF-8 validation and the escape tables

pub mod heap;
pub mod machine;
pub mod map;
pub mod print;
pub mod registry;
pub mod unicode;
pub mod value;

pub use heap::Heap;
pub use machine::{FrameId, Machine, MachineConfig, Scope};
pub use print::{dump, show};
pub use registry::{
    DynamicLoader, FINALIZER_SYMBOL, INITIALIZER_SYMBOL, ModuleLoader, NativeModule, Registry,
};
pub use value::{
    BuiltinFn, BuiltinHook, FINALIZATION_FAILED, ForeignFn, ForeignHook, MISS, ModuleHandle,
    ModuleHook, NativeFn, ObjKind, OUT_OF_HEAP, RawValue, ValueRef,
};
