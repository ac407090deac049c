//! Tagged values of the Skein runtime.
//!
//! Every value lives in the managed heap and is addressed by a compact
//! [`ValueRef`] handle; the empty list is not an object at all but the absent
//! value, spelled `None` at the Rust level. A small set of preallocated
//! sentinels (the out-of-heap exception, the finalization-failure exception
//! and the map-miss marker) sits outside the managed index range and is never
//! touched by relocation.
//!
//! Structural hashing is memoized in place: a cached hash of `0` means "not
//! yet computed", and a computed hash never disagrees with the payload it was
//! computed from.

use std::cell::Cell;
use std::fmt;

use crate::heap::Heap;
use crate::machine::Machine;

/// Handle to a managed value.
///
/// Handles index the collector's live space. Indices at or above
/// `SENTINEL_BASE` address the sentinel table instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueRef(pub(crate) u32);

pub(crate) const SENTINEL_BASE: u32 = 0xFFFF_FF00;

/// The preallocated `out of heap memory` exception.
pub const OUT_OF_HEAP: ValueRef = ValueRef(SENTINEL_BASE);
/// The preallocated `finalization failed` exception.
pub const FINALIZATION_FAILED: ValueRef = ValueRef(SENTINEL_BASE + 1);
/// Unique process-wide marker returned by map lookups on a miss.
pub const MISS: ValueRef = ValueRef(SENTINEL_BASE + 2);
pub(crate) const MSG_OUT_OF_HEAP: ValueRef = ValueRef(SENTINEL_BASE + 3);
pub(crate) const MSG_FINALIZATION_FAILED: ValueRef = ValueRef(SENTINEL_BASE + 4);
pub(crate) const SENTINEL_COUNT: u32 = 5;

impl ValueRef {
    pub(crate) fn is_sentinel(self) -> bool {
        self.0 >= SENTINEL_BASE
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// FFI-safe encoding of an optional [`ValueRef`] for the module ABI.
///
/// `u32::MAX` encodes the absent value; everything else is a handle.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawValue(pub u32);

const RAW_ABSENT: u32 = u32::MAX;

impl RawValue {
    pub const ABSENT: RawValue = RawValue(RAW_ABSENT);

    pub fn encode(value: Option<ValueRef>) -> RawValue {
        match value {
            Some(reference) => RawValue(reference.0),
            None => RawValue::ABSENT,
        }
    }

    pub fn decode(self) -> Option<ValueRef> {
        if self.0 == RAW_ABSENT {
            None
        } else {
            Some(ValueRef(self.0))
        }
    }
}

/// A native word implemented in the host: arguments through the data stack,
/// an exception on failure.
pub type BuiltinFn = fn(&mut Machine) -> Result<(), ValueRef>;

/// ABI form of a native word exported by a shared object.
pub type ForeignFn = unsafe extern "C" fn(*mut Machine) -> RawValue;

/// A native function pointer, either compiled in or resolved from a module.
#[derive(Clone, Copy)]
pub enum NativeFn {
    Builtin(BuiltinFn),
    Foreign(ForeignFn),
}

impl NativeFn {
    pub fn invoke(self, machine: &mut Machine) -> Result<(), ValueRef> {
        match self {
            NativeFn::Builtin(function) => function(machine),
            NativeFn::Foreign(function) => {
                let raw = unsafe { function(machine as *mut Machine) };
                match raw.decode() {
                    Some(exception) => Err(exception),
                    None => Ok(()),
                }
            }
        }
    }

    pub fn addr(self) -> usize {
        match self {
            NativeFn::Builtin(function) => function as usize,
            NativeFn::Foreign(function) => function as usize,
        }
    }
}

impl PartialEq for NativeFn {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function#0x{:08X}", self.addr())
    }
}

/// A module lifecycle hook: called with the machine and the library value
/// it belongs to, returning an exception or absent.
pub type BuiltinHook = fn(&mut Machine, Option<ValueRef>) -> Result<(), ValueRef>;

/// ABI form of a module lifecycle hook.
pub type ForeignHook = unsafe extern "C" fn(*mut Machine, RawValue) -> RawValue;

#[derive(Clone, Copy)]
pub enum ModuleHook {
    Builtin(BuiltinHook),
    Foreign(ForeignHook),
}

impl ModuleHook {
    pub fn invoke(self, machine: &mut Machine, library: Option<ValueRef>) -> Result<(), ValueRef> {
        match self {
            ModuleHook::Builtin(hook) => hook(machine, library),
            ModuleHook::Foreign(hook) => {
                let raw = unsafe { hook(machine as *mut Machine, RawValue::encode(library)) };
                match raw.decode() {
                    Some(exception) => Err(exception),
                    None => Ok(()),
                }
            }
        }
    }
}

impl fmt::Debug for ModuleHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = match self {
            ModuleHook::Builtin(hook) => *hook as usize,
            ModuleHook::Foreign(hook) => *hook as usize,
        };
        write!(f, "hook#0x{addr:08X}")
    }
}

/// Identity token for a loaded platform library. Two library values are the
/// same library exactly when their handles are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub(crate) u64);

impl ModuleHandle {
    pub fn token(self) -> u64 {
        self.0
    }
}

/// Payload of a managed value.
#[derive(Debug, Clone)]
pub enum ObjKind {
    /// Immutable identifier, compared bytewise.
    Symbol(Box<str>),
    /// IEEE 754 double.
    Number(f64),
    Boolean(bool),
    /// UTF-8 text with its codepoint count precomputed at construction.
    String { bytes: Box<str>, codepoints: u64 },
    /// Singly-linked cell; the empty list is the absent value.
    List {
        length: u64,
        head: Option<ValueRef>,
        tail: Option<ValueRef>,
    },
    /// Buckets of alternating key,value lists.
    Map {
        length: u64,
        buckets: Box<[Option<ValueRef>]>,
    },
    /// Dense, indexable sequence.
    Vector(Box<[Option<ValueRef>]>),
    /// Native function with a back-reference to its owning library
    /// (absent for compiled-in words).
    Native {
        library: Option<ValueRef>,
        function: NativeFn,
    },
    /// Handle to a native extension module; the path is its identity.
    Library {
        handle: Option<ModuleHandle>,
        path: Box<str>,
    },
    /// Error value; exceptions chain through their cause.
    Exception {
        cause: Option<ValueRef>,
        message: Option<ValueRef>,
    },
}

/// A managed heap object: payload plus the collector's forwarding slot and
/// the memoized structural hash.
#[derive(Debug, Clone)]
pub struct Obj {
    pub(crate) forward: Option<ValueRef>,
    pub(crate) hash: Cell<u64>,
    pub(crate) kind: ObjKind,
}

impl Obj {
    pub(crate) fn new(kind: ObjKind) -> Obj {
        Obj {
            forward: None,
            hash: Cell::new(0),
            kind,
        }
    }

    pub(crate) fn with_hash(kind: ObjKind, hash: u64) -> Obj {
        Obj {
            forward: None,
            hash: Cell::new(hash),
            kind,
        }
    }

    pub fn kind(&self) -> &ObjKind {
        &self.kind
    }
}

/// Fixed per-object charge covering the tag, forwarding and hash bookkeeping.
pub const HEADER_SIZE: usize = 48;
/// Byte charge of one inline value slot (map bucket or vector element).
pub const SLOT_SIZE: usize = 8;

/// Bytes an object of this payload occupies, header included.
pub fn byte_size_of(kind: &ObjKind) -> usize {
    let inline = match kind {
        ObjKind::Symbol(name) => name.len(),
        ObjKind::String { bytes, .. } => bytes.len(),
        ObjKind::Library { path, .. } => path.len(),
        ObjKind::Map { buckets, .. } => buckets.len() * SLOT_SIZE,
        ObjKind::Vector(elements) => elements.len() * SLOT_SIZE,
        ObjKind::Number(_)
        | ObjKind::Boolean(_)
        | ObjKind::List { .. }
        | ObjKind::Native { .. }
        | ObjKind::Exception { .. } => 0,
    };
    HEADER_SIZE + inline
}

pub(crate) fn kind_name(kind: &ObjKind) -> &'static str {
    match kind {
        ObjKind::Symbol(_) => "symbol",
        ObjKind::Number(_) => "number",
        ObjKind::Boolean(_) => "boolean",
        ObjKind::String { .. } => "string",
        ObjKind::List { .. } => "list",
        ObjKind::Map { .. } => "map",
        ObjKind::Vector(_) => "vector",
        ObjKind::Native { .. } => "function",
        ObjKind::Library { .. } => "library",
        ObjKind::Exception { .. } => "exception",
    }
}

const ABSENT_HASH: u64 = 31;
const HASH_PRIME: u64 = 31;

pub(crate) fn bytes_hash(bytes: &[u8]) -> u64 {
    let mut hash = HASH_PRIME;
    for &byte in bytes {
        hash = hash.wrapping_mul(HASH_PRIME).wrapping_add(byte as u64);
    }
    hash
}

fn number_hash(value: f64) -> u64 {
    // +0.0 and -0.0 are IEEE-equal, so they must hash alike
    let bits = if value == 0.0 { 0 } else { value.to_bits() };
    HASH_PRIME.wrapping_add(bits.wrapping_mul(HASH_PRIME))
}

impl Heap {
    /// Structural hash, memoized into the value.
    ///
    /// Deterministic within a process run, equal for structurally equal
    /// values, and never `0` once computed.
    pub fn hash(&self, value: Option<ValueRef>) -> u64 {
        let Some(reference) = value else {
            return ABSENT_HASH;
        };
        let object = self.get(reference);
        let cached = object.hash.get();
        if cached != 0 {
            return cached;
        }

        // composites fold child hashes; gather the children first so the
        // borrow of this object does not outlive the recursion
        let children: Option<Vec<Option<ValueRef>>> = match &object.kind {
            ObjKind::List { head, tail, .. } => Some(vec![*head, *tail]),
            ObjKind::Vector(elements) => Some(elements.to_vec()),
            ObjKind::Exception { cause, message } => Some(vec![*message, *cause]),
            _ => None,
        };

        let mut computed = match children {
            Some(children) => {
                let mut hash = HASH_PRIME;
                for child in children {
                    hash = hash.wrapping_add(self.hash(child).wrapping_mul(HASH_PRIME));
                }
                hash
            }
            None => match &self.get(reference).kind {
                ObjKind::Symbol(name) => bytes_hash(name.as_bytes()),
                ObjKind::Number(value) => number_hash(*value),
                ObjKind::Boolean(value) => {
                    if *value {
                        7
                    } else {
                        31
                    }
                }
                ObjKind::String { bytes, .. } => bytes_hash(bytes.as_bytes()),
                ObjKind::Native { function, .. } => {
                    HASH_PRIME.wrapping_add((function.addr() as u64).wrapping_mul(HASH_PRIME))
                }
                // the handle mutates when the registry opens the library, so
                // the memoized hash keys off the path instead
                ObjKind::Library { path, .. } => bytes_hash(path.as_bytes()),
                ObjKind::Map { .. } => self.map_entry_hash(reference),
                _ => unreachable!("composite kinds are handled above"),
            },
        };

        if computed == 0 {
            // 0 is reserved for "not yet computed"
            computed = HASH_PRIME;
        }
        self.get(reference).hash.set(computed);
        computed
    }

    /// Maps fold entry-wise with a commutative mix: equal maps must hash
    /// alike even when their capacities and bucket layouts differ.
    fn map_entry_hash(&self, reference: ValueRef) -> u64 {
        let mut hash = HASH_PRIME;
        let (capacity, _) = self.map_dims(reference);
        for index in 0..capacity as usize {
            let mut cursor = self.map_bucket(reference, index);
            while cursor.is_some() {
                let key = self.pair_key(cursor);
                let value = self.pair_value(cursor);
                hash = hash
                    .wrapping_add(self.hash(key).wrapping_mul(HASH_PRIME))
                    .wrapping_add(self.hash(value));
                cursor = self.pair_next(cursor);
            }
        }
        hash
    }

    /// Structural equality.
    ///
    /// Total over all variants; implies equal hashes. Short-circuits on
    /// identity, absent mismatch, tag mismatch, and on two cached hashes
    /// that disagree.
    pub fn equals(&self, a: Option<ValueRef>, b: Option<ValueRef>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => self.equals_refs(a, b),
            _ => false,
        }
    }

    fn equals_refs(&self, a: ValueRef, b: ValueRef) -> bool {
        if a == b {
            return true;
        }
        let (left, right) = (self.get(a), self.get(b));
        let (ha, hb) = (left.hash.get(), right.hash.get());
        if ha != 0 && hb != 0 && ha != hb {
            return false;
        }
        match (&left.kind, &right.kind) {
            (ObjKind::Symbol(x), ObjKind::Symbol(y)) => x == y,
            (ObjKind::Number(x), ObjKind::Number(y)) => x == y,
            (ObjKind::Boolean(x), ObjKind::Boolean(y)) => x == y,
            (ObjKind::String { bytes: x, .. }, ObjKind::String { bytes: y, .. }) => x == y,
            (ObjKind::List { length: x, .. }, ObjKind::List { length: y, .. }) => {
                x == y && self.list_elements_equal(a, b)
            }
            (ObjKind::Map { length: x, .. }, ObjKind::Map { length: y, .. }) => {
                x == y && self.map_subset_of(a, b) && self.map_subset_of(b, a)
            }
            (ObjKind::Vector(x), ObjKind::Vector(y)) => {
                x.len() == y.len()
                    && x.iter()
                        .zip(y.iter())
                        .all(|(&ex, &ey)| self.equals(ex, ey))
            }
            (ObjKind::Native { function: x, .. }, ObjKind::Native { function: y, .. }) => x == y,
            (ObjKind::Library { handle: x, .. }, ObjKind::Library { handle: y, .. }) => x == y,
            (
                ObjKind::Exception {
                    cause: ca,
                    message: ma,
                },
                ObjKind::Exception {
                    cause: cb,
                    message: mb,
                },
            ) => self.equals(*ma, *mb) && self.equals(*ca, *cb),
            _ => false,
        }
    }

    fn list_elements_equal(&self, a: ValueRef, b: ValueRef) -> bool {
        let mut left = Some(a);
        let mut right = Some(b);
        while let (Some(x), Some(y)) = (left, right) {
            let (xh, xt) = self.list_parts(x);
            let (yh, yt) = self.list_parts(y);
            if !self.equals(xh, yh) {
                return false;
            }
            left = xt;
            right = yt;
        }
        left.is_none() && right.is_none()
    }

    /// Bytes a value occupies in the heap; `0` for the absent value.
    pub fn byte_size(&self, value: Option<ValueRef>) -> usize {
        match value {
            None => 0,
            Some(reference) => byte_size_of(&self.get(reference).kind),
        }
    }

    /// The printable type name; the absent value is the empty list.
    pub fn type_name(&self, value: Option<ValueRef>) -> &'static str {
        match value {
            None => "list",
            Some(reference) => kind_name(&self.get(reference).kind),
        }
    }

    /// Container length: codepoints for strings, bytes for symbols, entries
    /// for maps, elements for lists and vectors, `0` otherwise.
    pub fn length(&self, value: Option<ValueRef>) -> u64 {
        match value {
            None => 0,
            Some(reference) => match &self.get(reference).kind {
                ObjKind::Symbol(name) => name.len() as u64,
                ObjKind::String { codepoints, .. } => *codepoints,
                ObjKind::List { length, .. } => *length,
                ObjKind::Map { length, .. } => *length,
                ObjKind::Vector(elements) => elements.len() as u64,
                _ => 0,
            },
        }
    }
}
