//! Two-space copying heap.
//!
//! Allocation bumps a byte budget in the live space. When an allocation no
//! longer fits, the machine collects: the spaces swap roles, every object
//! reachable from the frame chain is copied across, and a Cheney scan
//! rewrites child handles in copy order. Forwarding is recorded on the
//! from-space original, which doubles as the "already copied" flag.
//!
//! The heap itself only knows how to move objects; root discovery, the
//! growth policy and the registry sweep live in [`crate::machine`].

use crate::value::{
    MSG_FINALIZATION_FAILED, MSG_OUT_OF_HEAP, ModuleHandle, Obj, ObjKind, SENTINEL_BASE,
    SENTINEL_COUNT, ValueRef, byte_size_of,
};

pub struct Heap {
    /// Live (to-) space; objects append in allocation order.
    space: Vec<Obj>,
    /// Previous space. Populated only between `begin_collect` and
    /// `end_collect`, when its objects carry forwarding handles.
    old: Vec<Obj>,
    /// Bytes accounted to the live space.
    used: usize,
    /// Byte budget of each space.
    size: usize,
    /// Preallocated sentinel objects, indexed from `SENTINEL_BASE`.
    sentinels: Vec<Obj>,
}

fn sentinel_table() -> Vec<Obj> {
    let out_of_heap = Obj::new(ObjKind::Exception {
        cause: None,
        message: Some(MSG_OUT_OF_HEAP),
    });
    let finalization_failed = Obj::new(ObjKind::Exception {
        cause: None,
        message: Some(MSG_FINALIZATION_FAILED),
    });
    // the miss marker only needs identity; an empty string keeps it printable
    let miss = Obj::new(ObjKind::String {
        bytes: "".into(),
        codepoints: 0,
    });
    let out_of_heap_message = Obj::new(ObjKind::String {
        bytes: "out of heap memory".into(),
        codepoints: 18,
    });
    let finalization_failed_message = Obj::new(ObjKind::String {
        bytes: "finalization failed".into(),
        codepoints: 19,
    });
    let table = vec![
        out_of_heap,
        finalization_failed,
        miss,
        out_of_heap_message,
        finalization_failed_message,
    ];
    debug_assert_eq!(table.len(), SENTINEL_COUNT as usize);
    table
}

impl Heap {
    pub(crate) fn new(size: usize) -> Heap {
        Heap {
            space: Vec::new(),
            old: Vec::new(),
            used: 0,
            size,
            sentinels: sentinel_table(),
        }
    }

    /// Byte budget of each space.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes currently accounted to live objects.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes still available before the next collection.
    pub fn free(&self) -> usize {
        self.size.saturating_sub(self.used)
    }

    pub(crate) fn fits(&self, bytes: usize) -> bool {
        self.used + bytes <= self.size
    }

    pub(crate) fn grow(&mut self, size: usize) {
        debug_assert!(size >= self.size);
        self.size = size;
    }

    pub(crate) fn get(&self, reference: ValueRef) -> &Obj {
        if reference.is_sentinel() {
            &self.sentinels[(reference.0 - SENTINEL_BASE) as usize]
        } else {
            &self.space[reference.index()]
        }
    }

    fn get_mut(&mut self, reference: ValueRef) -> &mut Obj {
        if reference.is_sentinel() {
            &mut self.sentinels[(reference.0 - SENTINEL_BASE) as usize]
        } else {
            &mut self.space[reference.index()]
        }
    }

    /// Appends a fresh object. The caller has already reserved the bytes.
    pub(crate) fn push(&mut self, kind: ObjKind) -> ValueRef {
        debug_assert!(self.fits(0));
        debug_assert!((self.space.len() as u32) < SENTINEL_BASE);
        self.used += byte_size_of(&kind);
        self.space.push(Obj::new(kind));
        ValueRef(self.space.len() as u32 - 1)
    }

    /* ***** collection primitives ***** */

    pub(crate) fn begin_collect(&mut self) {
        std::mem::swap(&mut self.space, &mut self.old);
        self.space.clear();
        self.used = 0;
    }

    /// The relocation rule: absent stays absent, sentinels are unmanaged and
    /// stay put, forwarded objects resolve to their copy, and everything else
    /// is copied now.
    pub(crate) fn relocate(&mut self, value: Option<ValueRef>) -> Option<ValueRef> {
        let reference = value?;
        if reference.is_sentinel() {
            return Some(reference);
        }
        if let Some(forward) = self.old[reference.index()].forward {
            return Some(forward);
        }
        let original = &self.old[reference.index()];
        let copy = Obj::with_hash(original.kind.clone(), original.hash.get());
        self.used += byte_size_of(&copy.kind);
        self.space.push(copy);
        let forward = ValueRef(self.space.len() as u32 - 1);
        self.old[reference.index()].forward = Some(forward);
        Some(forward)
    }

    /// Where a from-space object was copied to, if it survived.
    pub(crate) fn forwarded(&self, reference: ValueRef) -> Option<ValueRef> {
        if reference.is_sentinel() {
            Some(reference)
        } else {
            self.old[reference.index()].forward
        }
    }

    /// Cheney scan: walk the copies in allocation order and relocate their
    /// children. Newly copied objects extend the scan.
    pub(crate) fn scan(&mut self) {
        let mut cursor = 0;
        while cursor < self.space.len() {
            let children: Vec<Option<ValueRef>> = match &self.space[cursor].kind {
                ObjKind::List { head, tail, .. } => vec![*head, *tail],
                ObjKind::Map { buckets, .. } => buckets.to_vec(),
                ObjKind::Vector(elements) => elements.to_vec(),
                ObjKind::Native { library, .. } => vec![*library],
                ObjKind::Exception { cause, message } => vec![*cause, *message],
                // scalars have no children
                _ => {
                    cursor += 1;
                    continue;
                }
            };
            let relocated: Vec<Option<ValueRef>> =
                children.into_iter().map(|child| self.relocate(child)).collect();
            match &mut self.space[cursor].kind {
                ObjKind::List { head, tail, .. } => {
                    *head = relocated[0];
                    *tail = relocated[1];
                }
                ObjKind::Map { buckets, .. } => {
                    buckets.copy_from_slice(&relocated);
                }
                ObjKind::Vector(elements) => {
                    elements.copy_from_slice(&relocated);
                }
                ObjKind::Native { library, .. } => {
                    *library = relocated[0];
                }
                ObjKind::Exception { cause, message } => {
                    *cause = relocated[0];
                    *message = relocated[1];
                }
                _ => unreachable!("scalars were skipped above"),
            }
            cursor += 1;
        }
    }

    pub(crate) fn end_collect(&mut self) {
        self.old.clear();
    }

    /* ***** structured accessors ***** */

    /// Head and tail of a list cell; `(None, None)` for anything else.
    pub fn list_parts(&self, reference: ValueRef) -> (Option<ValueRef>, Option<ValueRef>) {
        match &self.get(reference).kind {
            ObjKind::List { head, tail, .. } => (*head, *tail),
            _ => (None, None),
        }
    }

    pub fn list_length(&self, value: Option<ValueRef>) -> u64 {
        match value {
            Some(reference) => match &self.get(reference).kind {
                ObjKind::List { length, .. } => *length,
                _ => 0,
            },
            None => 0,
        }
    }

    /// Key of the pair starting at this bucket cell.
    pub(crate) fn pair_key(&self, cell: Option<ValueRef>) -> Option<ValueRef> {
        cell.and_then(|c| self.list_parts(c).0)
    }

    /// Value of the pair starting at this bucket cell.
    pub(crate) fn pair_value(&self, cell: Option<ValueRef>) -> Option<ValueRef> {
        let (_, rest) = self.list_parts(cell?);
        rest.and_then(|r| self.list_parts(r).0)
    }

    /// The cell after the pair starting at this bucket cell.
    pub(crate) fn pair_next(&self, cell: Option<ValueRef>) -> Option<ValueRef> {
        let (_, rest) = self.list_parts(cell?);
        rest.and_then(|r| self.list_parts(r).1)
    }

    pub fn map_dims(&self, reference: ValueRef) -> (u64, u64) {
        match &self.get(reference).kind {
            ObjKind::Map {
                length, buckets, ..
            } => (buckets.len() as u64, *length),
            _ => (0, 0),
        }
    }

    pub fn map_bucket(&self, reference: ValueRef, index: usize) -> Option<ValueRef> {
        match &self.get(reference).kind {
            ObjKind::Map { buckets, .. } => buckets.get(index).copied().flatten(),
            _ => None,
        }
    }

    pub(crate) fn set_map_bucket(
        &mut self,
        reference: ValueRef,
        index: usize,
        value: Option<ValueRef>,
    ) {
        if let ObjKind::Map { buckets, .. } = &mut self.get_mut(reference).kind {
            buckets[index] = value;
        }
    }

    pub(crate) fn set_map_length(&mut self, reference: ValueRef, value: u64) {
        if let ObjKind::Map { length, .. } = &mut self.get_mut(reference).kind {
            *length = value;
        }
    }

    /// Text of a string value, or `None` for any other variant.
    pub fn string_text(&self, reference: ValueRef) -> Option<&str> {
        match &self.get(reference).kind {
            ObjKind::String { bytes, .. } => Some(bytes),
            _ => None,
        }
    }

    /// Text of a symbol value, or `None` for any other variant.
    pub fn symbol_text(&self, reference: ValueRef) -> Option<&str> {
        match &self.get(reference).kind {
            ObjKind::Symbol(name) => Some(name),
            _ => None,
        }
    }

    /// Path of a library value, or `None` for any other variant.
    pub fn library_path(&self, reference: ValueRef) -> Option<&str> {
        match &self.get(reference).kind {
            ObjKind::Library { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn library_handle(&self, reference: ValueRef) -> Option<ModuleHandle> {
        match &self.get(reference).kind {
            ObjKind::Library { handle, .. } => *handle,
            _ => None,
        }
    }

    pub(crate) fn set_library_handle(&mut self, reference: ValueRef, value: Option<ModuleHandle>) {
        if let ObjKind::Library { handle, .. } = &mut self.get_mut(reference).kind {
            *handle = value;
        }
    }

    pub fn native_function(&self, reference: ValueRef) -> Option<crate::value::NativeFn> {
        match &self.get(reference).kind {
            ObjKind::Native { function, .. } => Some(*function),
            _ => None,
        }
    }

    pub fn vector_elements(&self, reference: ValueRef) -> Option<&[Option<ValueRef>]> {
        match &self.get(reference).kind {
            ObjKind::Vector(elements) => Some(elements),
            _ => None,
        }
    }

    pub fn exception_parts(&self, reference: ValueRef) -> Option<(Option<ValueRef>, Option<ValueRef>)> {
        match &self.get(reference).kind {
            ObjKind::Exception { cause, message } => Some((*cause, *message)),
            _ => None,
        }
    }

    pub fn number_value(&self, reference: ValueRef) -> Option<f64> {
        match &self.get(reference).kind {
            ObjKind::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn boolean_value(&self, reference: ValueRef) -> Option<bool> {
        match &self.get(reference).kind {
            ObjKind::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_list(&self, value: Option<ValueRef>) -> bool {
        match value {
            None => true,
            Some(reference) => matches!(self.get(reference).kind, ObjKind::List { .. }),
        }
    }

    pub fn is_symbol(&self, value: Option<ValueRef>) -> bool {
        match value {
            None => false,
            Some(reference) => matches!(self.get(reference).kind, ObjKind::Symbol(_)),
        }
    }
}
