//! The machine: heap, registry and the collector's roots.
//!
//! Everything is threaded through a single `Machine` value instead of module
//! state, so a host can run several interpreters side by side and tests never
//! share anything.
//!
//! Roots come in two shapes. A *frame* is three registers of scratch space
//! pushed around any operation that must keep handles alive across an
//! allocation. A *scope* holds the three interpreter stacks (dictionary,
//! call stack, data stack); the `run` word opens a nested scope and inherits
//! nothing. The discipline mirrors the collector contract: a handle held in
//! a plain local across an allocation is stale the moment a collection runs,
//! so it must either sit in a frame register (and be re-read afterwards) or
//! be re-obtained from a rooted structure.

use tracing::debug;

use crate::heap::Heap;
use crate::registry::{ModuleLoader, Registry};
use crate::value::{byte_size_of, HEADER_SIZE, NativeFn, ObjKind, OUT_OF_HEAP, SLOT_SIZE, ValueRef};

#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Initial byte budget of each heap space.
    pub heap_size: usize,
    /// Hard ceiling on heap growth; `None` grows without bound.
    pub heap_limit: Option<usize>,
    /// `>= 1` echoes the data stack after every instruction.
    pub verbosity: u8,
    /// Module path of the kernel that registers the builtin words.
    pub kernel_path: String,
}

impl Default for MachineConfig {
    fn default() -> MachineConfig {
        MachineConfig {
            heap_size: 64 * 1024,
            heap_limit: None,
            verbosity: 0,
            kernel_path: "kernel".to_string(),
        }
    }
}

/// The three interpreter stacks of one evaluation scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scope {
    pub dictionary: Option<ValueRef>,
    pub callstack: Option<ValueRef>,
    pub datastack: Option<ValueRef>,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    registers: [Option<ValueRef>; 3],
}

/// Token for a pushed frame; frames nest strictly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameId(usize);

pub struct Machine {
    heap: Heap,
    registry: Registry,
    scopes: Vec<Scope>,
    frames: Vec<Frame>,
    pub config: MachineConfig,
}

impl Machine {
    /// A machine with the default dynamic module loader.
    pub fn new(config: MachineConfig) -> Machine {
        Machine::with_loader(config, Box::new(crate::registry::DynamicLoader))
    }

    pub fn with_loader(config: MachineConfig, loader: Box<dyn ModuleLoader>) -> Machine {
        Machine {
            heap: Heap::new(config.heap_size),
            registry: Registry::new(loader),
            scopes: vec![Scope::default()],
            frames: Vec::new(),
            config,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub(crate) fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /* ***** roots ***** */

    /// The innermost scope.
    pub fn scope(&self) -> &Scope {
        self.scopes.last().expect("the bootstrap scope is never popped")
    }

    pub fn scope_mut(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("the bootstrap scope is never popped")
    }

    pub fn push_scope(&mut self, scope: Scope) {
        self.scopes.push(scope);
    }

    pub fn pop_scope(&mut self) -> Scope {
        debug_assert!(self.scopes.len() > 1, "the bootstrap scope stays");
        self.scopes.pop().unwrap_or_default()
    }

    /// Pushes a frame of three rooted registers. Handles written here are
    /// updated by the collector; re-read them after any allocation.
    pub fn push_frame(&mut self, registers: [Option<ValueRef>; 3]) -> FrameId {
        self.frames.push(Frame { registers });
        FrameId(self.frames.len() - 1)
    }

    pub fn pop_frame(&mut self, frame: FrameId) {
        debug_assert_eq!(frame.0, self.frames.len() - 1, "frames nest strictly");
        self.frames.pop();
    }

    pub fn registers(&self, frame: FrameId) -> [Option<ValueRef>; 3] {
        self.frames[frame.0].registers
    }

    pub fn set_register(&mut self, frame: FrameId, index: usize, value: Option<ValueRef>) {
        self.frames[frame.0].registers[index] = value;
    }

    /* ***** collection ***** */

    /// Runs a full collection: swap spaces, relocate the roots, scan, then
    /// sweep the library registry. Returns the finalizer's exception when an
    /// unreachable library fails to shut down; the remaining unreachable
    /// libraries are deferred to the next collection.
    pub fn collect(&mut self) -> Result<(), ValueRef> {
        self.heap.begin_collect();

        for index in 0..self.frames.len() {
            for register in 0..3 {
                let value = self.frames[index].registers[register];
                self.frames[index].registers[register] = self.heap.relocate(value);
            }
        }
        for index in 0..self.scopes.len() {
            let scope = self.scopes[index];
            self.scopes[index] = Scope {
                dictionary: self.heap.relocate(scope.dictionary),
                callstack: self.heap.relocate(scope.callstack),
                datastack: self.heap.relocate(scope.datastack),
            };
        }

        self.heap.scan();
        let dead = self.registry.sweep(&mut self.heap);
        self.heap.end_collect();
        debug!(live_bytes = self.heap.used(), "collection finished");

        let mut failure = None;
        for library in dead {
            if failure.is_none() {
                if let Err(exception) = self.registry_finalize(library) {
                    failure = Some(exception);
                }
            } else {
                // a finalizer already failed; retry this one next collection
                self.registry.reinsert(library);
            }
        }
        match failure {
            Some(exception) => Err(exception),
            None => Ok(()),
        }
    }

    /// Makes room for `bytes` more bytes, collecting and then growing the
    /// heap if needed. Every constructor calls this before `Heap::push`.
    pub(crate) fn reserve(&mut self, bytes: usize) -> Result<(), ValueRef> {
        if self.heap.fits(bytes) {
            return Ok(());
        }
        self.collect()?;
        if self.heap.fits(bytes) {
            return Ok(());
        }

        // grow: at least double, and at least enough for this allocation
        let minimum = self.heap.size() + (self.heap.used() + bytes - self.heap.size());
        let preferred = (self.heap.size() * 2).max(minimum);
        let grown = match self.config.heap_limit {
            None => preferred,
            Some(limit) if preferred <= limit => preferred,
            // fall back to the smallest workable size when the preferred
            // size breaches the limit
            Some(limit) if minimum <= limit => limit,
            Some(_) => return Err(OUT_OF_HEAP),
        };
        debug!(from = self.heap.size(), to = grown, "growing heap");
        self.heap.grow(grown);
        Ok(())
    }

    /* ***** constructors ***** */

    pub fn symbol(&mut self, name: &str) -> Result<ValueRef, ValueRef> {
        self.reserve(HEADER_SIZE + name.len())?;
        let reference = self.heap.push(ObjKind::Symbol(name.into()));
        // symbols are hashed eagerly; they are about to be dictionary keys
        self.heap.hash(Some(reference));
        Ok(reference)
    }

    /// Builds a string from raw bytes, rejecting text that is not UTF-8.
    pub fn string_from_bytes(&mut self, bytes: &[u8]) -> Result<ValueRef, ValueRef> {
        match crate::unicode::validate(bytes) {
            Ok((text, codepoints)) => {
                self.reserve(HEADER_SIZE + text.len())?;
                Ok(self.heap.push(ObjKind::String {
                    bytes: text.into(),
                    codepoints,
                }))
            }
            Err(fault) => Err(self.exception(fault.message())),
        }
    }

    pub fn string(&mut self, text: &str) -> Result<ValueRef, ValueRef> {
        let codepoints = text.chars().count() as u64;
        self.reserve(HEADER_SIZE + text.len())?;
        Ok(self.heap.push(ObjKind::String {
            bytes: text.into(),
            codepoints,
        }))
    }

    pub fn number(&mut self, value: f64) -> Result<ValueRef, ValueRef> {
        self.reserve(HEADER_SIZE)?;
        Ok(self.heap.push(ObjKind::Number(value)))
    }

    pub fn boolean(&mut self, value: bool) -> Result<ValueRef, ValueRef> {
        self.reserve(HEADER_SIZE)?;
        Ok(self.heap.push(ObjKind::Boolean(value)))
    }

    pub fn list(
        &mut self,
        head: Option<ValueRef>,
        tail: Option<ValueRef>,
    ) -> Result<ValueRef, ValueRef> {
        let frame = self.push_frame([head, tail, None]);
        let reserved = self.reserve(HEADER_SIZE);
        let [head, tail, _] = self.registers(frame);
        self.pop_frame(frame);
        reserved?;
        let length = self.heap.list_length(tail) + 1;
        Ok(self.heap.push(ObjKind::List { length, head, tail }))
    }

    pub fn map_with_capacity(&mut self, capacity: u64) -> Result<ValueRef, ValueRef> {
        let capacity = capacity as usize;
        self.reserve(HEADER_SIZE + capacity * SLOT_SIZE)?;
        Ok(self.heap.push(ObjKind::Map {
            length: 0,
            buckets: vec![None; capacity].into_boxed_slice(),
        }))
    }

    /// Builds a vector holding the elements of `list` in order.
    pub fn vector_from_list(&mut self, list: Option<ValueRef>) -> Result<ValueRef, ValueRef> {
        let frame = self.push_frame([list, None, None]);
        let count = self.heap.list_length(list) as usize;
        let reserved = self.reserve(HEADER_SIZE + count * SLOT_SIZE);
        let list = self.registers(frame)[0];
        self.pop_frame(frame);
        reserved?;
        // no allocation happens past this point, so plain reads are safe
        let mut elements = Vec::with_capacity(count);
        let mut cursor = list;
        while let Some(cell) = cursor {
            let (head, tail) = self.heap.list_parts(cell);
            elements.push(head);
            cursor = tail;
        }
        Ok(self.heap.push(ObjKind::Vector(elements.into_boxed_slice())))
    }

    pub fn native(
        &mut self,
        library: Option<ValueRef>,
        function: NativeFn,
    ) -> Result<ValueRef, ValueRef> {
        let frame = self.push_frame([library, None, None]);
        let reserved = self.reserve(HEADER_SIZE);
        let library = self.registers(frame)[0];
        self.pop_frame(frame);
        reserved?;
        Ok(self.heap.push(ObjKind::Native { library, function }))
    }

    /// Builds an unopened library value and registers it with the collector's
    /// weak list. The platform handle stays absent until the registry opens it.
    pub fn library(&mut self, path: &str) -> Result<ValueRef, ValueRef> {
        self.reserve(HEADER_SIZE + path.len())?;
        let reference = self.heap.push(ObjKind::Library {
            handle: None,
            path: path.into(),
        });
        self.registry.track(reference);
        Ok(reference)
    }

    pub fn exception_value(
        &mut self,
        cause: Option<ValueRef>,
        message: Option<ValueRef>,
    ) -> Result<ValueRef, ValueRef> {
        let frame = self.push_frame([cause, message, None]);
        let reserved = self.reserve(HEADER_SIZE);
        let [cause, message, _] = self.registers(frame);
        self.pop_frame(frame);
        reserved?;
        Ok(self.heap.push(ObjKind::Exception { cause, message }))
    }

    /// Shallow copy of a value. The copy starts with an uncomputed hash
    /// because callers mutate it before exposing it.
    pub fn clone_value(&mut self, value: Option<ValueRef>) -> Result<Option<ValueRef>, ValueRef> {
        let Some(_) = value else {
            return Ok(None);
        };
        let frame = self.push_frame([value, None, None]);
        let bytes = self.heap.byte_size(value);
        let reserved = self.reserve(bytes);
        let value = self.registers(frame)[0];
        self.pop_frame(frame);
        reserved?;
        let kind = match value {
            Some(reference) => self.heap.get(reference).kind.clone(),
            None => return Ok(None),
        };
        debug_assert_eq!(byte_size_of(&kind), bytes);
        Ok(Some(self.heap.push(kind)))
    }

    /// A fresh list with the elements of `list` in reverse order.
    pub fn list_reverse(&mut self, list: Option<ValueRef>) -> Result<Option<ValueRef>, ValueRef> {
        let frame = self.push_frame([list, None, None]);
        let result = self.list_reverse_rooted(frame);
        self.pop_frame(frame);
        result
    }

    fn list_reverse_rooted(&mut self, frame: FrameId) -> Result<Option<ValueRef>, ValueRef> {
        while let Some(cursor) = self.registers(frame)[0] {
            let head = self.heap.list_parts(cursor).0;
            let cell = self.list(head, self.registers(frame)[1])?;
            self.set_register(frame, 1, Some(cell));
            let cursor = self.registers(frame)[0];
            let tail = cursor.and_then(|c| self.heap.list_parts(c).1);
            self.set_register(frame, 0, tail);
        }
        Ok(self.registers(frame)[1])
    }

    /* ***** exceptions ***** */

    /// Builds a string exception. Falls back to the out-of-heap sentinel when
    /// even the message cannot be allocated.
    pub fn exception(&mut self, message: &str) -> ValueRef {
        self.exception_caused(None, message)
    }

    pub fn exception_caused(&mut self, cause: Option<ValueRef>, message: &str) -> ValueRef {
        let frame = self.push_frame([cause, None, None]);
        let built = self.string(message).and_then(|text| {
            self.set_register(frame, 1, Some(text));
            let cause = self.registers(frame)[0];
            let message = self.registers(frame)[1];
            self.exception_value(cause, message)
        });
        self.pop_frame(frame);
        match built {
            Ok(exception) => exception,
            Err(exception) => exception,
        }
    }

    pub fn underflow(&mut self, word: &str) -> ValueRef {
        self.exception(&format!("stack underflow in function '{word}'"))
    }

    /// `argument of illegal type '<got>' in function '<word>' (expected <want>)`;
    /// `want` carries its own quoting so multi-type expectations read well.
    pub fn type_error(&mut self, got: Option<ValueRef>, word: &str, want: &str) -> ValueRef {
        let got = self.heap.type_name(got);
        self.exception(&format!(
            "argument of illegal type '{got}' in function '{word}' (expected {want})"
        ))
    }

    /* ***** data stack ***** */

    /// Pops the top of the data stack, or raises a stack underflow named
    /// after the calling word.
    pub fn pop_data(&mut self, word: &str) -> Result<Option<ValueRef>, ValueRef> {
        match self.scope().datastack {
            Some(cell) => {
                let (head, tail) = self.heap.list_parts(cell);
                self.scope_mut().datastack = tail;
                Ok(head)
            }
            None => Err(self.underflow(word)),
        }
    }

    pub fn push_data(&mut self, value: Option<ValueRef>) -> Result<(), ValueRef> {
        let cell = self.list(value, self.scope().datastack)?;
        self.scope_mut().datastack = Some(cell);
        Ok(())
    }

    /* ***** registry bridge ***** */

    fn registry_finalize(&mut self, dead: crate::registry::DeadLibrary) -> Result<(), ValueRef> {
        debug!(path = %dead.path, "finalizing unreachable library");
        let hook = dead.entry.module.finalizer();
        let outcome = match hook {
            // the library value is unreachable by definition here
            Some(hook) => hook.invoke(self, None),
            None => Err(crate::value::FINALIZATION_FAILED),
        };
        // dropping the entry unloads the platform handle
        drop(dead);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scopes_nest() {
        let mut m = Machine::new(MachineConfig::default());
        let number = m.number(9.0).unwrap();
        m.push_data(Some(number)).unwrap();
        m.push_scope(Scope::default());
        assert!(m.scope().datastack.is_none());
        m.pop_scope();
        let top = m.pop_data("test").unwrap().unwrap();
        assert_eq!(m.heap().number_value(top), Some(9.0));
    }

    #[test]
    fn test_pop_data_underflow_names_the_word() {
        let mut m = Machine::new(MachineConfig::default());
        let exception = m.pop_data("equals").unwrap_err();
        let (_, message) = m.heap().exception_parts(exception).unwrap();
        let text = m.heap().string_text(message.unwrap()).unwrap();
        assert_eq!(text, "stack underflow in function 'equals'");
    }

    #[test]
    fn test_type_error_message_format() {
        let mut m = Machine::new(MachineConfig::default());
        let number = m.number(3.0).unwrap();
        let exception = m.type_error(Some(number), "push", "'list'");
        let (_, message) = m.heap().exception_parts(exception).unwrap();
        let text = m.heap().string_text(message.unwrap()).unwrap();
        assert_eq!(
            text,
            "argument of illegal type 'number' in function 'push' (expected 'list')"
        );
    }

    #[test]
    fn test_string_from_bytes_rejects_invalid_utf8() {
        let mut m = Machine::new(MachineConfig::default());
        let exception = m.string_from_bytes(&[0x61, 0xC3]).unwrap_err();
        let (_, message) = m.heap().exception_parts(exception).unwrap();
        let text = m.heap().string_text(message.unwrap()).unwrap();
        assert_eq!(text, "incomplete UTF-8 sequence");

        let exception = m.string_from_bytes(&[0xFF]).unwrap_err();
        let (_, message) = m.heap().exception_parts(exception).unwrap();
        let text = m.heap().string_text(message.unwrap()).unwrap();
        assert_eq!(text, "malformed UTF-8 sequence");
    }

    #[test]
    fn test_list_lengths_accumulate() {
        let mut m = Machine::new(MachineConfig::default());
        let a = m.number(1.0).unwrap();
        let cell = m.list(Some(a), None).unwrap();
        let b = m.number(2.0).unwrap();
        let cell = m.list(Some(b), Some(cell)).unwrap();
        assert_eq!(m.heap().list_length(Some(cell)), 2);
    }

    #[test]
    fn test_list_reverse() {
        let mut m = Machine::new(MachineConfig::default());
        let mut list = None;
        for value in [3.0, 2.0, 1.0] {
            let number = m.number(value).unwrap();
            list = Some(m.list(Some(number), list).unwrap());
        }
        // list is 1 2 3
        let reversed = m.list_reverse(list).unwrap();
        let mut cursor = reversed;
        let mut seen = Vec::new();
        while let Some(cell) = cursor {
            let (head, tail) = m.heap().list_parts(cell);
            seen.push(m.heap().number_value(head.unwrap()).unwrap());
            cursor = tail;
        }
        assert_eq!(seen, vec![3.0, 2.0, 1.0]);
        assert_eq!(m.heap().list_length(reversed), 3);
    }

    #[test]
    fn test_vector_from_list() {
        let mut m = Machine::new(MachineConfig::default());
        let mut list = None;
        for value in [3.0, 2.0, 1.0] {
            let number = m.number(value).unwrap();
            list = Some(m.list(Some(number), list).unwrap());
        }
        let vector = m.vector_from_list(list).unwrap();
        let elements = m.heap().vector_elements(vector).unwrap().to_vec();
        assert_eq!(elements.len(), 3);
        assert_eq!(m.heap().number_value(elements[0].unwrap()), Some(1.0));
        assert_eq!(m.heap().length(Some(vector)), 3);
    }

    #[test]
    fn test_clone_value_resets_the_hash_memo() {
        let mut m = Machine::new(MachineConfig::default());
        let original = m.string("payload").unwrap();
        let hash = m.heap().hash(Some(original));
        let copy = m.clone_value(Some(original)).unwrap().unwrap();
        assert_ne!(copy, original);
        // the copy recomputes to the same hash, proving the memo was cleared
        assert_eq!(m.heap().hash(Some(copy)), hash);
        assert!(m.heap().equals(Some(original), Some(copy)));
    }
}
