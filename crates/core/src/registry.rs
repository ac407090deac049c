//! Native library registry.
//!
//! The registry coordinates loading of extension modules: entries are keyed
//! by path, deduplicated, and reference counted. Library *values* on the
//! managed heap are tracked through a separate weak list that the collector
//! updates during every collection; when no managed reference to a path
//! remains, the collector retires the module by calling its finalizer and
//! unloading the platform handle. Explicit `open`/`close` drive the same
//! hooks through the reference count.
//!
//! Loading itself sits behind [`ModuleLoader`] so the state machine is
//! testable without building shared objects; [`DynamicLoader`] is the real
//! implementation on top of `libloading`.

use std::collections::HashMap;

use tracing::debug;

use crate::heap::Heap;
use crate::machine::Machine;
use crate::value::{FINALIZATION_FAILED, ModuleHandle, ModuleHook, NativeFn, ValueRef};

/// Name of the initializer a module exports.
pub const INITIALIZER_SYMBOL: &str = "skein_module_initialize";
/// Name of the finalizer a module exports.
pub const FINALIZER_SYMBOL: &str = "skein_module_finalize";

/// A loaded extension module: its lifecycle hooks plus name resolution for
/// the `native` word.
pub trait NativeModule {
    fn initializer(&self) -> Option<ModuleHook>;
    fn finalizer(&self) -> Option<ModuleHook>;
    fn native(&self, name: &str) -> Option<NativeFn>;
}

/// Produces modules from paths. Dropping the returned box unloads the module.
pub trait ModuleLoader {
    fn load(&mut self, path: &str) -> Result<Box<dyn NativeModule>, String>;

    /// Whether the platform already has this module resident without loading
    /// it. Loaders without a non-loading probe report `false`.
    fn is_resident(&self, path: &str) -> bool {
        let _ = path;
        false
    }
}

pub(crate) struct Entry {
    pub handle: ModuleHandle,
    pub module: Box<dyn NativeModule>,
    pub references: u64,
}

/// An entry whose library values all became unreachable; the machine calls
/// its finalizer after the collection completes.
pub(crate) struct DeadLibrary {
    pub path: Box<str>,
    pub entry: Entry,
}

pub struct Registry {
    pub(crate) loader: Box<dyn ModuleLoader>,
    entries: HashMap<Box<str>, Entry>,
    /// Weak references to every library value on the managed heap.
    weak: Vec<ValueRef>,
    next_handle: u64,
}

impl Registry {
    pub(crate) fn new(loader: Box<dyn ModuleLoader>) -> Registry {
        Registry {
            loader,
            entries: HashMap::new(),
            weak: Vec::new(),
            next_handle: 1,
        }
    }

    pub(crate) fn track(&mut self, library: ValueRef) {
        self.weak.push(library);
    }

    pub(crate) fn next_handle(&mut self) -> ModuleHandle {
        let handle = ModuleHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    pub(crate) fn get_mut(&mut self, path: &str) -> Option<&mut Entry> {
        self.entries.get_mut(path)
    }

    pub(crate) fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub(crate) fn insert(&mut self, path: Box<str>, entry: Entry) {
        self.entries.insert(path, entry);
    }

    pub(crate) fn remove(&mut self, path: &str) -> Option<Entry> {
        self.entries.remove(path)
    }

    pub(crate) fn reinsert(&mut self, dead: DeadLibrary) {
        self.entries.insert(dead.path, dead.entry);
    }

    /// Collector hook: update every weak reference to its new location, drop
    /// the ones whose value did not survive, and withdraw the entries that no
    /// longer have any managed reference.
    pub(crate) fn sweep(&mut self, heap: &mut Heap) -> Vec<DeadLibrary> {
        let mut kept = Vec::with_capacity(self.weak.len());
        let mut live_paths: Vec<Box<str>> = Vec::new();
        for reference in self.weak.drain(..) {
            match heap.forwarded(reference) {
                Some(forward) => {
                    if let Some(path) = heap.library_path(forward) {
                        live_paths.push(path.into());
                    }
                    kept.push(forward);
                }
                None => {}
            }
        }
        self.weak = kept;

        let dead_paths: Vec<Box<str>> = self
            .entries
            .keys()
            .filter(|path| !live_paths.iter().any(|live| live == *path))
            .cloned()
            .collect();
        dead_paths
            .into_iter()
            .filter_map(|path| {
                let entry = self.entries.remove(&path)?;
                Some(DeadLibrary { path, entry })
            })
            .collect()
    }

    /* ***** inspection ***** */

    /// Whether the registry currently holds this path.
    pub fn is_loaded(&self, path: &str) -> bool {
        self.entries.contains_key(path) || self.loader.is_resident(path)
    }

    pub fn reference_count(&self, path: &str) -> Option<u64> {
        self.entries.get(path).map(|entry| entry.references)
    }

    pub fn handle_of(&self, path: &str) -> Option<ModuleHandle> {
        self.entries.get(path).map(|entry| entry.handle)
    }

    pub fn loaded_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of library values the collector currently tracks.
    pub fn tracked_count(&self) -> usize {
        self.weak.len()
    }
}

impl Machine {
    /// Opens the library a value points at.
    ///
    /// A path already in the registry only bumps its reference count.
    /// Otherwise the module is loaded, entered into the registry, and its
    /// initializer runs with the library value on hand; any failure unloads
    /// the fresh handle again. Returns the (possibly relocated) library
    /// value.
    pub fn open_library(&mut self, library: ValueRef) -> Result<ValueRef, ValueRef> {
        let original = library;
        let Some(path) = self.heap().library_path(library).map(Box::<str>::from) else {
            return Err(self.type_error(Some(library), "library", "'library'"));
        };

        let existing = self.registry_mut().get_mut(&path).map(|entry| {
            entry.references += 1;
            (entry.handle, entry.references)
        });
        if let Some((handle, references)) = existing {
            self.heap_mut().set_library_handle(library, Some(handle));
            debug!(path = %path, references, "reusing loaded library");
            return Ok(library);
        }

        let module = match self.registry_mut().loader.load(&path) {
            Ok(module) => module,
            Err(error) => {
                return Err(self.exception(&format!("failed to load library '{path}': {error}")));
            }
        };
        let initializer = module.initializer();
        let handle = self.registry_mut().next_handle();
        self.registry_mut().insert(
            path.clone(),
            Entry {
                handle,
                module,
                references: 1,
            },
        );
        self.heap_mut().set_library_handle(library, Some(handle));
        debug!(path = %path, token = handle.token(), "loaded library");

        let frame = self.push_frame([Some(library), None, None]);
        let outcome = match initializer {
            Some(hook) => {
                let library = self.registers(frame)[0];
                hook.invoke(self, library)
            }
            None => Err(self.exception(&format!("failed to load library '{path}'"))),
        };
        let library = self.registers(frame)[0];
        self.pop_frame(frame);

        if let Err(exception) = outcome {
            // do not leak the platform handle
            if let Some(entry) = self.registry_mut().remove(&path) {
                drop(entry);
            }
            if let Some(library) = library {
                self.heap_mut().set_library_handle(library, None);
            }
            return Err(exception);
        }
        // the rooted register keeps the library alive through the initializer
        Ok(library.unwrap_or(original))
    }

    /// Releases one reference to the library a value points at. Dropping the
    /// last reference runs the finalizer and unloads the handle; any error on
    /// that path surfaces as a single `finalization failed` exception while
    /// the removal still completes.
    pub fn close_library(&mut self, library: ValueRef) -> Result<(), ValueRef> {
        let Some(path) = self.heap().library_path(library).map(Box::<str>::from) else {
            return Err(self.type_error(Some(library), "library", "'library'"));
        };
        let Some(entry) = self.registry_mut().get_mut(&path) else {
            return Err(FINALIZATION_FAILED);
        };

        entry.references -= 1;
        if entry.references > 0 {
            debug!(path = %path, references = entry.references, "released library reference");
            return Ok(());
        }

        let Some(entry) = self.registry_mut().remove(&path) else {
            return Err(FINALIZATION_FAILED);
        };
        self.heap_mut().set_library_handle(library, None);
        debug!(path = %path, "unloading library");

        let frame = self.push_frame([Some(library), None, None]);
        let finalizer = entry.module.finalizer();
        let outcome = match finalizer {
            Some(hook) => {
                let library = self.registers(frame)[0];
                hook.invoke(self, library)
            }
            None => Err(FINALIZATION_FAILED),
        };
        self.pop_frame(frame);
        // unload after the finalizer has run
        drop(entry);

        match outcome {
            Ok(()) => Ok(()),
            Err(FINALIZATION_FAILED) => Err(FINALIZATION_FAILED),
            Err(cause) => Err(self.exception_caused(Some(cause), "finalization failed")),
        }
    }

    /// Resolves an exported native function from an open library value.
    pub fn lookup_native(&mut self, library: ValueRef, name: &str) -> Result<NativeFn, ValueRef> {
        let Some(path) = self.heap().library_path(library).map(Box::<str>::from) else {
            return Err(self.type_error(Some(library), "native", "'library'"));
        };
        let resolved = self.registry().get(&path).map(|entry| entry.module.native(name));
        match resolved {
            None => Err(self.exception(&format!("library '{path}' is not loaded"))),
            Some(None) => Err(self.exception(&format!(
                "failed to resolve symbol '{name}' in library '{path}'"
            ))),
            Some(Some(function)) => Ok(function),
        }
    }

    /// Whether the path is loaded, asking the registry first and the
    /// platform loader's non-loading probe second.
    pub fn library_is_loaded(&self, path: &str) -> bool {
        self.registry().is_loaded(path)
    }
}

/* ***** dynamic loading ***** */

/// Loads modules through the platform's dynamic linker.
pub struct DynamicLoader;

struct DynamicModule {
    library: libloading::Library,
}

impl DynamicModule {
    fn hook(&self, name: &str) -> Option<ModuleHook> {
        let symbol = format!("{name}\0");
        unsafe {
            self.library
                .get::<crate::value::ForeignHook>(symbol.as_bytes())
                .ok()
                .map(|symbol| ModuleHook::Foreign(*symbol))
        }
    }
}

impl NativeModule for DynamicModule {
    fn initializer(&self) -> Option<ModuleHook> {
        self.hook(INITIALIZER_SYMBOL)
    }

    fn finalizer(&self) -> Option<ModuleHook> {
        self.hook(FINALIZER_SYMBOL)
    }

    fn native(&self, name: &str) -> Option<NativeFn> {
        let symbol = format!("{name}\0");
        unsafe {
            self.library
                .get::<crate::value::ForeignFn>(symbol.as_bytes())
                .ok()
                .map(|symbol| NativeFn::Foreign(*symbol))
        }
    }
}

impl ModuleLoader for DynamicLoader {
    fn load(&mut self, path: &str) -> Result<Box<dyn NativeModule>, String> {
        let library = unsafe { libloading::Library::new(path) }.map_err(|e| e.to_string())?;
        Ok(Box::new(DynamicModule { library }))
    }
}
