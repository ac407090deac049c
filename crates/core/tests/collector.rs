//! Collector and library-lifecycle integration tests.
//!
//! The stub loader stands in for the platform linker so the registry's
//! state machine (dedup, refcounts, collector-driven finalization) can be
//! exercised without building shared objects.

use std::sync::atomic::{AtomicUsize, Ordering};

use skein_core::{
    FINALIZATION_FAILED, Machine, MachineConfig, ModuleHook, ModuleLoader, NativeModule, Scope,
    ValueRef, show,
};

struct Counters {
    loads: AtomicUsize,
    inits: AtomicUsize,
    finis: AtomicUsize,
    unloads: AtomicUsize,
}

impl Counters {
    const fn new() -> Counters {
        Counters {
            loads: AtomicUsize::new(0),
            inits: AtomicUsize::new(0),
            finis: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
        }
    }
}

struct StubModule {
    counters: &'static Counters,
    initializer: ModuleHook,
    finalizer: ModuleHook,
}

impl NativeModule for StubModule {
    fn initializer(&self) -> Option<ModuleHook> {
        Some(self.initializer)
    }

    fn finalizer(&self) -> Option<ModuleHook> {
        Some(self.finalizer)
    }

    fn native(&self, _name: &str) -> Option<skein_core::NativeFn> {
        None
    }
}

impl Drop for StubModule {
    fn drop(&mut self) {
        self.counters.unloads.fetch_add(1, Ordering::SeqCst);
    }
}

struct StubLoader {
    counters: &'static Counters,
    initializer: ModuleHook,
    finalizer: ModuleHook,
}

impl ModuleLoader for StubLoader {
    fn load(&mut self, _path: &str) -> Result<Box<dyn NativeModule>, String> {
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubModule {
            counters: self.counters,
            initializer: self.initializer,
            finalizer: self.finalizer,
        }))
    }
}

fn stub_machine(
    counters: &'static Counters,
    initializer: ModuleHook,
    finalizer: ModuleHook,
) -> Machine {
    Machine::with_loader(
        MachineConfig::default(),
        Box::new(StubLoader {
            counters,
            initializer,
            finalizer,
        }),
    )
}

static LIFECYCLE: Counters = Counters::new();

fn lifecycle_init(_machine: &mut Machine, _library: Option<ValueRef>) -> Result<(), ValueRef> {
    LIFECYCLE.inits.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

fn lifecycle_fini(_machine: &mut Machine, _library: Option<ValueRef>) -> Result<(), ValueRef> {
    LIFECYCLE.finis.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

#[test]
fn test_open_twice_then_close_twice() {
    let mut m = stub_machine(
        &LIFECYCLE,
        ModuleHook::Builtin(lifecycle_init),
        ModuleHook::Builtin(lifecycle_fini),
    );
    let path = "ext/io.so";

    let first = m.library(path).unwrap();
    let frame = m.push_frame([Some(first), None, None]);
    let first = m.open_library(first).unwrap();
    m.set_register(frame, 0, Some(first));

    let second = m.library(path).unwrap();
    m.set_register(frame, 1, Some(second));
    let second = m.open_library(second).unwrap();
    m.set_register(frame, 1, Some(second));

    // one platform handle, one initializer run, two references
    assert_eq!(LIFECYCLE.loads.load(Ordering::SeqCst), 1);
    assert_eq!(LIFECYCLE.inits.load(Ordering::SeqCst), 1);
    assert_eq!(m.registry().reference_count(path), Some(2));
    assert!(m.library_is_loaded(path));
    let (first, second) = {
        let registers = m.registers(frame);
        (registers[0].unwrap(), registers[1].unwrap())
    };
    assert_eq!(m.heap().library_handle(first), m.heap().library_handle(second));
    assert!(m.heap().library_handle(first).is_some());
    // both values point at the same library
    assert!(m.heap().equals(Some(first), Some(second)));

    m.close_library(first).unwrap();
    assert_eq!(LIFECYCLE.finis.load(Ordering::SeqCst), 0);
    assert_eq!(m.registry().reference_count(path), Some(1));

    m.close_library(second).unwrap();
    assert_eq!(LIFECYCLE.finis.load(Ordering::SeqCst), 1);
    assert_eq!(LIFECYCLE.unloads.load(Ordering::SeqCst), 1);
    assert!(!m.library_is_loaded(path));
    m.pop_frame(frame);
}

static REACHABLE: Counters = Counters::new();

fn reachable_init(_machine: &mut Machine, _library: Option<ValueRef>) -> Result<(), ValueRef> {
    REACHABLE.inits.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

fn reachable_fini(_machine: &mut Machine, _library: Option<ValueRef>) -> Result<(), ValueRef> {
    REACHABLE.finis.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

#[test]
fn test_collector_retires_unreachable_libraries_only() {
    let mut m = stub_machine(
        &REACHABLE,
        ModuleHook::Builtin(reachable_init),
        ModuleHook::Builtin(reachable_fini),
    );

    let kept = m.library("ext/kept.so").unwrap();
    let frame = m.push_frame([Some(kept), None, None]);
    let kept = m.open_library(kept).unwrap();
    m.set_register(frame, 0, Some(kept));

    let dropped = m.library("ext/dropped.so").unwrap();
    let dropped = m.open_library(dropped).unwrap();
    // `dropped` is reachable from nothing; the next collection retires it
    let _ = dropped;

    m.collect().unwrap();
    assert_eq!(REACHABLE.finis.load(Ordering::SeqCst), 1);
    assert_eq!(REACHABLE.unloads.load(Ordering::SeqCst), 1);
    assert!(!m.library_is_loaded("ext/dropped.so"));
    assert!(m.library_is_loaded("ext/kept.so"));

    // the weak entry now points at the relocated value
    let kept = m.registers(frame)[0].unwrap();
    assert_eq!(m.heap().library_path(kept), Some("ext/kept.so"));
    assert!(m.heap().library_handle(kept).is_some());

    // dropping the last reference retires the survivor too
    m.set_register(frame, 0, None);
    m.collect().unwrap();
    assert_eq!(REACHABLE.finis.load(Ordering::SeqCst), 2);
    assert!(!m.library_is_loaded("ext/kept.so"));
    assert_eq!(m.registry().loaded_count(), 0);
    m.pop_frame(frame);
}

static FAILING: Counters = Counters::new();

fn failing_init(_machine: &mut Machine, _library: Option<ValueRef>) -> Result<(), ValueRef> {
    FAILING.inits.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

fn failing_fini(_machine: &mut Machine, _library: Option<ValueRef>) -> Result<(), ValueRef> {
    FAILING.finis.fetch_add(1, Ordering::SeqCst);
    Err(FINALIZATION_FAILED)
}

#[test]
fn test_failed_finalizer_defers_the_rest() {
    let mut m = stub_machine(
        &FAILING,
        ModuleHook::Builtin(failing_init),
        ModuleHook::Builtin(failing_fini),
    );

    let a = m.library("ext/a.so").unwrap();
    let a = m.open_library(a).unwrap();
    let b = m.library("ext/b.so").unwrap();
    let b = m.open_library(b).unwrap();
    let _ = (a, b);
    assert_eq!(m.registry().loaded_count(), 2);

    // both are unreachable; the first finalizer failure defers the second
    let error = m.collect().unwrap_err();
    assert_eq!(error, FINALIZATION_FAILED);
    assert_eq!(FAILING.finis.load(Ordering::SeqCst), 1);
    assert_eq!(m.registry().loaded_count(), 1);

    let error = m.collect().unwrap_err();
    assert_eq!(error, FINALIZATION_FAILED);
    assert_eq!(FAILING.finis.load(Ordering::SeqCst), 2);
    assert_eq!(m.registry().loaded_count(), 0);
}

#[test]
fn test_values_survive_repeated_collection_and_growth() {
    let mut m = Machine::new(MachineConfig {
        heap_size: 512,
        ..MachineConfig::default()
    });

    // a structure spanning every container variant
    let built = {
        let map = m.map_with_capacity(4).unwrap();
        let frame = m.push_frame([Some(map), None, None]);
        for index in 0..8 {
            // the key stays rooted across the number allocation
            let key = m.string(&format!("key-{index}")).unwrap();
            m.set_register(frame, 1, Some(key));
            let value = m.number(index as f64).unwrap();
            let map = m.registers(frame)[0].unwrap();
            let key = m.registers(frame)[1];
            let map = m.map_put(map, key, Some(value)).unwrap();
            m.set_register(frame, 0, Some(map));
        }
        let map = m.registers(frame)[0];
        let cell = m.list(map, None).unwrap();
        m.set_register(frame, 0, Some(cell));
        let word = m.symbol("anchor").unwrap();
        let map_cell = m.registers(frame)[0];
        let cell = m.list(Some(word), map_cell).unwrap();
        m.set_register(frame, 0, Some(cell));
        let list = m.registers(frame)[0];
        let vector = m.vector_from_list(list).unwrap();
        m.set_register(frame, 1, Some(vector));
        let list = m.registers(frame)[0];
        let vector = m.registers(frame)[1];
        let cell = m.list(vector, list).unwrap();
        m.pop_frame(frame);
        cell
    };

    let frame = m.push_frame([Some(built), None, None]);
    let before = show(m.heap(), m.registers(frame)[0]);

    for round in 0..5 {
        // churn enough garbage to force collection and growth
        for index in 0..64 {
            m.string(&format!("garbage-{round}-{index}")).unwrap();
        }
        m.collect().unwrap();
        let survivor = m.registers(frame)[0];
        assert!(m.heap().equals(survivor, survivor));
        assert_eq!(show(m.heap(), survivor), before);
    }
    m.pop_frame(frame);
}

#[test]
fn test_registry_weak_list_drops_dead_values() {
    static QUIET: Counters = Counters::new();
    fn quiet_init(_machine: &mut Machine, _library: Option<ValueRef>) -> Result<(), ValueRef> {
        Ok(())
    }
    fn quiet_fini(_machine: &mut Machine, _library: Option<ValueRef>) -> Result<(), ValueRef> {
        Ok(())
    }

    let mut m = stub_machine(
        &QUIET,
        ModuleHook::Builtin(quiet_init),
        ModuleHook::Builtin(quiet_fini),
    );
    // constructed but never opened: tracked, then dropped by the collector
    for index in 0..4 {
        m.library(&format!("ext/unused-{index}.so")).unwrap();
    }
    assert_eq!(m.registry().tracked_count(), 4);
    m.collect().unwrap();
    assert_eq!(m.registry().tracked_count(), 0);
    assert_eq!(m.registry().loaded_count(), 0);
}

#[test]
fn test_scope_stacks_are_roots() {
    let mut m = Machine::new(MachineConfig::default());
    let value = m.string("on the stack").unwrap();
    m.push_data(Some(value)).unwrap();
    m.push_scope(Scope::default());
    let inner = m.string("inner dictionary key").unwrap();
    let dictionary = m.map_with_capacity(4).unwrap();
    let dictionary = m.map_put(dictionary, Some(inner), None).unwrap();
    m.scope_mut().dictionary = Some(dictionary);

    m.collect().unwrap();

    // the inner scope's dictionary survived
    let dictionary = m.scope().dictionary.unwrap();
    assert_eq!(m.heap().map_dims(dictionary).1, 1);
    m.pop_scope();
    // and so did the outer data stack
    let top = m.pop_data("test").unwrap().unwrap();
    assert_eq!(m.heap().string_text(top), Some("on the stack"));
}
