//! Module plumbing: the registration back-channel and the standard loader.
//!
//! Extension modules export `skein_module_initialize` and
//! `skein_module_finalize` plus any number of native words; the initializer
//! registers words through [`register_function`]. The default kernel path
//! resolves to the compiled-in kernel module so the interpreter bootstraps
//! without an on-disk shared object; every other path goes through the
//! platform linker.

use skein_core::{
    DynamicLoader, Machine, ModuleLoader, NativeFn, NativeModule, ValueRef,
};

use crate::kernel::KernelModule;

/// Paths the loader serves from the compiled-in kernel.
pub const KERNEL_PATHS: &[&str] = &["kernel", "kernel.so", "kernel.dll"];

/// Enters `name -> native(library, function)` into the current dictionary,
/// replacing any existing binding.
pub fn register_function(
    machine: &mut Machine,
    name: &str,
    library: Option<ValueRef>,
    function: NativeFn,
) -> Result<(), ValueRef> {
    let frame = machine.push_frame([library, None, None]);
    let outcome = register_rooted(machine, frame, name, function);
    machine.pop_frame(frame);
    outcome
}

fn register_rooted(
    machine: &mut Machine,
    frame: skein_core::FrameId,
    name: &str,
    function: NativeFn,
) -> Result<(), ValueRef> {
    let symbol = machine.symbol(name)?;
    machine.set_register(frame, 1, Some(symbol));

    let library = machine.registers(frame)[0];
    let native = machine.native(library, function)?;
    machine.set_register(frame, 2, Some(native));

    // the back-channel may run before the dictionary exists
    let dictionary = match machine.scope().dictionary {
        Some(dictionary) => dictionary,
        None => machine.map_with_capacity(16)?,
    };
    let symbol = machine.registers(frame)[1];
    let native = machine.registers(frame)[2];
    let dictionary = machine.map_put(dictionary, symbol, native)?;
    machine.scope_mut().dictionary = Some(dictionary);
    Ok(())
}

/// The loader used by the bootstrap: the builtin kernel for the reserved
/// kernel paths, the platform linker for everything else.
pub struct StandardLoader {
    dynamic: DynamicLoader,
}

impl StandardLoader {
    pub fn new() -> StandardLoader {
        StandardLoader {
            dynamic: DynamicLoader,
        }
    }
}

impl Default for StandardLoader {
    fn default() -> StandardLoader {
        StandardLoader::new()
    }
}

impl ModuleLoader for StandardLoader {
    fn load(&mut self, path: &str) -> Result<Box<dyn NativeModule>, String> {
        if KERNEL_PATHS.contains(&path) {
            Ok(Box::new(KernelModule))
        } else {
            self.dynamic.load(path)
        }
    }
}

/// A machine wired up with the standard loader.
pub fn standard_machine(config: skein_core::MachineConfig) -> Machine {
    Machine::with_loader(config, Box::new(StandardLoader::new()))
}
