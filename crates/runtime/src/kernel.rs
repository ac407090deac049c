//! Builtin kernel words.
//!
//! The kernel is a module like any other: its initializer registers the
//! builtin words (including `run`) into the current dictionary, and the
//! loader resolves the default kernel path to this compiled-in module so no
//! shared object is needed for bootstrap. Arithmetic and everything else
//! userland lives in extension libraries.

use skein_core::{
    BuiltinFn, Machine, ModuleHook, NativeFn, NativeModule, ValueRef,
};

use crate::module::register_function;

const WORDS: &[(&str, BuiltinFn)] = &[
    ("run", crate::interp::run),
    ("type", word_type),
    ("hash", word_hash),
    ("equals", word_equals),
    ("show", word_show),
    ("length", word_length),
    ("throw", word_throw),
    ("nil", word_nil),
    ("push", word_push),
    ("library", word_library),
    ("native", word_native),
    ("tokens", word_tokens),
    ("gc", word_gc),
];

/// Registers every kernel word into the current dictionary.
pub fn install(machine: &mut Machine, library: Option<ValueRef>) -> Result<(), ValueRef> {
    let frame = machine.push_frame([library, None, None]);
    let mut outcome = Ok(());
    for (name, function) in WORDS {
        let library = machine.registers(frame)[0];
        if let Err(exception) = register_function(machine, name, library, NativeFn::Builtin(*function)) {
            outcome = Err(exception);
            break;
        }
    }
    machine.pop_frame(frame);
    outcome
}

fn finalize(_machine: &mut Machine, _library: Option<ValueRef>) -> Result<(), ValueRef> {
    Ok(())
}

/// The compiled-in kernel as a loadable module.
pub struct KernelModule;

impl NativeModule for KernelModule {
    fn initializer(&self) -> Option<ModuleHook> {
        Some(ModuleHook::Builtin(install))
    }

    fn finalizer(&self) -> Option<ModuleHook> {
        Some(ModuleHook::Builtin(finalize))
    }

    fn native(&self, name: &str) -> Option<NativeFn> {
        WORDS
            .iter()
            .find(|(word, _)| *word == name)
            .map(|(_, function)| NativeFn::Builtin(*function))
    }
}

/* ***** words ***** */

/// `v -- "type"`
fn word_type(machine: &mut Machine) -> Result<(), ValueRef> {
    let value = machine.pop_data("type")?;
    let name = machine.heap().type_name(value);
    let rendered = machine.string(name)?;
    machine.push_data(Some(rendered))
}

/// `v -- n` where n is the memoized structural hash.
fn word_hash(machine: &mut Machine) -> Result<(), ValueRef> {
    let value = machine.pop_data("hash")?;
    let hash = machine.heap().hash(value);
    let number = machine.number(hash as f64)?;
    machine.push_data(Some(number))
}

/// `a b -- bool`
fn word_equals(machine: &mut Machine) -> Result<(), ValueRef> {
    let a = machine.pop_data("equals")?;
    let b = machine.pop_data("equals")?;
    let equal = machine.heap().equals(a, b);
    let value = machine.boolean(equal)?;
    machine.push_data(Some(value))
}

/// `v -- "v"`
fn word_show(machine: &mut Machine) -> Result<(), ValueRef> {
    let value = machine.pop_data("show")?;
    let rendered = skein_core::show(machine.heap(), value);
    let text = machine.string(&rendered)?;
    machine.push_data(Some(text))
}

/// `v -- n` for lists, strings, maps and vectors.
fn word_length(machine: &mut Machine) -> Result<(), ValueRef> {
    let value = machine.pop_data("length")?;
    let measurable = matches!(
        machine.heap().type_name(value),
        "list" | "string" | "map" | "vector"
    );
    if !measurable {
        return Err(machine.type_error(
            value,
            "length",
            "'list', 'string', 'map' or 'vector'",
        ));
    }
    let length = machine.heap().length(value);
    let number = machine.number(length as f64)?;
    machine.push_data(Some(number))
}

/// `v --` raising v.
fn word_throw(machine: &mut Machine) -> Result<(), ValueRef> {
    let value = machine.pop_data("throw")?;
    match value {
        Some(exception) => Err(exception),
        // throwing the absent value raises nothing
        None => Ok(()),
    }
}

/// `-- [ ]`
fn word_nil(machine: &mut Machine) -> Result<(), ValueRef> {
    machine.push_data(None)
}

/// `head tail -- list` consing head onto tail.
fn word_push(machine: &mut Machine) -> Result<(), ValueRef> {
    let head = machine.pop_data("push")?;
    let tail = machine.pop_data("push")?;
    if !machine.heap().is_list(tail) {
        return Err(machine.type_error(tail, "push", "'list'"));
    }
    let cell = machine.list(head, tail)?;
    machine.push_data(Some(cell))
}

/// `"path" -- library` loading (or re-referencing) the module at path.
fn word_library(machine: &mut Machine) -> Result<(), ValueRef> {
    let value = machine.pop_data("library")?;
    let path = value.and_then(|v| machine.heap().string_text(v).map(String::from));
    let Some(path) = path else {
        return Err(machine.type_error(value, "library", "'string'"));
    };
    let library = machine.library(&path)?;
    let library = machine.open_library(library)?;
    machine.push_data(Some(library))
}

/// `"name" library -- function` resolving an exported native.
fn word_native(machine: &mut Machine) -> Result<(), ValueRef> {
    let name_value = machine.pop_data("native")?;
    let library = machine.pop_data("native")?;
    let name = name_value.and_then(|v| machine.heap().string_text(v).map(String::from));
    let Some(name) = name else {
        return Err(machine.type_error(name_value, "native", "'string'"));
    };
    let Some(library) = library else {
        return Err(machine.type_error(library, "native", "'library'"));
    };
    let function = machine.lookup_native(library, &name)?;
    let value = machine.native(Some(library), function)?;
    machine.push_data(Some(value))
}

/// `"source" -- tokens` scanning a string into a token list.
fn word_tokens(machine: &mut Machine) -> Result<(), ValueRef> {
    let value = machine.pop_data("tokens")?;
    let Some(source) = value else {
        return Err(machine.type_error(value, "tokens", "'string'"));
    };
    let tokens = crate::scanner::tokens(machine, source)?;
    machine.push_data(tokens)
}

/// `--` forcing a collection.
fn word_gc(machine: &mut Machine) -> Result<(), ValueRef> {
    machine.collect()
}
