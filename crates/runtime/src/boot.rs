//! Program bootstrap.
//!
//! The entry sequence mirrors the module lifecycle: allocate a dictionary,
//! open the configured kernel (whose initializer registers `run`), hand the
//! (data stack, call stack, dictionary) triple to `run` through the outer
//! data stack, and pop the updated triple afterwards. The finalizer clears
//! the roots and collects once so unreachable libraries shut down.

use std::io;

use tracing::debug;

use skein_core::{MISS, Machine, ValueRef, dump};

use crate::scanner;

/// Scans `source` onto the call stack and boots the machine over it.
pub fn execute(machine: &mut Machine, source: &str) -> Result<(), ValueRef> {
    let program = machine.string(source)?;
    let tokens = scanner::tokens(machine, program)?;
    machine.scope_mut().callstack = tokens;
    initialize(machine)
}

/// Boots the machine over whatever the root call stack already holds.
pub fn initialize(machine: &mut Machine) -> Result<(), ValueRef> {
    let dictionary = machine.map_with_capacity(16)?;
    machine.scope_mut().dictionary = Some(dictionary);

    let path = machine.config.kernel_path.clone();
    debug!(kernel = %path, "bootstrapping");
    let library = machine.library(&path)?;
    let library = machine.open_library(library)?;

    // keep the kernel value alive until run returns; the final collection
    // retires it once the dictionary is gone
    let frame = machine.push_frame([Some(library), None, None]);
    let outcome = bootstrap_run(machine);
    machine.pop_frame(frame);
    outcome
}

fn bootstrap_run(machine: &mut Machine) -> Result<(), ValueRef> {
    let frame = machine.push_frame([machine.scope().datastack, None, None]);
    let outcome = bootstrap_run_rooted(machine, frame);
    machine.pop_frame(frame);
    outcome
}

fn bootstrap_run_rooted(
    machine: &mut Machine,
    frame: skein_core::FrameId,
) -> Result<(), ValueRef> {
    // push the triple so its head is the data stack
    machine.push_data(machine.scope().dictionary)?;
    machine.push_data(machine.scope().callstack)?;
    machine.push_data(machine.registers(frame)[0])?;

    // `run` must be present in the dictionary by now
    let symbol = machine.symbol("run")?;
    let bound = match machine.scope().dictionary {
        Some(dictionary) => machine
            .heap()
            .map_get_or_else(dictionary, Some(symbol), Some(MISS)),
        None => Some(MISS),
    };
    let function = if bound == Some(MISS) {
        None
    } else {
        bound.and_then(|binding| machine.heap().native_function(binding))
    };
    let Some(function) = function else {
        return Err(machine.exception("failed to initialize module 'kernel' in function 'run'"));
    };
    function.invoke(machine)?;

    // pop the triple `run` handed back; the third slot is kept for layout
    // compatibility and not otherwise used
    machine.pop_data("run")?;
    machine.pop_data("run")?;
    machine.pop_data("run")?;
    Ok(())
}

/// Drops the roots and runs a final collection so library finalizers fire.
pub fn finalize(machine: &mut Machine) -> Result<(), ValueRef> {
    let scope = machine.scope_mut();
    scope.dictionary = None;
    scope.callstack = None;
    scope.datastack = None;
    machine.collect()
}

/// Prints the exception chain, one line per link: the first prefixed
/// `[exception]`, the rest `caused by`.
pub fn report<W: io::Write>(
    machine: &Machine,
    writer: &mut W,
    exception: ValueRef,
) -> io::Result<()> {
    let mut current = Some(exception);
    let mut first = true;
    while let Some(reference) = current {
        let prefix: &[u8] = if first { b"[exception] " } else { b"caused by " };
        writer.write_all(prefix)?;
        match machine.heap().exception_parts(reference) {
            Some((cause, message)) => {
                match message.and_then(|m| machine.heap().string_text(m)) {
                    // message content, not its quoted rendering
                    Some(text) => writer.write_all(text.as_bytes())?,
                    None => dump(machine.heap(), writer, message)?,
                }
                current = cause;
            }
            None => {
                // plain values can be thrown too
                dump(machine.heap(), writer, Some(reference))?;
                current = None;
            }
        }
        writer.write_all(b"\n")?;
        first = false;
    }
    Ok(())
}
