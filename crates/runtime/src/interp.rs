//! The run loop.
//!
//! `run` is itself a native word: it pops the (data stack, call stack,
//! dictionary) triple off the outer data stack, opens a fresh scope with it,
//! and drains the call stack one instruction at a time. A symbol consults
//! the dictionary: a miss pushes the symbol itself, a list inlines as the
//! word's body, a native function executes against the current frame, and
//! any other binding re-enters the call stack as a single instruction.
//! Whatever is not a symbol is data and goes straight to the data stack.

use std::io::{self, Write};

use tracing::trace;

use skein_core::{FrameId, MISS, Machine, Scope, ValueRef, dump};

/// The `run` word.
pub fn run(machine: &mut Machine) -> Result<(), ValueRef> {
    let datastack = machine.pop_data("run")?;
    let callstack = machine.pop_data("run")?;
    let dictionary = machine.pop_data("run")?;
    machine.push_scope(Scope {
        dictionary,
        callstack,
        datastack,
    });

    let outcome = run_loop(machine);

    // hand the updated triple back to the caller, keeping it rooted across
    // the pushes
    let scope = *machine.scope();
    let frame = machine.push_frame([scope.datastack, scope.callstack, scope.dictionary]);
    machine.pop_scope();
    let outcome = outcome.and_then(|()| {
        machine.push_data(machine.registers(frame)[2])?;
        machine.push_data(machine.registers(frame)[1])?;
        machine.push_data(machine.registers(frame)[0])?;
        Ok(())
    });
    machine.pop_frame(frame);
    outcome
}

fn run_loop(machine: &mut Machine) -> Result<(), ValueRef> {
    while let Some(callstack) = machine.scope().callstack {
        let (instruction, rest) = machine.heap().list_parts(callstack);
        machine.scope_mut().callstack = rest;

        let frame = machine.push_frame([instruction, None, None]);
        let stepped = step(machine, frame);
        machine.pop_frame(frame);
        stepped?;

        if machine.config.verbosity >= 1 {
            echo_datastack(machine);
        }
    }
    Ok(())
}

fn step(machine: &mut Machine, frame: FrameId) -> Result<(), ValueRef> {
    let instruction = machine.registers(frame)[0];
    if !machine.heap().is_symbol(instruction) {
        // data: straight to the data stack
        return machine.push_data(instruction);
    }

    let bound = match machine.scope().dictionary {
        Some(dictionary) => machine
            .heap()
            .map_get_or_else(dictionary, instruction, Some(MISS)),
        None => Some(MISS),
    };
    if bound == Some(MISS) {
        // unbound symbols are data too
        return machine.push_data(instruction);
    }

    if let Some(binding) = bound {
        if machine.heap().is_list(Some(binding)) {
            return inline_body(machine, frame, binding);
        }
        if let Some(function) = machine.heap().native_function(binding) {
            trace!(word = instruction.and_then(|i| machine.heap().symbol_text(i)), "native call");
            return function.invoke(machine);
        }
    }

    // a value alias: re-enter the call stack as one instruction
    let cell = machine.list(bound, machine.scope().callstack)?;
    machine.scope_mut().callstack = Some(cell);
    Ok(())
}

/// Prepends the body so its first element executes next.
fn inline_body(machine: &mut Machine, frame: FrameId, body: ValueRef) -> Result<(), ValueRef> {
    let reversed = machine.list_reverse(Some(body))?;
    machine.set_register(frame, 1, reversed);
    while let Some(cursor) = machine.registers(frame)[1] {
        let head = machine.heap().list_parts(cursor).0;
        let cell = machine.list(head, machine.scope().callstack)?;
        machine.scope_mut().callstack = Some(cell);
        let cursor = machine.registers(frame)[1];
        let tail = cursor.and_then(|cell| machine.heap().list_parts(cell).1);
        machine.set_register(frame, 1, tail);
    }
    Ok(())
}

fn echo_datastack(machine: &Machine) {
    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    let _ = stdout.write_all(b"[stack] ");
    let _ = dump(machine.heap(), &mut stdout, machine.scope().datastack);
    let _ = stdout.write_all(b"\n");
}
