//! Textual rendering of values.
//!
//! `dump` writes the canonical form to a stream; `show` produces the same
//! content as a host string, except that maps are rendered as a literal
//! `[ k v … ] map-from-list` so the output can be scanned back in.

use std::io;

use crate::heap::Heap;
use crate::unicode;
use crate::value::{ObjKind, ValueRef};

#[derive(Clone, Copy, PartialEq, Eq)]
enum MapStyle {
    /// `[ k : v … ]`
    Entries,
    /// `[ k v … ] map-from-list`
    Reparseable,
}

/// Writes the canonical rendering of `value` to `writer`.
pub fn dump<W: io::Write>(heap: &Heap, writer: &mut W, value: Option<ValueRef>) -> io::Result<()> {
    let mut out = String::new();
    render(heap, &mut out, value, MapStyle::Entries);
    writer.write_all(out.as_bytes())
}

/// Renders `value` into a host string, in a form the scanner can read back
/// for the variants it recognizes.
pub fn show(heap: &Heap, value: Option<ValueRef>) -> String {
    let mut out = String::new();
    render(heap, &mut out, value, MapStyle::Reparseable);
    out
}

fn render(heap: &Heap, out: &mut String, value: Option<ValueRef>, style: MapStyle) {
    let Some(reference) = value else {
        out.push_str("[ ]");
        return;
    };
    match &heap.get(reference).kind {
        ObjKind::Symbol(name) => out.push_str(name),
        ObjKind::Number(value) => render_number(out, *value),
        ObjKind::Boolean(true) => out.push_str("true"),
        ObjKind::Boolean(false) => out.push_str("false"),
        ObjKind::String { bytes, .. } => {
            out.push('"');
            for c in bytes.chars() {
                match unicode::escape(c) {
                    Some(sequence) => out.push_str(sequence),
                    None => out.push(c),
                }
            }
            out.push('"');
        }
        ObjKind::List { .. } => {
            out.push_str("[ ");
            let mut cursor = Some(reference);
            while let Some(cell) = cursor {
                let (head, tail) = heap.list_parts(cell);
                render(heap, out, head, style);
                if tail.is_some() {
                    out.push(' ');
                }
                cursor = tail;
            }
            out.push_str(" ]");
        }
        ObjKind::Map { .. } => render_map(heap, out, reference, style),
        ObjKind::Vector(elements) => {
            out.push_str("( ");
            for (index, element) in elements.iter().enumerate() {
                render(heap, out, *element, style);
                if index + 1 < elements.len() {
                    out.push(' ');
                }
            }
            out.push_str(" )");
        }
        ObjKind::Native { function, .. } => {
            out.push_str(&format!("function#0x{:08X}", function.addr()));
        }
        ObjKind::Library { handle, .. } => {
            let token = handle.map_or(0, |handle| handle.token());
            out.push_str(&format!("library#0x{token:08X}"));
        }
        ObjKind::Exception { cause: _, message } => {
            render(heap, out, *message, style);
            out.push_str(" exception");
        }
    }
}

fn render_map(heap: &Heap, out: &mut String, reference: ValueRef, style: MapStyle) {
    out.push_str("[ ");
    let (capacity, _) = heap.map_dims(reference);
    let mut first = true;
    for index in 0..capacity as usize {
        let mut cursor = heap.map_bucket(reference, index);
        while cursor.is_some() {
            if !first {
                out.push(' ');
            }
            first = false;
            render(heap, out, heap.pair_key(cursor), style);
            match style {
                MapStyle::Entries => out.push_str(" : "),
                MapStyle::Reparseable => out.push(' '),
            }
            render(heap, out, heap.pair_value(cursor), style);
            cursor = heap.pair_next(cursor);
        }
    }
    if first {
        out.push(']');
    } else {
        out.push_str(" ]");
    }
    if style == MapStyle::Reparseable {
        out.push_str(" map-from-list");
    }
}

/// Numbers print in integer form when that round-trips, decimal otherwise.
fn render_number(out: &mut String, value: f64) {
    if value.is_finite() && value == value.trunc() && value.abs() < 9.007_199_254_740_992e15 {
        out.push_str(&format!("{}", value as i64));
    } else {
        out.push_str(&format!("{value}"));
    }
}
