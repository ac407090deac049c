//! Skein runtime: the interpreter over the skein-core value model.
//!
//! - `scanner`: UTF-8-aware lexer producing number/string/boolean/symbol
//!   tokens, and the `tokens` builder that turns source into a value list
//! - `interp`: the concatenative run loop
//! - `kernel`: the compiled-in kernel module and its builtin words
//! - `module`: the registration back-channel and the standard loader
//! - `boot`: program entry, finalization and exception reporting

pub mod boot;
pub mod interp;
pub mod kernel;
pub mod module;
pub mod scanner;

pub use boot::{execute, finalize, initialize, report};
pub use module::{KERNEL_PATHS, StandardLoader, register_function, standard_machine};
pub use scanner::{Scanner, Token, tokens};
