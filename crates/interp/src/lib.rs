//! mscript: a bytecode interpreter for a small dynamically-typed scripting
//! language.
//!
//! The front end is a hand-written scanner and a single-pass Pratt compiler
//! that emits bytecode directly; a stack-based virtual machine executes it.
//! The embedder surface is deliberately small:
//!
//! ```rust
//! use mscript::Vm;
//!
//! let mut vm = Vm::new();
//! vm.interpret("x = 3\nx = x + 4\n").unwrap();
//! assert_eq!(vm.global("x").unwrap().to_string(), "7");
//! ```
//!
//! Dropping the [`Vm`] frees every heap object and checks that the byte
//! accounting returned to zero.

pub mod compiler;
pub mod debug;
pub mod scanner;
pub mod vm;

pub use compiler::{CompileError, compile};
pub use mscript_core::Value;
pub use scanner::{Scanner, Token, TokenKind};
pub use vm::{InterpretError, Vm};
