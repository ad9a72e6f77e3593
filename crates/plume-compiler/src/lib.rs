//! Plume compiler: lexer, single-pass parser and register bytecode generator.

pub mod compiler;
pub mod diagnostic;
pub mod disasm;
pub mod lexer;
pub mod opcode;
pub mod options;
pub mod proto;
pub mod token;

pub use compiler::{compile, compile_with, Chunk, ValueType};
pub use diagnostic::{CompileError, Diagnostic, Severity};
pub use options::CompileOptions;
