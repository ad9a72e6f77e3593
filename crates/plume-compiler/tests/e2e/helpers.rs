use plume_compiler::diagnostic::Diagnostic;
use plume_compiler::opcode::OpCode;
use plume_compiler::proto::{Constant, Proto};
use plume_compiler::{compile, compile_with, CompileError, CompileOptions};
use plume_core::string::StringInterner;
use tracing_subscriber::EnvFilter;

/// Route compiler logs to the test output; `RUST_LOG=plume_compiler=trace`
/// shows goto resolution and closed functions.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Compile a source string and return the main prototype with its strings.
pub fn compile_str(source: &str) -> (Proto, StringInterner) {
    init_tracing();
    let chunk = compile(source.as_bytes(), "test").unwrap_or_else(|e| {
        panic!("compile failed: {e}\nsource:\n{source}");
    });
    (chunk.proto, chunk.strings)
}

/// Compile a source string that must fail and return the full error.
pub fn compile_err(source: &str) -> CompileError {
    init_tracing();
    match compile(source.as_bytes(), "test") {
        Err(e) => e,
        Ok(_) => panic!("expected compile error, got success\nsource:\n{source}"),
    }
}

/// Bare message of a compile error.
pub fn compile_str_err(source: &str) -> String {
    compile_err(source).message
}

/// Warnings produced while compiling with the given options.
pub fn compile_warnings_with(source: &str, options: &CompileOptions) -> Vec<Diagnostic> {
    init_tracing();
    compile_with(source.as_bytes(), "test", options)
        .unwrap_or_else(|e| panic!("compile failed: {e}\nsource:\n{source}"))
        .warnings
}

/// Warnings produced with default options.
pub fn compile_warnings(source: &str) -> Vec<Diagnostic> {
    compile_warnings_with(source, &CompileOptions::default())
}

pub fn has_opcode(proto: &Proto, op: OpCode) -> bool {
    proto.code.iter().any(|i| i.opcode() == op)
}

pub fn count_opcode(proto: &Proto, op: OpCode) -> usize {
    proto.code.iter().filter(|i| i.opcode() == op).count()
}

/// Index of the first instruction with opcode `op`.
pub fn find_opcode(proto: &Proto, op: OpCode) -> Option<usize> {
    proto.code.iter().position(|i| i.opcode() == op)
}

/// Opcodes of a prototype, in order.
#[allow(dead_code)]
pub fn opcodes(proto: &Proto) -> Vec<OpCode> {
    proto.code.iter().map(|i| i.opcode()).collect()
}

/// Names of the prototype's local variables, in declaration order.
pub fn local_names(proto: &Proto, strings: &StringInterner) -> Vec<String> {
    proto
        .local_vars
        .iter()
        .map(|v| strings.get_str(v.name).into_owned())
        .collect()
}

/// String value of constant `idx`.
#[allow(dead_code)]
pub fn get_string_constant(proto: &Proto, idx: usize, strings: &StringInterner) -> String {
    match &proto.constants[idx] {
        Constant::String(id) => strings.get_str(*id).into_owned(),
        other => panic!("expected string constant, got {other:?}"),
    }
}
