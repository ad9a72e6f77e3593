#![no_main]

use libfuzzer_sys::fuzz_target;
use plume_compiler::disasm::disassemble;
use plume_compiler::{compile_with, CompileOptions};

fuzz_target!(|data: &[u8]| {
    // errors are fine, panics are bugs
    let opts = CompileOptions::default().with_color(true);
    if let Ok(chunk) = compile_with(data, "fuzz", &opts) {
        let _ = disassemble(&chunk.proto, &chunk.strings);
    }
});
