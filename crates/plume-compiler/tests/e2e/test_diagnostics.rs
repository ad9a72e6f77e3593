use super::helpers::*;
use plume_compiler::diagnostic::Severity;
use plume_compiler::{compile_with, CompileOptions};

#[test]
fn e2e_error_render_layout() {
    let err = compile_err("local x <const> = 5\nx = 6");
    let text = err.to_string();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "test:2: syntax error: attempt to reassign constant 'x'");
    assert_eq!(lines[1], "\t2 | x = 6");
    assert_eq!(
        lines[2],
        "\t  | ^^^^^ here: this variable is constant, and cannot be reassigned."
    );
    assert_eq!(lines[3], "\t  |");
}

#[test]
fn e2e_chunk_name_prefix_is_stripped() {
    let opts = CompileOptions::default();
    let err = compile_with(b"x = = 1", "@scripts/main.pl", &opts).unwrap_err();
    assert_eq!(err.chunk, "scripts/main.pl");
    assert!(err.to_string().starts_with("scripts/main.pl:1: syntax error: "));
}

#[test]
fn e2e_short_errors_are_one_line() {
    let opts = CompileOptions::default().with_short_errors(true);
    let err = compile_with(b"local x <const> = 5\nx = 6", "test", &opts).unwrap_err();
    assert_eq!(
        err.to_string(),
        "test:2: syntax error: attempt to reassign constant 'x'"
    );
}

#[test]
fn e2e_color_only_changes_rendering() {
    let src = b"goto nowhere";
    let plain = compile_with(src, "test", &CompileOptions::default()).unwrap_err();
    let colored = compile_with(src, "test", &CompileOptions::default().with_color(true)).unwrap_err();
    assert!(!plain.to_string().contains('\x1b'));
    assert!(colored.to_string().contains('\x1b'));
    assert_eq!(plain.message, colored.message);
    assert_eq!(plain.line, colored.line);
}

#[test]
fn e2e_shadowing_warning() {
    let warnings = compile_warnings("local x = 1\nlocal x = 2");
    assert_eq!(warnings.len(), 1);
    let w = &warnings[0];
    assert_eq!(w.severity, Severity::Warning);
    assert_eq!(w.line, 2);
    assert_eq!(w.message, "duplicate local declaration");
    assert!(w.here.as_deref().unwrap().contains("line 1"));
    assert!(w.render(false, false).starts_with("test:2: warning: duplicate local declaration"));
}

#[test]
fn e2e_shadowing_ignores_closed_scopes_and_other_functions() {
    assert!(compile_warnings("do local x = 1 end\nlocal x = 2").is_empty());
    assert!(compile_warnings("local x = 1\nlocal f = function(x) return x end").is_empty());
    assert!(compile_warnings("for i = 1, 2 do end\nfor i = 1, 2 do end").is_empty());
}

#[test]
fn e2e_shadowing_can_be_disabled() {
    let src = "local x = 1\nlocal x = 2";
    let opts = CompileOptions::default().with_shadow_warnings(false);
    assert!(compile_warnings_with(src, &opts).is_empty());
    let opts = CompileOptions::default().with_warnings(false);
    assert!(compile_warnings_with(src, &opts).is_empty());
}

#[test]
fn e2e_type_hint_mismatch_warning() {
    let warnings = compile_warnings("local x: number = \"hi\"");
    assert_eq!(warnings.len(), 1);
    assert_eq!(
        warnings[0].message,
        "x was type-hinted as number but is assigned a string value"
    );
}

#[test]
fn e2e_type_hint_mismatch_on_later_assignment() {
    let warnings = compile_warnings("local t: table = {}\nt = 5");
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].line, 2);
    assert_eq!(
        warnings[0].message,
        "t was type-hinted as table but is assigned a number value"
    );
}

#[test]
fn e2e_matching_or_unknown_types_do_not_warn() {
    assert!(compile_warnings("local x: number = 1").is_empty());
    assert!(compile_warnings("local s: string = f()").is_empty());
    assert!(compile_warnings("local u: userdata = 1").is_empty());
    assert!(compile_warnings("local b: bool = true").is_empty());
}

#[test]
fn e2e_return_hint_mismatch_warning() {
    let warnings = compile_warnings("local function f(): number\n  return \"x\"\nend");
    assert_eq!(warnings.len(), 1);
    assert_eq!(
        warnings[0].message,
        "function was hinted to return number but actually returns string"
    );
}

#[test]
fn e2e_warnings_never_change_bytecode() {
    let src = "local x: number = \"hi\"\nlocal x = 2\nlocal function f(): string return 1 end\nreturn x, f";
    let on = compile_with(src.as_bytes(), "test", &CompileOptions::default()).unwrap();
    let off = compile_with(
        src.as_bytes(),
        "test",
        &CompileOptions::default().with_warnings(false),
    )
    .unwrap();
    assert!(on.warnings.len() >= 3);
    assert!(off.warnings.is_empty());
    assert_eq!(on.proto.code, off.proto.code);
    assert_eq!(on.proto.constants, off.proto.constants);
    assert_eq!(on.proto.protos[0].code, off.proto.protos[0].code);
}
