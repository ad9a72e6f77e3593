use super::helpers::*;

#[test]
fn e2e_reassign_constant() {
    let err = compile_err("local x <const> = 5\nx = 6");
    assert_eq!(err.message, "attempt to reassign constant 'x'");
    assert_eq!(err.line, 2);
    assert!(err.here.is_some());
}

#[test]
fn e2e_reassign_close_variable() {
    let msg = compile_str_err("do local h <close> = nil\nh = 1 end");
    assert_eq!(msg, "attempt to reassign constant 'h'");
}

#[test]
fn e2e_reassign_captured_constant() {
    let msg = compile_str_err("local n <const> = f()\nlocal g = function() n = 1 end");
    assert_eq!(msg, "attempt to reassign constant 'n'");
}

#[test]
fn e2e_compound_assign_to_constant() {
    let msg = compile_str_err("local x <const> = 1\nx += 1");
    assert_eq!(msg, "attempt to reassign constant 'x'");
}

#[test]
fn e2e_unknown_attribute() {
    assert_eq!(compile_str_err("local a <static> = 1"), "unknown attribute 'static'");
}

#[test]
fn e2e_multiple_close_variables() {
    let msg = compile_str_err("local a <close>, b <close> = nil, nil");
    assert_eq!(msg, "multiple to-be-closed variables in local list");
}

#[test]
fn e2e_unknown_type_hint() {
    assert_eq!(compile_str_err("local n: integer = 1"), "unknown type hint 'integer'");
}

#[test]
fn e2e_vararg_outside_vararg_function() {
    let msg = compile_str_err("local f = function() return ... end");
    assert!(msg.starts_with("cannot use '...' outside a vararg function"), "{msg}");
}

#[test]
fn e2e_unexpected_symbol() {
    assert_eq!(compile_str_err("x = = 1"), "unexpected symbol near '='");
}

#[test]
fn e2e_stranded_lambda() {
    let err = compile_err("local f = |a| a");
    assert!(err.message.contains("lambda") || err.here.as_deref().is_some_and(|h| h.contains("lambda")));
}

#[test]
fn e2e_missing_end_on_later_line() {
    let msg = compile_str_err("while x do\n  f()\n");
    assert_eq!(msg, "missing 'end' to terminate 'while' block.");
}

#[test]
fn e2e_missing_end_on_same_line() {
    assert_eq!(compile_str_err("if x then f()"), "expected 'end' to terminate block.");
}

#[test]
fn e2e_missing_close_paren_names_opener() {
    assert_eq!(compile_str_err("f(1,\n2"), "')' expected (to close '(' at line 1)");
}

#[test]
fn e2e_unfinished_string_is_reported_with_line() {
    let err = compile_err("local a = 1\nlocal s = \"open");
    assert!(err.message.contains("unfinished string"), "{}", err.message);
    assert_eq!(err.line, 2);
}

#[test]
fn e2e_too_many_syntax_levels() {
    let src = format!("x = {}1{}", "(".repeat(300), ")".repeat(300));
    assert_eq!(compile_str_err(&src), "chunk has too many syntax levels");
}

#[test]
fn e2e_tuple_compound_assignment() {
    let msg = compile_str_err("local a, b = 1, 2\na, b += 1");
    assert!(msg.starts_with("unsupported tuple assignment"), "{msg}");
}

#[test]
fn e2e_break_outside_loop() {
    assert_eq!(compile_str_err("break"), "break outside loop at line 1");
    assert_eq!(
        compile_str_err("local f = function()\n  break\nend"),
        "break outside loop at line 2"
    );
}

#[test]
fn e2e_continue_outside_loop() {
    assert_eq!(compile_str_err("continue"), "continue outside of loop");
    assert_eq!(compile_str_err("do continue end"), "continue outside of loop");
}

#[test]
fn e2e_continue_deeper_than_nesting() {
    let msg = compile_str_err("while a do while b do continue 3 end end");
    assert_eq!(msg, "continue outside of loop");
}

#[test]
fn e2e_continue_does_not_cross_functions() {
    let msg = compile_str_err("while a do local f = function() continue end end");
    assert_eq!(msg, "continue outside of loop");
}

#[test]
fn e2e_undefined_label() {
    assert_eq!(compile_str_err("goto nowhere"), "no visible label 'nowhere' for <goto> at line 1");
}

#[test]
fn e2e_goto_into_local_scope() {
    let msg = compile_str_err("goto l\nlocal x = 1\n::l:: print(x)");
    assert_eq!(msg, "<goto l> at line 1 jumps into the scope of local 'x'");
}

#[test]
fn e2e_duplicate_label() {
    let msg = compile_str_err("::a::\nf()\n::a::");
    assert_eq!(msg, "label 'a' already defined on line 1");
}

#[test]
fn e2e_labels_are_per_function() {
    compile_str("::a:: local f = function() ::a:: end");
}

#[test]
fn e2e_case_outside_switch() {
    assert_eq!(compile_str_err("case 1: f()"), "inappropriate 'case' statement.");
    assert_eq!(compile_str_err("default: f()"), "inappropriate 'default' statement.");
}

#[test]
fn e2e_case_label_must_be_constant() {
    let err = compile_err("local y = f()\nswitch x do case y: g() end");
    assert_eq!(err.message, "malformed 'case' expression.");
    assert_eq!(err.line, 2);
}

#[test]
fn e2e_case_label_negated_name() {
    let msg = compile_str_err("switch x do case -y: g() end");
    assert_eq!(msg, "unexpected symbol in 'case' expression.");
}

#[test]
fn e2e_continue_directly_in_case() {
    let msg = compile_str_err("while a do switch x do case 1: continue end end");
    assert_eq!(msg, "'continue' outside of loop.");
}

#[test]
fn e2e_switch_requires_case_keyword() {
    let err = compile_err("switch x do f() end");
    assert_eq!(err.line, 1);
}

#[test]
fn e2e_error_display_contains_location() {
    let err = compile_err("local x <const> = 5\nx = 6");
    let text = err.to_string();
    assert!(text.starts_with("test:2: syntax error: attempt to reassign constant 'x'"));
    assert_eq!(err.chunk, "test");
}

#[test]
fn e2e_in_is_not_a_binary_operator() {
    let err = compile_err("local t = {}\nreturn 1 in t");
    assert_eq!(err.line, 2);
}
