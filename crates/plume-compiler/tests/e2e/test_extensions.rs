//! The syntax Plume adds on top of the Lua 5.4 grammar.
use super::helpers::*;
use plume_compiler::opcode::OpCode;

#[test]
fn e2e_keywords_as_field_names() {
    let (proto, _) = compile_str(
        "local t = {}\nt.case = 1\nt.default = 2\nt.switch = 3\nt.continue = 4\nreturn t.when",
    );
    assert_eq!(count_opcode(&proto, OpCode::SetField), 4);
    assert_eq!(count_opcode(&proto, OpCode::GetField), 1);
}

#[test]
fn e2e_keyword_method_names() {
    let (proto, _) = compile_str("local obj\nobj:default()\nfunction obj:case() end");
    assert!(has_opcode(&proto, OpCode::Self_));
    assert_eq!(proto.protos.len(), 1);
}

#[test]
fn e2e_value_keywords_are_not_field_names() {
    compile_err("local t = {}\nt.nil = 1");
    compile_err("local t = {}\nreturn t.true");
}

#[test]
fn e2e_compound_operators_all_accepted() {
    let src = "local n = 1\n\
               n += 1 n -= 1 n *= 2 n /= 2 n //= 1 n %= 3 n ^= 2\n\
               n &= 1 n |= 2 n <<= 1 n >>= 1 n **= 2\n\
               local s = \"\"\ns ..= \"x\"\nlocal m\nm ??= 0";
    let (proto, _) = compile_str(src);
    assert!(has_opcode(&proto, OpCode::Concat));
    assert!(has_opcode(&proto, OpCode::EqK));
    // every compound write lands back in its local
    assert!(!has_opcode(&proto, OpCode::SetTabUp));
}

#[test]
fn e2e_tilde_equals_is_only_a_comparison() {
    let (proto, _) = compile_str("local a, b\nreturn a ~= b");
    assert!(has_opcode(&proto, OpCode::Eq));
    compile_err("local a\na ~= 3");
}

#[test]
fn e2e_continue_accepts_a_depth() {
    compile_str("for i = 1, 2 do for j = 1, 2 do for k = 1, 2 do continue 3 end end end");
}

#[test]
fn e2e_repeat_when_accepts_body_locals() {
    compile_str("repeat local done = step() when not done");
}

#[test]
fn e2e_ifexpr_nests() {
    let (proto, _) = compile_str(
        "local a, b\nreturn if a then (if b then 1 else 2) else 3",
    );
    assert_eq!(count_opcode(&proto, OpCode::LoadI), 3);
}

#[test]
fn e2e_ifexpr_in_arguments_and_tables() {
    compile_str("local c\nf(if c then 1 else 2, 3)\nlocal t = {if c then \"y\" else \"n\"}");
}

#[test]
fn e2e_safe_navigation_with_index() {
    let (proto, _) = compile_str("local t\nreturn t?[1], t?.name");
    assert_eq!(count_opcode(&proto, OpCode::Test), 2);
    assert!(has_opcode(&proto, OpCode::GetI));
    assert!(has_opcode(&proto, OpCode::GetField));
}

#[test]
fn e2e_coalesce_mixes_with_logic() {
    compile_str("local a, b, c\nreturn (a ?? b) and c, a or b ?? c");
}

#[test]
fn e2e_lambda_with_vararg() {
    let (proto, _) = compile_str("local f = |...| -> select(\"#\", ...)");
    assert!(proto.protos[0].is_vararg);
}

#[test]
fn e2e_nested_lambdas_capture() {
    let (proto, _) = compile_str("local add = |a| -> |b| -> a + b");
    let inner = &proto.protos[0].protos[0];
    assert_eq!(inner.upvalues.len(), 1);
    assert!(inner.upvalues[0].in_stack);
}

#[test]
fn e2e_type_hints_everywhere() {
    compile_str(
        "local n: number, s: string = 1, \"a\"\n\
         local function f(a, b): table return {} end\n\
         local g = function(): nil end\n\
         local h: function = f",
    );
}

#[test]
fn e2e_switch_inside_function_returns_from_cases() {
    let (proto, _) = compile_str(
        "local function name(n)\n  switch n do\n    case 1: return \"one\"\n    case 2: return \"two\"\n    default: return \"many\"\n  end\nend",
    );
    assert_eq!(count_opcode(&proto.protos[0], OpCode::Return1), 3);
}
