use super::helpers::*;
use plume_compiler::opcode::OpCode;

#[test]
fn e2e_function_literal_params() {
    let (proto, _) = compile_str("local f = function(a, b, c) end");
    assert_eq!(proto.protos.len(), 1);
    let inner = &proto.protos[0];
    assert_eq!(inner.num_params, 3);
    assert!(!inner.is_vararg);
    assert!(has_opcode(inner, OpCode::Return0));
}

#[test]
fn e2e_vararg_function() {
    let (proto, _) = compile_str("local f = function(a, ...) return ... end");
    let inner = &proto.protos[0];
    assert_eq!(inner.num_params, 1);
    assert!(inner.is_vararg);
    assert_eq!(inner.code[0].opcode(), OpCode::VarArgPrep);
    assert!(has_opcode(inner, OpCode::VarArg));
}

#[test]
fn e2e_return_forms() {
    let (proto, _) = compile_str("local f = function() return end\nlocal g = function(a) return a end\nlocal h = function(a, b) return a, b end");
    assert!(has_opcode(&proto.protos[0], OpCode::Return0));
    assert!(has_opcode(&proto.protos[1], OpCode::Return1));
    let ret = find_opcode(&proto.protos[2], OpCode::Return).unwrap();
    // two values starting at R2
    assert_eq!(proto.protos[2].code[ret].a(), 2);
    assert_eq!(proto.protos[2].code[ret].b(), 3);
}

#[test]
fn e2e_multret_return_of_call() {
    let (proto, _) = compile_str("return f(), g()");
    let ret = find_opcode(&proto, OpCode::Return).unwrap();
    assert_eq!(proto.code[ret].b(), 0);
}

#[test]
fn e2e_upvalue_from_parent_local() {
    let (proto, strings) = compile_str("local x = 1\nlocal f = function() return x end");
    let inner = &proto.protos[0];
    assert_eq!(inner.upvalues.len(), 1);
    assert!(inner.upvalues[0].in_stack);
    assert_eq!(inner.upvalues[0].index, 0);
    assert_eq!(strings.get_str(inner.upvalues[0].name.unwrap()), "x");
    assert!(has_opcode(inner, OpCode::GetUpval));
}

#[test]
fn e2e_upvalue_chain_through_middle_function() {
    let (proto, _) = compile_str(
        "local x = 1\nlocal f = function()\n  return function() return x end\nend",
    );
    let middle = &proto.protos[0];
    let inner = &middle.protos[0];
    assert!(middle.upvalues[0].in_stack);
    // the innermost function captures the middle one's upvalue
    assert!(!inner.upvalues[0].in_stack);
    assert_eq!(inner.upvalues[0].index, 0);
}

#[test]
fn e2e_global_access_captures_env() {
    let (proto, strings) = compile_str("local f = function() return print end");
    let inner = &proto.protos[0];
    assert_eq!(strings.get_str(inner.upvalues[0].name.unwrap()), "_ENV");
    assert!(has_opcode(inner, OpCode::GetTabUp));
}

#[test]
fn e2e_upvalue_assignment() {
    let (proto, _) = compile_str("local n = 0\nlocal inc = function() n = n + 1 end");
    assert!(has_opcode(&proto.protos[0], OpCode::SetUpval));
}

#[test]
fn e2e_lambda_matches_function_literal() {
    let (lambda, _) = compile_str("local f = |a, b| -> a + b");
    let (function, _) = compile_str("local f = function(a, b) return a + b end");
    let (l, f) = (&lambda.protos[0], &function.protos[0]);
    assert_eq!(l.code, f.code);
    assert_eq!(l.num_params, f.num_params);
    assert_eq!(l.max_stack_size, f.max_stack_size);
    assert_eq!(lambda.code, function.code);
}

#[test]
fn e2e_lambda_without_params() {
    let (proto, _) = compile_str("local k = || -> 42");
    let inner = &proto.protos[0];
    assert_eq!(inner.num_params, 0);
    assert!(has_opcode(inner, OpCode::Return1));
}

#[test]
fn e2e_lambda_as_argument() {
    let (proto, _) = compile_str("map(t, |x| -> x * 2)");
    assert_eq!(proto.protos.len(), 1);
    let call = find_opcode(&proto, OpCode::Call).unwrap();
    assert_eq!(proto.code[call].b(), 3);
}

#[test]
fn e2e_table_function_field_is_a_method() {
    let (proto, strings) = compile_str("local obj = { function greet(name) return name end }");
    let inner = &proto.protos[0];
    // implicit self plus name
    assert_eq!(inner.num_params, 2);
    assert_eq!(local_names(inner, &strings), vec!["self", "name"]);
    assert!(has_opcode(&proto, OpCode::SetField));
}

#[test]
fn e2e_method_body_has_self() {
    let (proto, strings) = compile_str("local t = {}\nfunction t:get() return self end");
    let inner = &proto.protos[0];
    assert_eq!(local_names(inner, &strings), vec!["self"]);
    assert!(has_opcode(inner, OpCode::Return1));
}

#[test]
fn e2e_line_info_spans_body() {
    let (proto, _) = compile_str("local f = function()\n\n  return 1\nend");
    let inner = &proto.protos[0];
    assert_eq!(inner.line_defined, 1);
    assert_eq!(inner.last_line_defined, 4);
    let ret = find_opcode(inner, OpCode::Return1).unwrap();
    assert_eq!(inner.line_of(ret), 3);
}

#[test]
fn e2e_deep_nesting_of_functions() {
    let mut src = String::new();
    for _ in 0..20 {
        src.push_str("return function() ");
    }
    for _ in 0..20 {
        src.push_str("end ");
    }
    let (mut proto, _) = compile_str(&src);
    let mut depth = 0;
    while let Some(child) = proto.protos.pop() {
        proto = child;
        depth += 1;
    }
    assert_eq!(depth, 20);
}
