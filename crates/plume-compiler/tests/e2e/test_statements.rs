use super::helpers::*;
use plume_compiler::opcode::OpCode;
use plume_compiler::proto::Constant;

#[test]
fn e2e_local_small_integer_uses_loadi() {
    let (proto, _) = compile_str("local x = 42");
    assert!(has_opcode(&proto, OpCode::LoadI));
    assert!(proto.constants.is_empty());
}

#[test]
fn e2e_local_without_values_is_one_loadnil() {
    let (proto, _) = compile_str("local x, y, z");
    assert_eq!(count_opcode(&proto, OpCode::LoadNil), 1);
    let i = find_opcode(&proto, OpCode::LoadNil).unwrap();
    // three registers starting at R0
    assert_eq!(proto.code[i].a(), 0);
    assert_eq!(proto.code[i].b(), 2);
}

#[test]
fn e2e_local_fewer_values_pads_with_nil() {
    let (proto, _) = compile_str("local a, b, c = 1");
    assert!(has_opcode(&proto, OpCode::LoadI));
    let i = find_opcode(&proto, OpCode::LoadNil).unwrap();
    assert_eq!(proto.code[i].a(), 1);
    assert_eq!(proto.code[i].b(), 1);
}

#[test]
fn e2e_local_extra_values_are_still_evaluated() {
    let (proto, _) = compile_str("local a = 1, f()");
    assert!(has_opcode(&proto, OpCode::Call));
    assert_eq!(proto.max_stack_size, 2);
}

#[test]
fn e2e_local_call_adjusts_results() {
    let (proto, _) = compile_str("local a, b, c = f()");
    let i = find_opcode(&proto, OpCode::Call).unwrap();
    // three results requested
    assert_eq!(proto.code[i].c(), 4);
}

#[test]
fn e2e_global_assign_and_read() {
    let (proto, strings) = compile_str("x = 42\nreturn y");
    assert!(has_opcode(&proto, OpCode::SetTabUp));
    assert!(has_opcode(&proto, OpCode::GetTabUp));
    assert_eq!(get_string_constant(&proto, 0, &strings), "x");
}

#[test]
fn e2e_field_and_index_assignment_forms() {
    let (proto, _) = compile_str("local t = {}\nt.a = 1\nt[1] = 2\nt[t] = 3");
    assert!(has_opcode(&proto, OpCode::SetField));
    assert!(has_opcode(&proto, OpCode::SetI));
    assert!(has_opcode(&proto, OpCode::SetTable));
}

#[test]
fn e2e_swap_of_locals() {
    let (proto, _) = compile_str("local a, b = 1, 2\na, b = b, a");
    // b is saved before a overwrites it
    assert_eq!(count_opcode(&proto, OpCode::Move), 3);
}

#[test]
fn e2e_assignment_conflict_copies_table_register() {
    let (proto, _) = compile_str("local t, i = {}, 1\nt[i], t = 10, 20");
    let mv = find_opcode(&proto, OpCode::Move).unwrap();
    let set = find_opcode(&proto, OpCode::SetTable).unwrap();
    assert!(mv < set);
    // the saved copy of t is the table operand of the store
    assert_eq!(proto.code[set].a(), proto.code[mv].a());
}

#[test]
fn e2e_const_folds_into_constant() {
    let (proto, strings) = compile_str("local greeting <const> = \"hi\"\nreturn greeting");
    // no register for the constant, only the returned value
    assert_eq!(local_names(&proto, &strings), Vec::<String>::new());
    assert!(has_opcode(&proto, OpCode::LoadK));
    assert!(matches!(proto.constants[0], Constant::String(_)));
}

#[test]
fn e2e_const_with_runtime_value_keeps_register() {
    let (proto, strings) = compile_str("local n <const> = f()\nreturn n");
    assert_eq!(local_names(&proto, &strings), vec!["n"]);
}

#[test]
fn e2e_to_be_closed_variable() {
    let (proto, _) = compile_str("do local h <close> = open() end");
    let tbc = find_opcode(&proto, OpCode::Tbc).unwrap();
    assert_eq!(proto.code[tbc].a(), 0);
    // leaving the block closes it
    assert!(has_opcode(&proto, OpCode::Close));
    // and the final return must close as well
    assert!(proto.code.last().unwrap().k());
}

#[test]
fn e2e_local_function_is_visible_in_its_body() {
    let (proto, _) = compile_str("local function f(n) return f(n) end");
    assert_eq!(proto.protos.len(), 1);
    let inner = &proto.protos[0];
    assert_eq!(inner.num_params, 1);
    assert_eq!(inner.upvalues.len(), 1);
    assert!(inner.upvalues[0].in_stack);
    assert!(has_opcode(inner, OpCode::TailCall));
}

#[test]
fn e2e_local_function_debug_range_starts_after_closure() {
    let (proto, _) = compile_str("local function f() end");
    let closure = find_opcode(&proto, OpCode::Closure).unwrap();
    assert_eq!(proto.local_vars[0].start_pc as usize, closure + 1);
}

#[test]
fn e2e_function_statement_targets() {
    let (proto, _) = compile_str("function g() end\nlocal t = {}\nfunction t.a.b() end\nfunction t:m() end");
    assert_eq!(proto.protos.len(), 3);
    assert!(has_opcode(&proto, OpCode::SetTabUp));
    assert_eq!(count_opcode(&proto, OpCode::SetField), 2);
    // method definitions receive self
    assert_eq!(proto.protos[2].num_params, 1);
}

#[test]
fn e2e_call_statement_discards_results() {
    let (proto, _) = compile_str("print(1)");
    let call = find_opcode(&proto, OpCode::Call).unwrap();
    assert_eq!(proto.code[call].c(), 1);
}

#[test]
fn e2e_semicolons_are_empty_statements() {
    let (proto, _) = compile_str(";;local x = 1;;");
    assert_eq!(count_opcode(&proto, OpCode::LoadI), 1);
}

#[test]
fn e2e_do_block_scopes_locals() {
    let (proto, strings) = compile_str("do local a = 1 end\nlocal b = 2");
    assert_eq!(local_names(&proto, &strings), vec!["a", "b"]);
    // b reuses a's register
    let loads: Vec<u8> = proto
        .code
        .iter()
        .filter(|i| i.opcode() == OpCode::LoadI)
        .map(|i| i.a())
        .collect();
    assert_eq!(loads, vec![0, 0]);
}

#[test]
fn e2e_goto_backward() {
    let (proto, _) = compile_str("::top:: x = 1 goto top");
    let jmp = find_opcode(&proto, OpCode::Jmp).unwrap();
    // back to the first statement after VARARGPREP
    assert_eq!(jmp as i64 + 1 + proto.code[jmp].get_sj() as i64, 1);
}

#[test]
fn e2e_goto_forward_past_local_at_block_end() {
    compile_str("do goto done local x = 1 ::done:: end");
}

#[test]
fn e2e_goto_out_of_closure_scope_closes() {
    let (proto, _) = compile_str(
        "while true do\n  local x = 1\n  f(function() return x end)\n  goto out\nend\n::out::",
    );
    assert!(has_opcode(&proto, OpCode::Close));
}
