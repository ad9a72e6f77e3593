use super::helpers::*;
use plume_compiler::opcode::{sc_to_int, OpCode};
use plume_compiler::proto::Constant;

#[test]
fn e2e_arithmetic_folds_constants() {
    let (proto, _) = compile_str("return 1 + 2 * 3");
    assert!(!has_opcode(&proto, OpCode::Add));
    assert!(!has_opcode(&proto, OpCode::Mul));
    let load = find_opcode(&proto, OpCode::LoadI).unwrap();
    assert_eq!(proto.code[load].sbx(), 7);
}

#[test]
fn e2e_division_by_zero_is_not_folded() {
    let (proto, _) = compile_str("return 1 // 0");
    assert!(has_opcode(&proto, OpCode::IDivK) || has_opcode(&proto, OpCode::IDiv));
}

#[test]
fn e2e_immediate_and_constant_operands() {
    let (proto, _) = compile_str("local a\nreturn a + 1, a * 2.5, a >> 3");
    assert!(has_opcode(&proto, OpCode::AddI));
    assert!(has_opcode(&proto, OpCode::MulK));
    assert!(has_opcode(&proto, OpCode::ShrI));
    assert!(count_opcode(&proto, OpCode::MMBinI) >= 1);
    assert!(count_opcode(&proto, OpCode::MMBinK) >= 1);
}

#[test]
fn e2e_register_operands_emit_mmbin() {
    let (proto, _) = compile_str("local a, b\nreturn a - b");
    let sub = find_opcode(&proto, OpCode::Sub).unwrap();
    assert_eq!(proto.code[sub + 1].opcode(), OpCode::MMBin);
}

#[test]
fn e2e_exponent_alias() {
    let (star, _) = compile_str("local a\nreturn a ** 2");
    let (caret, _) = compile_str("local a\nreturn a ^ 2");
    assert_eq!(star.code, caret.code);
}

#[test]
fn e2e_not_equal_alias() {
    let (bang, _) = compile_str("local a\nreturn a != 1");
    let (tilde, _) = compile_str("local a\nreturn a ~= 1");
    assert_eq!(bang.code, tilde.code);
}

#[test]
fn e2e_concat_chain_is_one_instruction() {
    let (proto, _) = compile_str("local a, b\nreturn a .. b .. \"!\"");
    assert_eq!(count_opcode(&proto, OpCode::Concat), 1);
    let i = find_opcode(&proto, OpCode::Concat).unwrap();
    assert_eq!(proto.code[i].b(), 3);
}

#[test]
fn e2e_comparisons_use_immediates() {
    let (proto, _) = compile_str("local a\nreturn a < 1, a >= 2, a == 3");
    assert!(has_opcode(&proto, OpCode::LtI));
    assert!(has_opcode(&proto, OpCode::GeI));
    let eq = find_opcode(&proto, OpCode::EqI).unwrap();
    assert_eq!(sc_to_int(proto.code[eq].b()), 3);
}

#[test]
fn e2e_and_or_value() {
    let (proto, _) = compile_str("local a, b, c\nlocal x = a and b or c");
    assert!(has_opcode(&proto, OpCode::TestSet) || has_opcode(&proto, OpCode::Test));
}

#[test]
fn e2e_not_of_constant_folds() {
    let (proto, _) = compile_str("return not nil");
    assert!(has_opcode(&proto, OpCode::LoadTrue));
    assert!(!has_opcode(&proto, OpCode::Not));
}

#[test]
fn e2e_unary_operators() {
    let (proto, _) = compile_str("local a\nreturn -a, ~a, #a, not a");
    assert!(has_opcode(&proto, OpCode::Unm));
    assert!(has_opcode(&proto, OpCode::BNot));
    assert!(has_opcode(&proto, OpCode::Len));
    assert!(has_opcode(&proto, OpCode::Not));
}

#[test]
fn e2e_pseudo_unary_plus() {
    let (plus, _) = compile_str("local a\nreturn +a");
    let (bare, _) = compile_str("local a\nreturn a");
    assert_eq!(plus.code, bare.code);
}

#[test]
fn e2e_negative_index_is_folded() {
    let (proto, _) = compile_str("local t\nreturn t[-1]");
    // -1 does not fit GETI, so it becomes a register or constant key
    assert!(!has_opcode(&proto, OpCode::Unm));
}

#[test]
fn e2e_table_constructor_sizes() {
    let (proto, _) = compile_str("return {1, 2, 3, x = 1, [\"y\"] = 2}");
    let nt = find_opcode(&proto, OpCode::NewTable).unwrap();
    // array part of 3
    assert_eq!(proto.code[nt + 1].get_ax(), 0);
    assert_eq!(proto.code[nt].c(), 3);
    assert_eq!(count_opcode(&proto, OpCode::SetField), 2);
    assert_eq!(count_opcode(&proto, OpCode::SetList), 1);
}

#[test]
fn e2e_table_constructor_open_call() {
    let (proto, _) = compile_str("return {f()}");
    let set = find_opcode(&proto, OpCode::SetList).unwrap();
    // all results of the call are stored
    assert_eq!(proto.code[set].b(), 0);
}

#[test]
fn e2e_large_table_flushes_every_fifty() {
    let items: Vec<String> = (0..120).map(|i| i.to_string()).collect();
    let (proto, _) = compile_str(&format!("return {{{}}}", items.join(", ")));
    assert_eq!(count_opcode(&proto, OpCode::SetList), 3);
}

#[test]
fn e2e_keyword_keys_in_constructor_and_fields() {
    let (proto, strings) = compile_str("local t = {default = 1, case = 2}\nreturn t.default, t.case");
    assert_eq!(count_opcode(&proto, OpCode::GetField), 2);
    let names: Vec<String> = proto
        .constants
        .iter()
        .filter_map(|k| match k {
            Constant::String(id) => Some(strings.get_str(*id).into_owned()),
            _ => None,
        })
        .collect();
    assert!(names.contains(&"default".to_string()));
    assert!(names.contains(&"case".to_string()));
}

#[test]
fn e2e_method_call_uses_self() {
    let (proto, _) = compile_str("local obj\nobj:method(1, 2)");
    let s = find_opcode(&proto, OpCode::Self_).unwrap();
    let call = find_opcode(&proto, OpCode::Call).unwrap();
    assert!(s < call);
    // receiver plus two arguments
    assert_eq!(proto.code[call].b(), 4);
}

#[test]
fn e2e_string_and_table_call_arguments() {
    let (proto, _) = compile_str("f \"x\"\ng {1}");
    assert_eq!(count_opcode(&proto, OpCode::Call), 2);
    assert!(has_opcode(&proto, OpCode::NewTable));
}

#[test]
fn e2e_vararg_in_main() {
    let (proto, _) = compile_str("local a, b = ...\nreturn ...");
    assert_eq!(count_opcode(&proto, OpCode::VarArg), 2);
    assert!(proto.is_vararg);
}

#[test]
fn e2e_if_expression_lands_in_one_register() {
    let (proto, _) = compile_str("local c\nlocal x = if c then 1 else 2\nreturn x");
    let loads: Vec<u8> = proto
        .code
        .iter()
        .filter(|i| i.opcode() == OpCode::LoadI)
        .map(|i| i.a())
        .collect();
    assert_eq!(loads, vec![1, 1]);
}

#[test]
fn e2e_if_expression_elseif_chain() {
    let (proto, _) = compile_str("local c\nreturn if c == 1 then \"a\" elseif c == 2 then \"b\" else \"c\"");
    assert_eq!(count_opcode(&proto, OpCode::EqI), 2);
    assert_eq!(count_opcode(&proto, OpCode::LoadK), 3);
}

#[test]
fn e2e_safe_navigation_tests_each_link() {
    let (proto, _) = compile_str("local t\nreturn t?.a?.b");
    assert_eq!(count_opcode(&proto, OpCode::Test), 2);
    assert_eq!(count_opcode(&proto, OpCode::GetField), 2);
}

#[test]
fn e2e_safe_navigation_exits_converge() {
    let (proto, _) = compile_str("local t\nlocal v = t?.a?.b\nreturn v");
    let ret = find_opcode(&proto, OpCode::Return1)
        .or_else(|| find_opcode(&proto, OpCode::Return))
        .unwrap();
    for (pc, inst) in proto.code.iter().enumerate() {
        if inst.opcode() == OpCode::Jmp {
            let target = (pc as i64 + 1 + inst.get_sj() as i64) as usize;
            assert!(target <= ret);
            assert!(target > pc);
        }
    }
}

#[test]
fn e2e_safe_call_statement() {
    let (proto, _) = compile_str("local obj\nobj?.method()");
    assert!(has_opcode(&proto, OpCode::Test));
    assert!(has_opcode(&proto, OpCode::Call));
}

#[test]
fn e2e_coalesce_tests_for_nil() {
    let (proto, _) = compile_str("local a\nreturn a ?? 1");
    let eqk = find_opcode(&proto, OpCode::EqK).unwrap();
    let k = proto.code[eqk].b() as usize;
    assert_eq!(proto.constants[k], Constant::Nil);
}

#[test]
fn e2e_coalesce_chain_is_left_associative() {
    let (proto, _) = compile_str("local a, b\nreturn a ?? b ?? 3");
    assert_eq!(count_opcode(&proto, OpCode::EqK), 2);
}

#[test]
fn e2e_compound_assignment_on_local() {
    let (proto, _) = compile_str("local n = 1\nn += 2\nn *= n\nn ..= \"x\"");
    let add = find_opcode(&proto, OpCode::AddI).unwrap();
    assert_eq!(proto.code[add].a(), 0);
    let mul = find_opcode(&proto, OpCode::Mul).unwrap();
    assert_eq!(proto.code[mul].a(), 0);
    assert!(has_opcode(&proto, OpCode::Concat));
}

#[test]
fn e2e_compound_assignment_on_field_reads_once() {
    let (proto, _) = compile_str("local t\nt.count += 1");
    assert_eq!(count_opcode(&proto, OpCode::GetField), 1);
    assert_eq!(count_opcode(&proto, OpCode::SetField), 1);
}

#[test]
fn e2e_compound_assignment_on_indexed_call_evaluates_key_once() {
    let (proto, _) = compile_str("local t\nt[key()] -= 1");
    assert_eq!(count_opcode(&proto, OpCode::Call), 1);
    assert_eq!(count_opcode(&proto, OpCode::GetTable), 1);
    assert_eq!(count_opcode(&proto, OpCode::SetTable), 1);
}

#[test]
fn e2e_coalesce_assignment() {
    let (proto, _) = compile_str("local cfg\ncfg ??= {}\nglobal ??= 0");
    assert_eq!(count_opcode(&proto, OpCode::EqK), 2);
    assert!(has_opcode(&proto, OpCode::SetTabUp));
}

/// Index of the first `RETURN`/`RETURN1`, i.e. the explicit return statement.
fn first_return(proto: &plume_compiler::proto::Proto) -> usize {
    proto
        .code
        .iter()
        .position(|i| matches!(i.opcode(), OpCode::Return | OpCode::Return1))
        .unwrap()
}

#[test]
fn e2e_coalesce_call_operand_inside_arithmetic() {
    let (proto, _) = compile_str("local y = (a ?? f()) + 1\nreturn y");
    // the call result moves down into the left operand's register
    let mv = find_opcode(&proto, OpCode::Move).unwrap();
    assert_eq!((proto.code[mv].a(), proto.code[mv].b()), (0, 1));
    let add = find_opcode(&proto, OpCode::AddI).unwrap();
    assert_eq!(add, mv + 1);
    assert_eq!((proto.code[add].a(), proto.code[add].b()), (0, 0));
    // a non-nil left operand skips straight to the addition
    let jmp = find_opcode(&proto, OpCode::Jmp).unwrap();
    assert_eq!(jmp as i64 + 1 + proto.code[jmp].get_sj() as i64, add as i64);
    assert_eq!(proto.code[first_return(&proto)].a(), 0);
    assert_eq!(proto.max_stack_size, 2);
}

#[test]
fn e2e_if_expression_call_branch_inside_arithmetic() {
    let (proto, _) = compile_str("local z = (if c then 1 else g()) + 1\nreturn z");
    let load = find_opcode(&proto, OpCode::LoadI).unwrap();
    assert_eq!(proto.code[load].a(), 0);
    let mv = find_opcode(&proto, OpCode::Move).unwrap();
    assert_eq!((proto.code[mv].a(), proto.code[mv].b()), (0, 1));
    let add = find_opcode(&proto, OpCode::AddI).unwrap();
    assert_eq!((proto.code[add].a(), proto.code[add].b()), (0, 0));
    assert_eq!(proto.code[first_return(&proto)].a(), 0);
    assert_eq!(proto.max_stack_size, 2);
}

#[test]
fn e2e_coalesce_call_operand_as_index_key() {
    let (proto, _) = compile_str("local t\nreturn t[a ?? f()]");
    let mv = find_opcode(&proto, OpCode::Move).unwrap();
    assert_eq!((proto.code[mv].a(), proto.code[mv].b()), (1, 2));
    let get = find_opcode(&proto, OpCode::GetTable).unwrap();
    let inst = proto.code[get];
    assert_eq!((inst.a(), inst.b(), inst.c()), (1, 0, 1));
    assert_eq!(proto.code[first_return(&proto)].a(), 1);
    assert_eq!(proto.max_stack_size, 3);
}

#[test]
fn e2e_nested_call_operands_keep_locals_in_place() {
    let (proto, _) = compile_str(
        "local a = 1\nlocal b = (x ?? f()) .. (if y then g() else h())\nlocal c = a\nreturn c",
    );
    // `c = a` copies R0 into R2: nothing stayed reserved above b
    let last_move = proto
        .code
        .iter()
        .rposition(|i| i.opcode() == OpCode::Move)
        .unwrap();
    assert_eq!((proto.code[last_move].a(), proto.code[last_move].b()), (2, 0));
    assert_eq!(proto.code[first_return(&proto)].a(), 2);
}

#[test]
fn e2e_safe_call_statement_discards_results() {
    let (proto, _) = compile_str("local obj\nobj?.method()\nobj?.inner:run(1)");
    let calls: Vec<usize> = proto
        .code
        .iter()
        .enumerate()
        .filter(|(_, i)| i.opcode() == OpCode::Call)
        .map(|(pc, _)| pc)
        .collect();
    assert_eq!(calls.len(), 2);
    for &pc in &calls {
        assert_eq!(proto.code[pc].c(), 1, "call at {pc} keeps a result");
    }
    // every guard lands right after a call
    for (pc, inst) in proto.code.iter().enumerate() {
        if inst.opcode() == OpCode::Jmp {
            let target = (pc as i64 + 1 + inst.get_sj() as i64) as usize;
            assert!(calls.iter().any(|&c| c + 1 == target), "jump at {pc} to {target}");
        }
    }
}

#[test]
fn e2e_safe_navigation_keeps_falsy_base() {
    let (proto, _) = compile_str("local t = false\nlocal v = t?.x\nreturn v");
    // a skipped chain leaves the tested value itself, `false` here, not nil
    assert!(!has_opcode(&proto, OpCode::LoadNil));
    let mv = find_opcode(&proto, OpCode::Move).unwrap();
    assert_eq!((proto.code[mv].a(), proto.code[mv].b()), (1, 0));
    let test = find_opcode(&proto, OpCode::Test).unwrap();
    assert_eq!(proto.code[test].a(), 1);
    let get = find_opcode(&proto, OpCode::GetField).unwrap();
    assert_eq!((proto.code[get].a(), proto.code[get].b()), (1, 1));
}
