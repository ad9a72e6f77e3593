use plume_compiler::opcode::OpCode;
use plume_compiler::proto::Proto;
use plume_compiler::{compile, compile_with, CompileOptions};
use proptest::prelude::*;

fn expr() -> impl Strategy<Value = String> {
    let leaf = prop_oneof![
        Just("a".to_string()),
        Just("b".to_string()),
        Just("c".to_string()),
        Just("t.x".to_string()),
        Just("t[1]".to_string()),
        Just("nil".to_string()),
        Just("true".to_string()),
        Just("\"s\"".to_string()),
        (0i64..1000).prop_map(|n| n.to_string()),
        Just("2.5".to_string()),
        Just("f()".to_string()),
        Just("g(a)".to_string()),
        Just("t:m()".to_string()),
    ];
    leaf.prop_recursive(4, 24, 3, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(l, r)| format!("({l} + {r})")),
            (inner.clone(), inner.clone()).prop_map(|(l, r)| format!("({l} * {r})")),
            (inner.clone(), inner.clone()).prop_map(|(l, r)| format!("({l} .. {r})")),
            (inner.clone(), inner.clone()).prop_map(|(l, r)| format!("({l} and {r})")),
            (inner.clone(), inner.clone()).prop_map(|(l, r)| format!("({l} or {r})")),
            (inner.clone(), inner.clone()).prop_map(|(l, r)| format!("({l} ?? {r})")),
            (inner.clone(), inner.clone()).prop_map(|(l, r)| format!("({l} < {r})")),
            (inner.clone(), inner.clone()).prop_map(|(l, r)| format!("({l} != {r})")),
            (inner.clone(), inner.clone(), inner.clone())
                .prop_map(|(c, l, r)| format!("(if {c} then {l} else {r})")),
            (inner.clone(), inner.clone()).prop_map(|(l, r)| format!("f({l}, {r})")),
            (inner.clone(), inner.clone()).prop_map(|(l, r)| format!("{{{l}, k = {r}}}")),
            inner.clone().prop_map(|e| format!("(not {e})")),
            inner.clone().prop_map(|e| format!("(|p| -> {e})")),
            inner.prop_map(|e| format!("t?.y?[{e}]")),
        ]
    })
}

fn loop_exit() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just(""),
        Just("if c then break end"),
        Just("if b then continue end"),
    ]
}

fn block() -> impl Strategy<Value = String> {
    let leaf = prop_oneof![
        expr().prop_map(|e| format!("a = {e}")),
        expr().prop_map(|e| format!("local v = {e}")),
        (expr(), expr()).prop_map(|(l, r)| format!("local w = ({l} ?? {r}) + (if a then {l} else {r})")),
        expr().prop_map(|e| format!("t.x = {e}")),
        expr().prop_map(|e| format!("t[a] = {e}")),
        expr().prop_map(|e| format!("f({e})")),
        expr().prop_map(|e| format!("a += {e}")),
        expr().prop_map(|e| format!("b ??= {e}")),
        expr().prop_map(|e| format!("b, c = c, {e}")),
        Just("local h <close> = nil".to_string()),
    ];
    let stmt = leaf.prop_recursive(3, 16, 4, |inner| {
        let body = prop::collection::vec(inner, 0..4).prop_map(|s| s.join("\n"));
        prop_oneof![
            (expr(), body.clone(), body.clone())
                .prop_map(|(c, t, e)| format!("if {c} then\n{t}\nelse\n{e}\nend")),
            (expr(), body.clone(), loop_exit())
                .prop_map(|(c, b, x)| format!("while {c} do\n{b}\n{x}\nend")),
            (body.clone(), loop_exit())
                .prop_map(|(b, x)| format!("for i = 1, 3 do\n{b}\n{x}\nend")),
            (body.clone(), loop_exit())
                .prop_map(|(b, x)| format!("for k, v in pairs(t) do\n{b}\n{x}\nend")),
            (body.clone(), expr())
                .prop_map(|(b, c)| format!("repeat\n{b}\nuntil {c}")),
            body.clone().prop_map(|b| format!("do\n{b}\nend")),
            (body.clone(), body.clone(), body.clone()).prop_map(|(x, y, z)| format!(
                "switch a do\ncase 1:\n{x}\ncase \"s\":\n{y}\nbreak\ndefault:\n{z}\nend"
            )),
            body.prop_map(|b| format!("local g = function(...)\n{b}\nreturn ...\nend")),
        ]
    });
    prop::collection::vec(stmt, 0..6).prop_map(|s| s.join("\n"))
}

fn program() -> impl Strategy<Value = String> {
    block().prop_map(|b| format!("local a, b, c = 1, 2, 3\nlocal t = {{x = 1}}\n{b}\nreturn a, t"))
}

/// Every instruction that writes register A stays inside the frame, and
/// every jump lands inside the code.
fn check_frame(proto: &Proto) -> Result<(), String> {
    let len = proto.code.len() as i64;
    for (pc, inst) in proto.code.iter().enumerate() {
        let op = inst.opcode();
        if op.sets_a() && inst.a() >= proto.max_stack_size {
            return Err(format!("{op:?} at {pc} writes R{}", inst.a()));
        }
        if op == OpCode::Jmp {
            let target = pc as i64 + 1 + inst.get_sj() as i64;
            if !(0..len).contains(&target) {
                return Err(format!("jump at {pc} to {target}"));
            }
        }
    }
    proto.protos.iter().try_for_each(check_frame)
}

fn same_code(a: &Proto, b: &Proto) -> bool {
    a.code == b.code
        && a.constants == b.constants
        && a.max_stack_size == b.max_stack_size
        && a.protos.len() == b.protos.len()
        && a.protos.iter().zip(&b.protos).all(|(x, y)| same_code(x, y))
}

const TOKENS: &[&str] = &[
    "local", "x", "=", "1", "(", ")", "end", "if", "then", "do", "while", "+", "{", "}", ",",
    "...", "function", "return", "switch", "case", ":", "continue", "break", "|", "->", "?",
    ".", "??", "goto", "::", "repeat", "when", "<close>", "\"s\"", "for", "in",
];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Debug builds also check that every local declaration leaves the
    /// register stack at the level of the active locals.
    #[test]
    fn prop_generated_programs_compile(src in program()) {
        let chunk = compile(src.as_bytes(), "prop");
        prop_assert!(chunk.is_ok(), "{}\n---\n{}", chunk.unwrap_err(), src);
        let chunk = chunk.unwrap();
        if let Err(msg) = check_frame(&chunk.proto) {
            prop_assert!(false, "{}\n---\n{}", msg, src);
        }
    }

    #[test]
    fn prop_warnings_do_not_affect_code(src in program()) {
        let on = compile_with(src.as_bytes(), "prop", &CompileOptions::default()).unwrap();
        let off = compile_with(
            src.as_bytes(),
            "prop",
            &CompileOptions::default().with_warnings(false),
        )
        .unwrap();
        prop_assert!(same_code(&on.proto, &off.proto));
        prop_assert!(off.warnings.is_empty());
    }

    #[test]
    fn prop_continue_depth(depth in 1usize..5, n in 1i64..7) {
        let src = format!(
            "{}continue {n}{}",
            "while x do ".repeat(depth),
            " end".repeat(depth)
        );
        let result = compile(src.as_bytes(), "prop");
        if n as usize > depth {
            prop_assert_eq!(result.unwrap_err().message, "continue outside of loop");
        } else {
            prop_assert!(result.is_ok());
        }
    }

    #[test]
    fn prop_copy_after_value_lands_next_to_it(e in expr()) {
        let src = format!("local a, b, c = 1, 2, 3\nlocal t = {{x = 1}}\nlocal y = ({e}) ?? f()\nlocal z = y\nreturn z");
        let chunk = compile(src.as_bytes(), "prop").unwrap();
        let code = &chunk.proto.code;
        let mv = code.iter().rposition(|i| i.opcode() == OpCode::Move).unwrap();
        // y is R4, so its copy z must be R5
        prop_assert_eq!((code[mv].a(), code[mv].b()), (5, 4), "{}", src);
    }

    #[test]
    fn prop_token_soup_never_panics(picks in prop::collection::vec(0..TOKENS.len(), 0..16)) {
        let src: Vec<&str> = picks.iter().map(|&i| TOKENS[i]).collect();
        let _ = compile(src.join(" ").as_bytes(), "soup");
    }
}
