//! End-to-end compilation tests: real source in, compiled module
//! objects out, assertions against the bytecode and the export table.

use eel::{
    ClassId, CollectWarnings, CompileOptions, Compiler, ErrorKind, HeapId, Opcode, Value, count_instructions, decode,
};
use pretty_assertions::assert_eq;

fn native_stub(_heap: &mut eel::Heap, _args: &[Value]) -> Result<Option<Value>, eel::OperateError> {
    Ok(None)
}

/// A compiler with a few host functions scripts can call.
fn compiler() -> Compiler {
    let mut c = Compiler::new(CompileOptions::default());
    c.register_native("print", 0, 255, 0, 0, native_stub);
    c.register_native("foo", 0, 0, 0, 0, native_stub);
    c.register_native("a", 0, 0, 0, 0, native_stub);
    c.register_native("b", 0, 0, 0, 0, native_stub);
    c.register_native("c", 0, 0, 0, 0, native_stub);
    c
}

fn compile(c: &mut Compiler, src: &str) -> HeapId {
    let mut warnings = CollectWarnings::default();
    match c.compile_with(src.as_bytes(), "test.eel", &mut warnings) {
        Ok(m) => m,
        Err(e) => panic!("compile failed: {e}\nsource:\n{src}"),
    }
}

fn compile_err(c: &mut Compiler, src: &str) -> eel::CompileError {
    let mut warnings = CollectWarnings::default();
    match c.compile_with(src.as_bytes(), "test.eel", &mut warnings) {
        Ok(_) => panic!("expected a compile error for:\n{src}"),
        Err(e) => e,
    }
}

/// Finds a module function object by name.
fn function_named(c: &Compiler, module: HeapId, name: &str) -> HeapId {
    for &o in &c.heap().module(module).objects {
        if let Some(f) = c.heap().function(o) {
            if c.heap().str_lossy(f.name) == name {
                return o;
            }
        }
    }
    panic!("no function named {name} in module");
}

/// Decodes all instructions of a function body.
fn instructions(c: &Compiler, func: HeapId) -> Vec<(Opcode, eel::Operands, usize)> {
    let body = c.function_body(func).expect("bytecode function");
    let mut out = Vec::new();
    let mut pc = 0;
    while pc < body.code.len() {
        let (op, operands, size) = decode(&body.code, pc).expect("clean decode");
        out.push((op, operands, pc));
        pc += size;
    }
    out
}

#[test]
fn simple_procedure_compiles_to_immediate_init() {
    let mut c = compiler();
    let m = compile(&mut c, "procedure p() { local x = 1 + 2; }");

    // The module always exports its root function.
    let names = c.export_names(m);
    assert!(names.contains(&"__init_module".to_string()), "exports: {names:?}");

    // 1 + 2 folds; the body is a single immediate init plus the return.
    let p = function_named(&c, m, "p");
    let body = c.function_body(p).unwrap();
    assert_eq!(
        body.code,
        vec![Opcode::InitI as u8, 0, 3, 0, Opcode::Return as u8],
        "disassembly:\n{}",
        c.disassemble_function(p).unwrap()
    );
    assert_eq!(body.lines.len(), count_instructions(&body.code).unwrap());
    assert_eq!(body.cleansize, 1);
    assert!(body.cleansize <= body.framesize);
}

#[test]
fn lines_parallel_instructions_everywhere() {
    let mut c = compiler();
    let m = compile(
        &mut c,
        "local n = 3; procedure p(x) { if x > 1 print(x); } p(n); print(n);",
    );
    for &o in &c.heap().module(m).objects {
        if let Some(body) = c.function_body(o) {
            assert_eq!(
                Some(body.lines.len()),
                count_instructions(&body.code),
                "lineinfo out of sync:\n{}",
                c.disassemble_function(o).unwrap()
            );
        }
    }
}

#[test]
fn branchless_init_through_constant_condition() {
    let mut c = compiler();
    // A constant-true condition makes the initialization certain.
    compile(&mut c, "local x; if true x = 1; print(x);");
}

#[test]
fn maybe_uninitialized_read_is_rejected() {
    let mut c = compiler();
    let e = compile_err(&mut c, "local c = 0; local x; if c x = 1; print(x);");
    assert_eq!(e.kind, ErrorKind::Init);
    // Distinguishable from the definite-uninitialized wording.
    assert!(e.message.contains("may"), "{}", e.message);
    assert!(!e.message.contains("Reading uninitialized"), "{}", e.message);
}

#[test]
fn uninitialized_read_is_rejected() {
    let mut c = compiler();
    let e = compile_err(&mut c, "local x; print(x);");
    assert_eq!(e.kind, ErrorKind::Init);
    assert!(e.message.contains("uninitialized variable 'x'"), "{}", e.message);
}

#[test]
fn both_branches_initializing_is_accepted() {
    let mut c = compiler();
    compile(&mut c, "local q = 1; local x; if q x = 1; else x = 2; print(x);");
}

#[test]
fn for_loop_emits_one_preloop_and_one_loop() {
    let mut c = compiler();
    let m = compile(
        &mut c,
        "procedure q() { for local i = 0, 4, 1 { if i == 2 continue; if i == 3 break; } }",
    );
    let q = function_named(&c, m, "q");
    let ins = instructions(&c, q);

    let preloops: Vec<_> = ins.iter().filter(|(op, ..)| *op == Opcode::Preloop).collect();
    let loops: Vec<_> = ins.iter().filter(|(op, ..)| *op == Opcode::Loop).collect();
    assert_eq!(preloops.len(), 1, "{}", c.disassemble_function(q).unwrap());
    assert_eq!(loops.len(), 1, "{}", c.disassemble_function(q).unwrap());

    let (_, loop_operands, loop_pos) = *loops[0];
    let loop_size = Opcode::Loop.size();
    let loop_end = loop_pos + loop_size;

    // LOOP jumps backwards to the loop start.
    let loop_target = usize::try_from(i64::try_from(loop_end).unwrap() + i64::from(loop_operands.d)).unwrap();
    assert!(loop_target < loop_pos);

    // 'continue' patches to the LOOP instruction, 'break' to just after
    // it. Both are plain jumps inside the loop body.
    let body = c.function_body(q).unwrap();
    let mut continue_seen = false;
    let mut break_seen = false;
    for (op, operands, pos) in &ins {
        if *op != Opcode::Jump || *pos <= loop_target || *pos >= loop_pos {
            continue;
        }
        let target = usize::try_from(i64::try_from(pos + Opcode::Jump.size()).unwrap() + i64::from(operands.a)).unwrap();
        if target == loop_pos {
            continue_seen = true;
        }
        if target == loop_end {
            break_seen = true;
        }
    }
    assert!(continue_seen, "continue jump missing:\n{}", c.disassemble_function(q).unwrap());
    assert!(break_seen, "break jump missing:\n{}", c.disassemble_function(q).unwrap());

    // No branch escapes the function.
    for (op, operands, pos) in &ins {
        if let Some(_field) = op.jump_field() {
            let off = match op {
                Opcode::Jump => operands.a,
                Opcode::JumpZ | Opcode::JumpNZ => operands.b,
                Opcode::Switch => operands.c,
                _ => operands.d,
            };
            let target = i64::try_from(pos + op.size()).unwrap() + i64::from(off);
            assert!(target >= 0 && target <= i64::try_from(body.code.len()).unwrap());
        }
    }
}

#[test]
fn switch_builds_a_first_wins_jump_table() {
    let mut c = compiler();
    let m = compile(
        &mut c,
        "procedure s(x) { switch x { case 1 a(); case 2, 3 b(); default c(); } }",
    );
    let s = function_named(&c, m, "s");
    let ins = instructions(&c, s);
    let (_, sw, _) = *ins
        .iter()
        .find(|(op, ..)| *op == Opcode::Switch)
        .expect("one SWITCH instruction");

    let body = c.function_body(s).unwrap();
    let table = match &body.constants[usize::try_from(sw.b).unwrap()] {
        Value::ObjRef(t) => *t,
        other => panic!("switch table constant is {other:?}"),
    };
    assert_eq!(c.heap().class_of(table), ClassId::Table);
    let t = c.heap().table(table);
    let at = |k: i32| match t.get(&Value::Integer(k)) {
        Some(Value::Integer(p)) => *p,
        other => panic!("case {k} maps to {other:?}"),
    };
    let pa = at(1);
    let pb = at(2);
    assert_eq!(pb, at(3), "2 and 3 share a case body");
    assert_ne!(pa, pb);
}

#[test]
fn duplicate_case_value_is_a_scope_error() {
    let mut c = compiler();
    let e = compile_err(&mut c, "procedure s(x) { switch x { case 1 a(); case 1 b(); } }");
    assert_eq!(e.kind, ErrorKind::Scope);
    assert!(e.message.contains("already handled"), "{}", e.message);
}

#[test]
fn try_except_compiles_to_one_try_over_two_subfunctions() {
    let mut c = compiler();
    let m = compile(&mut c, "procedure t() { try foo(); except throw exception; }");
    let t = function_named(&c, m, "t");
    let ins = instructions(&c, t);
    let tries: Vec<_> = ins.iter().filter(|(op, ..)| *op == Opcode::Try).collect();
    assert_eq!(tries.len(), 1);
    let (_, operands, _) = *tries[0];

    let body = c.function_body(t).unwrap();
    let catch_fn = match &body.constants[usize::try_from(operands.a).unwrap()] {
        Value::ObjRef(o) | Value::WeakRef(o) => *o,
        other => panic!("catch constant is {other:?}"),
    };
    let try_fn = match &body.constants[usize::try_from(operands.b).unwrap()] {
        Value::ObjRef(o) | Value::WeakRef(o) => *o,
        other => panic!("try constant is {other:?}"),
    };
    assert_eq!(c.heap().class_of(catch_fn), ClassId::Function);
    assert_eq!(c.heap().class_of(try_fn), ClassId::Function);

    // The except body throws the exception value it received in R[0].
    let catch_body = c.function_body(catch_fn).unwrap();
    let mut pc = 0;
    let mut threw_r0 = false;
    while pc < catch_body.code.len() {
        let (op, operands, size) = decode(&catch_body.code, pc).unwrap();
        if op == Opcode::Throw && operands.a == 0 {
            threw_r0 = true;
        }
        pc += size;
    }
    assert!(threw_r0, "{}", c.disassemble_function(catch_fn).unwrap());
}

#[test]
fn exported_upvalue_functions_are_rejected() {
    let mut c = compiler();
    let e = compile_err(&mut c, "local x = 1; export procedure p() { upvalue x; x = 2; }");
    assert_eq!(e.kind, ErrorKind::Scope);
    assert!(
        e.message.contains("upvalues cannot be exported"),
        "{}",
        e.message
    );
}

#[test]
fn implicit_upvalue_access_is_rejected() {
    let mut c = compiler();
    let e = compile_err(&mut c, "local x = 1; procedure p() { x = 2; }");
    assert_eq!(e.kind, ErrorKind::Scope);
    assert!(e.message.contains("Implicit upvalue"), "{}", e.message);
}

#[test]
fn exported_functions_appear_in_the_export_table() {
    let mut c = compiler();
    let m = compile(&mut c, "export procedure hello() { print(1); }");
    let names = c.export_names(m);
    assert!(names.contains(&"hello".to_string()), "{names:?}");
    let v = c.export(m, "hello").expect("exported");
    let f = v.object().expect("function export");
    assert_eq!(c.heap().class_of(f), ClassId::Function);
}

#[test]
fn named_modules_export_their_name() {
    let mut c = compiler();
    let m = compile(&mut c, "module widgets; procedure p() { }");
    let v = c.export(m, "__modname").expect("__modname");
    let s = v.object().expect("string");
    assert_eq!(c.heap().str_lossy(s), "widgets");

    // Releasing the caller's reference tears the module down, functions
    // and all.
    let p = function_named(&c, m, "p");
    c.release_module(m);
    assert!(!c.heap().is_alive(m));
    assert!(!c.heap().is_alive(p));
}

#[test]
fn code_after_return_is_eliminated() {
    let mut c = compiler();
    let m = compile(&mut c, "procedure d() { return; local y = 1; print(y); }");
    let d = function_named(&c, m, "d");
    let body = c.function_body(d).unwrap();
    assert_eq!(body.code, vec![Opcode::Return as u8]);
    assert_eq!(body.lines.len(), 1);
}

#[test]
fn argument_pushes_fuse_to_phargi2() {
    let mut c = compiler();
    c.register_native("two", 2, 0, 0, 0, native_stub);
    let m = compile(&mut c, "procedure pp(u, v) { two(u, v); }");
    let pp = function_named(&c, m, "pp");
    let ins = instructions(&c, pp);
    assert!(
        ins.iter().any(|(op, ..)| *op == Opcode::PhArgI2),
        "{}",
        c.disassemble_function(pp).unwrap()
    );
}

#[test]
fn forward_declarations_must_be_fulfilled() {
    let mut c = compiler();
    let e = compile_err(&mut c, "procedure later(n);");
    assert_eq!(e.kind, ErrorKind::Scope);
    assert!(e.message.contains("declared but not defined"), "{}", e.message);

    // Fulfilled declarations are fine, and arity mismatches are not.
    compile(&mut c, "procedure later(n); procedure later(n) { print(n); }");
    let e = compile_err(&mut c, "procedure later(n); procedure later(n, m) { }");
    assert_eq!(e.kind, ErrorKind::Arity);
}

#[test]
fn arity_errors_on_direct_calls() {
    let mut c = compiler();
    c.register_native("two", 2, 0, 0, 0, native_stub);
    let e = compile_err(&mut c, "two(1);");
    assert_eq!(e.kind, ErrorKind::Arity);
    let e = compile_err(&mut c, "two(1, 2, 3);");
    assert_eq!(e.kind, ErrorKind::Arity);
    compile(&mut c, "two(1, 2);");
}

#[test]
fn constant_folding_reports_division_by_zero() {
    let mut c = compiler();
    let e = compile_err(&mut c, "local x = 1 / 0;");
    assert_eq!(e.kind, ErrorKind::Numeric);
}

#[test]
fn constants_and_functions_return_values() {
    let mut c = compiler();
    let m = compile(
        &mut c,
        "constant K = 40 + 2; function twice(n) { return n + n; } local r = twice(K); print(r);",
    );
    let twice = function_named(&c, m, "twice");
    let body = c.function_body(twice).unwrap();
    // A value-returning function ends in RETURNR.
    let ins = instructions(&c, twice);
    assert!(ins.iter().any(|(op, ..)| *op == Opcode::ReturnR), "{}", c.disassemble_function(twice).unwrap());
    assert!(body.framesize >= 1);
}

#[test]
fn missing_return_value_is_rejected() {
    let mut c = compiler();
    let e = compile_err(&mut c, "function f() { print(1); }");
    assert_eq!(e.kind, ErrorKind::Init);
    assert!(e.message.contains("should return a value"), "{}", e.message);
}

#[test]
fn while_loop_bodies_compile_with_break_and_assignment() {
    let mut c = compiler();
    compile(
        &mut c,
        "procedure w() { local x = 1; while true { x = 2; break; } print(x); }",
    );
}

#[test]
fn string_literals_intern_and_dedup_in_the_pool() {
    let mut c = compiler();
    let m = compile(&mut c, "procedure s2() { print(\"hi\", \"hi\", \"ho\"); }");
    let s2 = function_named(&c, m, "s2");
    let body = c.function_body(s2).unwrap();
    let strings: Vec<_> = body
        .constants
        .iter()
        .filter(|v| v.object().is_some_and(|o| c.heap().class_of(o) == ClassId::String))
        .collect();
    assert_eq!(strings.len(), 2, "\"hi\" must appear once");
}

#[test]
fn weak_assignment_needs_a_weakref_capable_target() {
    let mut c = compiler();
    compile(&mut c, "static s = nil; local t = table []; s (=) t;");
    let e = compile_err(&mut c, "local x = nil; local t = table []; x (=) t;");
    assert_eq!(e.kind, ErrorKind::Type);
}

#[test]
fn string_continuation_without_newline_warns() {
    let mut c = compiler();
    let mut warnings = CollectWarnings::default();
    c.compile_with(b"print(\"a\" \"b\");", "test.eel", &mut warnings)
        .expect("compiles");
    assert!(
        warnings.warnings.iter().any(|w| w.message.contains("continuation")),
        "{:?}",
        warnings.warnings
    );
}

#[test]
fn tuple_argument_writes_are_not_implemented() {
    let mut c = compiler();
    let e = compile_err(&mut c, "procedure g<t> { t[0] = 1; }");
    assert_eq!(e.kind, ErrorKind::Type);
    assert!(e.message.contains("not yet implemented"), "{}", e.message);
}

#[test]
fn import_is_reported_as_an_io_error() {
    let mut c = compiler();
    let e = compile_err(&mut c, "import \"somewhere\";");
    assert_eq!(e.kind, ErrorKind::Io);
}

#[test]
fn imported_exports_resolve_through_namespaces() {
    let mut c = compiler();
    let lib = compile(&mut c, "module widgets; export function count() { return 7; }");
    c.import_module(Some("widgets"), lib).expect("import");

    // Qualified access narrows the lookup to the namespace.
    compile(&mut c, "local n = widgets.count(); print(n);");

    // Unqualified import puts exports straight into scope.
    let lib2 = compile(&mut c, "export function zero() { return 0; }");
    c.import_module(None, lib2).expect("import");
    compile(&mut c, "local z = zero(); print(z);");
}

#[test]
fn stripped_source_tokens_are_accepted() {
    let mut c = compiler();
    // Keyword bytes: 128 + the token-table index. 'local' is 24, so
    // `<local> x = 1; print(x);` in stripped form:
    let mut src = vec![128 + 24];
    src.extend_from_slice(b" x = 1; print(x);");
    let mut warnings = CollectWarnings::default();
    c.compile_with(&src, "stripped.ess", &mut warnings)
        .expect("stripped source compiles");
}

#[test]
fn non_constructible_classes_are_rejected() {
    let mut c = compiler();
    let e = compile_err(&mut c, "local m = module [1];");
    assert_eq!(e.kind, ErrorKind::Type);
    assert!(e.message.contains("no constructor"), "{}", e.message);
    compile(&mut c, "local v = vector [1.0, 2.0];");
}

#[test]
fn errors_carry_positions() {
    let mut c = compiler();
    let e = compile_err(&mut c, "local a = 1;\nlocal a = 2;");
    assert_eq!(e.kind, ErrorKind::Scope);
    assert_eq!(e.line, 2);
}
