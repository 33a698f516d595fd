//! End-to-end VM tests.
//!
//! The parser and code generator are external collaborators, so these
//! tests assemble instruction streams by hand the way the code generator
//! would emit them. Each test comments the script it encodes.

use std::sync::Arc;

use feral::{
    Bytecode, Const, E_EXEC_FAIL, E_OK, FnMarker, FnTemplate, NativeFnDesc, Op, SrcFile, Type, Var,
    Vm,
};
use pretty_assertions::assert_eq;

fn new_vm() -> Vm {
    let mut vm = Vm::new("feral", "/usr/local", vec![], 0);
    assert!(vm.load_core_mods());
    vm
}

fn run_in(vm: &mut Vm, bc: Bytecode) -> (i32, String) {
    let file = SrcFile::new("main.fer", ".", "", bc, true);
    vm.add_src(file.clone(), 0);
    let code = vm.exec(file.bytecode());
    (code, vm.take_output())
}

fn run(bc: Bytecode) -> (i32, String) {
    let mut vm = new_vm();
    run_in(&mut vm, bc)
}

#[test]
fn arithmetic_precedence() {
    // let a = 1 + 2 * 3; println(a);
    let mut bc = Bytecode::new();
    bc.emit_const(Const::Int(1.into()), 0);
    bc.emit_const(Const::Int(2.into()), 0);
    bc.emit_const(Const::Int(3.into()), 0);
    bc.emit_member_call("*", 1, 0);
    bc.emit_member_call("+", 1, 0);
    bc.emit_let("a", 0);
    bc.emit_load("println", 0);
    bc.emit_load("a", 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run(bc), (E_OK, "7\n".to_string()));
}

#[test]
fn mixed_arithmetic_widens() {
    // println(1 + 2.5);
    let mut bc = Bytecode::new();
    bc.emit_load("println", 0);
    bc.emit_const(Const::Int(1.into()), 0);
    bc.emit_const(Const::Flt(2.5), 0);
    bc.emit_member_call("+", 1, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run(bc), (E_OK, "3.5\n".to_string()));
}

#[test]
fn assignment_mutates_in_place() {
    // let a = 1; a = 2; println(a);
    let mut bc = Bytecode::new();
    bc.emit_const(Const::Int(1.into()), 0);
    bc.emit_let("a", 0);
    bc.emit_load("a", 0);
    bc.emit_const(Const::Int(2.into()), 0);
    bc.add(Op::Assign, 0);
    bc.add(Op::Unload, 0);
    bc.emit_load("println", 0);
    bc.emit_load("a", 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run(bc), (E_OK, "2\n".to_string()));
}

#[test]
fn duplicate_binding_fails() {
    // let a = 1; let a = 2;
    let mut bc = Bytecode::new();
    bc.emit_const(Const::Int(1.into()), 0);
    bc.emit_let("a", 0);
    bc.emit_const(Const::Int(2.into()), 0);
    bc.emit_let("a", 0);

    let mut vm = new_vm();
    let (code, _) = run_in(&mut vm, bc);
    assert_eq!(code, E_EXEC_FAIL);
    let diags = vm.take_diags().join("\n");
    assert!(diags.contains("already exists"), "{}", diags);
}

#[test]
fn function_with_default_parameter() {
    // let f = fn(x, y = 5) { return x + y; }; println(f(3));
    let mut bc = Bytecode::new();
    let jmp = bc.add(Op::Jump(0), 0);
    let body_begin = bc.len();
    bc.emit_load("x", 0);
    bc.emit_load("y", 0);
    bc.emit_member_call("+", 1, 0);
    bc.add(Op::Return, 0);
    let body_end = bc.len();
    bc.patch_jump(jmp, body_end);

    let mut default = Bytecode::new();
    default.emit_const(Const::Int(5.into()), 0);
    let fn_i = bc.add_fn(FnTemplate {
        params: vec!["x".into(), "y".into()],
        defaults: vec![None, Some(Arc::new(default))],
        marker: FnMarker::None,
        body_begin,
        body_end,
    });
    bc.add(Op::MakeFn(fn_i), 0);
    bc.emit_let("f", 0);
    bc.emit_load("println", 0);
    bc.emit_load("f", 0);
    bc.emit_const(Const::Int(3.into()), 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run(bc), (E_OK, "8\n".to_string()));
}

#[test]
fn missing_required_argument_fails() {
    // let f = fn(x) { return x; }; f();
    let mut bc = Bytecode::new();
    let jmp = bc.add(Op::Jump(0), 0);
    let body_begin = bc.len();
    bc.emit_load("x", 0);
    bc.add(Op::Return, 0);
    let body_end = bc.len();
    bc.patch_jump(jmp, body_end);
    let fn_i = bc.add_fn(FnTemplate {
        params: vec!["x".into()],
        defaults: vec![None],
        marker: FnMarker::None,
        body_begin,
        body_end,
    });
    bc.add(Op::MakeFn(fn_i), 0);
    bc.emit_let("f", 0);
    bc.emit_load("f", 0);
    bc.add(Op::Call(0), 0);
    bc.add(Op::Unload, 0);

    let mut vm = new_vm();
    let (code, _) = run_in(&mut vm, bc);
    assert_eq!(code, E_EXEC_FAIL);
    assert!(vm.take_diags().join("\n").contains("missing required argument"));
}

#[test]
fn varargs_collect_into_vec() {
    // let f = fn(args...) { println(args); }; f(1, 2, 3);
    let mut bc = Bytecode::new();
    let jmp = bc.add(Op::Jump(0), 0);
    let body_begin = bc.len();
    bc.emit_load("println", 0);
    bc.emit_load("args", 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);
    let body_end = bc.len();
    bc.patch_jump(jmp, body_end);
    let fn_i = bc.add_fn(FnTemplate {
        params: vec!["args".into()],
        defaults: vec![None],
        marker: FnMarker::Variadic,
        body_begin,
        body_end,
    });
    bc.add(Op::MakeFn(fn_i), 0);
    bc.emit_let("f", 0);
    bc.emit_load("f", 0);
    bc.emit_const(Const::Int(1.into()), 0);
    bc.emit_const(Const::Int(2.into()), 0);
    bc.emit_const(Const::Int(3.into()), 0);
    bc.add(Op::Call(3), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run(bc), (E_OK, "[1, 2, 3]\n".to_string()));
}

/// Builds `let f = fn(x) { x = 5; }; let a = 1; f(a); println(a);` with the
/// given parameter marker.
fn param_mutation_program(marker: FnMarker) -> Bytecode {
    let mut bc = Bytecode::new();
    let jmp = bc.add(Op::Jump(0), 0);
    let body_begin = bc.len();
    bc.emit_load("x", 0);
    bc.emit_const(Const::Int(5.into()), 0);
    bc.add(Op::Assign, 0);
    bc.add(Op::Unload, 0);
    let body_end = bc.len();
    bc.patch_jump(jmp, body_end);
    let fn_i = bc.add_fn(FnTemplate {
        params: vec!["x".into()],
        defaults: vec![None],
        marker,
        body_begin,
        body_end,
    });
    bc.add(Op::MakeFn(fn_i), 0);
    bc.emit_let("f", 0);
    bc.emit_const(Const::Int(1.into()), 0);
    bc.emit_let("a", 0);
    bc.emit_load("f", 0);
    bc.emit_load("a", 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);
    bc.emit_load("println", 0);
    bc.emit_load("a", 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);
    bc
}

#[test]
fn reference_parameter_writes_through() {
    let bc = param_mutation_program(FnMarker::Reference);
    assert_eq!(run(bc), (E_OK, "5\n".to_string()));
}

#[test]
fn plain_parameter_binds_a_copy() {
    let bc = param_mutation_program(FnMarker::None);
    assert_eq!(run(bc), (E_OK, "1\n".to_string()));
}

#[test]
fn implicit_return_is_nil() {
    // let f = fn() {}; println(type_of(f()));
    let mut bc = Bytecode::new();
    let jmp = bc.add(Op::Jump(0), 0);
    let body_begin = bc.len();
    let body_end = bc.len();
    bc.patch_jump(jmp, body_end);
    let fn_i = bc.add_fn(FnTemplate {
        params: vec![],
        defaults: vec![],
        marker: FnMarker::None,
        body_begin,
        body_end,
    });
    bc.add(Op::MakeFn(fn_i), 0);
    bc.emit_let("f", 0);
    bc.emit_load("println", 0);
    bc.emit_load("type_of", 0);
    bc.emit_load("f", 0);
    bc.add(Op::Call(0), 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run(bc), (E_OK, "nil\n".to_string()));
}

#[test]
fn raise_caught_by_protected_region() {
    // let t = fn() { raise 'boom'; }; t() or e { println(e); };
    let mut bc = Bytecode::new();
    let jmp = bc.add(Op::Jump(0), 0);
    let body_begin = bc.len();
    bc.emit_const(Const::Str("boom".into()), 0);
    bc.add(Op::Raise, 0);
    let body_end = bc.len();
    bc.patch_jump(jmp, body_end);
    let fn_i = bc.add_fn(FnTemplate {
        params: vec![],
        defaults: vec![],
        marker: FnMarker::None,
        body_begin,
        body_end,
    });
    bc.add(Op::MakeFn(fn_i), 0);
    bc.emit_let("t", 0);

    let name_e = bc.add_name("e");
    let push_fail = bc.add(Op::PushFail(0, name_e), 0);
    bc.emit_load("t", 0);
    bc.add(Op::Call(0), 0);
    bc.add(Op::Unload, 0);
    bc.add(Op::PopFail, 0);
    let jmp_end = bc.add(Op::Jump(0), 0);
    let catch = bc.len();
    bc.emit_load("println", 0);
    bc.emit_load("e", 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);
    bc.add(Op::PopBlock, 0);
    let end = bc.len();
    bc.patch_jump(push_fail, catch);
    bc.patch_jump(jmp_end, end);

    assert_eq!(run(bc), (E_OK, "boom\n".to_string()));
}

#[test]
fn uncaught_raise_reaches_the_driver() {
    // raise 'kaboom';
    let mut bc = Bytecode::new();
    bc.emit_const(Const::Str("kaboom".into()), 0);
    bc.add(Op::Raise, 0);

    let mut vm = new_vm();
    let (code, _) = run_in(&mut vm, bc);
    assert_eq!(code, E_EXEC_FAIL);
    assert!(vm.take_diags().join("\n").contains("kaboom"));
}

#[test]
fn runaway_recursion_hits_the_stack_bound() {
    // let f = fn() { return f(); }; f();
    let mut bc = Bytecode::new();
    let jmp = bc.add(Op::Jump(0), 0);
    let body_begin = bc.len();
    bc.emit_load("f", 0);
    bc.add(Op::Call(0), 0);
    bc.add(Op::Return, 0);
    let body_end = bc.len();
    bc.patch_jump(jmp, body_end);
    let fn_i = bc.add_fn(FnTemplate {
        params: vec![],
        defaults: vec![],
        marker: FnMarker::None,
        body_begin,
        body_end,
    });
    bc.add(Op::MakeFn(fn_i), 0);
    bc.emit_let("f", 0);
    bc.emit_load("f", 0);
    bc.add(Op::Call(0), 0);
    bc.add(Op::Unload, 0);

    let mut vm = new_vm();
    let (code, _) = run_in(&mut vm, bc);
    assert_eq!(code, E_EXEC_FAIL);
    assert!(vm.exec_stack_count_exceeded);
    assert!(vm.take_diags().join("\n").contains("call stack"));
}

#[test]
fn loop_with_continue_and_condition() {
    // let i = 0; loop while i < 3 { println(i); i += 1; }
    let mut bc = Bytecode::new();
    bc.emit_const(Const::Int(0.into()), 0);
    bc.emit_let("i", 0);
    bc.add(Op::PushLoop, 0);
    let cond = bc.len();
    bc.emit_load("i", 0);
    bc.emit_const(Const::Int(3.into()), 0);
    bc.emit_member_call("<", 1, 0);
    let jf = bc.add(Op::JumpFalse(0), 0);
    bc.emit_load("println", 0);
    bc.emit_load("i", 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);
    bc.emit_load("i", 0);
    bc.emit_const(Const::Int(1.into()), 0);
    bc.emit_member_call("+=", 1, 0);
    bc.add(Op::Unload, 0);
    let cont = bc.add(Op::Continue(0), 0);
    let pop_loop = bc.add(Op::PopLoop, 0);
    bc.patch_jump(jf, pop_loop);
    bc.patch_jump(cont, cond);

    assert_eq!(run(bc), (E_OK, "0\n1\n2\n".to_string()));
}

#[test]
fn break_leaves_the_loop() {
    // loop { break; println('unreachable'); }
    let mut bc = Bytecode::new();
    bc.add(Op::PushLoop, 0);
    let brk = bc.add(Op::Break(0), 0);
    bc.emit_load("println", 0);
    bc.emit_const(Const::Str("unreachable".into()), 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);
    bc.add(Op::PopLoop, 0);
    let end = bc.len();
    bc.patch_jump(brk, end);

    assert_eq!(run(bc), (E_OK, String::new()));
}

#[test]
fn break_outside_a_loop_fails() {
    let mut bc = Bytecode::new();
    bc.add(Op::Break(1), 0);

    let mut vm = new_vm();
    let (code, _) = run_in(&mut vm, bc);
    assert_eq!(code, E_EXEC_FAIL);
    assert!(vm.take_diags().join("\n").contains("break outside a loop"));
}

#[test]
fn exit_stops_execution_with_code() {
    // println('before'); exit(5); println('after');
    let mut bc = Bytecode::new();
    bc.emit_load("println", 0);
    bc.emit_const(Const::Str("before".into()), 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);
    bc.emit_load("exit", 0);
    bc.emit_const(Const::Int(5.into()), 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);
    bc.emit_load("println", 0);
    bc.emit_const(Const::Str("after".into()), 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run(bc), (5, "before\n".to_string()));
}

#[test]
fn undefined_name_fails() {
    let mut bc = Bytecode::new();
    bc.emit_load("no_such_name", 0);

    let mut vm = new_vm();
    let (code, _) = run_in(&mut vm, bc);
    assert_eq!(code, E_EXEC_FAIL);
    assert!(vm.take_diags().join("\n").contains("undefined name"));
}

#[test]
fn calling_a_non_callable_fails() {
    // 1();
    let mut bc = Bytecode::new();
    bc.emit_const(Const::Int(1.into()), 0);
    bc.add(Op::Call(0), 0);

    let mut vm = new_vm();
    let (code, _) = run_in(&mut vm, bc);
    assert_eq!(code, E_EXEC_FAIL);
    assert!(vm.take_diags().join("\n").contains("not callable"));
}

#[test]
fn equality_is_structural_and_widening() {
    // println(2 == 2.0); println([1, 2] == [1, 2]);
    let mut bc = Bytecode::new();
    bc.emit_load("println", 0);
    bc.emit_const(Const::Int(2.into()), 0);
    bc.emit_const(Const::Flt(2.0), 0);
    bc.emit_member_call("==", 1, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);
    bc.emit_load("println", 0);
    bc.emit_const(Const::Int(1.into()), 0);
    bc.emit_const(Const::Int(2.into()), 0);
    bc.add(Op::BuildVec(2), 0);
    bc.emit_const(Const::Int(1.into()), 0);
    bc.emit_const(Const::Int(2.into()), 0);
    bc.add(Op::BuildVec(2), 0);
    bc.emit_member_call("==", 1, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run(bc), (E_OK, "true\ntrue\n".to_string()));
}

fn probe_type(_vm: &mut Vm, fd: &feral::FnData) -> Option<Var> {
    Some(Var::str("from-type", fd.src_id, fd.idx))
}

fn probe_all(_vm: &mut Vm, fd: &feral::FnData) -> Option<Var> {
    Some(Var::str("from-all", fd.src_id, fd.idx))
}

#[test]
fn method_resolution_prefers_type_over_all() {
    let mut vm = new_vm();
    vm.add_native_typefn(Type::Int, NativeFnDesc::new("probe", 0, probe_type), 0, 0);
    vm.add_native_typefn(Type::All, NativeFnDesc::new("probe", 0, probe_all), 0, 0);

    // println(1.probe()); println('s'.probe());
    let mut bc = Bytecode::new();
    bc.emit_load("println", 0);
    bc.emit_const(Const::Int(1.into()), 0);
    bc.emit_member_call("probe", 0, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);
    bc.emit_load("println", 0);
    bc.emit_const(Const::Str("s".into()), 0);
    bc.emit_member_call("probe", 0, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run_in(&mut vm, bc), (E_OK, "from-type\nfrom-all\n".to_string()));
}

#[test]
fn method_resolution_prefers_attributes_first() {
    let mut vm = new_vm();
    vm.add_native_typefn(Type::All, NativeFnDesc::new("probe", 0, probe_all), 0, 0);

    // let pf = fn() { return 'from-attr'; };
    // let s = struct_new(); s.probe = pf; println(s.probe());
    let mut bc = Bytecode::new();
    let jmp = bc.add(Op::Jump(0), 0);
    let body_begin = bc.len();
    bc.emit_const(Const::Str("from-attr".into()), 0);
    bc.add(Op::Return, 0);
    let body_end = bc.len();
    bc.patch_jump(jmp, body_end);
    let fn_i = bc.add_fn(FnTemplate {
        params: vec![],
        defaults: vec![],
        marker: FnMarker::None,
        body_begin,
        body_end,
    });
    bc.add(Op::MakeFn(fn_i), 0);
    bc.emit_let("pf", 0);
    bc.emit_load("struct_new", 0);
    bc.add(Op::Call(0), 0);
    bc.emit_let("s", 0);
    bc.emit_load("s", 0);
    bc.emit_load("pf", 0);
    let probe = bc.add_name("probe");
    bc.add(Op::AttrSet(probe), 0);
    bc.add(Op::Unload, 0);
    bc.emit_load("println", 0);
    bc.emit_load("s", 0);
    bc.emit_member_call("probe", 0, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run_in(&mut vm, bc), (E_OK, "from-attr\n".to_string()));
}

#[test]
fn struct_attributes_read_back() {
    // let s = struct_new(); s.x = 10; println(s.x);
    let mut bc = Bytecode::new();
    bc.emit_load("struct_new", 0);
    bc.add(Op::Call(0), 0);
    bc.emit_let("s", 0);
    bc.emit_load("s", 0);
    bc.emit_const(Const::Int(10.into()), 0);
    let x = bc.add_name("x");
    bc.add(Op::AttrSet(x), 0);
    bc.add(Op::Unload, 0);
    bc.emit_load("println", 0);
    bc.emit_load("s", 0);
    bc.add(Op::AttrGet(x), 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run(bc), (E_OK, "10\n".to_string()));
}

#[test]
fn vec_push_pop_round_trip() {
    // let v = []; v.push(10); println(v.pop()); println(v.len());
    let mut vm = new_vm();
    assert!(vm.nmod_load("vec", 0, 0));

    let mut bc = Bytecode::new();
    bc.add(Op::BuildVec(0), 0);
    bc.emit_let("v", 0);
    bc.emit_load("v", 0);
    bc.emit_const(Const::Int(10.into()), 0);
    bc.emit_member_call("push", 1, 0);
    bc.add(Op::Unload, 0);
    bc.emit_load("println", 0);
    bc.emit_load("v", 0);
    bc.emit_member_call("pop", 0, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);
    bc.emit_load("println", 0);
    bc.emit_load("v", 0);
    bc.emit_member_call("len", 0, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run_in(&mut vm, bc), (E_OK, "10\n0\n".to_string()));
}

#[test]
fn split_drops_empty_segments() {
    // let s = '1,2,,3'; println(s.split_native(','));
    let mut vm = new_vm();
    assert!(vm.nmod_load("str", 0, 0));

    let mut bc = Bytecode::new();
    bc.emit_const(Const::Str("1,2,,3".into()), 0);
    bc.emit_const(Const::Str(",".into()), 0);
    bc.emit_member_call("split_native", 1, 0);
    bc.emit_let("parts", 0);
    bc.emit_load("println", 0);
    bc.emit_load("parts", 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run_in(&mut vm, bc), (E_OK, "[1, 2, 3]\n".to_string()));
}

#[test]
fn chr_byt_round_trip() {
    // println('Z'.byt().chr());
    let mut vm = new_vm();
    assert!(vm.nmod_load("str", 0, 0));

    let mut bc = Bytecode::new();
    bc.emit_load("println", 0);
    bc.emit_const(Const::Str("Z".into()), 0);
    bc.emit_member_call("byt", 0, 0);
    bc.emit_member_call("chr", 0, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run_in(&mut vm, bc), (E_OK, "Z\n".to_string()));
}

#[test]
fn str_scan_helpers() {
    // println('abcabc'.rfind('bc')); println('abc'.lastidx());
    // println('hello'.ischat(1, 'aeiou'));
    let mut vm = new_vm();
    assert!(vm.nmod_load("str", 0, 0));

    let mut bc = Bytecode::new();
    bc.emit_load("println", 0);
    bc.emit_const(Const::Str("abcabc".into()), 0);
    bc.emit_const(Const::Str("bc".into()), 0);
    bc.emit_member_call("rfind", 1, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);
    bc.emit_load("println", 0);
    bc.emit_const(Const::Str("abc".into()), 0);
    bc.emit_member_call("lastidx", 0, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);
    bc.emit_load("println", 0);
    bc.emit_const(Const::Str("hello".into()), 0);
    bc.emit_const(Const::Int(1.into()), 0);
    bc.emit_const(Const::Str("aeiou".into()), 0);
    bc.emit_member_call("ischat", 2, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run_in(&mut vm, bc), (E_OK, "4\n2\ntrue\n".to_string()));
}

#[test]
fn str_radix_helpers_round_trip() {
    // println('f'.getBinStrFromHexStr()); println('1000001'.getUTF8CharFromBinStr());
    let mut vm = new_vm();
    assert!(vm.nmod_load("str", 0, 0));

    let mut bc = Bytecode::new();
    bc.emit_load("println", 0);
    bc.emit_const(Const::Str("f".into()), 0);
    bc.emit_member_call("getBinStrFromHexStr", 0, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);
    bc.emit_load("println", 0);
    bc.emit_const(Const::Str("1000001".into()), 0);
    bc.emit_member_call("getUTF8CharFromBinStr", 0, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run_in(&mut vm, bc), (E_OK, "1111\nA\n".to_string()));
}

#[test]
fn str_clear_empties_in_place() {
    // let s = 'xy'; s.clear(); println(s.len());
    let mut vm = new_vm();
    assert!(vm.nmod_load("str", 0, 0));

    let mut bc = Bytecode::new();
    bc.emit_const(Const::Str("xy".into()), 0);
    bc.emit_let("s", 0);
    bc.emit_load("s", 0);
    bc.emit_member_call("clear", 0, 0);
    bc.add(Op::Unload, 0);
    bc.emit_load("println", 0);
    bc.emit_load("s", 0);
    bc.emit_member_call("len", 0, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run_in(&mut vm, bc), (E_OK, "0\n".to_string()));
}

#[test]
fn failed_assert_reaches_the_driver() {
    // assert(false, 'nope');
    let mut bc = Bytecode::new();
    bc.emit_load("assert", 0);
    bc.emit_const(Const::Bool(false), 0);
    bc.emit_const(Const::Str("nope".into()), 0);
    bc.add(Op::Call(2), 0);
    bc.add(Op::Unload, 0);

    let mut vm = new_vm();
    let (code, _) = run_in(&mut vm, bc);
    assert_eq!(code, E_EXEC_FAIL);
    assert!(vm.take_diags().join("\n").contains("assertion failed: nope"));
}

#[test]
fn str_int_round_trip() {
    // println(int('42').str());
    let mut bc = Bytecode::new();
    bc.emit_load("println", 0);
    bc.emit_load("int", 0);
    bc.emit_const(Const::Str("42".into()), 0);
    bc.add(Op::Call(1), 0);
    bc.emit_member_call("str", 0, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run(bc), (E_OK, "42\n".to_string()));
}

#[test]
fn map_preserves_insertion_order() {
    // let m = {'b': 1, 'a': 2}; m.insert('c', 3); println(m.keys()); println(m.get('a'));
    let mut vm = new_vm();
    assert!(vm.nmod_load("map", 0, 0));

    let mut bc = Bytecode::new();
    bc.emit_const(Const::Str("b".into()), 0);
    bc.emit_const(Const::Int(1.into()), 0);
    bc.emit_const(Const::Str("a".into()), 0);
    bc.emit_const(Const::Int(2.into()), 0);
    bc.add(Op::BuildMap(2), 0);
    bc.emit_let("m", 0);
    bc.emit_load("m", 0);
    bc.emit_const(Const::Str("c".into()), 0);
    bc.emit_const(Const::Int(3.into()), 0);
    bc.emit_member_call("insert", 2, 0);
    bc.add(Op::Unload, 0);
    bc.emit_load("println", 0);
    bc.emit_load("m", 0);
    bc.emit_member_call("keys", 0, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);
    bc.emit_load("println", 0);
    bc.emit_load("m", 0);
    bc.emit_const(Const::Str("a".into()), 0);
    bc.emit_member_call("get", 1, 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run_in(&mut vm, bc), (E_OK, "[b, a, c]\n2\n".to_string()));
}

#[test]
fn division_by_zero_is_catchable() {
    // (1 / 0) or e { println('caught'); };
    let mut bc = Bytecode::new();
    let name_e = bc.add_name("e");
    let push_fail = bc.add(Op::PushFail(0, name_e), 0);
    bc.emit_const(Const::Int(1.into()), 0);
    bc.emit_const(Const::Int(0.into()), 0);
    bc.emit_member_call("/", 1, 0);
    bc.add(Op::Unload, 0);
    bc.add(Op::PopFail, 0);
    let jmp_end = bc.add(Op::Jump(0), 0);
    let catch = bc.len();
    bc.emit_load("println", 0);
    bc.emit_const(Const::Str("caught".into()), 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);
    bc.add(Op::PopBlock, 0);
    let end = bc.len();
    bc.patch_jump(push_fail, catch);
    bc.patch_jump(jmp_end, end);

    assert_eq!(run(bc), (E_OK, "caught\n".to_string()));
}

#[test]
fn globals_are_visible_from_scripts() {
    let mut vm = new_vm();
    vm.gadd("answer", Var::int(42, 0, 0));

    let mut bc = Bytecode::new();
    bc.emit_load("println", 0);
    bc.emit_load("answer", 0);
    bc.add(Op::Call(1), 0);
    bc.add(Op::Unload, 0);

    assert_eq!(run_in(&mut vm, bc), (E_OK, "42\n".to_string()));
}
