//! Behavior tests for the execution core: stack discipline, failure
//! propagation, generator pumping, exception unwinding.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use wend_common_core::bytecode::{Module, ModuleBuilder, Pc};
use wend_common_core::instruction::{Instruction, Opcode};
use wend_runtime::{builtins, exception, value, Func};
use wend_vm::frame::Arena;
use wend_vm::{Answer, Vm, WendThread};

fn inst(op: Opcode, a: u16, b: u16, c: u16) -> Instruction {
    Instruction::new(op, a, b, c)
}

/// Wrap a module offset as a zero-arg callable.
fn func_at(module: &Arc<Module>, name: &str, num_params: u16, num_vars: u16, off: usize) -> wend_runtime::Value {
    value::func(Func {
        name: name.to_string(),
        is_bound: false,
        pc: Pc::bytecode(module.clone(), off),
        num_params,
        num_vars,
        container: None,
    })
}

fn expect_value(ans: Answer) -> wend_runtime::Value {
    match ans {
        Answer::Value(v) => v,
        other => panic!("expected a value, got {:?}", other),
    }
}

fn new_thread() -> WendThread {
    let _ = env_logger::builder().is_test(true).try_init();
    Vm::new().spawn_thread()
}

// === Stack discipline ===

#[test]
fn test_push_pop_in_reverse_order() {
    let mut arena = Arena::new();
    for i in [1, 2, 3] {
        arena.push_value(value::int(i));
    }
    let popped: Vec<i64> = (0..3)
        .map(|_| value::as_int(&arena.pop_value().unwrap()).unwrap())
        .collect();
    assert_eq!(popped, vec![3, 2, 1]);
}

#[test]
fn test_lifo_matches_model_stack() {
    // deterministic pseudo-random push/pop sequence vs a plain Vec model
    let mut arena = Arena::new();
    let mut model: Vec<i64> = Vec::new();
    let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
    for step in 0..1000 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        if model.is_empty() || seed % 3 != 0 {
            arena.push_value(value::int(step));
            model.push(step);
        } else {
            let got = value::as_int(&arena.pop_value().unwrap()).unwrap();
            assert_eq!(Some(got), model.pop());
        }
    }
    while let Some(want) = model.pop() {
        assert_eq!(value::as_int(&arena.pop_value().unwrap()), Some(want));
    }
    assert!(arena.is_empty());
}

// === Failure frames ===

#[test]
fn test_failure_jumps_to_frame_target() {
    let mut b = ModuleBuilder::new("fail_to");
    b.emit(inst(Opcode::UnpackArgs, 0, 0, 0)); // 0
    let add_ff = b.emit(Instruction::branch(Opcode::AddFailureFrame, 0)); // 1
    b.emit(inst(Opcode::FailNow, 0, 0, 0)); // 2
    b.emit(inst(Opcode::Int, 0, 0, 0)); // 3: not reached
    let target = b.emit(inst(Opcode::Int, 0, 42, 0)); // 4
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 5
    b.patch_branch(add_ff, target);
    let m = b.build();

    let mut t = new_thread();
    let f = func_at(&m, "f", 0, 0, 0);
    let v = expect_value(t.apply(f, vec![]).unwrap());
    assert_eq!(value::as_int(&v), Some(42));
    // the failure frame was consumed and the activation fully unwound
    assert!(t.stack_handle().lock().is_empty());
}

#[test]
fn test_failure_reaches_function_fail_epilogue() {
    // the bootstrap pattern: a bottom failure frame targeting a
    // return-fail epilogue, so failure never escapes the propagator
    let mut b = ModuleBuilder::new("fail_out");
    b.emit(inst(Opcode::UnpackArgs, 0, 0, 0)); // 0
    let add_ff = b.emit(Instruction::branch(Opcode::AddFailureFrame, 0)); // 1
    b.emit(inst(Opcode::FailNow, 0, 0, 0)); // 2
    let epi = b.emit(inst(Opcode::BuiltinLookup, builtins::BUILTIN_FAIL, 0, 0)); // 3
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 4
    b.patch_branch(add_ff, epi);
    let m = b.build();

    let mut t = new_thread();
    let f = func_at(&m, "f", 0, 0, 0);
    assert!(matches!(t.apply(f, vec![]).unwrap(), Answer::Fail));
}

#[test]
fn test_failure_with_no_frame_is_fatal() {
    let mut b = ModuleBuilder::new("no_frame");
    b.emit(inst(Opcode::UnpackArgs, 0, 0, 0));
    b.emit(inst(Opcode::FailNow, 0, 0, 0));
    let m = b.build();

    let mut t = new_thread();
    let f = func_at(&m, "f", 0, 0, 0);
    assert!(matches!(
        t.apply(f, vec![]),
        Err(wend_vm::VmError::NoFailureFrame)
    ));
}

// === Generator pumping ===

/// `gen` yields "a", "b", then returns "c".
fn abc_generator() -> (Arc<Module>, wend_runtime::Value) {
    let mut b = ModuleBuilder::new("abc_gen");
    let sa = b.intern("a");
    let sb = b.intern("b");
    let sc = b.intern("c");
    b.emit(inst(Opcode::UnpackArgs, 0, 0, 0)); // 0
    b.emit(inst(Opcode::Str, sa, 0, 0)); // 1
    b.emit(inst(Opcode::Yield, 0, 0, 0)); // 2
    b.emit(inst(Opcode::Str, sb, 0, 0)); // 3
    b.emit(inst(Opcode::Yield, 0, 0, 0)); // 4
    b.emit(inst(Opcode::Str, sc, 0, 0)); // 5
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 6
    let m = b.build();
    let f = func_at(&m, "abc", 0, 0, 0);
    (m, f)
}

#[test]
fn test_pump_yields_then_final_return() {
    let (_m, g) = abc_generator();
    let mut t = new_thread();
    t.pre_apply_pump(g, vec![]).unwrap();

    for want in ["a", "b", "c"] {
        let v = expect_value(t.pump(false).unwrap());
        assert_eq!(value::as_str(&v), Some(want));
    }
    assert!(matches!(t.pump(false).unwrap(), Answer::Fail));
    // exhaustion removed the generator frame
    assert!(t.stack_handle().lock().gfp.is_none());
}

#[test]
fn test_generator_replay_is_forward_only() {
    // pumping never re-observes an earlier yield
    let (_m, g) = abc_generator();
    let mut t = new_thread();
    t.pre_apply_pump(g, vec![]).unwrap();
    let first = expect_value(t.pump(false).unwrap());
    let second = expect_value(t.pump(false).unwrap());
    assert_ne!(value::as_str(&first), value::as_str(&second));
    assert_eq!(value::as_str(&second), Some("b"));
}

#[test]
fn test_ordinary_call_of_generator_returns_first_yield() {
    // with nobody pumping, a yield is in effect a return
    let (_m, g) = abc_generator();
    let mut t = new_thread();
    let v = expect_value(t.apply(g, vec![]).unwrap());
    assert_eq!(value::as_str(&v), Some("a"));
}

/// Consumer: pumps `gen` until its value equals 5, then returns it.
///
///   f(gen) { ... | v := gen() where v == 5 ... }
fn eq5_consumer(module_name: &str) -> (Arc<Module>, usize) {
    let mut b = ModuleBuilder::new(module_name);
    b.emit(inst(Opcode::UnpackArgs, 1, 0, 0)); // 0
    let add_ff = b.emit(Instruction::branch(Opcode::AddFailureFrame, 0)); // 1
    b.emit(inst(Opcode::AddFailUpFrame, 0, 0, 0)); // 2
    b.emit(inst(Opcode::VarLookup, 0, 0, 0)); // 3: gen
    b.emit(inst(Opcode::Apply, 0, 0, 0)); // 4: pumped call site
    b.emit(inst(Opcode::Int, 0, 5, 0)); // 5
    b.emit(inst(Opcode::Eq, 0, 0, 0)); // 6: v == 5 or fail
    b.emit(inst(Opcode::VarAssign, 0, 1, 0)); // 7: save the match
    b.emit(inst(Opcode::Pop, 0, 0, 0)); // 8
    b.emit(inst(Opcode::RemoveFailureFrame, 0, 0, 0)); // 9: fail-up + generator
    b.emit(inst(Opcode::RemoveFailureFrame, 0, 0, 0)); // 10: bottom frame
    b.emit(inst(Opcode::VarLookup, 0, 1, 0)); // 11
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 12
    let epi = b.emit(inst(Opcode::BuiltinLookup, builtins::BUILTIN_FAIL, 0, 0)); // 13
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 14
    b.patch_branch(add_ff, epi);
    (b.build(), 0)
}

#[test]
fn test_fail_up_pumps_generator_for_alternatives() {
    // generator yields 3, then 5; the consumer rejects 3, backtracks into
    // the generator, and accepts 5
    let mut b = ModuleBuilder::new("gen35");
    b.emit(inst(Opcode::UnpackArgs, 0, 0, 0)); // 0
    b.emit(inst(Opcode::Int, 0, 3, 0)); // 1
    b.emit(inst(Opcode::Yield, 0, 0, 0)); // 2
    b.emit(inst(Opcode::Int, 0, 5, 0)); // 3
    b.emit(inst(Opcode::Yield, 0, 0, 0)); // 4
    b.emit(inst(Opcode::Int, 0, 9, 0)); // 5
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 6
    let gen_m = b.build();
    let gen = func_at(&gen_m, "gen35", 0, 0, 0);

    let (cons_m, off) = eq5_consumer("eq5");
    let f = func_at(&cons_m, "eq5", 1, 2, off);

    let mut t = new_thread();
    let v = expect_value(t.apply(f, vec![gen]).unwrap());
    assert_eq!(value::as_int(&v), Some(5));
    assert!(t.stack_handle().lock().is_empty());
}

#[test]
fn test_fail_up_exhausted_generator_falls_through() {
    // generator yields 3 then returns fail: no value matches, the whole
    // consumer fails through its bottom frame
    let mut b = ModuleBuilder::new("gen3");
    b.emit(inst(Opcode::UnpackArgs, 0, 0, 0)); // 0
    b.emit(inst(Opcode::Int, 0, 3, 0)); // 1
    b.emit(inst(Opcode::Yield, 0, 0, 0)); // 2
    b.emit(inst(Opcode::BuiltinLookup, builtins::BUILTIN_FAIL, 0, 0)); // 3
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 4
    let gen_m = b.build();
    let gen = func_at(&gen_m, "gen3", 0, 0, 0);

    let (cons_m, off) = eq5_consumer("eq5_b");
    let f = func_at(&cons_m, "eq5_b", 1, 2, off);

    let mut t = new_thread();
    assert!(matches!(t.apply(f, vec![gen]).unwrap(), Answer::Fail));
}

#[test]
fn test_nested_generator_pumped_through_generator() {
    // a(b) yields every value b yields: pumping a drives backtracking
    // into b, so a's snapshot carries b's suspended generator frame
    let mut b = ModuleBuilder::new("inner");
    b.emit(inst(Opcode::UnpackArgs, 0, 0, 0)); // 0
    b.emit(inst(Opcode::Int, 0, 1, 0)); // 1
    b.emit(inst(Opcode::Yield, 0, 0, 0)); // 2
    b.emit(inst(Opcode::Int, 0, 2, 0)); // 3
    b.emit(inst(Opcode::Yield, 0, 0, 0)); // 4
    b.emit(inst(Opcode::BuiltinLookup, builtins::BUILTIN_FAIL, 0, 0)); // 5
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 6
    let inner_m = b.build();
    let inner = func_at(&inner_m, "inner", 0, 0, 0);

    let mut b = ModuleBuilder::new("outer");
    b.emit(inst(Opcode::UnpackArgs, 1, 0, 0)); // 0
    let add_ff = b.emit(Instruction::branch(Opcode::AddFailureFrame, 0)); // 1
    b.emit(inst(Opcode::AddFailUpFrame, 0, 0, 0)); // 2
    b.emit(inst(Opcode::VarLookup, 0, 0, 0)); // 3
    b.emit(inst(Opcode::Apply, 0, 0, 0)); // 4: pump inner
    b.emit(inst(Opcode::Yield, 0, 0, 0)); // 5: pass the value on
    b.emit(inst(Opcode::FailNow, 0, 0, 0)); // 6: backtrack into inner
    let epi = b.emit(inst(Opcode::BuiltinLookup, builtins::BUILTIN_FAIL, 0, 0)); // 7
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 8
    b.patch_branch(add_ff, epi);
    let outer_m = b.build();
    let outer = func_at(&outer_m, "outer", 1, 1, 0);

    let mut t = new_thread();
    t.pre_apply_pump(outer, vec![inner]).unwrap();
    let v1 = expect_value(t.pump(false).unwrap());
    assert_eq!(value::as_int(&v1), Some(1));
    let v2 = expect_value(t.pump(false).unwrap());
    assert_eq!(value::as_int(&v2), Some(2));
    assert!(matches!(t.pump(false).unwrap(), Answer::Fail));
}

#[test]
fn test_operands_survive_backtracking() {
    // f(gen) { return x where x := 40 + gen() == 42 }; the literal 40 is
    // produced once, before the pumped call, and must still be there when
    // the consumer re-runs after backtracking
    let mut b = ModuleBuilder::new("addback");
    b.emit(inst(Opcode::UnpackArgs, 1, 0, 0)); // 0
    let add_ff = b.emit(Instruction::branch(Opcode::AddFailureFrame, 0)); // 1
    b.emit(inst(Opcode::AddFailUpFrame, 0, 0, 0)); // 2
    b.emit(inst(Opcode::Int, 0, 40, 0)); // 3
    b.emit(inst(Opcode::VarLookup, 0, 0, 0)); // 4
    b.emit(inst(Opcode::Apply, 0, 0, 0)); // 5
    b.emit(inst(Opcode::Add, 0, 0, 0)); // 6: 40 + yielded
    b.emit(inst(Opcode::Int, 0, 42, 0)); // 7
    b.emit(inst(Opcode::Eq, 0, 0, 0)); // 8
    b.emit(inst(Opcode::VarAssign, 0, 1, 0)); // 9
    b.emit(inst(Opcode::Pop, 0, 0, 0)); // 10
    b.emit(inst(Opcode::RemoveFailureFrame, 0, 0, 0)); // 11
    b.emit(inst(Opcode::RemoveFailureFrame, 0, 0, 0)); // 12
    b.emit(inst(Opcode::VarLookup, 0, 1, 0)); // 13
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 14
    let epi = b.emit(inst(Opcode::BuiltinLookup, builtins::BUILTIN_FAIL, 0, 0)); // 15
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 16
    b.patch_branch(add_ff, epi);
    let m = b.build();

    // generator yields 1 then 2; only 40 + 2 == 42
    let mut gb = ModuleBuilder::new("onetwo");
    gb.emit(inst(Opcode::UnpackArgs, 0, 0, 0));
    gb.emit(inst(Opcode::Int, 0, 1, 0));
    gb.emit(inst(Opcode::Yield, 0, 0, 0));
    gb.emit(inst(Opcode::Int, 0, 2, 0));
    gb.emit(inst(Opcode::Yield, 0, 0, 0));
    gb.emit(inst(Opcode::BuiltinLookup, builtins::BUILTIN_FAIL, 0, 0));
    gb.emit(inst(Opcode::Return, 0, 0, 0));
    let gen_m = gb.build();
    let gen = func_at(&gen_m, "onetwo", 0, 0, 0);

    let mut t = new_thread();
    let f = func_at(&m, "addback", 1, 2, 0);
    let v = expect_value(t.apply(f, vec![gen]).unwrap());
    assert_eq!(value::as_int(&v), Some(42));
}

// === Alternation (eyield) ===

#[test]
fn test_eyield_tries_next_alternative_inline() {
    // f() { v := (1 | 3) where v == 3; return v }
    let mut b = ModuleBuilder::new("alt");
    b.emit(inst(Opcode::UnpackArgs, 0, 0, 0)); // 0
    let bottom = b.emit(Instruction::branch(Opcode::AddFailureFrame, 0)); // 1
    b.emit(inst(Opcode::AddFailUpFrame, 0, 0, 0)); // 2
    let alt_ff = b.emit(Instruction::branch(Opcode::AddFailureFrame, 0)); // 3
    b.emit(inst(Opcode::Int, 0, 1, 0)); // 4
    b.emit(inst(Opcode::EYield, 0, 0, 0)); // 5
    let join_br = b.emit(Instruction::branch(Opcode::Branch, 0)); // 6
    let alt2 = b.emit(inst(Opcode::Int, 0, 3, 0)); // 7
    let join = b.emit(inst(Opcode::Int, 0, 3, 0)); // 8
    b.emit(inst(Opcode::Eq, 0, 0, 0)); // 9
    b.emit(inst(Opcode::VarAssign, 0, 0, 0)); // 10
    b.emit(inst(Opcode::Pop, 0, 0, 0)); // 11
    b.emit(inst(Opcode::RemoveFailureFrame, 0, 0, 0)); // 12: fail-up
    b.emit(inst(Opcode::RemoveFailureFrame, 0, 0, 0)); // 13: bottom
    b.emit(inst(Opcode::VarLookup, 0, 0, 0)); // 14
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 15
    let epi = b.emit(inst(Opcode::BuiltinLookup, builtins::BUILTIN_FAIL, 0, 0)); // 16
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 17
    b.patch_branch(bottom, epi);
    b.patch_branch(alt_ff, alt2);
    b.patch_branch(join_br, join);
    let m = b.build();

    let mut t = new_thread();
    let f = func_at(&m, "alt", 0, 1, 0);
    let v = expect_value(t.apply(f, vec![]).unwrap());
    assert_eq!(value::as_int(&v), Some(3));
}

// === Exceptions and backtraces ===

fn raiser(_t: &mut WendThread) -> Result<Answer, wend_vm::VmError> {
    Ok(Answer::Raise(exception::new("User_Exception", "boom")))
}

#[test]
fn test_backtrace_has_entry_per_activation() {
    // f1 installs a handler, calls f2, which calls f3 (native), which
    // raises; the chain has one entry per activation and control resumes
    // in f1's handler
    let mut b = ModuleBuilder::new("depth");
    // f1: params = [f2, f3]
    b.emit(inst(Opcode::UnpackArgs, 2, 0, 0)); // 0
    let add_xf = b.emit(Instruction::branch(Opcode::AddExceptionFrame, 0)); // 1
    b.emit(inst(Opcode::VarLookup, 0, 0, 0)); // 2: f2
    b.emit(inst(Opcode::VarLookup, 0, 1, 0)); // 3: f3
    b.emit(inst(Opcode::Apply, 1, 0, 0)); // 4: f2(f3)
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 5: not reached
    let handler = b.emit(inst(Opcode::Return, 0, 0, 0)); // 6: return the exception
    b.patch_branch(add_xf, handler);
    // f2: param = [f3]
    let f2_off = b.emit(inst(Opcode::UnpackArgs, 1, 0, 0)); // 7
    b.emit(inst(Opcode::VarLookup, 0, 0, 0)); // 8
    b.emit(inst(Opcode::Apply, 0, 0, 0)); // 9: f3()
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 10
    let m = b.build();

    let vm = Vm::new();
    let mut t = vm.spawn_thread();
    let f3 = vm.register_native("f3", raiser);
    let f2 = func_at(&m, "f2", 1, 1, f2_off);
    let f1 = func_at(&m, "f1", 2, 2, 0);

    let v = expect_value(t.apply(f1, vec![f2, f3]).unwrap());
    assert!(exception::is_exception(&v));
    assert_eq!(exception::name(&v).as_deref(), Some("User_Exception"));
    assert_eq!(exception::chain_len(&v), 3);
    let bt = exception::render_backtrace(&v);
    // native and bytecode frames are both represented
    assert!(bt.contains("f3 at internal"));
    assert!(bt.contains("f2 at depth:"));
    assert!(bt.ends_with("User_Exception: boom"));
    assert!(t.stack_handle().lock().is_empty());
}

#[test]
fn test_raise_with_no_handler_reaches_host() {
    // raising with no handler anywhere surfaces as Answer::Raise at the
    // host boundary (the host is the top-level handler of last resort)
    let vm = Vm::new();
    let mut t = vm.spawn_thread();
    let f3 = vm.register_native("f3", raiser);
    match t.apply(f3, vec![]).unwrap() {
        Answer::Raise(exc) => {
            assert_eq!(exception::chain_len(&exc), 1);
        }
        other => panic!("expected a raise, got {:?}", other),
    }
}

#[test]
fn test_raise_opcode_and_catch_same_function() {
    // f(exc) { try { raise exc } catch e { return e } }
    let mut b = ModuleBuilder::new("raise_catch");
    b.emit(inst(Opcode::UnpackArgs, 1, 0, 0)); // 0
    let add_xf = b.emit(Instruction::branch(Opcode::AddExceptionFrame, 0)); // 1
    b.emit(inst(Opcode::VarLookup, 0, 0, 0)); // 2
    b.emit(inst(Opcode::Raise, 0, 0, 0)); // 3
    let handler = b.emit(inst(Opcode::Return, 0, 0, 0)); // 4
    b.patch_branch(add_xf, handler);
    let m = b.build();

    let mut t = new_thread();
    let f = func_at(&m, "f", 1, 1, 0);
    let exc = exception::new("User_Exception", "direct");
    let caught = expect_value(t.apply(f, vec![exc.clone()]).unwrap());
    assert!(value::is_same(&caught, &exc));
    assert_eq!(exception::chain_len(&exc), 1);
}

#[test]
fn test_handler_resumes_with_static_frame_pointers() {
    // after catching, failure control uses the handler function's own
    // failure frame, not anything from the raise site
    let mut b = ModuleBuilder::new("static_scope");
    b.emit(inst(Opcode::UnpackArgs, 1, 0, 0)); // 0
    let add_ff = b.emit(Instruction::branch(Opcode::AddFailureFrame, 0)); // 1
    let add_xf = b.emit(Instruction::branch(Opcode::AddExceptionFrame, 0)); // 2
    b.emit(inst(Opcode::VarLookup, 0, 0, 0)); // 3
    b.emit(inst(Opcode::Apply, 0, 0, 0)); // 4: raises
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 5: not reached
    let handler = b.emit(inst(Opcode::Pop, 0, 0, 0)); // 6: discard exception
    b.emit(inst(Opcode::FailNow, 0, 0, 0)); // 7: must use our frame
    let ft = b.emit(inst(Opcode::Int, 0, 77, 0)); // 8
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 9
    b.patch_branch(add_ff, ft);
    b.patch_branch(add_xf, handler);
    let m = b.build();

    let vm = Vm::new();
    let mut t = vm.spawn_thread();
    let f3 = vm.register_native("f3", raiser);
    let f = func_at(&m, "f", 1, 1, 0);
    let v = expect_value(t.apply(f, vec![f3]).unwrap());
    assert_eq!(value::as_int(&v), Some(77));
}

// === Interrupts ===

#[test]
fn test_pending_interrupt_becomes_signal_exception() {
    let mut b = ModuleBuilder::new("spin");
    b.emit(inst(Opcode::UnpackArgs, 0, 0, 0)); // 0
    b.emit(Instruction::branch(Opcode::Branch, 0)); // 1: spin forever
    let m = b.build();

    let vm = Vm::new();
    let mut t = vm.spawn_thread();
    vm.heap.request_interrupt();
    let f = func_at(&m, "spin", 0, 0, 0);
    match t.apply(f, vec![]).unwrap() {
        Answer::Raise(exc) => {
            assert_eq!(exception::name(&exc).as_deref(), Some("Signal_Exception"));
        }
        other => panic!("expected a raise, got {:?}", other),
    }
}

// === Values, slots and pending binds through the loop ===

#[test]
fn test_pending_bind_applies_with_receiver() {
    // obj.m(10) via PreSlotLookupApply: the bound method sees the
    // receiver as its first argument without a bound-method allocation
    let mut b = ModuleBuilder::new("bind");
    let name = b.intern("m");
    // caller(obj): obj.m(10)
    b.emit(inst(Opcode::UnpackArgs, 1, 0, 0)); // 0
    b.emit(inst(Opcode::VarLookup, 0, 0, 0)); // 1
    b.emit(inst(Opcode::PreSlotLookupApply, name, 0, 0)); // 2
    b.emit(inst(Opcode::Int, 0, 10, 0)); // 3
    b.emit(inst(Opcode::Apply, 1, 0, 0)); // 4
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 5
    // m(self, x): return self.v + x
    let v_name = b.intern("v");
    let m_off = b.emit(inst(Opcode::UnpackArgs, 2, 0, 0)); // 6
    b.emit(inst(Opcode::VarLookup, 0, 0, 0)); // 7: self
    b.emit(inst(Opcode::SlotLookup, v_name, 0, 0)); // 8
    b.emit(inst(Opcode::VarLookup, 0, 1, 0)); // 9: x
    b.emit(inst(Opcode::Add, 0, 0, 0)); // 10
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 11
    let m = b.build();

    let method = value::func(Func {
        name: "m".to_string(),
        is_bound: true,
        pc: Pc::bytecode(m.clone(), m_off),
        num_params: 2,
        num_vars: 2,
        container: None,
    });
    let obj = value::int(0); // any object with slots
    obj.set_slot("v", value::int(32));
    obj.set_slot("m", method);

    let mut t = new_thread();
    let caller = func_at(&m, "caller", 1, 1, 0);
    let v = expect_value(t.apply(caller, vec![obj]).unwrap());
    assert_eq!(value::as_int(&v), Some(42));
}

#[test]
fn test_get_slot_apply_binds_receiver() {
    // the host-side convenience mirrors PreSlotLookupApply: bound slots
    // get their receiver as the first argument
    let mut b = ModuleBuilder::new("gsa");
    let v_name = b.intern("v");
    b.emit(inst(Opcode::UnpackArgs, 1, 0, 0)); // 0: self
    b.emit(inst(Opcode::VarLookup, 0, 0, 0)); // 1
    b.emit(inst(Opcode::SlotLookup, v_name, 0, 0)); // 2
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 3
    let m = b.build();

    let method = value::func(Func {
        name: "get_v".to_string(),
        is_bound: true,
        pc: Pc::bytecode(m.clone(), 0),
        num_params: 1,
        num_vars: 1,
        container: None,
    });
    let obj = value::int(0);
    obj.set_slot("v", value::int(7));
    obj.set_slot("get_v", method);

    let mut t = new_thread();
    let v = expect_value(t.get_slot_apply(&obj, "get_v", vec![]).unwrap());
    assert_eq!(value::as_int(&v), Some(7));
}

#[test]
fn test_literal_construction_and_unpack_assign() {
    // f() { x, y := [4, 5]; return x }  -- checked destructuring
    let mut b = ModuleBuilder::new("lits");
    b.emit(inst(Opcode::UnpackArgs, 0, 0, 0)); // 0
    b.emit(inst(Opcode::Int, 0, 4, 0)); // 1
    b.emit(inst(Opcode::Int, 0, 5, 0)); // 2
    b.emit(inst(Opcode::List, 2, 0, 0)); // 3
    b.emit(inst(Opcode::UnpackAssign, 2, 0, 0)); // 4
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 5: top is element 0
    let m = b.build();

    let mut t = new_thread();
    let f = func_at(&m, "f", 0, 0, 0);
    let v = expect_value(t.apply(f, vec![]).unwrap());
    assert_eq!(value::as_int(&v), Some(4));
}

#[test]
fn test_unpack_assign_length_mismatch_raises() {
    let mut b = ModuleBuilder::new("badunpack");
    b.emit(inst(Opcode::UnpackArgs, 0, 0, 0));
    b.emit(inst(Opcode::Int, 0, 4, 0));
    b.emit(inst(Opcode::List, 1, 0, 0));
    b.emit(inst(Opcode::UnpackAssign, 2, 0, 0));
    b.emit(inst(Opcode::Return, 0, 0, 0));
    let m = b.build();

    let mut t = new_thread();
    let f = func_at(&m, "f", 0, 0, 0);
    match t.apply(f, vec![]).unwrap() {
        Answer::Raise(exc) => {
            assert_eq!(exception::name(&exc).as_deref(), Some("Unpack_Exception"));
        }
        other => panic!("expected a raise, got {:?}", other),
    }
}

#[test]
fn test_too_many_parameters_raises() {
    let mut b = ModuleBuilder::new("params");
    b.emit(inst(Opcode::UnpackArgs, 1, 0, 0));
    b.emit(inst(Opcode::VarLookup, 0, 0, 0));
    b.emit(inst(Opcode::Return, 0, 0, 0));
    let m = b.build();

    let mut t = new_thread();
    let f = func_at(&m, "f", 1, 1, 0);
    match t.apply(f, vec![value::int(1), value::int(2)]).unwrap() {
        Answer::Raise(exc) => {
            assert_eq!(
                exception::name(&exc).as_deref(),
                Some("Parameters_Exception")
            );
        }
        other => panic!("expected a raise, got {:?}", other),
    }
}

#[test]
fn test_var_args_collected_into_list() {
    let mut b = ModuleBuilder::new("vargs");
    b.emit(Instruction::with_flags(Opcode::UnpackArgs, 1, 1, 0, 0)); // 1 param + vargs
    b.emit(inst(Opcode::VarLookup, 0, 1, 0)); // the vargs list
    b.emit(inst(Opcode::Return, 0, 0, 0));
    let m = b.build();

    let mut t = new_thread();
    let f = func_at(&m, "f", 1, 2, 0);
    let v = expect_value(
        t.apply(f, vec![value::int(1), value::int(2), value::int(3)])
            .unwrap(),
    );
    assert_eq!(value::list_len(&v), Some(2));
    assert_eq!(value::as_int(&value::list_get(&v, 0).unwrap()), Some(2));
    assert_eq!(value::as_int(&value::list_get(&v, 1).unwrap()), Some(3));
}

#[test]
fn test_nested_calls_return_through_trampoline() {
    // f(g) { return g() + 1 } with g() { return 41 }
    let mut b = ModuleBuilder::new("nest");
    b.emit(inst(Opcode::UnpackArgs, 1, 0, 0)); // 0
    b.emit(inst(Opcode::VarLookup, 0, 0, 0)); // 1
    b.emit(inst(Opcode::Apply, 0, 0, 0)); // 2
    b.emit(inst(Opcode::Int, 0, 1, 0)); // 3
    b.emit(inst(Opcode::Add, 0, 0, 0)); // 4
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 5
    let g_off = b.emit(inst(Opcode::UnpackArgs, 0, 0, 0)); // 6
    b.emit(inst(Opcode::Int, 0, 41, 0)); // 7
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 8
    let m = b.build();

    let mut t = new_thread();
    let g = func_at(&m, "g", 0, 0, g_off);
    let f = func_at(&m, "f", 1, 1, 0);
    let v = expect_value(t.apply(f, vec![g]).unwrap());
    assert_eq!(value::as_int(&v), Some(42));
}

#[test]
fn test_func_defn_creates_closure_over_container() {
    // f() { x := 10; g := func() { return x }; return g() }
    let mut b = ModuleBuilder::new("defn");
    let g_name = b.intern("g");
    b.emit(inst(Opcode::UnpackArgs, 0, 0, 0)); // 0
    b.emit(inst(Opcode::Int, 0, 10, 0)); // 1
    b.emit(inst(Opcode::VarAssign, 0, 0, 0)); // 2: x
    b.emit(inst(Opcode::Pop, 0, 0, 0)); // 3
    b.emit(inst(Opcode::FuncDefn, 0, 0, g_name)); // 4: body at 6
    let over = b.emit(Instruction::branch(Opcode::Branch, 0)); // 5
    b.emit(inst(Opcode::UnpackArgs, 0, 0, 0)); // 6: g body
    b.emit(inst(Opcode::VarLookup, 1, 0, 0)); // 7: x from enclosing
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 8
    let after = b.emit(inst(Opcode::Apply, 0, 0, 0)); // 9: g()
    b.emit(inst(Opcode::Return, 0, 0, 0)); // 10
    b.patch_branch(over, after);
    let m = b.build();

    let mut t = new_thread();
    let f = func_at(&m, "f", 0, 1, 0);
    let v = expect_value(t.apply(f, vec![]).unwrap());
    assert_eq!(value::as_int(&v), Some(10));
}
