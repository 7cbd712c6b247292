// quill-vm - Coroutine tests
// Copyright (c) 2025 Quill contributors. MIT licensed.

use quill_vm::{CoroutineStatus, Error, RuntimeError, Value, Vm, VmConfig};

fn vm() -> Vm {
    Vm::new(VmConfig {
        enable_jit: false,
        ..VmConfig::default()
    })
}

#[test]
fn resume_collects_yields_then_return() {
    let mut vm = vm();
    vm.eval("fn gen() { yield 1; yield 2; return 3 }").unwrap();
    let gen = vm.get_global("gen");
    let coro = vm.create_coroutine(gen).unwrap();
    vm.set_global("co", coro.clone());

    assert_eq!(vm.coroutine_status(&coro), Some(CoroutineStatus::Suspended));
    assert_eq!(vm.resume(&coro, Value::Nil).unwrap(), Value::Number(1.0));
    assert_eq!(vm.coroutine_status(&coro), Some(CoroutineStatus::Suspended));
    assert_eq!(vm.resume(&coro, Value::Nil).unwrap(), Value::Number(2.0));
    assert_eq!(vm.resume(&coro, Value::Nil).unwrap(), Value::Number(3.0));
    assert_eq!(vm.coroutine_status(&coro), Some(CoroutineStatus::Dead));
}

#[test]
fn resuming_a_dead_coroutine_is_an_error() {
    let mut vm = vm();
    vm.eval("fn gen() { return 1 }").unwrap();
    let gen = vm.get_global("gen");
    let coro = vm.create_coroutine(gen).unwrap();
    vm.set_global("co", coro.clone());

    assert_eq!(vm.resume(&coro, Value::Nil).unwrap(), Value::Number(1.0));
    let err = vm.resume(&coro, Value::Nil).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::NotResumable(CoroutineStatus::Dead)
    ));
}

#[test]
fn first_resume_argument_becomes_the_parameter() {
    let mut vm = vm();
    vm.eval("fn gen(start) { yield start; return start + 1 }").unwrap();
    let gen = vm.get_global("gen");
    let coro = vm.create_coroutine(gen).unwrap();
    vm.set_global("co", coro.clone());

    assert_eq!(
        vm.resume(&coro, Value::Number(10.0)).unwrap(),
        Value::Number(10.0)
    );
    assert_eq!(vm.resume(&coro, Value::Nil).unwrap(), Value::Number(11.0));
}

#[test]
fn later_resume_arguments_become_yield_results() {
    let mut vm = vm();
    vm.eval("fn echo() { let got = yield nil; return got * 2 }").unwrap();
    let gen = vm.get_global("echo");
    let coro = vm.create_coroutine(gen).unwrap();
    vm.set_global("co", coro.clone());

    assert_eq!(vm.resume(&coro, Value::Nil).unwrap(), Value::Nil);
    assert_eq!(
        vm.resume(&coro, Value::Number(21.0)).unwrap(),
        Value::Number(42.0)
    );
}

#[test]
fn scripts_resume_by_calling_the_coroutine_value() {
    let mut vm = vm();
    vm.eval("fn gen() { yield 1; yield 2; return 3 }").unwrap();
    let gen = vm.get_global("gen");
    let coro = vm.create_coroutine(gen).unwrap();
    vm.set_global("co", coro);

    assert_eq!(
        vm.eval("co(nil) + co(nil) + co(nil)").unwrap(),
        Value::Number(6.0)
    );
}

#[test]
fn yield_outside_a_coroutine_is_an_error() {
    let mut vm = vm();
    let err = vm.eval("yield 1").unwrap_err();
    assert!(matches!(
        err,
        Error::Runtime(RuntimeError::YieldOutsideCoroutine)
    ));
}

#[test]
fn coroutine_keeps_its_own_stack_across_suspensions() {
    let mut vm = vm();
    vm.eval(
        "fn accumulate() {
             let total = 0;
             total = total + (yield total);
             total = total + (yield total);
             return total
         }",
    )
    .unwrap();
    let f = vm.get_global("accumulate");
    let coro = vm.create_coroutine(f).unwrap();
    vm.set_global("co", coro.clone());

    assert_eq!(vm.resume(&coro, Value::Nil).unwrap(), Value::Number(0.0));
    assert_eq!(
        vm.resume(&coro, Value::Number(5.0)).unwrap(),
        Value::Number(5.0)
    );
    assert_eq!(
        vm.resume(&coro, Value::Number(7.0)).unwrap(),
        Value::Number(12.0)
    );
    assert_eq!(vm.coroutine_status(&coro), Some(CoroutineStatus::Dead));
}

#[test]
fn coroutines_interleave_with_main_execution() {
    let mut vm = vm();
    vm.eval("fn gen() { yield 10; yield 20; return 30 }").unwrap();
    let gen = vm.get_global("gen");
    let coro = vm.create_coroutine(gen).unwrap();
    vm.set_global("co", coro);

    // Resumes interleave with ordinary evaluation on the main state.
    assert_eq!(vm.eval("let a = co(nil)").unwrap(), Value::Nil);
    assert_eq!(vm.eval("100 + 1").unwrap(), Value::Number(101.0));
    assert_eq!(vm.eval("a + co(nil)").unwrap(), Value::Number(30.0));
}

#[test]
fn create_coroutine_rejects_non_functions() {
    let mut vm = vm();
    assert!(matches!(
        vm.create_coroutine(Value::Number(1.0)),
        Err(RuntimeError::TypeError { .. })
    ));
}

#[test]
fn two_coroutines_run_independently() {
    let mut vm = vm();
    vm.eval("fn gen(start) { yield start; return start + 1 }").unwrap();
    let gen = vm.get_global("gen");
    let a = vm.create_coroutine(gen.clone()).unwrap();
    let b = vm.create_coroutine(gen).unwrap();
    vm.set_global("ca", a.clone());
    vm.set_global("cb", b.clone());

    assert_eq!(vm.resume(&a, Value::Number(1.0)).unwrap(), Value::Number(1.0));
    assert_eq!(vm.resume(&b, Value::Number(100.0)).unwrap(), Value::Number(100.0));
    assert_eq!(vm.resume(&a, Value::Nil).unwrap(), Value::Number(2.0));
    assert_eq!(vm.resume(&b, Value::Nil).unwrap(), Value::Number(101.0));
}
