// quill-vm - Closure and upvalue tests
// Copyright (c) 2025 Quill contributors. MIT licensed.

use quill_vm::{Value, Vm, VmConfig};

fn eval(source: &str) -> Value {
    Vm::new(VmConfig {
        enable_jit: false,
        ..VmConfig::default()
    })
    .eval(source)
    .expect("eval error")
}

#[test]
fn simple_capture() {
    assert_eq!(
        eval("fn make() { let x = 42; return fn() { return x } } make()()"),
        Value::Number(42.0)
    );
}

#[test]
fn capture_sees_mutation_before_close() {
    assert_eq!(
        eval(
            "fn probe() {
                 let x = 1;
                 let get = fn() { return x };
                 x = 9;
                 return get()
             }
             probe()"
        ),
        Value::Number(9.0)
    );
}

#[test]
fn mutation_through_closure_is_visible_outside() {
    assert_eq!(
        eval(
            "fn probe() {
                 let x = 0;
                 let bump = fn() { x = x + 1 };
                 bump()
                 bump()
                 return x
             }
             probe()"
        ),
        Value::Number(2.0)
    );
}

#[test]
fn two_closures_share_one_upvalue() {
    // Both closures capture the same variable: exactly one upvalue
    // object is shared, so each sees the other's increments — including
    // after the enclosing frame has returned and the variable closed.
    assert_eq!(
        eval(
            "fn make_counter() {
                 let count = 0;
                 return {
                     inc: fn() { count = count + 1; return count },
                     get: fn() { return count },
                 }
             }
             let c = make_counter();
             c.inc();
             c.inc();
             c.get()"
        ),
        Value::Number(2.0)
    );
}

#[test]
fn closure_from_a_later_call_diverges() {
    // A closure created by a separate call captures a fresh variable.
    assert_eq!(
        eval(
            "fn make_counter() {
                 let count = 0;
                 return {
                     inc: fn() { count = count + 1; return count },
                     get: fn() { return count },
                 }
             }
             let a = make_counter();
             a.inc();
             a.inc();
             let b = make_counter();
             a.get() - b.get()"
        ),
        Value::Number(2.0)
    );
}

#[test]
fn transitive_capture_through_intermediate_function() {
    assert_eq!(
        eval(
            "fn outer() {
                 let x = 7;
                 return fn() {
                     return fn() { return x }
                 }
             }
             outer()()()"
        ),
        Value::Number(7.0)
    );
}

#[test]
fn inner_shadowing_uses_nearest_binding() {
    assert_eq!(
        eval(
            "fn outer() {
                 let x = 1;
                 let f = fn(x) { return fn() { return x } };
                 return f(42)
             }
             outer()()"
        ),
        Value::Number(42.0)
    );
}

#[test]
fn block_scope_close_keeps_sharing() {
    // The captured local's scope ends before the function returns; the
    // closed upvalue is still shared by both closures.
    assert_eq!(
        eval(
            "fn probe() {
                 let pair = nil;
                 {
                     let x = 0;
                     pair = {
                         set: fn(v) { x = v },
                         get: fn() { return x },
                     };
                 }
                 pair.set(31);
                 return pair.get()
             }
             probe()"
        ),
        Value::Number(31.0)
    );
}

#[test]
fn loop_iterations_capture_distinct_variables() {
    // Each iteration's `n` closes separately at scope exit.
    assert_eq!(
        eval(
            "let fs = {};
             for (let i = 0; i < 2; i += 1) {
                 let n = i * 10;
                 if i == 0 { fs.a = fn() { return n } }
                 if i == 1 { fs.b = fn() { return n } }
             }
             fs.a() * 100 + fs.b()"
        ),
        Value::Number(10.0)
    );
}

#[test]
fn adder_factory() {
    assert_eq!(
        eval(
            "fn adder(n) { return fn(x) { return x + n } }
             let add5 = adder(5);
             let add10 = adder(10);
             add5(1) + add10(1)"
        ),
        Value::Number(17.0)
    );
}

#[test]
fn named_function_recurses_without_globals() {
    // The body sees its own name through reserved slot 0, so recursion
    // works even when the global binding is shadowed away.
    assert_eq!(
        eval(
            "fn count(n) { if n == 0 { return 0 } return 1 + count(n - 1) }
             let alias = count;
             count = nil;
             alias(4)"
        ),
        Value::Number(4.0)
    );
}
