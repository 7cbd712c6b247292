// quill-vm - JIT differential tests
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! The interpreter is ground truth: for the same program, JIT-enabled
//! and interpreter-only VMs must be externally indistinguishable, and
//! numeric results bit-identical. On targets without a JIT backend these
//! tests still run (everything interprets) and remain green.

use quill_vm::{Error, RuntimeError, Value, Vm, VmConfig};

fn interp() -> Vm {
    Vm::new(VmConfig {
        enable_jit: false,
        ..VmConfig::default()
    })
}

fn jitted() -> Vm {
    Vm::new(VmConfig {
        enable_jit: true,
        jit_threshold: 2, // compile almost immediately
        ..VmConfig::default()
    })
}

fn assert_same(source: &str) {
    let mut vi = interp();
    let mut vj = jitted();
    let a = vi.eval(source);
    let b = vj.eval(source);
    match (a, b) {
        (Ok(Value::Number(x)), Ok(Value::Number(y))) => {
            assert_eq!(
                x.to_bits(),
                y.to_bits(),
                "numeric divergence on:\n{}\ninterp={} jit={}",
                source,
                x,
                y
            );
        }
        // Values from different VMs can't be identity-compared; render
        // through each VM instead.
        (Ok(x), Ok(y)) => assert_eq!(
            vi.render(&x),
            vj.render(&y),
            "divergence on:\n{}",
            source
        ),
        (Err(Error::Runtime(x)), Err(Error::Runtime(y))) => {
            assert_eq!(
                std::mem::discriminant(&x),
                std::mem::discriminant(&y),
                "error divergence on:\n{}\ninterp={} jit={}",
                source,
                x,
                y
            );
        }
        (a, b) => panic!(
            "outcome divergence on:\n{}\ninterp={:?} jit={:?}",
            source, a, b
        ),
    }
}

#[test]
fn hot_arithmetic_function() {
    assert_same(
        "fn poly(x) { return 3 * x ^ 2 - 2 * x + 1 }
         let s = 0;
         for (let i = 0; i < 300; i += 1) { s = s + poly(i) }
         s",
    );
}

#[test]
fn hot_division_and_modulo() {
    assert_same(
        "fn f(a, b) { return a / b + a % b }
         let s = 0;
         for (let i = 1; i < 250; i += 1) { s = s + f(i * 7, i) }
         s",
    );
}

#[test]
fn hot_comparisons_and_branches() {
    assert_same(
        "fn clamp(x, lo, hi) {
             if x < lo { return lo }
             if x > hi { return hi }
             return x
         }
         let s = 0;
         for (let i = 0; i < 300; i += 1) { s = s + clamp(i - 150, -20, 20) }
         s",
    );
}

#[test]
fn recursive_fib_matches() {
    assert_same(
        "fn fib(n) { if n <= 1 { return n } return fib(n - 1) + fib(n - 2) }
         fib(17)",
    );
}

#[test]
fn loops_inside_the_hot_function() {
    assert_same(
        "fn sum_to(n) {
             let s = 0;
             for (let i = 0; i <= n; i += 1) { s += i }
             return s
         }
         let total = 0;
         for (let k = 0; k < 120; k += 1) { total = total + sum_to(k) }
         total",
    );
}

#[test]
fn float_edge_values_are_bit_identical() {
    assert_same(
        "fn f(x) { return x * 1e308 + x / 3 }
         let s = 0;
         for (let i = 0; i < 200; i += 1) { s = f(0.1) }
         s",
    );
    // 0/0-free NaN propagation through multiplication overflow.
    assert_same(
        "fn f(x) { return x * x }
         let s = 0;
         for (let i = 0; i < 200; i += 1) { s = f(1e200) - f(1e200) }
         s == s", // NaN != NaN in both engines
    );
}

#[test]
fn deopt_on_non_numeric_arguments_is_transparent() {
    // Heat the function with numbers, then call it with strings: the
    // entry guard fails and the interpreter takes over mid-flight with
    // identical results.
    assert_same(
        "fn add(a, b) { return a + b }
         let s = 0;
         for (let i = 0; i < 200; i += 1) { s = s + add(i, 1) }
         add(\"de\", \"opt\")",
    );
}

#[test]
fn division_by_zero_inside_hot_code() {
    assert_same(
        "fn f(a, b) { return a / b }
         let s = 0;
         for (let i = 1; i < 200; i += 1) { s = s + f(i, i) }
         f(1, 0)",
    );
}

#[test]
fn type_errors_inside_hot_code() {
    assert_same(
        "fn f(a, b) { return a - b }
         let s = 0;
         for (let i = 0; i < 200; i += 1) { s = s + f(i, 1) }
         f(nil, 1)",
    );
}

#[test]
fn hot_table_field_access_uses_caches_transparently() {
    // The table arrives through a global, so the function's arguments
    // stay numeric and the compiled body drives its inline caches.
    assert_same(
        "let point = {x: 3, y: 4};
         fn dot(n) { return (point.x * point.x + point.y * point.y) * n }
         let s = 0;
         for (let i = 0; i < 300; i += 1) { s = s + dot(i) }
         s",
    );
}

#[test]
fn cache_invalidation_on_table_mutation() {
    assert_same(
        "let p = {x: 1};
         fn get(n) { return p.x + n }
         let s = 0;
         for (let i = 0; i < 300; i += 1) { s = s + get(0) }
         p.y = 2; // structural change invalidates the cached slot
         p.x = 10;
         s + get(0)",
    );
}

#[test]
fn table_valued_arguments_deopt_every_call() {
    // Functions called with table arguments fail the numeric entry
    // guard and fall back to interpretation — transparently.
    assert_same(
        "let point = {x: 3, y: 4};
         fn dot(p) { return p.x * p.x + p.y * p.y }
         let s = 0;
         for (let i = 0; i < 300; i += 1) { s = s + dot(point) }
         s",
    );
}

#[test]
fn hot_function_writing_globals() {
    assert_same(
        "let counter = 0;
         fn bump() { counter = counter + 1; return counter }
         let last = 0;
         for (let i = 0; i < 250; i += 1) { last = bump() }
         last + counter",
    );
}

#[test]
fn jitted_code_calls_natives() {
    fn triple(_vm: &mut Vm, args: &[Value]) -> quill_vm::Result<Value> {
        match args.first() {
            Some(Value::Number(n)) => Ok(Value::Number(n * 3.0)),
            _ => Err(RuntimeError::TypeError {
                expected: "number".into(),
                got: "other".into(),
            }),
        }
    }

    let source = "fn f(x) { return triple(x) + 1 }
                  let s = 0;
                  for (let i = 0; i < 250; i += 1) { s = s + f(i) }
                  s";

    let mut a = interp();
    a.bind_native("triple", triple);
    let mut b = jitted();
    b.bind_native("triple", triple);
    assert_eq!(a.eval(source).unwrap(), b.eval(source).unwrap());
}

#[test]
fn closure_heavy_functions_stay_interpreted_but_agree() {
    assert_same(
        "fn adder(n) { return fn(x) { return x + n } }
         let add2 = adder(2);
         let s = 0;
         for (let i = 0; i < 250; i += 1) { s = add2(s) }
         s",
    );
}

#[test]
fn string_concatenation_in_hot_code() {
    assert_same(
        "fn tag(n) { return \"#\" + n_str }
         let n_str = \"x\";
         let out = \"\";
         for (let i = 0; i < 150; i += 1) { out = tag(i) }
         out == \"#x\"",
    );
}
