// quill-vm - Language behaviour tests
// Copyright (c) 2025 Quill contributors. MIT licensed.

use quill_vm::{Value, Vm, VmConfig};

fn vm() -> Vm {
    // Interpreter-only; JIT behaviour is covered by the differential
    // suite.
    Vm::new(VmConfig {
        enable_jit: false,
        ..VmConfig::default()
    })
}

fn eval(source: &str) -> Value {
    vm().eval(source).expect("eval error")
}

fn eval_str(source: &str) -> String {
    let mut vm = vm();
    let value = vm.eval(source).expect("eval error");
    vm.render(&value)
}

#[test]
fn literals() {
    assert_eq!(eval("42"), Value::Number(42.0));
    assert_eq!(eval("3.14"), Value::Number(3.14));
    assert_eq!(eval("1e3"), Value::Number(1000.0));
    assert_eq!(eval("true"), Value::Bool(true));
    assert_eq!(eval("false"), Value::Bool(false));
    assert_eq!(eval("nil"), Value::Nil);
    assert_eq!(eval_str("\"hello\""), "hello");
}

#[test]
fn arithmetic() {
    assert_eq!(eval("1 + 2 * 3"), Value::Number(7.0));
    assert_eq!(eval("(1 + 2) * 3"), Value::Number(9.0));
    assert_eq!(eval("10 / 4"), Value::Number(2.5));
    assert_eq!(eval("10 % 3"), Value::Number(1.0));
    assert_eq!(eval("2 ^ 10"), Value::Number(1024.0));
    assert_eq!(eval("2 ^ 3 ^ 2"), Value::Number(512.0)); // right assoc
    assert_eq!(eval("-(3 + 4)"), Value::Number(-7.0));
}

#[test]
fn comparison_and_equality() {
    assert_eq!(eval("1 < 2"), Value::Bool(true));
    assert_eq!(eval("2 <= 2"), Value::Bool(true));
    assert_eq!(eval("3 > 4"), Value::Bool(false));
    assert_eq!(eval("1 == 1"), Value::Bool(true));
    assert_eq!(eval("1 != 2"), Value::Bool(true));
    // Different types are never equal.
    assert_eq!(eval("1 == \"1\""), Value::Bool(false));
    assert_eq!(eval("nil == false"), Value::Bool(false));
}

#[test]
fn logic_short_circuits() {
    assert_eq!(eval("true && 2"), Value::Number(2.0));
    assert_eq!(eval("false && undefined_global()"), Value::Bool(false));
    assert_eq!(eval("nil || 5"), Value::Number(5.0));
    assert_eq!(eval("1 || undefined_global()"), Value::Number(1.0));
    assert_eq!(eval("!nil"), Value::Bool(true));
    assert_eq!(eval("!0"), Value::Bool(false)); // zero is truthy
}

#[test]
fn globals_and_locals() {
    assert_eq!(eval("let x = 10; x + 1"), Value::Number(11.0));
    assert_eq!(eval("let x = 1; { let x = 2; } x"), Value::Number(1.0));
    assert_eq!(eval("let x = 1; x = 3; x"), Value::Number(3.0));
    // Missing globals read as nil.
    assert_eq!(eval("missing"), Value::Nil);
}

#[test]
fn compound_assignment() {
    assert_eq!(eval("let x = 1; x += 2; x"), Value::Number(3.0));
    assert_eq!(eval("let x = 8; x /= 2; x"), Value::Number(4.0));
    assert_eq!(
        eval("let t = {n: 5}; t.n *= 3; t.n"),
        Value::Number(15.0)
    );
}

#[test]
fn if_else() {
    assert_eq!(eval("let x = 0; if true { x = 1 } x"), Value::Number(1.0));
    assert_eq!(
        eval("let x = 0; if false { x = 1 } else { x = 2 } x"),
        Value::Number(2.0)
    );
    assert_eq!(
        eval("let x = 0; if (x == 0) { x = 5 } x"),
        Value::Number(5.0)
    );
}

#[test]
fn while_loop() {
    assert_eq!(
        eval("let i = 0; let s = 0; while i < 5 { s += i; i += 1 } s"),
        Value::Number(10.0)
    );
}

#[test]
fn for_loop() {
    assert_eq!(
        eval("let s = 0; for (let i = 0; i < 10; i += 1) { s += i } s"),
        Value::Number(45.0)
    );
}

#[test]
fn break_and_continue() {
    assert_eq!(
        eval("let i = 0; while true { i += 1; if i == 7 { break } } i"),
        Value::Number(7.0)
    );
    // Continue in a for-loop must still run the increment.
    assert_eq!(
        eval(
            "let s = 0;
             for (let i = 0; i < 10; i += 1) {
                 if i % 2 == 0 { continue }
                 s += i
             }
             s"
        ),
        Value::Number(25.0)
    );
    // Break resolves to the innermost loop.
    assert_eq!(
        eval(
            "let n = 0;
             for (let i = 0; i < 3; i += 1) {
                 while true { break }
                 n += 1
             }
             n"
        ),
        Value::Number(3.0)
    );
}

#[test]
fn functions_and_calls() {
    assert_eq!(
        eval("fn add(a, b) { return a + b } add(2, 3)"),
        Value::Number(5.0)
    );
    assert_eq!(eval("let f = fn(x) { return x * 2 }; f(21)"), Value::Number(42.0));
    // A function body without a return yields nil.
    assert_eq!(eval("fn noop() { } noop()"), Value::Nil);
}

#[test]
fn fib_scenarios() {
    let src = "fn fib(n) { if n <= 1 { return n } return fib(n - 1) + fib(n - 2) }";
    assert_eq!(
        eval(&format!("{} fib(10)", src)),
        Value::Number(55.0)
    );
    assert_eq!(
        eval(&format!("{} fib(20)", src)),
        Value::Number(6765.0)
    );
}

#[test]
fn table_literals_and_fields() {
    assert_eq!(eval("let t = {x: 1, y: 2}; t.x + t.y"), Value::Number(3.0));
    assert_eq!(
        eval("let t = {x: 1, y: 2}; t.x = t.x + t.y; t.x"),
        Value::Number(3.0)
    );
    assert_eq!(eval("let t = {}; t.a = 7; t[\"a\"]"), Value::Number(7.0));
    assert_eq!(
        eval("let t = {[\"k\" + \"ey\"]: 9}; t.key"),
        Value::Number(9.0)
    );
    // Absent fields read as nil.
    assert_eq!(eval("let t = {}; t.missing"), Value::Nil);
}

#[test]
fn nested_tables() {
    assert_eq!(
        eval("let t = {inner: {value: 10}}; t.inner.value"),
        Value::Number(10.0)
    );
    assert_eq!(
        eval("let t = {inner: {}}; t.inner.x = 4; t.inner.x"),
        Value::Number(4.0)
    );
}

#[test]
fn string_concatenation_interns() {
    assert_eq!(eval_str("\"a\" + \"b\" + \"c\""), "abc");
    // Two independently constructed instances are pointer-identical,
    // which is exactly what == observes.
    assert_eq!(eval("(\"a\" + \"b\" + \"c\") == \"abc\""), Value::Bool(true));
    assert_eq!(
        eval("let x = \"ab\" + \"c\"; let y = \"a\" + \"bc\"; x == y"),
        Value::Bool(true)
    );
}

#[test]
fn assignment_is_an_expression() {
    assert_eq!(eval("let x = 0; let y = (x = 5); y"), Value::Number(5.0));
}

#[test]
fn natives_receive_arguments_and_return_one_value() {
    fn sum(_vm: &mut Vm, args: &[Value]) -> quill_vm::Result<Value> {
        let mut total = 0.0;
        for arg in args {
            if let Value::Number(n) = arg {
                total += n;
            }
        }
        Ok(Value::Number(total))
    }

    let mut vm = vm();
    vm.bind_native("sum", sum);
    assert_eq!(vm.eval("sum(1, 2, 3)").unwrap(), Value::Number(6.0));
}

#[test]
fn native_can_reenter_the_vm() {
    fn call_twice(vm: &mut Vm, args: &[Value]) -> quill_vm::Result<Value> {
        let f = args[0].clone();
        let first = vm.call(f.clone(), &[Value::Number(1.0)])?;
        let second = vm.call(f, &[Value::Number(2.0)])?;
        match (first, second) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            _ => Ok(Value::Nil),
        }
    }

    let mut vm = vm();
    vm.bind_native("call_twice", call_twice);
    assert_eq!(
        vm.eval("call_twice(fn(x) { return x * 10 })").unwrap(),
        Value::Number(30.0)
    );
}

#[test]
fn run_can_be_repeated_on_one_compiled_function() {
    let mut vm = vm();
    let function = vm.compile("let c = c + 1; c", "<test>").unwrap();
    vm.set_global("c", Value::Number(0.0));
    assert_eq!(vm.run(&function).unwrap(), Value::Number(1.0));
    assert_eq!(vm.run(&function).unwrap(), Value::Number(2.0));
    assert_eq!(vm.run(&function).unwrap(), Value::Number(3.0));
}
