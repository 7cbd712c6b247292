// quill-embed - Embedding API tests
// Copyright (c) 2025 Quill contributors. MIT licensed.

use quill_embed::{Engine, RuntimeError, Value, Vm, VmConfig};

#[test]
fn eval_and_convert() {
    let mut engine = Engine::new();
    let n: f64 = engine.eval_as("6 * 7").unwrap();
    assert_eq!(n, 42.0);
    let s: String = engine.eval_as("\"he\" + \"llo\"").unwrap();
    assert_eq!(s, "hello");
    let b: bool = engine.eval_as("1 < 2").unwrap();
    assert!(b);
    let none: Option<f64> = engine.eval_as("nil").unwrap();
    assert!(none.is_none());
}

#[test]
fn globals_round_trip_through_conversion() {
    let mut engine = Engine::new();
    engine.set("speed", 12.5);
    engine.set("name", "player");
    engine.set("alive", true);

    assert_eq!(engine.get_as::<f64>("speed"), Some(12.5));
    assert_eq!(engine.get_as::<String>("name"), Some("player".to_string()));
    assert_eq!(engine.get_as::<bool>("alive"), Some(true));
    assert!(engine.has("speed"));
    assert!(!engine.has("missing"));

    // Scripts see host-set globals and vice versa.
    let doubled: f64 = engine.eval_as("speed * 2").unwrap();
    assert_eq!(doubled, 25.0);
    engine.eval("let computed = speed + 0.5").unwrap();
    assert_eq!(engine.get_as::<f64>("computed"), Some(13.0));
}

#[test]
fn call_script_functions_from_rust() {
    let mut engine = Engine::new();
    engine.eval("fn area(w, h) { return w * h }").unwrap();
    let result = engine
        .call("area", &[Value::Number(3.0), Value::Number(4.0)])
        .unwrap();
    assert_eq!(result, Value::Number(12.0));
}

#[test]
fn native_functions_round_trip() {
    fn hypot(_vm: &mut Vm, args: &[Value]) -> quill_vm::Result<Value> {
        match (args.first(), args.get(1)) {
            (Some(Value::Number(a)), Some(Value::Number(b))) => {
                Ok(Value::Number((a * a + b * b).sqrt()))
            }
            _ => Err(RuntimeError::TypeError {
                expected: "two numbers".into(),
                got: "something else".into(),
            }),
        }
    }

    let mut engine = Engine::new();
    engine.register_native("hypot", hypot);
    let n: f64 = engine.eval_as("hypot(3, 4)").unwrap();
    assert_eq!(n, 5.0);
}

#[test]
fn compile_once_run_many() {
    let mut engine = Engine::new();
    engine.set("ticks", 0.0);
    let step = engine.compile("ticks = ticks + 1", "step").unwrap();
    for _ in 0..5 {
        engine.run(&step).unwrap();
    }
    assert_eq!(engine.get_as::<f64>("ticks"), Some(5.0));
}

#[test]
fn reset_recovers_from_runtime_errors() {
    let mut engine = Engine::new();
    assert!(engine.eval("1 / 0").is_err());
    engine.reset();
    assert_eq!(engine.eval_as::<f64>("1 + 1").unwrap(), 2.0);
}

#[test]
fn save_and_load_state_round_trips_globals() {
    let mut engine = Engine::new();
    engine
        .eval(
            "let score = 100;
             let label = \"level-1\";
             let flags = {hard: true, seen: nil};
             let nested = {pos: {x: 1.5, y: 2.5}}",
        )
        .unwrap();

    let saved = engine.save_state().unwrap();

    // A fresh engine — as after a host module reload.
    let mut reloaded = Engine::new();
    reloaded.load_state(&saved).unwrap();

    assert_eq!(reloaded.get_as::<f64>("score"), Some(100.0));
    assert_eq!(reloaded.get_as::<String>("label"), Some("level-1".to_string()));
    assert_eq!(reloaded.eval_as::<bool>("flags.hard").unwrap(), true);
    assert_eq!(reloaded.eval_as::<f64>("nested.pos.y").unwrap(), 2.5);
}

#[test]
fn save_state_skips_functions_and_keeps_data() {
    let mut engine = Engine::new();
    engine.eval("fn helper() { return 1 } let kept = 7").unwrap();
    let saved = engine.save_state().unwrap();

    let mut reloaded = Engine::new();
    reloaded.load_state(&saved).unwrap();
    assert_eq!(reloaded.get_as::<f64>("kept"), Some(7.0));
    // The function did not survive, by design.
    assert!(!reloaded.has("helper"));
}

#[test]
fn engine_with_custom_config() {
    let mut engine = Engine::with_config(VmConfig {
        frame_stack_size: 8,
        enable_jit: false,
        ..VmConfig::default()
    });
    let err = engine
        .eval("fn deep(n) { if n == 0 { return 0 } return deep(n - 1) } deep(100)")
        .unwrap_err();
    assert!(matches!(
        err,
        quill_embed::Error::Runtime(RuntimeError::FrameStackOverflow)
    ));
}

#[test]
fn coroutines_through_the_engine() {
    let mut engine = Engine::new();
    engine.eval("fn gen() { yield 1; yield 2; return 3 }").unwrap();
    let gen = engine.get("gen");
    let coro = engine.create_coroutine(gen).unwrap();
    engine.set("co", coro.clone());

    assert_eq!(engine.resume(&coro, ()).unwrap(), Value::Number(1.0));
    assert_eq!(engine.resume(&coro, ()).unwrap(), Value::Number(2.0));
    assert_eq!(engine.resume(&coro, ()).unwrap(), Value::Number(3.0));
    assert_eq!(
        engine.coroutine_status(&coro),
        Some(quill_embed::CoroutineStatus::Dead)
    );
}

#[test]
fn gc_stats_are_exposed() {
    let mut engine = Engine::new();
    engine.eval("let t = {a: 1}").unwrap();
    engine.collect_garbage();
    assert!(engine.gc_stats().live_objects > 0);
}
