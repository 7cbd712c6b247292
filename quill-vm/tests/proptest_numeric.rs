// quill-vm - Property tests: interpreter vs JIT numeric agreement
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Random well-typed numeric functions must produce bit-identical
//! results whether interpreted or JIT-compiled.

use proptest::prelude::*;

use quill_vm::{Value, Vm, VmConfig};

/// A tiny expression tree over the three parameters and literals,
/// restricted to total operations (no division, so no error paths).
#[derive(Debug, Clone)]
enum Expr {
    Param(u8),
    Lit(f64),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn render(&self) -> String {
        match self {
            Expr::Param(0) => "a".into(),
            Expr::Param(1) => "b".into(),
            Expr::Param(_) => "c".into(),
            Expr::Lit(n) => format!("({:?})", n),
            Expr::Add(l, r) => format!("({} + {})", l.render(), r.render()),
            Expr::Sub(l, r) => format!("({} - {})", l.render(), r.render()),
            Expr::Mul(l, r) => format!("({} * {})", l.render(), r.render()),
        }
    }
}

fn expr_strategy() -> impl Strategy<Value = Expr> {
    let leaf = prop_oneof![
        (0u8..3).prop_map(Expr::Param),
        (-1000.0f64..1000.0).prop_map(Expr::Lit),
    ];
    leaf.prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone())
                .prop_map(|(l, r)| Expr::Add(Box::new(l), Box::new(r))),
            (inner.clone(), inner.clone())
                .prop_map(|(l, r)| Expr::Sub(Box::new(l), Box::new(r))),
            (inner.clone(), inner)
                .prop_map(|(l, r)| Expr::Mul(Box::new(l), Box::new(r))),
        ]
    })
}

fn eval_number(vm: &mut Vm, source: &str) -> u64 {
    match vm.eval(source).expect("eval error") {
        Value::Number(n) => n.to_bits(),
        other => panic!("expected number, got {:?}", other),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn interpreter_and_jit_agree_bitwise(
        expr in expr_strategy(),
        a in -100.0f64..100.0,
        b in -100.0f64..100.0,
        c in -100.0f64..100.0,
    ) {
        let source = format!(
            "fn f(a, b, c) {{ return {} }}\n\
             let r = 0;\n\
             for (let i = 0; i < 64; i += 1) {{ r = f({:?}, {:?}, {:?}) }}\n\
             r",
            expr.render(),
            a,
            b,
            c,
        );

        let mut interp = Vm::new(VmConfig { enable_jit: false, ..VmConfig::default() });
        let mut jit = Vm::new(VmConfig { enable_jit: true, jit_threshold: 2, ..VmConfig::default() });

        let x = eval_number(&mut interp, &source);
        let y = eval_number(&mut jit, &source);
        prop_assert_eq!(x, y, "divergence on source:\n{}", source);
    }

    #[test]
    fn comparisons_agree(
        a in -100.0f64..100.0,
        b in -100.0f64..100.0,
    ) {
        let source = format!(
            "fn cmp(a, b) {{ if a < b {{ return 0 - 1 }} if a > b {{ return 1 }} return 0 }}\n\
             let r = 0;\n\
             for (let i = 0; i < 64; i += 1) {{ r = cmp({:?}, {:?}) }}\n\
             r",
            a, b,
        );

        let mut interp = Vm::new(VmConfig { enable_jit: false, ..VmConfig::default() });
        let mut jit = Vm::new(VmConfig { enable_jit: true, jit_threshold: 2, ..VmConfig::default() });
        prop_assert_eq!(
            eval_number(&mut interp, &source),
            eval_number(&mut jit, &source)
        );
    }
}
