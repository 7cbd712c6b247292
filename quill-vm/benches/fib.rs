// quill-vm - fib benchmark: interpreter vs JIT
// Copyright (c) 2025 Quill contributors. MIT licensed.

use criterion::{criterion_group, criterion_main, Criterion};

use quill_vm::{Vm, VmConfig};

const FIB: &str = "fn fib(n) { if n <= 1 { return n } return fib(n - 1) + fib(n - 2) } fib(18)";

fn bench_fib(c: &mut Criterion) {
    c.bench_function("fib18_interp", |b| {
        b.iter(|| {
            let mut vm = Vm::new(VmConfig {
                enable_jit: false,
                ..VmConfig::default()
            });
            vm.eval(FIB).unwrap()
        })
    });

    c.bench_function("fib18_jit", |b| {
        b.iter(|| {
            let mut vm = Vm::new(VmConfig {
                enable_jit: true,
                jit_threshold: 2,
                ..VmConfig::default()
            });
            vm.eval(FIB).unwrap()
        })
    });
}

criterion_group!(benches, bench_fib);
criterion_main!(benches);
