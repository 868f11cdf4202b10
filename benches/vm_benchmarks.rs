//! Performance benchmarks for the avm2 VM
//!
//! Run with: cargo bench
//!
//! Measures decoding, analysis and lowering of a method, and execution
//! throughput of the interpreter against the compiled tier.

use avm2::bytecode::{decode_all, CodeBuilder, ConstantPoolData, MethodBody, MethodInfo, Opcode};
use avm2::jit::{analyze, compile};
use avm2::{StandardModel, Value, VmConfig, VmContext};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::rc::Rc;
use std::sync::Arc;

/// sum = 0; for (i = 0; i < n; i++) sum += i * 2; return sum
fn sum_loop(n: i16) -> MethodInfo {
    let mut b = CodeBuilder::new();
    let (top, test) = (b.new_label(), b.new_label());
    b.push_byte(0).set_local(1).push_byte(0).set_local(2).jump(test);
    b.bind(top).op(Opcode::Label);
    b.get_local(2).get_local(1).push_byte(2).op(Opcode::Multiply).op(Opcode::Add);
    b.set_local(2);
    b.get_local(1).op(Opcode::IncrementI).set_local(1);
    b.bind(test).get_local(1).push_short(n).branch(Opcode::IfLt, top);
    b.get_local(2).op(Opcode::ReturnValue);
    let code = b.finish().expect("benchmark program assembles");
    MethodInfo::new("sum_loop", MethodBody::new(code, 3, 3))
}

fn vm_for(method: MethodInfo, config: VmConfig) -> VmContext {
    VmContext::builder()
        .pool(Arc::new(ConstantPoolData::new()))
        .method(method)
        .model(Rc::new(StandardModel::new()))
        .config(config)
        .build()
        .expect("benchmark vm builds")
}

/// Benchmark: front end passes over one method
fn bench_front_end(c: &mut Criterion) {
    let method = sum_loop(1000);
    let pool = ConstantPoolData::new();
    let mut group = c.benchmark_group("front_end");

    group.bench_function("decode", |b| {
        b.iter(|| decode_all(black_box(&method.body.code)).unwrap())
    });
    group.bench_function("analyze", |b| b.iter(|| analyze(black_box(&method)).unwrap()));
    group.bench_function("compile", |b| {
        b.iter(|| compile(black_box(&method), &pool).unwrap())
    });

    group.finish();
}

/// Benchmark: loop execution in each tier
fn bench_execution(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute");

    for iterations in [100i16, 1000, 10000] {
        group.throughput(Throughput::Elements(iterations as u64));
        for (tier, config) in [
            ("interpreter", VmConfig::interpreter_only()),
            ("compiled", VmConfig::jit_always()),
        ] {
            let vm = vm_for(sum_loop(iterations), config);
            group.bench_with_input(BenchmarkId::new(tier, iterations), &vm, |b, vm| {
                b.iter(|| vm.invoke(0, Value::Null, Vec::new()).unwrap())
            });
        }
    }

    group.finish();
}

/// Benchmark: per-call overhead of entering a method
fn bench_invoke(c: &mut Criterion) {
    let mut b = CodeBuilder::new();
    b.get_local(1).op(Opcode::ReturnValue);
    let code = b.finish().expect("benchmark program assembles");
    let identity = MethodInfo::new("identity", MethodBody::new(code, 1, 2))
        .with_params(vec![avm2::bytecode::ParamType::Int]);

    let mut group = c.benchmark_group("invoke");
    for (tier, config) in [
        ("interpreter", VmConfig::interpreter_only()),
        ("compiled", VmConfig::jit_always()),
    ] {
        let vm = vm_for(identity.clone(), config);
        group.bench_function(tier, |b| {
            b.iter(|| vm.invoke(0, Value::Null, vec![Value::from(black_box(7))]).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_front_end, bench_execution, bench_invoke);
criterion_main!(benches);
