//! Native call dispatch benchmarks
//!
//! Measures marshalling overhead for plain calls, callback round trips
//! and struct field access.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gir_bridge::{
    Callback, CallbackScope, FfiType, NativeCall, Ownership, Record, Runtime, RuntimeConfig,
    StructLayout, Trampoline, TypedArg, Value, SELF_LIBRARY,
};

fn runtime() -> Runtime {
    Runtime::start_with_config(RuntimeConfig::detached())
}

fn bench_plain_calls(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("call");

    group.bench_function("abs", |b| {
        let args = [TypedArg::new(FfiType::i32(), -42)];
        b.iter(|| rt.call(SELF_LIBRARY, "abs", black_box(&args), &FfiType::i32()))
    });

    for len in [8usize, 256, 4096].iter() {
        group.bench_with_input(BenchmarkId::new("strlen", len), len, |b, &len| {
            let args = [TypedArg::new(FfiType::string(Ownership::None), "x".repeat(len))];
            b.iter(|| rt.call(SELF_LIBRARY, "strlen", black_box(&args), &FfiType::u64()))
        });
    }

    group.bench_function("batch_10", |b| {
        let calls: Vec<NativeCall> = (0..10)
            .map(|i| NativeCall::new(SELF_LIBRARY, "abs", vec![TypedArg::new(FfiType::i32(), -i)]))
            .collect();
        b.iter(|| rt.batch_call(black_box(&calls)))
    });

    group.finish();
}

fn bench_callbacks(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("callback");

    let element = StructLayout::new("Int", [("value", FfiType::i32())]).unwrap();
    let compar = FfiType::callback(
        Trampoline::Plain,
        CallbackScope::Call,
        vec![
            FfiType::struct_ptr(element.clone(), Ownership::None),
            FfiType::struct_ptr(element, Ownership::None),
        ],
        FfiType::i32(),
    )
    .unwrap();

    for n in [4usize, 64].iter() {
        group.bench_with_input(BenchmarkId::new("qsort", n), n, |b, &n| {
            let buffer = rt.alloc(n * 4, "IntBuffer").unwrap();
            let layout = StructLayout::opaque("IntBuffer", n * 4);
            b.iter(|| {
                for i in 0..n {
                    rt.write(&buffer, &FfiType::i32(), i * 4, &Value::Int((n - i) as i64))
                        .unwrap();
                }
                // Address order is a valid total order for distinct cells
                let handler = Callback::new(|args: &[Value]| {
                    let a = args[0].as_boxed().map_or(0, |b| b.as_ptr() as usize);
                    let b = args[1].as_boxed().map_or(0, |b| b.as_ptr() as usize);
                    Ok(Value::Int(a.cmp(&b) as i64))
                });
                rt.call(
                    SELF_LIBRARY,
                    "qsort",
                    &[
                        TypedArg::new(FfiType::struct_ptr(layout.clone(), Ownership::None), buffer.clone()),
                        TypedArg::new(FfiType::u64(), n as u64),
                        TypedArg::new(FfiType::u64(), 4u64),
                        TypedArg::new(compar.clone(), handler),
                    ],
                    &FfiType::void(),
                )
            })
        });
    }

    group.finish();
}

fn bench_struct_fields(c: &mut Criterion) {
    let rt = runtime();
    let layout = StructLayout::new(
        "Rect",
        [
            ("x", FfiType::f64()),
            ("y", FfiType::f64()),
            ("width", FfiType::f64()),
            ("height", FfiType::f64()),
        ],
    )
    .unwrap();
    let field = FfiType::struct_value(layout.clone()).unwrap();
    let buffer = rt.alloc(layout.size(), "Rect").unwrap();
    let rect = Value::Record(
        Record::new()
            .with("x", 1.0)
            .with("y", 2.0)
            .with("width", 640.0)
            .with("height", 480.0),
    );

    let mut group = c.benchmark_group("struct");
    group.bench_function("write", |b| {
        b.iter(|| rt.write(&buffer, &field, 0, black_box(&rect)))
    });
    group.bench_function("read", |b| b.iter(|| rt.read(&buffer, &field, 0)));
    group.finish();
}

criterion_group!(benches, bench_plain_calls, bench_callbacks, bench_struct_fields);
criterion_main!(benches);
