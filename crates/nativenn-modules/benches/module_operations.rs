//! Benchmarks for module operations on the reference engine
//!
//! Run with: cargo bench -p nativenn-modules

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nativenn_core::prelude::*;
use nativenn_core::testing::reference_engine;
use nativenn_modules::prelude::*;
use nativenn_modules::functional;

fn benchmark_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("construction");
    let (_native, engine) = reference_engine();

    for &channels in &[4i64, 16, 64] {
        group.bench_with_input(BenchmarkId::new("conv2d", channels), &channels, |b, &channels| {
            b.iter(|| Conv2dConfig::new(channels, channels, 3).build(black_box(&engine)).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("batch_norm2d", channels), &channels, |b, &channels| {
            b.iter(|| BatchNorm2d::new(black_box(&engine), NormConfig::new(channels)).unwrap());
        });
    }

    group.finish();
}

fn benchmark_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward");
    let (_native, engine) = reference_engine();

    for &size in &[8i64, 32, 64] {
        let conv = Conv2dConfig::new(3, 8, 3).padding(1).build(&engine).unwrap();
        let input = Tensor::zeros(&engine, &[1, 3, size, size], TensorOptions::default()).unwrap();
        group.bench_with_input(BenchmarkId::new("conv2d", size), &size, |b, _| {
            b.iter(|| conv.forward(black_box(&input)).unwrap());
        });

        let weight = conv.weight().unwrap().unwrap();
        let options = ConvOptions::default().padding(1);
        group.bench_with_input(BenchmarkId::new("functional_conv2d", size), &size, |b, _| {
            b.iter(|| functional::conv2d(black_box(&input), &weight, None, &options).unwrap());
        });

        let ln = LayerNormConfig::new(vec![size, size]).build(&engine).unwrap();
        group.bench_with_input(BenchmarkId::new("layer_norm", size), &size, |b, _| {
            b.iter(|| ln.forward(black_box(&input)).unwrap());
        });
    }

    group.finish();
}

fn benchmark_accessors(c: &mut Criterion) {
    let mut group = c.benchmark_group("accessors");
    let (_native, engine) = reference_engine();
    let bn = BatchNorm1d::new(&engine, NormConfig::new(16)).unwrap();
    let mean = Tensor::zeros(&engine, &[16], TensorOptions::default()).unwrap();

    group.bench_function("get_running_mean", |b| {
        b.iter(|| bn.running_mean().unwrap());
    });

    group.bench_function("set_running_mean", |b| {
        b.iter(|| bn.set_running_mean(Some(black_box(&mean))).unwrap());
    });

    group.bench_function("named_parameters", |b| {
        b.iter(|| bn.named_parameters());
    });

    group.finish();
}

fn benchmark_migration(c: &mut Criterion) {
    let mut group = c.benchmark_group("migration");
    let (_native, engine) = reference_engine();

    for &(name, device) in &[("native", Device::cuda(0)), ("manual", Device::directml(0))] {
        let conv = Conv2dConfig::new(16, 16, 3).build(&engine).unwrap();
        group.bench_with_input(BenchmarkId::new("round_trip", name), &device, |b, &device| {
            b.iter(|| {
                conv.to_device(black_box(device)).unwrap();
                conv.to_device(Device::CPU).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_construction,
    benchmark_forward,
    benchmark_accessors,
    benchmark_migration
);
criterion_main!(benches);
