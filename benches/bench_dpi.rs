// DPI Accelerator Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Benchmarks of the driver path against the simulated accelerator.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dpi_accel::regs::Status;
use dpi_accel::sim::{default_binding, SimPlatform};
use dpi_accel::state::DeviceState;
use dpi_accel::{DpiConfig, DpiDevice};

/// Benchmark submit + interrupt + retrieval for typical packet sizes.
fn bench_round_trip(c: &mut Criterion) {
    let sizes: Vec<usize> = vec![
        64,    // minimum frame
        512,   // typical request
        1500,  // Ethernet MTU
        9000,  // jumbo frame
        65535, // transfer limit
    ];

    let sim = SimPlatform::new();
    let device = DpiDevice::attach(sim.clone(), &default_binding(), DpiConfig::default())
        .expect("attach simulated device");
    let done = (Status::FILTER_DONE | Status::MATCH).bits();

    let mut group = c.benchmark_group("round_trip");

    for size in sizes {
        let payload: Vec<u8> = (0..size).map(|i| (i & 0xFF) as u8).collect();

        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("sim", size), &payload, |b, payload| {
            b.iter(|| {
                device.submit_payload(payload).unwrap();
                sim.complete_transfer(done);
                device.get_filter_result().unwrap()
            });
        });
    }

    group.finish();
}

/// Benchmark the state machine transition taken at every completion.
fn bench_evaluate(c: &mut Criterion) {
    let statuses = [
        ("match", 0x18u32),
        ("no_match", 0x10),
        ("error", 0x50),
        ("unrecognized", 0x00),
    ];

    let mut group = c.benchmark_group("evaluate");

    for (name, raw) in statuses {
        group.bench_with_input(BenchmarkId::new("status", name), &raw, |b, &raw| {
            b.iter(|| {
                let mut state = DeviceState::new();
                state.begin(dpi_accel::state::Operation::Filter);
                state.evaluate(raw)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_round_trip, bench_evaluate);
criterion_main!(benches);
