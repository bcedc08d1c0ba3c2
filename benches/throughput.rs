//! Throughput benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use tcf_expect::core::poll::PollState;
use tcf_expect::{Pattern, SimulatedConsole, Target, WaitContext};
use tokio_util::sync::CancellationToken;

fn window() -> Vec<u8> {
    let line = b"[  12.345678] usb 1-1: new high-speed USB device number 2 using xhci_hcd\n";
    let mut data: Vec<u8> = line.iter().copied().cycle().take(64 * 1024).collect();
    data.extend_from_slice(b"Welcome to Linux\nqemu0 login: ");
    data
}

fn pattern_benchmark(c: &mut Criterion) {
    let data = window();

    let mut group = c.benchmark_group("pattern");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("literal_find", |b| {
        let pattern = Pattern::literal("login: ");
        b.iter(|| black_box(pattern.find(black_box(&data))));
    });

    group.bench_function("regex_find", |b| {
        let pattern = Pattern::regex(r"(?P<host>[a-z0-9]+) login: ").unwrap();
        b.iter(|| black_box(pattern.find(black_box(&data))));
    });

    group.finish();
}

fn poll_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let chunk = vec![b'x'; 4096];

    let sim = Arc::new(SimulatedConsole::new(&["serial0"]));
    let target = Arc::new(Target::new("target", "bench", "serial0", sim.clone()));
    let state = Arc::new(PollState::new(target, "serial0", dir.path()));
    let ctx = WaitContext::new("bench", CancellationToken::new());

    let mut group = c.benchmark_group("poll");
    group.throughput(Throughput::Bytes(chunk.len() as u64));

    group.bench_function("append_4k", |b| {
        b.to_async(&rt).iter(|| {
            sim.emit("serial0", &chunk);
            let state = state.clone();
            let ctx = ctx.clone();
            async move { black_box(state.poll(&ctx, 0).await.unwrap()) }
        });
    });

    group.bench_function("read_range_4k", |b| {
        let len = state.captured_len();
        b.iter(|| black_box(state.read_range(len.saturating_sub(4096), len).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, pattern_benchmark, poll_benchmark);
criterion_main!(benches);
