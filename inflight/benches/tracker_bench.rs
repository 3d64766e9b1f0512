// Inflight tracker benchmarks using criterion.
//
// Measures:
//   - track/untrack round trip on a warm pending set
//   - drain of an already-empty tracker

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use inflight::AckTracker;

// ---------------------------------------------------------------------------
// Track / untrack throughput
// ---------------------------------------------------------------------------

fn bench_track_untrack(c: &mut Criterion) {
    let backlogs: &[usize] = &[0, 1_024, 16_384];

    let mut group = c.benchmark_group("track_untrack");
    group.throughput(Throughput::Elements(1));
    for &backlog in backlogs {
        let tracker = AckTracker::new();
        for i in 0..backlog {
            tracker.track(format!("backlog-{i}"));
        }
        let id = String::from("hot-id");
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{backlog}pending")),
            &tracker,
            |b, t| {
                b.iter(|| {
                    t.track(id.as_str());
                    black_box(t.untrack(&id));
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Drain fast path
// ---------------------------------------------------------------------------

fn bench_drain_empty(c: &mut Criterion) {
    let tracker = AckTracker::new();
    c.bench_function("drain_empty", |b| {
        b.iter(|| {
            black_box(tracker.drain(Duration::from_millis(1))).unwrap();
        });
    });
}

criterion_group!(benches, bench_track_untrack, bench_drain_empty);
criterion_main!(benches);
