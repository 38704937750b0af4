// SPDX-License-Identifier: MPL-2.0
//! Microbenchmarks for the hot synchronization paths: these run once per
//! displayed frame (delay math, clock reads) or once per audio buffer
//! (difference tracking), so regressions here show up as jitter.

use criterion::{criterion_group, criterion_main, Criterion};
use reelplay::config::Tuning;
use reelplay::engine::clock::Clock;
use reelplay::engine::sync::{compute_target_delay, AudioDiffTracker};
use std::hint::black_box;

fn bench_compute_target_delay(c: &mut Criterion) {
    let tuning = Tuning::default();
    c.bench_function("compute_target_delay", |b| {
        b.iter(|| {
            compute_target_delay(
                black_box(0.04),
                black_box(-0.06),
                black_box(10.0),
                &tuning,
            )
        });
    });
}

fn bench_clock_read(c: &mut Criterion) {
    let clock = Clock::new_external();
    clock.set_at(1.0, 1, 100.0);
    c.bench_function("clock_get_at", |b| {
        b.iter(|| clock.get_at(black_box(100.5)));
    });
}

fn bench_audio_diff_tracker(c: &mut Criterion) {
    let tuning = Tuning::default();
    c.bench_function("audio_wanted_samples", |b| {
        let mut tracker = AudioDiffTracker::new(0.02, &tuning);
        b.iter(|| tracker.wanted_samples(black_box(0.015), black_box(1024), 48_000, &tuning));
    });
}

criterion_group!(
    benches,
    bench_compute_target_delay,
    bench_clock_read,
    bench_audio_diff_tracker
);
criterion_main!(benches);
