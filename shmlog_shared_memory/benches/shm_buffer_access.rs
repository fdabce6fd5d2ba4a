//! Locked vs unlocked shared buffer access benchmarks

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::Rng;
use shmlog_shared_memory::platform::get_current_pid;
use shmlog_shared_memory::{BufferSpec, SharedBuffer};
use std::hint::black_box;

fn bench_name(tag: &str) -> String {
    format!("bench_{tag}_{}", get_current_pid())
}

/// Single element get/set, with and without the region lock
fn bench_element_access(c: &mut Criterion) {
    let spec = BufferSpec::of::<f64>(bench_name("element"), vec![1024]);
    let mut buffer = SharedBuffer::<f64>::create(&spec, true).unwrap();
    let mut rng = rand::thread_rng();

    for with_lock in [false, true] {
        c.bench_with_input(
            BenchmarkId::new("get_random_element", with_lock),
            &with_lock,
            |b, &with_lock| {
                b.iter(|| {
                    let index = rng.gen_range(0..1024);
                    black_box(buffer.get(index, with_lock).unwrap());
                });
            },
        );

        c.bench_with_input(
            BenchmarkId::new("set_random_element", with_lock),
            &with_lock,
            |b, &with_lock| {
                b.iter(|| {
                    let index = rng.gen_range(0..1024);
                    buffer.set(index, black_box(1.5), with_lock).unwrap();
                });
            },
        );
    }

    buffer.destroy().unwrap();
}

/// Whole-buffer copies of increasing size
fn bench_range_access(c: &mut Criterion) {
    for len in [64usize, 1024, 16384] {
        let spec = BufferSpec::of::<u8>(bench_name(&format!("range_{len}")), vec![len]);
        let mut buffer = SharedBuffer::<u8>::create(&spec, true).unwrap();
        let data = vec![0xAAu8; len];

        c.bench_with_input(BenchmarkId::new("write_locked", len), &len, |b, _| {
            b.iter(|| buffer.write(.., black_box(&data), true).unwrap());
        });

        c.bench_with_input(BenchmarkId::new("read_locked", len), &len, |b, _| {
            b.iter(|| black_box(buffer.read(.., true).unwrap()));
        });

        c.bench_with_input(BenchmarkId::new("with_exclusive_fill", len), &len, |b, _| {
            b.iter(|| buffer.with_exclusive(|d| d.fill(black_box(0x55))).unwrap());
        });

        buffer.destroy().unwrap();
    }
}

criterion_group!(benches, bench_element_access, bench_range_access);
criterion_main!(benches);
