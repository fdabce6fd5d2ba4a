//! Archive open, iteration and batching benchmarks

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use shmlog_logger::{ArchiveReader, ArchiveWriter, MessageKey};
use std::hint::black_box;
use std::path::PathBuf;
use tempfile::TempDir;

const SIZES: [u64; 3] = [1_000, 10_000, 100_000];

fn build_archive(dir: &TempDir, count: u64) -> PathBuf {
    let path = dir.path().join(format!("bench_{count}.arc"));
    let mut writer = ArchiveWriter::create(&path).unwrap();
    writer
        .append(&MessageKey::onset(1).to_string(), &1_700_000_000_000_000u64.to_le_bytes())
        .unwrap();
    let payload = [0x5Au8; 64];
    for ts in 1..=count {
        writer.append(&MessageKey::new(1, ts * 100).to_string(), &payload).unwrap();
    }
    writer.finish(false).unwrap();
    path
}

/// Open plus onset discovery
fn bench_open(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    for count in SIZES {
        let path = build_archive(&dir, count);
        c.bench_with_input(BenchmarkId::new("open_and_discover_onset", count), &path, |b, path| {
            b.iter(|| {
                let reader = ArchiveReader::open(path).unwrap();
                black_box(reader.onset_timestamp_us().unwrap())
            });
        });
    }
}

/// Full ordered iteration, borrowed vs copied payloads
fn bench_iterate(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    for count in SIZES {
        let reader = ArchiveReader::open(build_archive(&dir, count)).unwrap();

        c.bench_with_input(BenchmarkId::new("iter_messages", count), &count, |b, _| {
            b.iter(|| {
                let mut bytes = 0usize;
                for message in reader.iter_messages(None).unwrap() {
                    bytes += black_box(message.unwrap().payload).len();
                }
                bytes
            });
        });

        c.bench_with_input(BenchmarkId::new("read_all_messages", count), &count, |b, _| {
            b.iter(|| black_box(reader.read_all_messages().unwrap()));
        });

        c.bench_with_input(BenchmarkId::new("get_batches_4x4", count), &count, |b, _| {
            b.iter(|| black_box(reader.get_batches(4, 4)));
        });
    }
}

criterion_group!(benches, bench_open, bench_iterate);
criterion_main!(benches);
