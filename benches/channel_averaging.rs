//! Criterion benchmarks for the channel averaging stage.
//!
//! Chunk shapes follow a 36-antenna array with autocorrelations (666 rows),
//! four polarisation products and a varying channel count.
//!
//! Run with: cargo bench --bench channel_averaging

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use num_complex::Complex32;
use rust_ingest::data::vis_chunk::{Polarisation, VisChunk};
use rust_ingest::pipeline::Stage;
use rust_ingest::stages::ChannelAveragingStage;

const ROWS: usize = 666;

fn chunk(channels: usize) -> VisChunk {
    let mut chunk = VisChunk::new(ROWS, channels, Polarisation::ALL.to_vec());
    for ((_, channel, pol), v) in chunk.visibility.indexed_iter_mut() {
        *v = Complex32::new(channel as f32, pol as f32);
    }
    // every seventh channel flagged
    for ((_, channel, _), f) in chunk.flag.indexed_iter_mut() {
        *f = channel % 7 == 0;
    }
    chunk.channel_width = 18_518.5;
    chunk.frequency = (0..channels).map(|c| 1.0e9 + c as f64 * 18_518.5).collect();
    chunk
}

fn averaging(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_averaging");
    group.sample_size(20);

    for (channels, factor) in [(216usize, 54usize), (2592, 54), (2592, 2)] {
        let input = chunk(channels);
        let mut stage = ChannelAveragingStage::new(factor).unwrap();
        group.throughput(Throughput::Elements((ROWS * channels * 4) as u64));
        group.bench_with_input(
            BenchmarkId::new(format!("factor_{}", factor), channels),
            &channels,
            |b, _| {
                b.iter_batched(
                    || input.clone(),
                    |mut chunk| {
                        stage.process(&mut chunk).unwrap();
                        black_box(chunk)
                    },
                    criterion::BatchSize::LargeInput,
                );
            },
        );
    }
    group.finish();
}

criterion_group!(benches, averaging);
criterion_main!(benches);
