use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use shoal_transport::feedback::{CcFeedbackReport, FeedbackBuilder, MinimalFeedback};
use shoal_transport::infer::{InferenceConfig, InferenceState};

/// A report covering `n` packets with every fourth one lost.
fn sample_report(n: u16) -> CcFeedbackReport {
    let mut builder = FeedbackBuilder::new(2);
    for seq in 0..n {
        if seq % 4 != 3 {
            builder.record(1, seq, seq as u32 * 64, 0);
        }
    }
    builder.build(n as u32 * 64 + 1000).unwrap()
}

/// Benchmark report encode and decode at typical report sizes.
fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("cc_feedback");
    for n in [16u16, 128] {
        let report = sample_report(n);
        let wire = report.to_bytes().unwrap();
        group.throughput(Throughput::Bytes(wire.len() as u64));

        group.bench_function(format!("encode_{n}_records"), |b| {
            b.iter(|| black_box(&report).to_bytes().unwrap());
        });
        group.bench_function(format!("decode_{n}_records"), |b| {
            b.iter(|| CcFeedbackReport::decode(black_box(&wire)).unwrap());
        });
    }
    group.finish();
}

/// Benchmark the builder: 64 arrivals recorded then one report built.
fn bench_builder(c: &mut Criterion) {
    let mut group = c.benchmark_group("feedback_builder");
    group.throughput(Throughput::Elements(64));
    group.bench_function("record_64_and_build", |b| {
        let mut builder = FeedbackBuilder::new(2);
        let mut base = 0u16;
        b.iter(|| {
            for i in 0..64u16 {
                builder.record(1, base.wrapping_add(i), i as u32 * 64, 0);
            }
            base = base.wrapping_add(64);
            black_box(builder.build(10_000));
        });
    });
    group.finish();
}

/// Benchmark a full inference step: transmit bookkeeping plus one
/// synthesised report per minimal feedback.
fn bench_inference(c: &mut Criterion) {
    let mut group = c.benchmark_group("inference");
    group.throughput(Throughput::Elements(1));
    group.bench_function("transmit_and_infer", |b| {
        let mut state = InferenceState::new(InferenceConfig::default());
        let mut seq = 0u16;
        let mut now = 0u32;
        b.iter(|| {
            state.on_transmitted(seq, 1200, now);
            let feedback = MinimalFeedback { timestamp: now + 500, seq };
            black_box(state.on_minimal_feedback(feedback, now + 600));
            seq = seq.wrapping_add(1);
            now = now.wrapping_add(64);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_codec, bench_builder, bench_inference);
criterion_main!(benches);
