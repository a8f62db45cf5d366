//! End-to-end benchmarks: streamed generation, decode steps, and incremental decoding.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tarifin_stream::config::GenerationConfig;
use tarifin_stream::inference::{Fragments, GenerationRequest, Pipeline};
use tarifin_stream::model::{create_demo_model_seeded, Generator};
use tarifin_stream::tokenizer::{ByteTokenizer, IncrementalDecoder, TokenizerAdapter};

const PROMPT: &str = "Tarifin: Bir tavuk yemeği öner, 30 dakikada hazır olsun.";

fn bench_streamed_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("streamed_generation");

    let model = create_demo_model_seeded(42).unwrap();
    let pipeline = Pipeline::new(
        Arc::new(model),
        Arc::new(ByteTokenizer::new()),
        GenerationConfig::default(),
    )
    .unwrap();

    for max_new in [10, 50, 200] {
        group.bench_with_input(
            BenchmarkId::new("greedy", max_new),
            &max_new,
            |b, &max_new| {
                b.iter(|| {
                    let req = GenerationRequest::new(PROMPT).with_max_new_tokens(max_new);
                    let session = pipeline.start(req).unwrap();
                    Fragments::new(session).map(|f| f.unwrap().text.len()).sum::<usize>()
                });
            },
        );
    }

    group.finish();
}

fn bench_forward_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_step");

    let model = create_demo_model_seeded(42).unwrap();
    let prompt = ByteTokenizer::new().encode(PROMPT).unwrap();

    for len in [1, 16, 64] {
        let ids: Vec<u32> = prompt.ids().iter().copied().cycle().take(len).collect();
        group.bench_with_input(BenchmarkId::new("prefill", len), &len, |b, _| {
            b.iter(|| {
                let mut session = model.start_session().unwrap();
                for &id in &ids {
                    session.forward_step(id).unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_incremental_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental_decode");

    let tok: Arc<dyn TokenizerAdapter> = Arc::new(ByteTokenizer::new());
    let text = "Tavuğu doğrayın, soğanı ekleyin, 30 dakika pişirin. ".repeat(20);
    let ids: Vec<u32> = text.bytes().map(ByteTokenizer::byte_to_id).collect();

    group.bench_function("push_all", |b| {
        b.iter(|| {
            let mut decoder = IncrementalDecoder::new(Arc::clone(&tok));
            let mut n = 0;
            for &id in &ids {
                if let Some(s) = decoder.push(id).unwrap() {
                    n += s.len();
                }
            }
            n
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_streamed_generation,
    bench_forward_step,
    bench_incremental_decode
);
criterion_main!(benches);
