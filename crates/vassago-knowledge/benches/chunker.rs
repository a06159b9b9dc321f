//! Benchmarks for chunking and brute-force retrieval.

use std::hint::black_box;

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vassago_core::{Chunk, Document};
use vassago_knowledge::chunker::{reconstruct, Chunker, ChunkerConfig};
use vassago_knowledge::{
    Embedder, InMemoryStore, MetadataFilter, MockEmbedder, VectorRecord, VectorStore,
};

const SENTENCE: &str = "The ingestion pipeline splits each article into overlapping chunks. ";

fn article(chars: usize) -> Document {
    let text: String = SENTENCE.chars().cycle().take(chars).collect();
    Document::new("bench", "acme", text)
}

// ============================================================================
// CHUNKING
// ============================================================================

fn chunking_benchmark(c: &mut Criterion) {
    let chunker = Chunker::new(ChunkerConfig::default()).unwrap();
    let mut group = c.benchmark_group("chunking");

    for size in [10_000, 100_000, 1_000_000] {
        let document = article(size);
        group.throughput(Throughput::Bytes(document.text.len() as u64));
        group.bench_with_input(BenchmarkId::new("default_config", size), &document, |b, doc| {
            b.iter(|| chunker.chunk(black_box(doc)))
        });
    }

    let document = article(100_000);
    for (max_length, overlap) in [(256, 32), (1200, 200), (4000, 400)] {
        let chunker = Chunker::new(ChunkerConfig::new(max_length, overlap)).unwrap();
        group.bench_function(format!("100k_{max_length}_{overlap}"), |b| {
            b.iter(|| chunker.chunk(black_box(&document)))
        });
    }

    let chunks = chunker.chunk(&document);
    group.bench_function("reconstruct_100k", |b| {
        b.iter(|| reconstruct(black_box(&chunks)))
    });

    group.finish();
}

// ============================================================================
// RETRIEVAL
// ============================================================================

fn retrieval_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let embedder = MockEmbedder::new(384);
    let mut group = c.benchmark_group("retrieval");

    for records in [1_000, 10_000] {
        let store = InMemoryStore::new();
        runtime.block_on(async {
            let document = article(records * 20);
            for i in 0..records {
                let chunk = Chunk::new(&document, i, i * 20, i * 20 + 20);
                let embedding = embedder.embed_single(&chunk.text).await.unwrap();
                let mut chunk = chunk;
                if i % 2 == 1 {
                    chunk.organization = "globex".into();
                }
                let record = VectorRecord::from_chunk(&chunk, embedding, Utc::now(), "mock");
                store.upsert(record).await.unwrap();
            }
        });

        let query = runtime
            .block_on(embedder.embed_single("overlapping chunks"))
            .unwrap();
        let filter = MetadataFilter::for_organization("acme");

        group.bench_with_input(BenchmarkId::new("top5_filtered", records), &records, |b, _| {
            b.to_async(&runtime)
                .iter(|| async { store.query(black_box(&query), 5, &filter).await.unwrap() })
        });
    }

    group.finish();
}

criterion_group!(benches, chunking_benchmark, retrieval_benchmark);
criterion_main!(benches);
