use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use xylo_reader::{Reader, DEFAULT_MAX_BYTES_PER_READ};

fn synthetic_document() -> Vec<u8> {
    let mut doc = Vec::new();
    doc.extend_from_slice(b"<?xml version=\"1.0\"?>\n<feed xmlns:x=\"urn:bench\">\n");
    for i in 0..2_000 {
        doc.extend_from_slice(
            format!(
                "  <x:entry id=\"{i}\" kind='plain'>\
                 value {i} &amp; some longer text for the scanner to chew on\
                 <!--note--><![CDATA[raw {i}]]></x:entry>\n"
            )
            .as_bytes(),
        );
    }
    doc.extend_from_slice(b"</feed>\n");
    doc
}

fn parse_buffered(doc: &[u8]) -> usize {
    let mut reader = Reader::from_bytes(doc.to_vec());

    let mut count = 0usize;
    while reader.read().unwrap() {
        count += 1;
    }

    count
}

fn parse_streaming(doc: &[u8]) -> usize {
    let mut reader = Reader::from_stream(doc, DEFAULT_MAX_BYTES_PER_READ);

    let mut count = 0usize;
    while reader.read().unwrap() {
        count += 1;
    }

    count
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("xylo-reader");
    group.sample_size(20);

    let doc = synthetic_document();
    group.throughput(Throughput::Bytes(doc.len() as u64));

    group.bench_with_input(BenchmarkId::new("buffered", doc.len()), &doc, |b, doc| {
        b.iter(|| parse_buffered(doc));
    });

    group.bench_with_input(BenchmarkId::new("streaming", doc.len()), &doc, |b, doc| {
        b.iter(|| parse_streaming(doc));
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
