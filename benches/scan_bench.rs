use criterion::{black_box, criterion_group, criterion_main, Criterion};
use csvquery::record::{encode_all, decode_all, IndexRecord};
use csvquery::scan::count_separators;

fn bench_scan_and_codec(c: &mut Criterion) {
    let mut buf = vec![b'x'; 1024 * 1024];
    for i in (0..buf.len()).step_by(40) {
        buf[i] = b'\n';
    }
    c.bench_function("count_separators_1mb", |b| {
        b.iter(|| count_separators(black_box(&buf), b'\n'))
    });
    c.bench_function("count_separators_naive_1mb", |b| {
        b.iter(|| black_box(&buf).iter().filter(|&&x| x == b'\n').count())
    });

    let records: Vec<IndexRecord> = (0..10_000)
        .map(|i| IndexRecord::new(format!("key{i:06}").as_bytes(), i * 41, i + 1))
        .collect();
    let encoded = encode_all(&records);
    c.bench_function("encode_10k_records", |b| b.iter(|| encode_all(black_box(&records))));
    c.bench_function("decode_10k_records", |b| b.iter(|| decode_all(black_box(&encoded))));
}

criterion_group!(benches, bench_scan_and_codec);
criterion_main!(benches);
