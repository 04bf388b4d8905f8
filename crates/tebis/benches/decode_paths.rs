use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tebis::decode::{BatchShape, ColumnSpec};
use tebis::decode::binary::decode;
use tebis::decode::text::decode_text;
use tebis::decode::writer::PayloadWriter;
use tebis::table::ResultAssembler;

const ROWS: u32 = 3_600;
const POINTS: usize = 100;

fn layout(points: usize) -> Vec<ColumnSpec> {
    std::iter::once(ColumnSpec::timestamp())
        .chain((0..points).map(|i| ColumnSpec::value(format!("p{i}"))))
        .collect()
}

fn first_batch() -> BatchShape {
    BatchShape::new(0, POINTS, ROWS as usize)
}

/// One hour at 1 s: every point stores a distinct value per row.
fn distinct_batch(compressed: bool) -> Vec<u8> {
    let mut writer = PayloadWriter::new(ROWS).compressed(compressed);
    writer.timestamp_column(1_700_000_000_000, 1_000);
    for point in 0..POINTS {
        let values: Vec<f64> = (0..ROWS)
            .map(|row| (point as f64).mul_add(0.1, f64::from(row % 97)))
            .collect();
        writer.distinct_column(&values);
    }
    writer.finish()
}

fn grouped_batch() -> Vec<u8> {
    let mut writer = PayloadWriter::new(ROWS).compressed(true);
    writer.timestamp_column(1_700_000_000_000, 1_000);
    let groups: Vec<(u8, f64)> = (0..ROWS / 60).map(|g| (60, f64::from(g))).collect();
    for _ in 0..POINTS {
        writer.grouped_column(&groups);
    }
    writer.finish()
}

fn text_batch() -> Vec<u8> {
    let mut body = format!("{},{ROWS},301,0,d,{ROWS},1700000000000,1000", POINTS + 1);
    for point in 0..POINTS {
        body.push_str(",8,0");
        for row in 0..ROWS {
            body.push_str(&format!(",{}.{}", row % 97, point % 10));
        }
    }
    format!(
        "1,{}\n-1,463453,756543,-1,3,{body}\n-1,463453,756543,-1\n",
        body.len()
    )
    .into_bytes()
}

fn bench_binary_raw(c: &mut Criterion) {
    let raw = distinct_batch(false);
    let columns = layout(POINTS);
    c.bench_function("binary_distinct_raw", |b| {
        b.iter(|| decode(black_box(&raw), &columns, None, first_batch()).unwrap())
    });
}

fn bench_binary_compressed(c: &mut Criterion) {
    let raw = distinct_batch(true);
    let columns = layout(POINTS);
    c.bench_function("binary_distinct_zlib", |b| {
        b.iter(|| decode(black_box(&raw), &columns, None, first_batch()).unwrap())
    });
}

fn bench_grouped(c: &mut Criterion) {
    let raw = grouped_batch();
    let columns = layout(POINTS);
    c.bench_function("binary_grouped_zlib", |b| {
        b.iter(|| decode(black_box(&raw), &columns, None, first_batch()).unwrap())
    });
}

fn bench_text(c: &mut Criterion) {
    let raw = text_batch();
    let columns = layout(POINTS);
    c.bench_function("text_literals", |b| {
        b.iter(|| decode_text(black_box(&raw), &columns).unwrap())
    });
}

fn bench_assemble_batches(c: &mut Criterion) {
    let raw = distinct_batch(true);
    let columns = layout(POINTS * 3);
    c.bench_function("assemble_three_batches", |b| {
        b.iter(|| {
            let mut assembler = ResultAssembler::new(columns.clone());
            for batch in 0..3 {
                let shape = BatchShape::new(batch * POINTS, POINTS, ROWS as usize);
                assembler.push_binary(black_box(&raw), shape).unwrap();
            }
            assembler.finish().unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_binary_raw,
    bench_binary_compressed,
    bench_grouped,
    bench_text,
    bench_assemble_batches
);
criterion_main!(benches);
