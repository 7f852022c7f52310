use std::time::SystemTime;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use netspectra::codec::{FieldCodec, MAX_KEY_LEN};
use netspectra::model::{normalize_addr, FiveTuple, PacketInfo};
use netspectra::sketch::{CountMinSketch, SuperSpreaderSketch};
use netspectra::task::ExactTask;

fn sample_packet(i: u32) -> PacketInfo {
    let octets = i.to_be_bytes();
    PacketInfo {
        timestamp: SystemTime::UNIX_EPOCH,
        five_tuple: FiveTuple {
            src_ip: normalize_addr(&octets).expect("valid addr"),
            dst_ip: normalize_addr(&[8, 8, 8, 8]).expect("valid addr"),
            src_port: 40000 + (i % 1000) as u16,
            dst_port: 443,
            protocol: 6,
        },
        length: 1400,
    }
}

fn bench_codec_encode(c: &mut Criterion) {
    let codec = FieldCodec::new(&[
        "SrcIP".to_string(),
        "DstIP".to_string(),
        "SrcPort".to_string(),
        "DstPort".to_string(),
        "Protocol".to_string(),
    ])
    .expect("valid codec");
    let packet = sample_packet(7);
    let mut buf = [0u8; MAX_KEY_LEN];

    c.bench_function("codec/encode_five_tuple", |b| {
        b.iter(|| codec.encode(black_box(&packet.five_tuple), black_box(&mut buf)))
    });
}

fn bench_exact_process(c: &mut Criterion) {
    let task = ExactTask::new("bench", &["SrcIP".to_string()], 256).expect("valid task");
    let packets: Vec<PacketInfo> = (0..1024).map(sample_packet).collect();

    let mut i = 0usize;
    c.bench_function("exact/process", |b| {
        b.iter(|| {
            task.process(black_box(&packets[i & 1023]));
            i += 1;
        })
    });
}

fn bench_count_min_insert(c: &mut Criterion) {
    let sketch = CountMinSketch::new(1 << 16, 3, 0, 0, 16);
    let flows: Vec<[u8; 16]> = (0..1024u32)
        .map(|i| normalize_addr(&i.to_be_bytes()).expect("valid addr"))
        .collect();

    let mut i = 0usize;
    c.bench_function("count_min/insert", |b| {
        b.iter(|| {
            sketch.insert(black_box(&flows[i & 1023]), black_box(1400));
            i += 1;
        })
    });
}

fn bench_super_spreader_insert(c: &mut Criterion) {
    let sketch = SuperSpreaderSketch::new(1 << 13, 2, 0, 128, 5, 0.5, 1.08, 16);
    let flow = normalize_addr(&[2, 2, 2, 2]).expect("valid addr");
    let elems: Vec<[u8; 16]> = (0..4096u32)
        .map(|i| normalize_addr(&i.to_be_bytes()).expect("valid addr"))
        .collect();

    let mut i = 0usize;
    c.bench_function("super_spreader/insert", |b| {
        b.iter(|| {
            sketch.insert(black_box(&flow), black_box(&elems[i & 4095]));
            i += 1;
        })
    });
}

criterion_group!(
    benches,
    bench_codec_encode,
    bench_exact_process,
    bench_count_min_insert,
    bench_super_spreader_insert,
);
criterion_main!(benches);
