//! Codec benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use osclive_core::codec::{decode_channel, encode_control, parse_response, sysex_frame};
use osclive_core::DeviceProfile;

fn decode_benchmark(c: &mut Criterion) {
    let profile = DeviceProfile::studiolive_1602();
    let ch1 = profile.channel("ch1").unwrap().clone();
    let payload: Vec<u8> = (0..ch1.length).map(|i| (i % 16) as u8).collect();
    let frame = sysex_frame(&ch1.resp_id, &payload);

    c.bench_function("decode_input_channel", |b| {
        b.iter(|| {
            let payload = parse_response(black_box(&frame), &ch1.resp_id, ch1.frame_len()).unwrap();
            black_box(decode_channel(&ch1, payload).count())
        })
    });
}

fn encode_benchmark(c: &mut Criterion) {
    let profile = DeviceProfile::studiolive_1602();
    let geq = profile.channel("geq0").unwrap().clone();
    let mut payload = vec![0u8; geq.length];

    c.bench_function("encode_geq_bands", |b| {
        b.iter(|| {
            for (_, desc) in &geq.controls {
                encode_control(desc, &mut payload, geq.offset, black_box(0.5));
            }
            black_box(&payload);
        })
    });
}

criterion_group!(benches, decode_benchmark, encode_benchmark);
criterion_main!(benches);
