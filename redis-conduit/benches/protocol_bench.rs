use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use redis_conduit::core::mapping::TypeMapping;
use redis_conduit::protocol::{RespDecoder, RespEncoder};
use redis_conduit::{calculate_slot, ProtocolVersion, RespValue};

fn bench_encode_command(c: &mut Criterion) {
    c.bench_function("encode_command", |b| {
        let args = [
            Bytes::from_static(b"SET"),
            Bytes::from_static(b"mykey"),
            Bytes::from_static(b"myvalue"),
        ];
        b.iter(|| {
            let mut buf = BytesMut::new();
            RespEncoder::encode_command(black_box(&args), &mut buf);
            black_box(buf);
        });
    });
}

fn bench_encode_map(c: &mut Criterion) {
    let value = RespValue::Map(
        (0..16)
            .map(|i| {
                (
                    RespValue::BulkString(Bytes::from(format!("field{}", i))),
                    RespValue::Integer(i),
                )
            })
            .collect(),
    );
    let mut group = c.benchmark_group("encode_map");
    for version in [ProtocolVersion::Resp2, ProtocolVersion::Resp3] {
        group.bench_with_input(BenchmarkId::from_parameter(version), &version, |b, v| {
            b.iter(|| {
                let mut buf = BytesMut::new();
                RespEncoder::encode(black_box(&value), *v, &mut buf);
                black_box(buf);
            });
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let frames: [(&str, &[u8]); 4] = [
        ("simple_string", b"+OK\r\n"),
        ("bulk_string", b"$13\r\nHello, Redis!\r\n"),
        ("array", b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n"),
        (
            "resp3_map",
            b"%2\r\n+name\r\n$5\r\nalice\r\n+score\r\n,1.5\r\n",
        ),
    ];
    let mut group = c.benchmark_group("decode");
    for (name, data) in frames {
        group.bench_function(name, |b| {
            let mut decoder = RespDecoder::new(ProtocolVersion::Resp3);
            b.iter(|| {
                let mut buf = BytesMut::from(black_box(data));
                black_box(decoder.decode(&mut buf).unwrap());
            });
        });
    }
    group.finish();
}

fn bench_decode_split_reply(c: &mut Criterion) {
    // One pipelined burst of 100 replies, fed in 7-byte reads
    let mut burst = BytesMut::new();
    for i in 0..100 {
        RespEncoder::encode(
            &RespValue::BulkString(Bytes::from(format!("value-{}", i))),
            ProtocolVersion::Resp2,
            &mut burst,
        );
    }
    let burst = burst.freeze();

    c.bench_function("decode_split_burst", |b| {
        b.iter(|| {
            let mut decoder = RespDecoder::new(ProtocolVersion::Resp2);
            let mut buf = BytesMut::new();
            let mut frames = 0;
            for chunk in burst.chunks(7) {
                buf.extend_from_slice(chunk);
                while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                    black_box(frame);
                    frames += 1;
                }
            }
            assert_eq!(frames, 100);
        });
    });
}

fn bench_type_mapping(c: &mut Criterion) {
    let reply = RespValue::Map(
        (0..32)
            .map(|i| {
                (
                    RespValue::BulkString(Bytes::from(format!("field{}", i))),
                    RespValue::BulkString(Bytes::from(format!("value{}", i))),
                )
            })
            .collect(),
    );
    let mapping = TypeMapping::default();
    c.bench_function("map_to_record", |b| {
        b.iter(|| black_box(mapping.apply(black_box(reply.clone())).unwrap()));
    });
}

fn bench_calculate_slot(c: &mut Criterion) {
    c.bench_function("calculate_slot", |b| {
        b.iter(|| calculate_slot(black_box(b"{user:1000}:profile")));
    });
}

criterion_group!(
    benches,
    bench_encode_command,
    bench_encode_map,
    bench_decode,
    bench_decode_split_reply,
    bench_type_mapping,
    bench_calculate_slot,
);
criterion_main!(benches);
