use bytes::{Bytes, BytesMut};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use restream_codec::{
    rtp::RtpHeader,
    sctp::{
        Packet,
        chunk::{Chunk, Data},
    },
    stun::{Message, MessageEncoder, attributes::*, methods::*},
};

fn criterion_benchmark(c: &mut Criterion) {
    let token = [0u8; 12];

    let mut stun = BytesMut::with_capacity(1280);
    {
        let mut encoder = MessageEncoder::new(BINDING_REQUEST, &token, &mut stun);
        encoder.append::<UserName>("remote:local");
        encoder.append::<Priority>(1853824767);
        encoder.append::<IceControlling>(1);
        encoder.flush(Some(&b"password"[..]));
    }

    #[rustfmt::skip]
    let rtp = [
        0x90, 0xe0, 0x04, 0xf1, 0xf8, 0x87, 0x3f, 0xad, 0x67, 0xfe,
        0x9d, 0xfc, 0xbe, 0xde, 0x00, 0x01, 0x10, 0xff, 0x00, 0x00,
    ];

    let sctp = Packet {
        source_port: 5000,
        destination_port: 5000,
        verification_tag: 1,
        chunks: vec![Chunk::Data(Data {
            unordered: false,
            beginning: true,
            ending: true,
            tsn: 1,
            stream: 0,
            ssn: 0,
            ppid: 53,
            payload: Bytes::from(vec![0u8; 1024]),
        })],
    }
    .encode();

    let mut criterion = c.benchmark_group("codec");

    criterion.throughput(Throughput::Elements(1));
    criterion.bench_function("stun_decode_and_verify", |bencher| {
        bencher.iter(|| {
            let message = Message::decode(&stun[..]).unwrap();
            message.verify_integrity(b"password").unwrap();
        })
    });

    criterion.bench_function("rtp_header_decode", |bencher| {
        bencher.iter(|| {
            RtpHeader::decode(&rtp[..]).unwrap();
        })
    });

    criterion.bench_function("sctp_packet_decode", |bencher| {
        bencher.iter(|| {
            Packet::decode(&sctp).unwrap();
        })
    });

    criterion.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
