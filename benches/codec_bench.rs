//! Criterion benchmarks for the galaxy-core message codec.
//!
//! Measures encode and decode latency for representative coherence traffic:
//! small control messages (GET/INVACK), data-carrying PUTs at typical line
//! sizes, and batched backup packets.
//!
//! Run with:
//! ```bash
//! cargo bench --bench codec_bench
//! ```

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use galaxy_core::{
    decode_buffers, decode_flat, encode_buffers, encode_flat, DataBuf, Message,
};

// ── Message fixtures ──────────────────────────────────────────────────────────

fn owned(len: usize, fill: u8) -> DataBuf {
    DataBuf::Owned(Bytes::from(vec![fill; len]))
}

fn make_get() -> Message {
    let mut msg = Message::get(5, 0x100);
    msg.set_message_id(42);
    msg
}

fn make_invack() -> Message {
    let mut msg = Message::invack(5, 0x100);
    msg.set_message_id(43);
    msg
}

fn make_put_1k() -> Message {
    let mut get = Message::get(5, 0x100);
    get.set_message_id(44);
    Message::put_response(&get, 0x100, 7, owned(1024, 0xAB))
}

fn make_put_64k() -> Message {
    let mut get = Message::get(5, 0x100);
    get.set_message_id(45);
    Message::put_response(&get, 0x100, 7, owned(u16::MAX as usize, 0xCD))
}

fn make_putx_8_sharers() -> Message {
    let mut getx = Message::getx(5, 0x100);
    getx.set_message_id(46);
    Message::putx_response(&getx, 0x100, 7, (0..8).collect(), owned(1024, 0xEF))
}

fn make_backup_packet_16() -> Message {
    let backups = (0..16u64)
        .map(|i| Message::backup(0x1000 + i, i, owned(256, i as u8)))
        .collect();
    let mut msg = Message::backup_packet(99, backups);
    msg.set_message_id(47);
    msg
}

fn make_msg_256() -> Message {
    let mut msg = Message::msg(3, 0x30, Bytes::from(vec![0x42; 256]));
    msg.set_message_id(48);
    msg
}

fn fixture_set() -> Vec<(&'static str, Message)> {
    vec![
        ("Get", make_get()),
        ("InvAck", make_invack()),
        ("Put(1k)", make_put_1k()),
        ("Put(64k)", make_put_64k()),
        ("PutX(8 sharers)", make_putx_8_sharers()),
        ("BackupPacket(16)", make_backup_packet_16()),
        ("Msg(256)", make_msg_256()),
    ]
}

// ── Benchmark groups ──────────────────────────────────────────────────────────

fn bench_encode_flat(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_flat");
    for (name, msg) in fixture_set() {
        group.bench_with_input(BenchmarkId::new("msg", name), &msg, |b, msg| {
            b.iter(|| encode_flat(black_box(msg)).expect("encode must succeed"))
        });
    }
    group.finish();
}

fn bench_decode_flat(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_flat");
    for (name, msg) in fixture_set() {
        let bytes = encode_flat(&msg).expect("encode must succeed for setup");
        group.bench_with_input(BenchmarkId::new("msg", name), &bytes, |b, bytes| {
            b.iter(|| decode_flat(black_box(bytes)).expect("decode must succeed"))
        });
    }
    group.finish();
}

/// The vector form exists to skip payload copies, so measure it against the
/// data-heavy fixtures.
fn bench_vector_form(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_form");
    for (name, msg) in [
        ("Put(1k)", make_put_1k()),
        ("Put(64k)", make_put_64k()),
        ("BackupPacket(16)", make_backup_packet_16()),
    ] {
        group.bench_with_input(BenchmarkId::new("encode", name), &msg, |b, msg| {
            b.iter(|| encode_buffers(black_box(msg)).expect("encode must succeed"))
        });

        let buffers = encode_buffers(&msg).expect("encode must succeed for setup");
        let concat: Vec<u8> = buffers.iter().flat_map(|b| b.iter().copied()).collect();
        let source = Bytes::from(concat);
        group.bench_with_input(BenchmarkId::new("decode", name), &source, |b, source| {
            b.iter(|| decode_buffers(black_box(source)).expect("decode must succeed"))
        });
    }
    group.finish();
}

fn bench_roundtrip_hot_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_decode_roundtrip");

    // GET: the highest-frequency coherence request.
    let get = make_get();
    group.bench_function("Get", |b| {
        b.iter(|| {
            let bytes = encode_flat(black_box(&get)).unwrap();
            decode_flat(black_box(&bytes)).unwrap()
        })
    });

    // PUT with a typical line: the hot data path.
    let put = make_put_1k();
    group.bench_function("Put_1k", |b| {
        b.iter(|| {
            let bytes = encode_flat(black_box(&put)).unwrap();
            decode_flat(black_box(&bytes)).unwrap()
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_encode_flat,
    bench_decode_flat,
    bench_vector_form,
    bench_roundtrip_hot_path
);
criterion_main!(benches);
