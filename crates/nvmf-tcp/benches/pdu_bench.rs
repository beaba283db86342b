//! NVMe/TCP PDU Benchmarks
//!
//! Performance benchmarks for the PDU codecs, digests and transfer planning.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use bytes::{Bytes, BytesMut};
use nvmf_tcp::{
    crc32c,
    pdu::{C2HData, CapsuleCmd, CapsuleResp, PduOptions},
    transfer::{chunk_ranges, CorrelationTable, DataTransfer},
    DigestOptions, FabricsCommand, NvmeCompletion, NvmeCommand, SubmissionEntry, R2T,
};

/// Benchmark SQE serialization
fn bench_command_encoding(c: &mut Criterion) {
    let connect = FabricsCommand::connect(0, 31, 0, 0);
    c.bench_function("fabrics_connect_encode_sqe", |b| {
        b.iter(|| black_box(connect.encode_sqe()))
    });

    let read = NvmeCommand::read(1, 0x1000, 7);
    c.bench_function("nvme_read_encode_sqe", |b| {
        b.iter(|| black_box(read.encode_sqe()))
    });
}

/// Benchmark command capsule framing with and without digests
fn bench_capsule_framing(c: &mut Criterion) {
    let sqe = FabricsCommand::connect(0, 31, 0, 0).encode_sqe();
    let data = vec![0xA5u8; 1024];

    let mut group = c.benchmark_group("capsule_cmd_encode");
    group.throughput(Throughput::Bytes(data.len() as u64));
    for (name, digests) in [
        ("plain", DigestOptions::NONE),
        ("digests", DigestOptions::new(true, true)),
    ] {
        let opts = PduOptions::new(digests, 0);
        group.bench_function(name, |b| {
            let mut buf = BytesMut::with_capacity(2048);
            b.iter(|| {
                buf.clear();
                CapsuleCmd::new(sqe, &data).encode(&mut buf, &opts);
                black_box(buf.len())
            })
        });
    }
    group.finish();

    let mut buf = BytesMut::new();
    CapsuleResp::new(NvmeCompletion::success(1).to_bytes())
        .encode(&mut buf, &PduOptions::new(DigestOptions::new(true, false), 0));
    let bytes = buf.freeze();
    c.bench_function("capsule_resp_decode", |b| {
        b.iter(|| black_box(CapsuleResp::decode(&bytes).unwrap()))
    });
}

/// Benchmark CRC32C throughput
fn bench_crc32c(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc32c");
    for size in [512usize, 4096, 65536] {
        let data = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(crc32c(data)))
        });
    }
    group.finish();
}

/// Benchmark receive-side placement of C2HData payloads
fn bench_c2h_placement(c: &mut Criterion) {
    const CHUNK: u32 = 8192;
    const TOTAL: u32 = 128 * 1024;
    let payload = vec![0x11u8; CHUNK as usize];

    let mut group = c.benchmark_group("c2h_placement");
    group.throughput(Throughput::Bytes(TOTAL as u64));
    group.bench_function("128k_in_8k_pdus", |b| {
        b.iter(|| {
            let mut table = CorrelationTable::new();
            table
                .register(1, None, DataTransfer::FromController(TOTAL), false)
                .unwrap();
            let mut offset = 0;
            while offset < TOTAL {
                let pdu = C2HData {
                    cccid: 1,
                    datao: offset,
                    datal: CHUNK,
                    last_pdu: offset + CHUNK == TOTAL,
                    success: false,
                };
                table.handle_c2h(&pdu, &payload).unwrap();
                offset += CHUNK;
            }
            black_box(table.complete(NvmeCompletion::success(1)).unwrap())
        })
    });
    group.finish();
}

/// Benchmark R2T chunk planning
fn bench_r2t_planning(c: &mut Criterion) {
    c.bench_function("chunk_ranges_1m_by_32k", |b| {
        b.iter(|| black_box(chunk_ranges(0, 1024 * 1024, 32 * 1024)))
    });

    let data = Bytes::from(vec![0u8; 256 * 1024]);
    c.bench_function("handle_r2t_256k", |b| {
        b.iter(|| {
            let mut table = CorrelationTable::new();
            table
                .register(3, None, DataTransfer::ToController(data.clone()), false)
                .unwrap();
            let r2t = R2T {
                cccid: 3,
                ttag: 1,
                r2to: 0,
                r2tl: 256 * 1024,
            };
            black_box(table.handle_r2t(&r2t, 32 * 1024, 0).unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_command_encoding,
    bench_capsule_framing,
    bench_crc32c,
    bench_c2h_placement,
    bench_r2t_planning,
);
criterion_main!(benches);
