use std::io::Read;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use edge_bfs::{hash_of, FileHeader, BlockInfo, Fs, FsOptions};
use tempfile::TempDir;

fn bench_opts() -> FsOptions {
    FsOptions {
        bytes_per_sync: 64 << 20,
        ..Default::default()
    }
}

fn bench_write_10kb(c: &mut Criterion) {
    let temp = TempDir::new().unwrap();
    let fs = Fs::open(temp.path(), bench_opts()).unwrap();
    let data = vec![0u8; 1024 * 10]; // 10KB
    let mut i = 0u64;

    c.bench_function("bfs_write_10kb", |b| {
        b.iter(|| {
            // fresh hash per iteration so every write is a new object
            i += 1;
            let hash = hash_of(i.to_le_bytes());
            let mut writer = fs.open_file_writer(&hash, data.len() as i64, false).unwrap();
            writer.write_meta(200, 0, data.len() as i64).unwrap();
            writer.write_body(black_box(&data)).unwrap();
            writer.close().unwrap();
        })
    });
}

fn bench_read_1mb(c: &mut Criterion) {
    let temp = TempDir::new().unwrap();
    let fs = Fs::open(temp.path(), bench_opts()).unwrap();
    let data = vec![7u8; 1024 * 1024]; // 1MB
    let hash = hash_of("bench-read");

    let mut writer = fs.open_file_writer(&hash, data.len() as i64, false).unwrap();
    writer.write_meta(200, 0, data.len() as i64).unwrap();
    for chunk in data.chunks(16 * 1024) {
        writer.write_body(chunk).unwrap();
    }
    writer.close().unwrap();
    fs.sync_all().unwrap();

    let mut out = Vec::with_capacity(data.len());
    c.bench_function("bfs_read_1mb", |b| {
        b.iter(|| {
            out.clear();
            let mut reader = fs.open_file_reader(black_box(&hash), false).unwrap();
            reader.read_to_end(&mut out).unwrap();
        })
    });
}

fn bench_header_encode(c: &mut Criterion) {
    let mut header = FileHeader::new_writing(200, 0, 1 << 20);
    for i in 0..64u64 {
        // non-contiguous so blocks are not merged
        header.add_body_block(BlockInfo::new(i * 16384, i * 32768, 16384));
    }
    header.compact();
    let hash = hash_of("encode");

    c.bench_function("file_header_encode_64_blocks", |b| {
        b.iter(|| black_box(&header).encode(&hash).unwrap())
    });
}

criterion_group!(benches, bench_write_10kb, bench_read_1mb, bench_header_encode);
criterion_main!(benches);
