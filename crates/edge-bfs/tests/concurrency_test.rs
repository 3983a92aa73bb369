use std::io::Read;
use std::sync::{Arc, Barrier};
use std::thread;

use edge_bfs::{hash_of, shard_name, Fs, FsOptions};
use tempfile::TempDir;

fn test_opts() -> FsOptions {
    FsOptions {
        bytes_per_sync: 1 << 20,
        max_open_files: 16,
        ..Default::default()
    }
}

fn body_for(key: &str) -> Vec<u8> {
    key.as_bytes().repeat(64)
}

#[test]
fn test_parallel_writers_many_shards() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 50;

    let temp = TempDir::new().unwrap();
    let fs = Arc::new(Fs::open(temp.path(), test_opts()).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let fs = fs.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    let key = format!("t{t}-obj{i}");
                    let body = body_for(&key);
                    let hash = hash_of(&key);
                    let mut writer = fs.open_file_writer(&hash, body.len() as i64, false).unwrap();
                    writer.write_meta(200, 0, body.len() as i64).unwrap();
                    for chunk in body.chunks(100) {
                        writer.write_body(chunk).unwrap();
                    }
                    writer.close().unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    // more shards than max_open_files were touched; eviction kept up
    assert!(fs.stats().open_shards <= 16);

    for t in 0..THREADS {
        for i in 0..PER_THREAD {
            let key = format!("t{t}-obj{i}");
            let mut reader = fs.open_file_reader(&hash_of(&key), false).unwrap();
            let mut body = Vec::new();
            reader.read_to_end(&mut body).unwrap();
            assert_eq!(body, body_for(&key), "{key}");
        }
    }
}

#[test]
fn test_same_shard_writes_interleave_safely() {
    let temp = TempDir::new().unwrap();
    let fs = Arc::new(Fs::open(temp.path(), test_opts()).unwrap());

    // find a handful of keys landing in one shard
    let target = shard_name(&hash_of("anchor"));
    let keys: Vec<String> = std::iter::once("anchor".to_string())
        .chain((0..).map(|i| format!("shard-mate-{i}")))
        .filter(|k| shard_name(&hash_of(k)) == target)
        .take(4)
        .collect();

    let handles: Vec<_> = keys
        .iter()
        .cloned()
        .map(|key| {
            let fs = fs.clone();
            thread::spawn(move || {
                let hash = hash_of(&key);
                let mut writer = fs.open_file_writer(&hash, -1, false).unwrap();
                writer.write_meta(200, 0, -1).unwrap();
                for _ in 0..200 {
                    writer.write_body(key.as_bytes()).unwrap();
                }
                writer.close().unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(fs.shard_names().unwrap(), vec![target]);
    for key in &keys {
        let mut reader = fs.open_file_reader(&hash_of(key), false).unwrap();
        let mut body = Vec::new();
        reader.read_to_end(&mut body).unwrap();
        assert_eq!(body, key.as_bytes().repeat(200));
    }
}

#[test]
fn test_single_writer_per_hash() {
    let temp = TempDir::new().unwrap();
    let fs = Arc::new(Fs::open(temp.path(), test_opts()).unwrap());
    let hash = hash_of("contended");

    let mut writer = fs.open_file_writer(&hash, -1, false).unwrap();
    writer.write_meta(200, 0, -1).unwrap();

    let rejected = {
        let fs = fs.clone();
        let hash = hash.clone();
        thread::spawn(move || fs.open_file_writer(&hash, -1, false).err())
            .join()
            .unwrap()
    };
    assert!(rejected.is_some_and(|e| e.is_writing()));

    writer.write_body(b"winner").unwrap();
    writer.close().unwrap();
    assert!(fs.open_file_writer(&hash, -1, false).is_ok());
}

#[test]
fn test_reader_snapshot_isolated_from_rewrite() {
    let temp = TempDir::new().unwrap();
    let fs = Fs::open(temp.path(), test_opts()).unwrap();
    let hash = hash_of("snap");

    let mut writer = fs.open_file_writer(&hash, -1, false).unwrap();
    writer.write_meta(200, 0, -1).unwrap();
    writer.write_body(b"original").unwrap();
    writer.close().unwrap();

    let mut reader = fs.open_file_reader(&hash, false).unwrap();

    let mut writer = fs.open_file_writer(&hash, -1, false).unwrap();
    writer.write_meta(200, 0, -1).unwrap();
    writer.write_body(b"REPLACED").unwrap();
    writer.close().unwrap();

    let mut body = String::new();
    reader.read_to_string(&mut body).unwrap();
    assert_eq!(body, "original");
}

#[test]
fn test_concurrent_readers() {
    let temp = TempDir::new().unwrap();
    let fs = Arc::new(Fs::open(temp.path(), test_opts()).unwrap());
    let hash = hash_of("popular");
    let body: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 256) as u8).collect();

    let mut writer = fs.open_file_writer(&hash, body.len() as i64, false).unwrap();
    writer.write_meta(200, 0, body.len() as i64).unwrap();
    writer.write_body(&body).unwrap();
    writer.close().unwrap();
    fs.sync_all().unwrap();

    let body = Arc::new(body);
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let (fs, hash, body) = (fs.clone(), hash.clone(), body.clone());
            thread::spawn(move || {
                for _ in 0..20 {
                    let mut reader = fs.open_file_reader(&hash, false).unwrap();
                    let mut out = Vec::new();
                    reader.read_to_end(&mut out).unwrap();
                    assert_eq!(&out, body.as_ref());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(fs.stats().readers, 0);
}
