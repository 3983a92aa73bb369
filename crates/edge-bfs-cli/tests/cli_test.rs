//! End-to-end tests for the bfsctl binary

use std::path::Path;
use std::process::{Command, Output};

use edge_config::testing::TestEnvironment;

fn bfsctl(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_bfsctl"))
        .arg("--dir")
        .arg(dir)
        .args(args)
        .env("EDGE_BFS_BYTES_PER_SYNC", "1048576")
        .env("EDGE_LOG", "warn")
        .output()
        .expect("Failed to execute bfsctl")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_put_get_rm() {
    let env = TestEnvironment::new().unwrap();
    let body = env.create_file("body.txt", b"hello world").unwrap();
    let dir = &env.cache_dir;

    let put = bfsctl(
        dir,
        &["put", "--key", "k1", "--file", body.to_str().unwrap(), "--header", "Content-Type: text/plain"],
    );
    assert!(put.status.success(), "{}", String::from_utf8_lossy(&put.stderr));
    let hash = stdout(&put).trim().to_string();
    assert_eq!(hash, edge_bfs::hash_of("k1"));

    let get = bfsctl(dir, &["get", &hash]);
    assert!(get.status.success());
    assert_eq!(get.stdout, b"hello world");

    let get = bfsctl(dir, &["get", "--key", "k1", "--include-header"]);
    assert_eq!(get.stdout, b"Content-Type: text/plainhello world");

    assert!(bfsctl(dir, &["rm", "--key", "k1"]).status.success());
    let get = bfsctl(dir, &["get", &hash]);
    assert!(!get.status.success());
    assert!(String::from_utf8_lossy(&get.stderr).contains("not found"));
}

#[test]
fn test_stat_json() {
    let env = TestEnvironment::new().unwrap();
    let body = env.create_file("b.bin", &[7u8; 1000]).unwrap();
    for key in ["a", "b", "c"] {
        let out = bfsctl(&env.cache_dir, &["put", "--key", key, "-f", body.to_str().unwrap()]);
        assert!(out.status.success());
    }

    let out = bfsctl(&env.cache_dir, &["stat", "--json"]);
    assert!(out.status.success());
    let stats: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(stats["objects"], 3);
    assert_eq!(stats["data_bytes"], 3000);
    assert_eq!(stats["corrupt_shards"], 0);
}

#[test]
fn test_verify_repair_cycle() {
    let env = TestEnvironment::new().unwrap();
    let body = env.create_file("b.bin", b"data").unwrap();
    let out = bfsctl(&env.cache_dir, &["put", "--key", "x", "-f", body.to_str().unwrap()]);
    assert!(out.status.success());
    assert!(bfsctl(&env.cache_dir, &["verify"]).status.success());

    let hash = edge_bfs::hash_of("x");
    let meta = env
        .cache_dir
        .join(format!("{}.m", edge_bfs::shard_name(&hash)));
    let mut bytes = std::fs::read(&meta).unwrap();
    bytes.extend_from_slice(&[0, 0, 0, 40, b'+']);
    std::fs::write(&meta, bytes).unwrap();

    let verify = bfsctl(&env.cache_dir, &["verify"]);
    assert!(!verify.status.success());
    assert!(stdout(&verify).contains("CORRUPT"));

    let repair = bfsctl(&env.cache_dir, &["repair"]);
    assert!(repair.status.success());
    assert!(stdout(&repair).contains("Repaired 1 shard(s)"));
    assert!(bfsctl(&env.cache_dir, &["verify"]).status.success());

    let get = bfsctl(&env.cache_dir, &["get", "--key", "x"]);
    assert_eq!(get.stdout, b"data");
}

#[test]
fn test_compact() {
    let env = TestEnvironment::new().unwrap();
    let body = env.create_file("b.bin", b"v").unwrap();
    for _ in 0..3 {
        let out = bfsctl(&env.cache_dir, &["put", "--key", "same", "-f", body.to_str().unwrap()]);
        assert!(out.status.success());
    }

    let out = bfsctl(&env.cache_dir, &["compact"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("Compacted 1 shard(s)"));

    let out = bfsctl(&env.cache_dir, &["stat", "--json"]);
    let stats: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(stats["stale_records"], 0);
    assert_eq!(stats["objects"], 1);
}

#[test]
fn test_rejects_bad_hash() {
    let env = TestEnvironment::new().unwrap();
    let out = bfsctl(&env.cache_dir, &["get", "XYZ"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("invalid hash"));
}
