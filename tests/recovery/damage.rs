//! Reopen over damaged files

use crate::common::*;
use spanstore_core::BlockId;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

fn newest_push_log(wal_dir: &Path) -> PathBuf {
    let mut logs: Vec<PathBuf> = fs::read_dir(wal_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().map_or(false, |e| e == "wal"))
        .collect();
    logs.sort();
    logs.pop().expect("a push log generation")
}

#[test]
fn torn_push_log_tail_is_dropped() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.push("acme", &trace_id(1), &root_fragment("api", "a")).unwrap();
    store.push("acme", &trace_id(2), &root_fragment("api", "b")).unwrap();
    std::mem::forget(store);

    let log = newest_push_log(&dir.path().join("wal").join("acme"));
    let mut file = OpenOptions::new().append(true).open(&log).unwrap();
    file.write_all(&[0x40, 0, 0]).unwrap();
    drop(file);

    let store = open_store(&dir);
    let instance = store.instance("acme").unwrap();
    let report = instance.recovery();
    assert_eq!(report.push_log.records_replayed, 2);
    assert_eq!(report.push_log.truncated_segments, 1);
    assert!(report.has_issues());
    assert_eq!(instance.live_count(), 2);
}

#[test]
fn corrupt_push_log_record_is_skipped() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.push("acme", &trace_id(1), &root_fragment("api", "a")).unwrap();
    store.push("acme", &trace_id(2), &root_fragment("api", "b")).unwrap();
    std::mem::forget(store);

    let log = newest_push_log(&dir.path().join("wal").join("acme"));
    let mut bytes = fs::read(&log).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&log, bytes).unwrap();

    let store = open_store(&dir);
    let instance = store.instance("acme").unwrap();
    assert_eq!(instance.recovery().push_log.corrupt_records_skipped, 1);
    assert_eq!(instance.live_count(), 1);
    assert!(store.find_trace_by_id("acme", &trace_id(1)).unwrap().is_some());
    assert!(store.find_trace_by_id("acme", &trace_id(2)).unwrap().is_none());
}

#[test]
fn block_dir_without_meta_is_removed() {
    let dir = TempDir::new().unwrap();
    let orphan = dir
        .path()
        .join("blocks")
        .join("acme")
        .join(BlockId::new().to_string());
    fs::create_dir_all(&orphan).unwrap();
    fs::write(orphan.join("data.spb"), b"partial").unwrap();

    let store = open_store(&dir);
    let instance = store.instance("acme").unwrap();
    assert_eq!(instance.recovery().removed_block_dirs, 1);
    assert!(instance.completed_block_ids().is_empty());
    assert!(!orphan.exists());
}

#[test]
fn unreadable_head_is_skipped() {
    let dir = TempDir::new().unwrap();
    let wal_dir = dir.path().join("wal").join("acme");
    fs::create_dir_all(&wal_dir).unwrap();
    fs::write(wal_dir.join(format!("{}.head", BlockId::new())), b"nope").unwrap();

    let store = open_store(&dir);
    let instance = store.instance("acme").unwrap();
    assert_eq!(instance.recovery().unreadable_heads, 1);
    assert!(instance.completing_block_ids().is_empty());

    store.push("acme", &trace_id(1), &root_fragment("api", "a")).unwrap();
    assert!(store.find_trace_by_id("acme", &trace_id(1)).unwrap().is_some());
}
