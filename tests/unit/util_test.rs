//! Tests for utility functions

use vault_scheduler::util::hash::TASK_ID_LEN;
use vault_scheduler::util::{now_ms, now_nanos, short_hash, task_id};

#[test]
fn test_task_id_is_stable_per_metadata() {
    let a = task_id("scan_file:/photos/a.jpg", None);
    assert_eq!(a.len(), TASK_ID_LEN);
    assert_eq!(a, task_id("scan_file:/photos/a.jpg", None));
    assert_ne!(a, task_id("scan_file:/photos/b.jpg", None));
}

#[test]
fn test_salted_task_ids_are_distinct() {
    let salted: std::collections::HashSet<String> = (0..100)
        .map(|seq| task_id("ingest:same", Some((now_nanos(), seq))))
        .collect();
    assert_eq!(salted.len(), 100);
}

#[test]
fn test_short_hash_prefix() {
    let long = short_hash("backup:/library", 20);
    assert!(long.starts_with(&short_hash("backup:/library", TASK_ID_LEN)));
}

#[test]
fn test_clock_is_after_epoch() {
    let ms = now_ms();
    assert!(ms > 1_600_000_000_000);
    assert!(now_nanos() / 1_000_000 >= ms);
}
