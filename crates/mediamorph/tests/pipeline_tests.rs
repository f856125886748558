//! End-to-end worker-pipeline scenarios driven through the pool.

mod common;

use mediamorph::db::{file_index_repo, task_repo, FileStatus, TaskStatus};
use mediamorph::worker::derive_output_path;

use common::{StubConverter, TestHarness, STUB_OUTPUT};

#[test]
fn test_happy_path_conversion() {
    let harness = TestHarness::with_converter(StubConverter::claiming("jpg", "heic"));
    let pool = harness.spawn_pool(1);

    let src = harness.write_media("a/b/c/photo.jpg", b"jpeg content, stable");
    let result = harness.convert_and_wait(&pool, &src);
    assert_eq!(result.status, TaskStatus::Success);

    // Destination: /watch/a/b/heic/photo.heic
    let dst = harness.watch_root.join("a/b/heic/photo.heic");
    assert!(dst.exists(), "expected output at {}", dst.display());
    assert_eq!(std::fs::read(&dst).unwrap(), STUB_OUTPUT);

    let entry = file_index_repo::find_by_path(&harness.db, &src.to_string_lossy())
        .unwrap()
        .expect("index entry must exist");
    assert_eq!(entry.status, FileStatus::Success);
    assert_eq!(entry.converter_name.as_deref(), Some("stub"));
    assert_eq!(
        entry.content_hash,
        mediamorph::hash::file_digest(&src, 8192).unwrap()
    );

    let tasks = task_repo::list(&harness.db, 10, 0).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Success);

    pool.stop_accepting();
    pool.wait();
}

#[test]
fn test_duplicate_event_is_skipped() {
    let harness = TestHarness::with_converter(StubConverter::claiming("jpg", "heic"));
    let pool = harness.spawn_pool(1);

    let src = harness.write_media("a/b/c/photo.jpg", b"unchanged bytes");

    let first = harness.convert_and_wait(&pool, &src);
    assert_eq!(first.status, TaskStatus::Success);

    let second = harness.convert_and_wait(&pool, &src);
    assert_eq!(second.status, TaskStatus::Skipped);

    // No second destination file appeared.
    let out_dir = harness.watch_root.join("a/b/heic");
    let outputs = std::fs::read_dir(&out_dir).unwrap().count();
    assert_eq!(outputs, 1);

    let tasks = task_repo::list(&harness.db, 10, 0).unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].status, TaskStatus::Skipped);

    pool.stop_accepting();
    pool.wait();
}

#[test]
fn test_content_change_reconverts() {
    let harness = TestHarness::with_converter(StubConverter::claiming("jpg", "heic"));
    let pool = harness.spawn_pool(1);

    let src = harness.write_media("a/b/c/photo.jpg", b"first version");
    let first = harness.convert_and_wait(&pool, &src);
    assert_eq!(first.status, TaskStatus::Success);
    let first_hash = file_index_repo::find_by_path(&harness.db, &src.to_string_lossy())
        .unwrap()
        .unwrap()
        .content_hash;

    std::fs::write(&src, b"second version, different bytes").unwrap();
    let second = harness.convert_and_wait(&pool, &src);
    assert_eq!(second.status, TaskStatus::Success);

    let entry = file_index_repo::find_by_path(&harness.db, &src.to_string_lossy())
        .unwrap()
        .unwrap();
    assert_ne!(entry.content_hash, first_hash);
    assert_eq!(entry.status, FileStatus::Success);

    // The original destination still exists; the reconversion either
    // rewrote it or created a timestamp-suffixed sibling.
    let out_dir = harness.watch_root.join("a/b/heic");
    assert!(std::fs::read_dir(&out_dir).unwrap().count() >= 1);

    let success_tasks = task_repo::list(&harness.db, 10, 0)
        .unwrap()
        .into_iter()
        .filter(|t| t.status == TaskStatus::Success)
        .count();
    assert_eq!(success_tasks, 2);

    pool.stop_accepting();
    pool.wait();
}

#[test]
fn test_unclaimed_file_fails_with_no_converter() {
    let harness = TestHarness::with_converter(StubConverter::claiming("png", "avif"));
    let pool = harness.spawn_pool(1);

    let src = harness.write_media("pic.jpg", b"a jpg nobody claims");
    let result = harness.convert_and_wait(&pool, &src);

    assert_eq!(result.status, TaskStatus::Failed);
    assert!(result.error.unwrap().contains("no converter"));

    let tasks = task_repo::list(&harness.db, 10, 0).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Failed);

    pool.stop_accepting();
    pool.wait();
}

#[test]
fn test_failed_conversion_is_queryable() {
    let harness = TestHarness::with_converter(StubConverter {
        name: "stub",
        claims_extension: "jpg",
        target: "heic",
        fail: true,
    });
    let pool = harness.spawn_pool(1);

    let src = harness.write_media("broken.jpg", b"bytes");
    let result = harness.convert_and_wait(&pool, &src);
    assert_eq!(result.status, TaskStatus::Failed);

    let entry = file_index_repo::find_by_path(&harness.db, &src.to_string_lossy())
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, FileStatus::Failed);

    let tasks = task_repo::list_for_path(&harness.db, &src.to_string_lossy(), 10).unwrap();
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].error_message.is_some());
    assert!(tasks[0].console_output.contains("stub log"));

    pool.stop_accepting();
    pool.wait();
}

#[test]
fn test_parallel_conversions_across_paths() {
    let harness = TestHarness::with_converter(StubConverter::claiming("jpg", "heic"));
    let pool = harness.spawn_pool(4);

    let mut paths = Vec::new();
    for i in 0..8 {
        paths.push(harness.write_media(
            &format!("batch/set{}/img{i}.jpg", i % 3),
            format!("payload {i}").as_bytes(),
        ));
    }

    for path in &paths {
        pool.submit(mediamorph::worker::Task::new(
            path.clone(),
            mediamorph::watcher::EventOrigin::Scan,
        ))
        .unwrap();
    }

    let mut successes = 0;
    for _ in 0..paths.len() {
        let result = pool
            .recv_result_timeout(std::time::Duration::from_secs(15))
            .expect("expected a result per submitted task");
        if result.status == TaskStatus::Success {
            successes += 1;
        }
    }
    assert_eq!(successes, paths.len());

    let stats = file_index_repo::stats(&harness.db).unwrap();
    assert_eq!(stats.success_count, paths.len() as i64);

    pool.stop_accepting();
    pool.wait();
}

#[test]
fn test_derived_destination_shape() {
    assert_eq!(
        derive_output_path(std::path::Path::new("/w/a/b/c/photo.jpg"), "heic"),
        std::path::PathBuf::from("/w/a/b/heic/photo.heic")
    );
}
