//! Integration tests for complete sync cycles
//!
//! - Local create uploaded once, its echo suppressed on the way back
//! - Directory delete collapsed into one remote delete
//! - Rename plus edit applied as delete and upload
//! - Identical changes on both sides converge without writes
//! - Unnecessary changes dropped after probing the replicas
//! - Direction `down` ignores local changes
//! - A delete yields to an edit made on the other side
//! - Echoes are spent once, even while another change keeps failing
//! - Changes to one path apply in sequence order; the pool stays bounded
//! - A restarted engine resumes from the persisted watermarks

use std::time::Duration;

use twinsync_core::config::{Direction, UnnecessaryChangePolicy};
use twinsync_core::domain::{Location, NodeStatus, Watermarks};
use twinsync_core::ports::{AdapterError, IStateRepository};
use twinsync_sync::control::CycleSummary;
use twinsync_sync::engine::{CycleOutcome, SyncEngine};

use crate::common::{self, dir_node, file_node, p, Harness, JOB};

fn completed(outcome: CycleOutcome) -> CycleSummary {
    match outcome {
        CycleOutcome::Completed(summary) => summary,
        other => panic!("expected a completed cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn test_local_create_is_uploaded_once() {
    let h = Harness::new().await;
    h.local_volume.put_file("/a.txt", b"0123456789");
    h.local_feed.create_file("a", "/a.txt", b"0123456789");

    let engine = h.engine();
    let summary = completed(engine.run_cycle().await.unwrap());

    assert_eq!(summary.applied, 1);
    assert_eq!(h.remote.calls(), vec!["upload /a.txt".to_string()]);
    assert_eq!(h.remote_volume.read("/a.txt").unwrap(), b"0123456789");

    let marks = h.repository.load_watermarks(JOB).await.unwrap();
    assert_eq!(marks, Watermarks { local: 2, remote: 0 });
    assert_eq!(
        h.repository.get_status(JOB, &p("/a.txt")).await.unwrap(),
        Some(NodeStatus::Idle)
    );

    // The remote feed now reports the upload: it must not come back down
    h.remote_feed.create_file("r-a", "/a.txt", b"0123456789");
    let summary = completed(engine.run_cycle().await.unwrap());

    assert_eq!(summary.fetched, 0);
    assert_eq!(h.remote.calls().len(), 1);
    assert!(h.local.calls().is_empty());

    let marks = h.repository.load_watermarks(JOB).await.unwrap();
    assert_eq!(marks, Watermarks { local: 2, remote: 2 });
    assert!(h.repository.list_echoes(JOB).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deleted_directory_is_removed_with_one_call() {
    let h = Harness::new().await;
    h.remote_volume.put_dir("/photos");
    for i in 0..50 {
        let path = format!("/photos/img{i:02}.jpg");
        h.remote_volume.put_file(&path, b"jpeg");
        h.local_feed
            .delete(&format!("f{i:02}"), &path, file_node(&path, b"jpeg"));
    }
    h.local_feed.delete("photos", "/photos", dir_node("/photos"));

    let summary = completed(h.engine().run_cycle().await.unwrap());

    assert_eq!(summary.applied, 1);
    assert_eq!(h.remote.calls(), vec!["delete /photos".to_string()]);
    assert!(h.remote_volume.paths().is_empty());

    let marks = h.repository.load_watermarks(JOB).await.unwrap();
    assert_eq!(marks.local, 52);
}

#[tokio::test]
async fn test_rename_with_edit_replaces_the_remote_file() {
    let h = Harness::new().await;
    h.remote_volume.put_file("/x.txt", b"old");
    h.local_volume.put_file("/y.txt", b"new content");
    h.local_feed
        .rename("x", "/x.txt", "/y.txt", file_node("/y.txt", b"old"));
    h.local_feed.edit("x", "/y.txt", b"new content");

    let summary = completed(h.engine().run_cycle().await.unwrap());

    assert_eq!(summary.applied, 2);
    let mut calls = h.remote.calls();
    calls.sort();
    assert_eq!(calls, vec!["delete /x.txt".to_string(), "upload /y.txt".to_string()]);
    assert_eq!(h.remote_volume.paths(), vec!["/y.txt".to_string()]);
    assert_eq!(h.remote_volume.read("/y.txt").unwrap(), b"new content");
}

#[tokio::test]
async fn test_folder_rename_moves_remote_subtree() {
    let h = Harness::new().await;
    h.remote_volume.put_dir("/docs");
    h.remote_volume.put_file("/docs/a.txt", b"a");
    h.local_feed
        .rename("docs", "/docs", "/archive", dir_node("/archive"));

    let summary = completed(h.engine().run_cycle().await.unwrap());

    assert_eq!(summary.applied, 1);
    assert_eq!(h.remote.calls(), vec!["move /docs /archive".to_string()]);
    assert_eq!(
        h.remote_volume.paths(),
        vec!["/archive".to_string(), "/archive/a.txt".to_string()]
    );
}

#[tokio::test]
async fn test_identical_changes_on_both_sides_converge() {
    let h = Harness::new().await;
    h.local_volume.put_file("/twin.txt", b"same");
    h.remote_volume.put_file("/twin.txt", b"same");
    h.local_feed.create_file("l", "/twin.txt", b"same");
    h.remote_feed.create_file("r", "/twin.txt", b"same");

    let summary = completed(h.engine().run_cycle().await.unwrap());

    assert_eq!(summary.applied, 0);
    assert!(h.local.calls().is_empty());
    assert!(h.remote.calls().is_empty());
    assert!(h.repository.list_conflicts(JOB).await.unwrap().is_empty());

    let marks = h.repository.load_watermarks(JOB).await.unwrap();
    assert_eq!(marks, Watermarks { local: 2, remote: 2 });
}

#[tokio::test]
async fn test_unnecessary_change_is_dropped_when_probing() {
    let h = Harness::new().await;
    h.local_volume.put_file("/same.txt", b"x");
    h.remote_volume.put_file("/same.txt", b"x");
    h.local_volume.put_file("/fresh.txt", b"y");
    h.local_feed.create_file("s", "/same.txt", b"x");
    h.local_feed.create_file("f", "/fresh.txt", b"y");

    let config = common::builder()
        .unnecessary_changes(UnnecessaryChangePolicy::Always)
        .build();
    let summary = completed(h.engine_with(&config).run_cycle().await.unwrap());

    assert!(summary.reduced >= 1);
    assert_eq!(h.remote.calls(), vec!["upload /fresh.txt".to_string()]);
}

#[tokio::test]
async fn test_direction_down_ignores_local_changes() {
    let h = Harness::new().await;
    h.local_volume.put_file("/up.txt", b"local");
    h.remote_volume.put_file("/down.txt", b"remote");
    h.local_feed.create_file("u", "/up.txt", b"local");
    h.remote_feed.create_file("d", "/down.txt", b"remote");

    let config = common::builder().direction(Direction::Down).build();
    completed(h.engine_with(&config).run_cycle().await.unwrap());

    assert_eq!(h.remote.calls(), vec!["download /down.txt".to_string()]);
    assert_eq!(h.local_volume.read("/down.txt").unwrap(), b"remote");
    assert!(!h.remote_volume.contains("/up.txt"));

    // Local changes are consumed, not replayed
    let marks = h.repository.load_watermarks(JOB).await.unwrap();
    assert_eq!(marks, Watermarks { local: 2, remote: 2 });
}

#[tokio::test]
async fn test_remote_directory_create_reaches_local() {
    let h = Harness::new().await;
    h.remote_volume.put_dir("/music");
    h.remote_feed.create_dir("m", "/music");

    completed(h.engine().run_cycle().await.unwrap());

    assert_eq!(h.local.calls(), vec!["mkdir /music".to_string()]);
    assert!(h.local_volume.contains("/music"));

    let echoes = h.repository.list_echoes(JOB).await.unwrap();
    assert_eq!(echoes.len(), 1);
    assert_eq!(echoes[0].echo.location, Location::Local);
}

#[tokio::test]
async fn test_missing_remote_root_is_created() {
    let h = Harness::new().await;
    // A volume without its root
    let bare = common::Volume::default();
    let remote = common::MemoryAdapter::new(Location::Remote, bare.clone(), h.local_volume.clone());
    let mut ports = h.ports();
    ports.remote = remote.clone();

    let engine = SyncEngine::new(&common::config(), ports, h.control()).unwrap();
    completed(engine.run_cycle().await.unwrap());

    assert_eq!(remote.calls(), vec!["mkdir /".to_string()]);
}

#[tokio::test]
async fn test_remote_edit_survives_local_delete() {
    let h = Harness::new().await;
    h.remote_volume.put_file("/f.txt", b"edited remotely");
    h.local_feed
        .delete("f", "/f.txt", file_node("/f.txt", b"before"));
    h.remote_feed.edit("rf", "/f.txt", b"edited remotely");

    completed(h.engine().run_cycle().await.unwrap());

    assert_eq!(h.remote.calls(), vec!["download /f.txt".to_string()]);
    assert_eq!(h.local_volume.read("/f.txt").unwrap(), b"edited remotely");
    assert_eq!(h.remote_volume.read("/f.txt").unwrap(), b"edited remotely");
}

#[tokio::test]
async fn test_echo_is_spent_once_while_another_change_keeps_failing() {
    let h = Harness::new().await;
    h.local_volume.put_file("/a.txt", b"v1");
    h.local_volume.put_file("/bad.txt", b"bad");
    h.local_feed.create_file("a", "/a.txt", b"v1");
    h.local_feed.create_file("bad", "/bad.txt", b"bad");
    h.remote
        .fail_on("/bad.txt", AdapterError::Io("flaky disk".to_string()));
    let engine = h.engine();

    let summary = completed(engine.run_cycle().await.unwrap());
    assert_eq!((summary.applied, summary.failed), (1, 1));

    // The upload comes back through the remote feed and is dropped
    h.remote_feed.create_file("r-a", "/a.txt", b"v1");
    let summary = completed(engine.run_cycle().await.unwrap());
    assert_eq!((summary.applied, summary.failed), (0, 1));
    assert!(h.local.calls().is_empty());
    assert!(h.repository.list_echoes(JOB).await.unwrap().is_empty());

    // A genuine remote replacement of the same file must come down
    h.remote_volume.put_file("/a.txt", b"REMOTE-v2");
    h.remote_feed
        .delete("r-a", "/a.txt", file_node("/a.txt", b"v1"));
    h.remote_feed.create_file("r-a", "/a.txt", b"REMOTE-v2");
    let summary = completed(engine.run_cycle().await.unwrap());

    assert_eq!(summary.applied, 1);
    assert_eq!(h.remote.count("download /a.txt"), 1);
    assert_eq!(h.local_volume.read("/a.txt").unwrap(), b"REMOTE-v2");
    assert_eq!(h.remote.count("upload /a.txt"), 1);
}

#[tokio::test]
async fn test_replaced_file_is_applied_in_sequence_order() {
    let h = Harness::new().await;
    h.remote_volume.put_file("/x.txt", b"old");
    h.local_volume.put_file("/x.txt", b"new");
    h.local_feed
        .delete("x-old", "/x.txt", file_node("/x.txt", b"old"));
    h.local_feed.create_file("x-new", "/x.txt", b"new");
    // a slow delete must still finish before the upload starts
    h.remote
        .delay_on("delete /x.txt", Duration::from_millis(50));

    let summary = completed(h.engine().run_cycle().await.unwrap());

    assert_eq!(summary.applied, 2);
    assert_eq!(
        h.remote.calls(),
        vec!["delete /x.txt".to_string(), "upload /x.txt".to_string()]
    );
    assert_eq!(h.remote_volume.read("/x.txt").unwrap(), b"new");
    assert_eq!(h.repository.load_watermarks(JOB).await.unwrap().local, 3);
}

#[tokio::test]
async fn test_worker_pool_bounds_concurrent_transfers() {
    let h = Harness::new().await;
    for i in 0..6 {
        let path = format!("/f{i}.txt");
        h.local_volume.put_file(&path, b"data");
        h.local_feed.create_file(&format!("f{i}"), &path, b"data");
        h.remote
            .delay_on(&format!("upload {path}"), Duration::from_millis(50));
    }

    let config = common::builder().pool_size(3).build();
    let summary = completed(h.engine_with(&config).run_cycle().await.unwrap());

    assert_eq!(summary.applied, 6);
    assert_eq!(h.remote.count("upload "), 6);
    assert_eq!(h.remote.peak_concurrency(), 3);
}

#[tokio::test]
async fn test_restart_resumes_from_persisted_watermarks() {
    let h = Harness::new().await;
    h.local_volume.put_file("/a.txt", b"a");
    h.local_feed.create_file("a", "/a.txt", b"a");
    completed(h.engine().run_cycle().await.unwrap());
    assert_eq!(
        h.repository.load_watermarks(JOB).await.unwrap(),
        Watermarks { local: 2, remote: 0 }
    );

    // A new engine on the same state only sees what came after the mark
    h.local_volume.put_file("/b.txt", b"b");
    h.local_feed.create_file("b", "/b.txt", b"b");
    let summary = completed(h.engine().run_cycle().await.unwrap());

    assert_eq!(summary.fetched, 1);
    assert_eq!(h.local_feed.starts(), vec![0, 2]);
    assert_eq!(h.remote.count("upload /a.txt"), 1);
    assert_eq!(h.remote.count("upload /b.txt"), 1);
    assert_eq!(h.repository.load_watermarks(JOB).await.unwrap().local, 3);
}
