//! Integration tests for failure handling
//!
//! - A recoverable failure holds the watermark and is retried next cycle
//! - A fatal per-cycle error stops the apply phase early
//! - An unreachable remote ends the cycle offline with nothing applied
//! - A failed change gets one attempt per cycle

use twinsync_core::config::Direction;
use twinsync_core::domain::{ErrorClass, Location, NodeStatus, Watermarks};
use twinsync_core::ports::{AdapterError, IStateRepository};
use twinsync_sync::engine::{CycleOutcome, SyncEngine};

use crate::common::{self, p, Harness, JOB};

fn two_local_files(h: &Harness) {
    h.local_volume.put_file("/a.txt", b"a");
    h.local_volume.put_file("/b.txt", b"b");
    h.local_feed.create_file("a", "/a.txt", b"a");
    h.local_feed.create_file("b", "/b.txt", b"b");
}

#[tokio::test]
async fn test_recoverable_failure_is_retried_next_cycle() {
    let h = Harness::new().await;
    two_local_files(&h);
    h.remote
        .fail_on("/b.txt", AdapterError::Io("disk hiccup".to_string()));

    let outcome = h.engine().run_cycle().await.unwrap();
    let CycleOutcome::Completed(summary) = outcome else {
        panic!("expected a completed cycle, got {outcome:?}");
    };
    assert_eq!(summary.applied, 1);
    assert_eq!(summary.failed, 1);

    // The mark stops at the failed record
    let marks = h.repository.load_watermarks(JOB).await.unwrap();
    assert_eq!(marks.local, 2);
    assert_eq!(
        h.repository.get_status(JOB, &p("/b.txt")).await.unwrap(),
        Some(NodeStatus::Pending)
    );

    let failures = h.repository.list_failures(JOB, 10).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].class, ErrorClass::RecoverablePerRecord);
    assert!(failures[0].message.contains("disk hiccup"));

    // A fresh engine on the same state replays only the failed change
    h.remote.clear_failures();
    let outcome = h.engine().run_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Completed(_)));

    assert_eq!(h.remote.count("upload /a.txt"), 1);
    assert_eq!(h.remote.count("upload /b.txt"), 1);
    assert_eq!(h.remote_volume.read("/b.txt").unwrap(), b"b");
    assert_eq!(h.repository.load_watermarks(JOB).await.unwrap().local, 3);
}

#[tokio::test]
async fn test_failed_directory_is_attempted_once_per_cycle() {
    let h = Harness::new().await;
    h.local_volume.put_dir("/d");
    h.local_feed.create_dir("d", "/d");
    h.remote
        .fail_on("/d", AdapterError::Io("mkdir refused".to_string()));

    let outcome = h.engine().run_cycle().await.unwrap();
    let CycleOutcome::Completed(summary) = outcome else {
        panic!("expected a completed cycle, got {outcome:?}");
    };
    assert_eq!(summary.applied, 0);
    assert_eq!(summary.failed, 1);

    let failures = h.repository.list_failures(JOB, 10).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(
        h.repository.get_status(JOB, &p("/d")).await.unwrap(),
        Some(NodeStatus::Pending)
    );
    assert_eq!(h.repository.load_watermarks(JOB).await.unwrap().local, 1);

    h.remote.clear_failures();
    let outcome = h.engine().run_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Completed(_)));
    assert_eq!(h.remote.count("mkdir /d"), 1);
    assert_eq!(h.repository.list_failures(JOB, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_quota_error_aborts_the_apply_phase() {
    let h = Harness::new().await;
    two_local_files(&h);
    let quota = AdapterError::QuotaExceeded("storage full".to_string());
    h.remote.fail_on("/a.txt", quota.clone());
    h.remote.fail_on("/b.txt", quota);

    let config = common::builder().pool_size(1).build();
    let outcome = h.engine_with(&config).run_cycle().await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Aborted("quota exceeded: storage full".to_string())
    );
    // Only the first attempt ran; failed attempts are not logged as writes
    assert!(h.remote.calls().is_empty());
    assert!(h.remote_volume.paths().is_empty());
    assert_eq!(
        h.repository.load_watermarks(JOB).await.unwrap(),
        Watermarks::default()
    );

    let failures = h.repository.list_failures(JOB, 10).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].class, ErrorClass::FatalPerCycle);
}

#[tokio::test]
async fn test_unreachable_remote_goes_offline() {
    let h = Harness::new().await;
    two_local_files(&h);
    h.remote_feed
        .fail_with(Some(AdapterError::Network("connection refused".to_string())));

    let engine = h.engine();
    let outcome = engine.run_cycle().await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Offline("network error: connection refused".to_string())
    );
    assert!(h.remote.calls().is_empty());
    assert_eq!(h.local_feed.fetches(), 0);
    assert!(!engine.control().progress().online);
    assert_eq!(
        h.repository.load_watermarks(JOB).await.unwrap(),
        Watermarks::default()
    );

    // Back online: everything goes through
    h.remote_feed.fail_with(None);
    let outcome = engine.run_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Completed(_)));
    assert_eq!(h.remote.count("upload "), 2);
    assert!(engine.control().progress().online);
}

#[tokio::test]
async fn test_upload_only_job_never_reads_the_remote_feed() {
    let h = Harness::new().await;
    two_local_files(&h);
    h.remote_feed
        .fail_with(Some(AdapterError::Network("unused".to_string())));

    let config = common::builder().direction(Direction::Up).build();
    let outcome = h.engine_with(&config).run_cycle().await.unwrap();

    assert!(matches!(outcome, CycleOutcome::Completed(_)));
    assert_eq!(h.remote_feed.fetches(), 0);
    assert_eq!(h.remote.count("upload "), 2);
}

#[tokio::test]
async fn test_missing_local_root_waits() {
    let h = Harness::new().await;
    let bare = common::Volume::default();
    let local = common::MemoryAdapter::new(Location::Local, bare, common::Volume::new());
    let mut ports = h.ports();
    ports.local = local;

    let engine = SyncEngine::new(&common::config(), ports, h.control()).unwrap();
    let outcome = engine.run_cycle().await.unwrap();

    assert!(matches!(outcome, CycleOutcome::Waiting(_)));
    assert_eq!(h.local_feed.fetches(), 0);
    assert_eq!(h.remote_feed.fetches(), 0);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let h = Harness::new().await;
    let config = common::builder().pool_size(0).build();

    assert!(SyncEngine::new(&config, h.ports(), h.control()).is_err());
}
