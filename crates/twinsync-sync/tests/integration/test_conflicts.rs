//! Integration tests for the conflict gate
//!
//! - Divergent edits block the whole apply phase
//! - A submitted resolution is consumed by the next cycle
//! - Keep-both policy moves the local copy aside and syncs both versions
//! - A keep-both move waits until no other conflict is open

use twinsync_core::config::Strategy;
use twinsync_core::domain::{NodeStatus, Resolution, Watermarks};
use twinsync_core::ports::IStateRepository;
use twinsync_sync::control::ProgressEvent;
use twinsync_sync::engine::CycleOutcome;

use crate::common::{self, p, Harness, JOB};

fn diverge(h: &Harness) {
    h.local_volume.put_file("/doc.txt", b"local edit");
    h.remote_volume.put_file("/doc.txt", b"remote edit");
    h.local_feed.edit("l", "/doc.txt", b"local edit");
    h.remote_feed.edit("r", "/doc.txt", b"remote edit");
}

#[tokio::test]
async fn test_divergent_edits_block_apply() {
    let h = Harness::new().await;
    diverge(&h);
    // an unrelated change is held back as well
    h.local_volume.put_file("/other.txt", b"other");
    h.local_feed.create_file("o", "/other.txt", b"other");

    let engine = h.engine();
    let mut events = engine.control().subscribe_events();
    let outcome = engine.run_cycle().await.unwrap();

    assert_eq!(outcome, CycleOutcome::ConflictsPending(1));
    assert!(h.local.calls().is_empty());
    assert!(h.remote.calls().is_empty());
    assert_eq!(
        h.repository.load_watermarks(JOB).await.unwrap(),
        Watermarks::default()
    );
    assert_eq!(
        h.repository.get_status(JOB, &p("/doc.txt")).await.unwrap(),
        Some(NodeStatus::Conflict)
    );

    let conflict = h
        .repository
        .get_conflict(JOB, &p("/doc.txt"))
        .await
        .unwrap()
        .expect("conflict recorded");
    assert!(conflict.detail.is_some());

    let mut detected = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ProgressEvent::ConflictDetected { ref path } if path.as_str() == "/doc.txt") {
            detected = true;
        }
    }
    assert!(detected);
    assert_eq!(engine.control().progress().conflicts, 1);
}

#[tokio::test]
async fn test_conflict_persists_until_resolved() {
    let h = Harness::new().await;
    diverge(&h);
    let engine = h.engine();

    assert_eq!(engine.run_cycle().await.unwrap(), CycleOutcome::ConflictsPending(1));
    assert_eq!(engine.run_cycle().await.unwrap(), CycleOutcome::ConflictsPending(1));
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn test_keep_local_resolution_uploads_local_version() {
    let h = Harness::new().await;
    diverge(&h);
    let engine = h.engine();
    assert_eq!(engine.run_cycle().await.unwrap(), CycleOutcome::ConflictsPending(1));

    engine
        .control()
        .submit_resolution(&p("/doc.txt"), Resolution::KeepLocal)
        .await
        .unwrap();
    assert_eq!(
        h.repository.get_status(JOB, &p("/doc.txt")).await.unwrap(),
        Some(NodeStatus::Solved(Resolution::KeepLocal))
    );

    let outcome = engine.run_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Completed(_)));
    assert_eq!(h.remote.calls(), vec!["upload /doc.txt".to_string()]);
    assert_eq!(h.remote_volume.read("/doc.txt").unwrap(), b"local edit");
    assert_eq!(
        h.repository.get_status(JOB, &p("/doc.txt")).await.unwrap(),
        Some(NodeStatus::Idle)
    );
    assert!(engine.control().conflicts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_keep_remote_resolution_downloads_remote_version() {
    let h = Harness::new().await;
    diverge(&h);
    let engine = h.engine();
    engine.run_cycle().await.unwrap();

    engine
        .control()
        .submit_resolution(&p("/doc.txt"), Resolution::KeepRemote)
        .await
        .unwrap();
    engine.run_cycle().await.unwrap();

    assert_eq!(h.remote.calls(), vec!["download /doc.txt".to_string()]);
    assert_eq!(h.local_volume.read("/doc.txt").unwrap(), b"remote edit");
}

#[tokio::test]
async fn test_resolution_for_unknown_node_is_rejected() {
    let h = Harness::new().await;
    let control = h.control();

    assert!(control
        .submit_resolution(&p("/never-seen.txt"), Resolution::KeepLocal)
        .await
        .is_err());

    h.repository
        .set_status(JOB, &p("/calm.txt"), NodeStatus::Idle)
        .await
        .unwrap();
    assert!(control
        .submit_resolution(&p("/calm.txt"), Resolution::KeepLocal)
        .await
        .is_err());
}

#[tokio::test]
async fn test_keep_both_policy_syncs_both_versions() {
    let h = Harness::new().await;
    diverge(&h);
    let config = common::builder()
        .conflicts_default_strategy(Strategy::KeepBoth)
        .build();

    let outcome = h.engine_with(&config).run_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Completed(_)), "{outcome:?}");

    // The local edit now lives beside the remote version on both replicas
    let aside: Vec<String> = h
        .local_volume
        .paths()
        .into_iter()
        .filter(|path| path.contains("conflicted copy"))
        .collect();
    assert_eq!(aside.len(), 1);
    let aside = &aside[0];
    assert!(aside.starts_with("/doc (conflicted copy "));
    assert!(aside.ends_with(").txt"));

    assert_eq!(h.local_volume.read("/doc.txt").unwrap(), b"remote edit");
    assert_eq!(h.local_volume.read(aside).unwrap(), b"local edit");
    assert_eq!(h.remote_volume.read(aside).unwrap(), b"local edit");
    assert_eq!(h.remote_volume.read("/doc.txt").unwrap(), b"remote edit");
    assert_eq!(h.remote.count("upload "), 1);
    assert_eq!(h.remote.count("download "), 1);
}

#[tokio::test]
async fn test_rule_overrides_default_strategy() {
    let h = Harness::new().await;
    diverge(&h);
    let config = common::builder()
        .conflicts_default_strategy(Strategy::Manual)
        .conflict_rule("*.txt", Strategy::KeepRemote)
        .build();

    let outcome = h.engine_with(&config).run_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Completed(_)), "{outcome:?}");
    assert_eq!(h.remote.calls(), vec!["download /doc.txt".to_string()]);
}

#[tokio::test]
async fn test_keep_both_move_waits_for_open_conflicts() {
    let h = Harness::new().await;
    diverge(&h);
    h.local_volume.put_file("/sheet.csv", b"local rows");
    h.remote_volume.put_file("/sheet.csv", b"remote rows");
    h.local_feed.edit("ls", "/sheet.csv", b"local rows");
    h.remote_feed.edit("rs", "/sheet.csv", b"remote rows");
    let config = common::builder()
        .conflicts_default_strategy(Strategy::Manual)
        .conflict_rule("*.txt", Strategy::KeepBoth)
        .build();
    let engine = h.engine_with(&config);

    // The csv is still open, so the txt copy is not moved aside yet
    assert_eq!(engine.run_cycle().await.unwrap(), CycleOutcome::ConflictsPending(1));
    assert!(h.local.calls().is_empty());
    assert!(h.remote.calls().is_empty());
    assert!(!h
        .local_volume
        .paths()
        .iter()
        .any(|path| path.contains("conflicted copy")));
    assert_eq!(h.local_volume.read("/doc.txt").unwrap(), b"local edit");
    assert_eq!(
        h.repository.get_status(JOB, &p("/doc.txt")).await.unwrap(),
        Some(NodeStatus::Solved(Resolution::KeepBoth))
    );

    engine
        .control()
        .submit_resolution(&p("/sheet.csv"), Resolution::KeepLocal)
        .await
        .unwrap();
    let outcome = engine.run_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Completed(_)), "{outcome:?}");

    let aside: Vec<String> = h
        .local_volume
        .paths()
        .into_iter()
        .filter(|path| path.contains("conflicted copy"))
        .collect();
    assert_eq!(aside.len(), 1);
    assert_eq!(h.remote_volume.read(&aside[0]).unwrap(), b"local edit");
    assert_eq!(h.local_volume.read("/doc.txt").unwrap(), b"remote edit");
    assert_eq!(h.remote_volume.read("/sheet.csv").unwrap(), b"local rows");
    assert_eq!(h.remote.count("upload "), 2);
    assert_eq!(h.remote.count("download "), 1);
}
