//! Replica view checks through the full pipeline.

mod common;

use std::sync::Arc;

use common::{replica, stage_config, wait_until, Harness, RecordingHandler};
use osd_lease::lease::{CellId, CoordinatorCall, LeaseState, ViewState};
use osd_node::capability::AccessMode;
use osd_node::error::ViewRejection;
use osd_node::storage::{StorageEngine, ViewRecord};
use osd_node::{FileId, Operation, OsdError, Reply, StageRequest};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn harness() -> Harness {
    Harness::with_recorder(2, stage_config(), RecordingHandler::new())
}

fn seed_view(harness: &Harness, file_id: &str, version: u64, invalidated: bool) {
    harness
        .storage
        .set_view_record(
            &FileId::new(file_id),
            &ViewRecord {
                version,
                invalidated,
                modified_ms: 0,
            },
        )
        .unwrap();
}

fn stored(harness: &Harness, file_id: &str) -> ViewRecord {
    harness.storage.view_record(&FileId::new(file_id)).unwrap()
}

async fn invalidate(harness: &Harness, file_id: &str, version: u64, require_current: bool) -> Result<Reply, OsdError> {
    let (req, done) = StageRequest::external(
        file_id,
        Operation::InvalidateView {
            require_current_view: require_current,
        },
    );
    let req = req
        .with_capability(harness.capability(file_id, AccessMode::RDWR))
        .with_replica(replica(version));
    harness.call(req, done).await
}

#[tokio::test]
async fn outdated_request_never_reaches_the_handler() {
    let harness = harness();
    seed_view(&harness, "vol:1", 3, false);

    let err = harness.read("vol:1", Some(2)).await.unwrap_err();
    assert_eq!(
        err,
        OsdError::InvalidView(ViewRejection::Outdated {
            request: 2,
            current: 3
        })
    );
    assert!(harness.recorder.calls().is_empty());
    assert_eq!(stored(&harness, "vol:1").version, 3);
}

#[tokio::test]
async fn newer_view_is_adopted_before_the_handler_runs() {
    let harness = harness();
    seed_view(&harness, "vol:1", 3, false);

    harness.read("vol:1", Some(5)).await.unwrap();

    let record = stored(&harness, "vol:1");
    assert_eq!((record.version, record.invalidated), (5, false));
    assert_eq!(harness.recorder.calls().len(), 1);
    assert!(harness.coordinator.calls().contains(&CoordinatorCall::SetView {
        cell: CellId::for_file("vol:1"),
        file_id: "vol:1".to_string(),
        view: ViewState::valid(5),
    }));
}

#[tokio::test]
async fn unreplicated_requests_skip_the_view_check() {
    let harness = harness();
    seed_view(&harness, "vol:1", 3, true);
    harness.read("vol:1", None).await.unwrap();
    assert_eq!(harness.recorder.calls().len(), 1);
}

#[tokio::test]
async fn announced_view_is_installed_once() {
    let harness = harness();
    seed_view(&harness, "vol:1", 3, false);
    let cell = CellId::for_file("vol:1");

    harness.coordinator.announce(&cell, 7);
    wait_until(|| stored(&harness, "vol:1").version == 7).await;

    // Duplicate and stale announcements change nothing.
    harness.coordinator.announce(&cell, 7);
    harness.coordinator.announce(&cell, 6);
    harness.barrier("vol:1").await;

    let record = stored(&harness, "vol:1");
    assert_eq!((record.version, record.invalidated), (7, false));
    let echoes = harness
        .coordinator
        .calls()
        .into_iter()
        .filter(|call| matches!(call, CoordinatorCall::SetView { .. }))
        .count();
    assert_eq!(echoes, 1);

    // Requests based on the superseded view are now refused.
    assert!(harness.read("vol:1", Some(3)).await.is_err());
    harness.read("vol:1", Some(7)).await.unwrap();
}

#[tokio::test]
async fn invalidation_blocks_the_current_view() {
    let harness = harness();
    seed_view(&harness, "vol:1", 3, false);
    harness.coordinator.set_lease_state("vol:1", LeaseState::Primary);

    assert_eq!(
        invalidate(&harness, "vol:1", 3, true).await.unwrap(),
        Reply::Invalidated(LeaseState::Primary)
    );
    assert!(stored(&harness, "vol:1").invalidated);

    let err = harness.read("vol:1", Some(3)).await.unwrap_err();
    assert_eq!(
        err,
        OsdError::InvalidView(ViewRejection::Invalidated { current: 3 })
    );

    // Repeating the invalidation is idempotent.
    invalidate(&harness, "vol:1", 3, true).await.unwrap();
    let record = stored(&harness, "vol:1");
    assert_eq!((record.version, record.invalidated), (3, true));

    harness.read("vol:1", Some(4)).await.unwrap();
    let record = stored(&harness, "vol:1");
    assert_eq!((record.version, record.invalidated), (4, false));
}

#[tokio::test]
async fn invalidation_with_stale_view_is_refused_when_current_view_required() {
    let harness = harness();
    seed_view(&harness, "vol:1", 5, false);

    let err = invalidate(&harness, "vol:1", 4, true).await.unwrap_err();
    assert!(matches!(err, OsdError::InvalidView(ViewRejection::Outdated { .. })));
    assert!(!stored(&harness, "vol:1").invalidated);
}

#[tokio::test]
async fn persistence_failure_is_reported_and_leaves_state_unchanged() {
    let harness = harness();
    seed_view(&harness, "vol:1", 2, false);
    let memory = Arc::clone(harness.memory.as_ref().unwrap());
    memory.fail_view_writes(true);

    let err = harness.read("vol:1", Some(3)).await.unwrap_err();
    assert!(matches!(err, OsdError::Io(_)));
    assert!(harness.recorder.calls().is_empty());

    memory.fail_view_writes(false);
    let err = harness.read("vol:1", Some(1)).await.unwrap_err();
    assert_eq!(
        err,
        OsdError::InvalidView(ViewRejection::Outdated {
            request: 1,
            current: 2
        })
    );
}

#[tokio::test]
async fn random_view_traffic_keeps_versions_monotonic() {
    let harness = harness();
    let file = "vol:42";
    let cell = CellId::for_file(file);
    let mut rng = SmallRng::seed_from_u64(0x5eed);
    let mut last = stored(&harness, file);

    for _ in 0..300 {
        let version = rng.gen_range(0..20u64);
        let before = stored(&harness, file);
        match rng.gen_range(0..3) {
            0 => {
                let res = harness.read(file, Some(version)).await;
                if before.invalidated && version <= before.version {
                    assert!(res.is_err(), "invalidated replica served view {version}");
                }
                if res.is_ok() {
                    assert!(version >= before.version);
                }
            }
            1 => {
                let _ = invalidate(&harness, file, version, rng.gen_bool(0.5)).await;
            }
            _ => {
                harness.coordinator.announce(&cell, version);
                harness.barrier(file).await;
            }
        }
        let now = stored(&harness, file);
        assert!(now.version >= last.version, "view moved backwards");
        last = now;
    }
}
