//! Admission control, capability checks and stage fault handling.

mod common;

use std::time::Duration;

use common::{stage_config, wait_until, Harness, RecordingHandler};
use osd_node::capability::AccessMode;
use osd_node::config::StageConfig;
use osd_lease::lease::CellId;
use osd_node::error::CapabilityError;
use osd_node::storage::{StorageEngine, ViewRecord};
use osd_node::{unix_time_ms, Completion, FileId, Operation, OsdError, Reply, StageRequest};

fn read_request(harness: &Harness, file_id: &str, offset: u64) -> (StageRequest, Completion) {
    let (req, done) = StageRequest::external(file_id, Operation::Read { offset, length: 8 });
    (req.with_capability(harness.capability(file_id, AccessMode::RDWR)), done)
}

async fn finish(done: Completion) -> Result<Reply, OsdError> {
    tokio::time::timeout(common::WAIT_TIMEOUT, done)
        .await
        .expect("request timed out")
}

#[tokio::test]
async fn full_queue_refuses_external_requests_only() {
    let harness = Harness::with_recorder(
        1,
        StageConfig {
            queue_capacity: 2,
            ..stage_config()
        },
        RecordingHandler::gated(),
    );

    // The first request occupies the stage; two more fill the queue.
    let (req, first) = read_request(&harness, "vol:1", 0);
    harness.pipeline.submit(req).unwrap();
    wait_until(|| harness.recorder.calls().len() == 1).await;
    let mut queued = Vec::new();
    for offset in [8, 16] {
        let (req, done) = read_request(&harness, "vol:1", offset);
        harness.pipeline.submit(req).unwrap();
        queued.push(done);
    }

    let payload = harness.pipeline.buffers().copy_from(b"rejected bytes");
    assert_eq!(harness.pipeline.buffers().outstanding(), 1);
    let (req, refused) = StageRequest::external("vol:1", Operation::Write { offset: 0 });
    let req = req
        .with_capability(harness.capability("vol:1", AccessMode::RDWR))
        .with_payload(payload);
    let err = harness.pipeline.submit(req).unwrap_err();
    assert_eq!(err, OsdError::Overloaded { depth: 2 });
    assert_eq!(finish(refused).await, Err(OsdError::Overloaded { depth: 2 }));
    assert_eq!(harness.pipeline.buffers().outstanding(), 0);

    // Follow-up work the node already committed to is still admitted.
    let ping = harness
        .pipeline
        .submit_internal("vol:1".into(), Operation::PingFile)
        .unwrap();

    harness.recorder.release(3);
    finish(first).await.unwrap();
    for done in queued {
        finish(done).await.unwrap();
    }
    assert!(matches!(finish(ping).await, Ok(Reply::Pinged { .. })));

    let stats = harness.pipeline.stats();
    assert_eq!(stats.overloaded, 1);
    assert_eq!(stats.processed, 4);
    assert!(harness.pipeline.failed_shards().is_empty());
}

#[tokio::test]
async fn expired_cached_capability_is_rejected() {
    let harness = Harness::with_recorder(1, stage_config(), RecordingHandler::new());
    let cap = harness.capability_until("vol:1", AccessMode::RDWR, unix_time_ms() + 150);

    let (req, done) = StageRequest::external("vol:1", Operation::Read { offset: 0, length: 8 });
    harness
        .call(req.with_capability(cap.clone()), done)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let (req, done) = StageRequest::external("vol:1", Operation::Read { offset: 0, length: 8 });
    let err = harness
        .call(req.with_capability(cap), done)
        .await
        .unwrap_err();
    assert_eq!(err, OsdError::InvalidCapability(CapabilityError::Expired));
    assert_eq!(harness.recorder.calls().len(), 1);
}

#[tokio::test]
async fn capability_checks_run_before_the_handler() {
    let harness = Harness::with_recorder(1, stage_config(), RecordingHandler::new());

    // Read-only capabilities cannot write.
    let (req, done) = StageRequest::external("vol:1", Operation::Write { offset: 0 });
    let err = harness
        .call(
            req.with_capability(harness.capability("vol:1", AccessMode::RDONLY)),
            done,
        )
        .await
        .unwrap_err();
    assert_eq!(err, OsdError::InvalidCapability(CapabilityError::InsufficientMode));

    // A capability issued for another file.
    let (req, done) = StageRequest::external("vol:1", Operation::Read { offset: 0, length: 8 });
    let err = harness
        .call(
            req.with_capability(harness.capability("vol:2", AccessMode::RDWR)),
            done,
        )
        .await
        .unwrap_err();
    assert_eq!(err, OsdError::InvalidCapability(CapabilityError::WrongFile));

    // Tampered signature.
    let mut forged = harness.capability("vol:1", AccessMode::RDONLY);
    forged.access_mode = AccessMode::RDWR;
    let (req, done) = StageRequest::external("vol:1", Operation::Delete);
    let err = harness
        .call(req.with_capability(forged), done)
        .await
        .unwrap_err();
    assert_eq!(err, OsdError::InvalidCapability(CapabilityError::BadSignature));

    // No capability at all.
    let (req, done) = StageRequest::external("vol:1", Operation::Read { offset: 0, length: 8 });
    let err = harness.call(req, done).await.unwrap_err();
    assert!(matches!(err, OsdError::InvalidArgument(_)));

    assert!(harness.recorder.calls().is_empty());
    assert_eq!(harness.pipeline.stats().rejected, 4);
}

#[tokio::test]
async fn forged_capability_is_rejected_after_the_genuine_one_was_cached() {
    let harness = Harness::with_recorder(1, stage_config(), RecordingHandler::new());
    let genuine = harness.capability("vol:1", AccessMode::RDONLY);
    let (req, done) = StageRequest::external("vol:1", Operation::Read { offset: 0, length: 8 });
    harness
        .call(req.with_capability(genuine.clone()), done)
        .await
        .unwrap();

    // Same signature, escalated mode and lifetime.
    let mut forged = genuine;
    forged.access_mode = AccessMode::RDWR;
    forged.expires_ms = u64::MAX;
    let (req, done) = StageRequest::external("vol:1", Operation::Delete);
    let err = harness
        .call(req.with_capability(forged), done)
        .await
        .unwrap_err();
    assert_eq!(err, OsdError::InvalidCapability(CapabilityError::BadSignature));
    assert_eq!(harness.recorder.calls().len(), 1);
}

#[tokio::test]
async fn clients_cannot_issue_follow_up_operations() {
    let mut harness = Harness::with_recorder(1, stage_config(), RecordingHandler::new());
    let file = FileId::new("vol:1");
    harness
        .storage
        .set_view_record(
            &file,
            &ViewRecord {
                version: 3,
                invalidated: false,
                modified_ms: 0,
            },
        )
        .unwrap();
    harness.read("vol:1", Some(3)).await.unwrap();

    let follow_ups = [
        Operation::CheckDeleteOnClose,
        Operation::CloseFile,
        Operation::PingFile,
        Operation::ViewIdChanged {
            cell: CellId::for_file("vol:1"),
            version: 9,
        },
    ];
    for op in follow_ups {
        let (req, done) = StageRequest::external("vol:1", op);
        let err = harness
            .call(
                req.with_capability(harness.capability("vol:1", AccessMode::RDWR)),
                done,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OsdError::InvalidArgument(_)), "{err:?}");
    }

    // Nothing was marked, closed or installed.
    assert_eq!(harness.pipeline.stats().open_files, 1);
    assert_eq!(harness.pipeline.stats().rejected, 4);
    assert!(harness.try_next_event().is_none());
    let record = harness.storage.view_record(&file).unwrap();
    assert_eq!((record.version, record.invalidated), (3, false));
    assert_eq!(
        harness
            .pipeline
            .submit_internal(file.clone(), Operation::CloseFile)
            .unwrap()
            .await,
        Ok(Reply::Closed(true))
    );
    assert!(matches!(
        harness.next_event().await,
        osd_node::FileEvent::Closed { deleted: false, .. }
    ));
}

#[tokio::test]
async fn ignored_capabilities_admit_bare_requests() {
    let harness = Harness::with_recorder(
        1,
        StageConfig {
            ignore_capabilities: true,
            ..stage_config()
        },
        RecordingHandler::new(),
    );
    let (req, done) = StageRequest::external("vol:1", Operation::Read { offset: 0, length: 8 });
    harness.call(req, done).await.unwrap();
    assert_eq!(harness.recorder.calls().len(), 1);
}

#[tokio::test]
async fn empty_file_id_is_invalid() {
    let harness = Harness::with_recorder(1, stage_config(), RecordingHandler::new());
    let (req, done) = StageRequest::external("", Operation::Read { offset: 0, length: 8 });
    let err = harness
        .call(req.with_capability(harness.capability("", AccessMode::RDWR)), done)
        .await
        .unwrap_err();
    assert!(matches!(err, OsdError::InvalidArgument(_)));
}

async fn assert_stage_terminates(recorder: RecordingHandler, inject: impl FnOnce(&RecordingHandler)) {
    let harness = Harness::with_recorder(1, stage_config(), recorder);
    inject(&harness.recorder);

    let (req, failing) = read_request(&harness, "vol:bad", 0);
    harness.pipeline.submit(req).unwrap();
    wait_until(|| harness.recorder.calls().len() == 1).await;
    let (req, queued) = read_request(&harness, "vol:other", 0);
    harness.pipeline.submit(req).unwrap();
    harness.recorder.release(1);

    assert!(matches!(finish(failing).await, Err(OsdError::Internal(_))));
    assert_eq!(finish(queued).await, Err(OsdError::StageTerminated));
    wait_until(|| harness.pipeline.failed_shards() == vec![0]).await;
    assert_eq!(harness.pipeline.stats().faults, 1);

    let (req, done) = read_request(&harness, "vol:later", 0);
    assert_eq!(
        harness.pipeline.submit(req).unwrap_err(),
        OsdError::StageTerminated
    );
    assert_eq!(finish(done).await, Err(OsdError::StageTerminated));
    assert!(harness.pipeline.shutdown().await.is_err());
}

#[tokio::test]
async fn handler_fault_terminates_the_stage() {
    assert_stage_terminates(RecordingHandler::gated(), |recorder| recorder.fault_on("vol:bad")).await;
}

#[tokio::test]
async fn handler_panic_terminates_the_stage() {
    assert_stage_terminates(RecordingHandler::gated(), |recorder| recorder.panic_on("vol:bad")).await;
}

#[tokio::test]
async fn rejections_do_not_stop_the_stage() {
    let harness = Harness::with_recorder(1, stage_config(), RecordingHandler::new());
    for _ in 0..3 {
        let (req, done) = StageRequest::external("vol:1", Operation::Read { offset: 0, length: 8 });
        assert!(harness.call(req, done).await.is_err());
    }
    harness.read("vol:1", None).await.unwrap();
    assert!(harness.pipeline.failed_shards().is_empty());
    assert_eq!(harness.pipeline.stats().faults, 0);
    harness.pipeline.shutdown().await.unwrap();
}
