//! Shared helpers for integration tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use osd_lease::lease::{LocalCoordinator, ReplicaDescriptor, ReplicaPolicy};
use osd_node::capability::{AccessMode, Capability, Sha256Signer};
use osd_node::config::{PipelineConfig, StageConfig};
use osd_node::error::HandlerFailure;
use osd_node::handler::{HandlerCall, HandlerTable, ObjectHandler, OperationHandler};
use osd_node::request::{OpKind, OpResult};
use osd_node::storage::{MemoryStorage, StorageEngine};
use osd_node::{unix_time_ms, FileEvent, FileId, Operation, Pipeline, Reply, StageDeps, StageRequest};
use tokio::sync::{mpsc, Semaphore};

/// Upper bound for anything a test waits on.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Stage settings that keep the sweep out of the way unless a test wants it.
pub fn stage_config() -> StageConfig {
    StageConfig {
        queue_capacity: 64,
        open_extension: Duration::from_secs(30),
        sweep_interval: Duration::from_secs(3600),
        ..StageConfig::default()
    }
}

pub fn replica(version: u64) -> ReplicaDescriptor {
    ReplicaDescriptor {
        version,
        policy: ReplicaPolicy::WriteQuorumReadQuorum,
        replicas: vec!["osd-a".to_string(), "osd-b".to_string(), "osd-c".to_string()],
    }
}

/// One handler invocation seen by `RecordingHandler`.
#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub file_id: FileId,
    pub kind: OpKind,
    pub offset: Option<u64>,
}

/// Handler that records invocations and per-file overlap, with optional
/// gating and fault injection.
#[derive(Default)]
pub struct RecordingHandler {
    active: Mutex<HashMap<FileId, usize>>,
    max_overlap: AtomicUsize,
    calls: Mutex<Vec<RecordedCall>>,
    delay: Duration,
    gate: Option<Semaphore>,
    fault_on: Mutex<Option<FileId>>,
    panic_on: Mutex<Option<FileId>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Every invocation waits for a permit from `release`.
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn fault_on(&self, file_id: &str) {
        *self.fault_on.lock().unwrap() = Some(FileId::new(file_id));
    }

    pub fn panic_on(&self, file_id: &str) {
        *self.panic_on.lock().unwrap() = Some(FileId::new(file_id));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_overlap(&self) -> usize {
        self.max_overlap.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OperationHandler for RecordingHandler {
    async fn handle(&self, call: HandlerCall) -> Result<Reply, HandlerFailure> {
        let file_id = call.file_id.clone();
        {
            let mut active = self.active.lock().unwrap();
            let running = active.entry(file_id.clone()).or_default();
            *running += 1;
            self.max_overlap.fetch_max(*running, Ordering::SeqCst);
        }
        let offset = match &call.op {
            Operation::Read { offset, .. } | Operation::Write { offset } => Some(*offset),
            _ => None,
        };
        self.calls.lock().unwrap().push(RecordedCall {
            file_id: file_id.clone(),
            kind: call.op.kind(),
            offset,
        });

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        tokio::task::yield_now().await;

        *self.active.lock().unwrap().get_mut(&file_id).unwrap() -= 1;

        if self.panic_on.lock().unwrap().as_ref() == Some(&file_id) {
            panic!("injected panic for {file_id}");
        }
        if self.fault_on.lock().unwrap().as_ref() == Some(&file_id) {
            return Err(HandlerFailure::Fault(anyhow::anyhow!("injected fault for {file_id}")));
        }
        if let Some(payload) = call.payload {
            payload.release();
        }
        match call.op {
            Operation::Read { .. } => Ok(Reply::Data(Bytes::new())),
            _ => Ok(Reply::Done),
        }
    }
}

pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub storage: Arc<dyn StorageEngine>,
    pub memory: Option<Arc<MemoryStorage>>,
    pub coordinator: Arc<LocalCoordinator>,
    pub signer: Arc<Sha256Signer>,
    pub recorder: Arc<RecordingHandler>,
    events: mpsc::UnboundedReceiver<FileEvent>,
}

impl Harness {
    /// Pipeline over in-memory storage with `recorder` handling every data operation.
    pub fn with_recorder(shards: usize, stage: StageConfig, recorder: RecordingHandler) -> Self {
        let memory = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(recorder);
        let mut harness = Self::build(shards, stage, memory.clone(), recorder.clone(), recorder);
        harness.memory = Some(memory);
        harness
    }

    /// Pipeline with the object data path over `storage`.
    pub fn with_objects(shards: usize, stage: StageConfig, storage: Arc<dyn StorageEngine>) -> Self {
        let handler = Arc::new(ObjectHandler::new(storage.clone(), 16));
        Self::build(shards, stage, storage, handler, Arc::new(RecordingHandler::new()))
    }

    fn build(
        shards: usize,
        stage: StageConfig,
        storage: Arc<dyn StorageEngine>,
        handler: Arc<dyn OperationHandler>,
        recorder: Arc<RecordingHandler>,
    ) -> Self {
        let coordinator = Arc::new(LocalCoordinator::new());
        let signer = Arc::new(Sha256Signer::new("test-secret"));
        let (events_tx, events) = mpsc::unbounded_channel();
        let pipeline = Pipeline::start(
            PipelineConfig { shards, stage },
            StageDeps {
                storage: storage.clone(),
                coordinator: coordinator.clone(),
                verifier: signer.clone(),
                handlers: Arc::new(HandlerTable::uniform(handler)),
                events: Some(events_tx),
            },
        )
        .expect("start pipeline");
        coordinator.subscribe(pipeline.clone());
        Self {
            pipeline,
            storage,
            memory: None,
            coordinator,
            signer,
            recorder,
            events,
        }
    }

    pub fn capability(&self, file_id: &str, mode: AccessMode) -> Capability {
        self.capability_until(file_id, mode, unix_time_ms() + 60_000)
    }

    pub fn capability_until(&self, file_id: &str, mode: AccessMode, expires_ms: u64) -> Capability {
        self.signer.sign(Capability {
            subject: "tester".to_string(),
            file_id: file_id.to_string(),
            access_mode: mode,
            expires_ms,
            epoch: 0,
            priority: 0,
            snapshots_enabled: false,
            signature: String::new(),
        })
    }

    /// Submit and wait for the outcome; refusals surface through the completion.
    pub async fn call(&self, req: StageRequest, done: impl Future<Output = OpResult>) -> OpResult {
        let _ = self.pipeline.submit(req);
        tokio::time::timeout(WAIT_TIMEOUT, done)
            .await
            .expect("request timed out")
    }

    /// Read with a fresh read-write capability against `view`.
    pub async fn read(&self, file_id: &str, view: Option<u64>) -> OpResult {
        let (req, done) = StageRequest::external(file_id, Operation::Read { offset: 0, length: 16 });
        let mut req = req.with_capability(self.capability(file_id, AccessMode::RDWR));
        if let Some(version) = view {
            req = req.with_replica(replica(version));
        }
        self.call(req, done).await
    }

    /// Internal op used to wait until everything queued before it on the
    /// file's stage has been processed.
    pub async fn barrier(&self, file_id: &str) {
        let (req, done) = StageRequest::internal(file_id, Operation::PingFile);
        let _ = self.call(req, done).await;
    }

    pub async fn next_event(&mut self) -> FileEvent {
        tokio::time::timeout(WAIT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for file event")
            .expect("event channel closed")
    }

    pub fn try_next_event(&mut self) -> Option<FileEvent> {
        self.events.try_recv().ok()
    }
}

/// Poll `check` until it holds or the wait times out.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
