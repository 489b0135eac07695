//! A single-consumer processing stage.
//!
//! Each stage owns the open-file registry, capability cache and view cache
//! for the files hashed onto it, and processes its queue one request at a
//! time. Handler invocations for a file therefore never overlap and need no
//! locking. A handler fault (error or panic) stops the stage: every request
//! still queued completes with `StageTerminated` and supervision is left to
//! the owner of the `StageHandle`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use futures_util::FutureExt;
use osd_lease::lease::{FileCredentials, LeaseCoordinator, ReplicaDescriptor, ReplicaPolicy};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::buffer::PooledBuffer;
use crate::capability::{Capability, CapabilityValidator, SignatureVerifier};
use crate::config::StageConfig;
use crate::error::{HandlerFailure, OsdError};
use crate::handler::{HandlerCall, HandlerTable};
use crate::open_files::{CowPolicy, OpenFile, OpenFileTable};
use crate::queue::{AdmissionQueue, Dequeued};
use crate::request::{FileId, Operation, Origin, Reply, StageRequest};
use crate::stats::{StageStats, StatsSnapshot};
use crate::storage::StorageEngine;
use crate::unix_time_ms;
use crate::view::ViewController;

/// Notifications about file lifecycle transitions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileEvent {
    Closed {
        file_id: FileId,
        cow_policy: CowPolicy,
        /// The file was written since the last version was created.
        written: bool,
        deleted: bool,
    },
    /// A written file went idle; a new version should be cut.
    VersionCreated { file_id: FileId },
}

/// Collaborators shared by every stage of a pipeline.
#[derive(Clone)]
pub struct StageDeps {
    pub storage: Arc<dyn StorageEngine>,
    pub coordinator: Arc<dyn LeaseCoordinator>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub handlers: Arc<HandlerTable>,
    pub events: Option<mpsc::UnboundedSender<FileEvent>>,
}

pub struct StageHandle {
    shard: usize,
    queue: Arc<AdmissionQueue>,
    stats: Arc<StageStats>,
    task: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
}

impl StageHandle {
    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn submit(&self, req: StageRequest) -> Result<(), OsdError> {
        self.queue.submit(req)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop admitting requests, let the stage drain its queue, and wait for it.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.queue.close();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match task {
            Some(task) => task.await.map_err(|err| anyhow!("stage {} join: {err}", self.shard))?,
            None => Ok(()),
        }
    }
}

pub struct Stage {
    shard: usize,
    config: StageConfig,
    queue: Arc<AdmissionQueue>,
    stats: Arc<StageStats>,
    capabilities: CapabilityValidator,
    open_files: OpenFileTable,
    views: ViewController,
    storage: Arc<dyn StorageEngine>,
    handlers: Arc<HandlerTable>,
    events: Option<mpsc::UnboundedSender<FileEvent>>,
}

impl Stage {
    pub fn spawn(shard: usize, config: StageConfig, deps: StageDeps) -> anyhow::Result<StageHandle> {
        deps.handlers.ensure_complete()?;
        let stats = Arc::new(StageStats::default());
        let queue = Arc::new(AdmissionQueue::new(
            config.queue_capacity,
            config.scheduling.discipline(),
            stats.clone(),
        ));
        let stage = Stage {
            shard,
            capabilities: CapabilityValidator::new(
                deps.verifier,
                config.capability_cache,
                config.ignore_capabilities,
            ),
            open_files: OpenFileTable::new(),
            views: ViewController::new(deps.storage.clone(), deps.coordinator, config.view_cache),
            storage: deps.storage,
            handlers: deps.handlers,
            events: deps.events,
            queue: queue.clone(),
            stats: stats.clone(),
            config,
        };
        let task = tokio::spawn(stage.run());
        Ok(StageHandle {
            shard,
            queue,
            stats,
            task: Mutex::new(Some(task)),
        })
    }

    async fn run(mut self) -> anyhow::Result<()> {
        info!(shard = self.shard, capacity = self.queue.capacity(), "stage started");
        let mut next_sweep = Instant::now() + self.config.sweep_interval;
        loop {
            if Instant::now() >= next_sweep {
                self.sweep();
                next_sweep = Instant::now() + self.config.sweep_interval;
            }
            match self.queue.next(next_sweep).await {
                Dequeued::Request(req) => {
                    if let Err(err) = self.dispatch(req).await {
                        self.stats.record_fault();
                        let pending = self.queue.close_and_drain();
                        error!(
                            shard = self.shard,
                            pending = pending.len(),
                            error = ?err,
                            "stage fault, terminating"
                        );
                        for req in pending {
                            req.fail(OsdError::StageTerminated);
                        }
                        return Err(err);
                    }
                }
                Dequeued::TimedOut => {}
                Dequeued::Closed => break,
            }
        }
        info!(shard = self.shard, "stage stopped");
        Ok(())
    }

    /// Process one request. `Err` means the stage must stop.
    async fn dispatch(&mut self, req: StageRequest) -> anyhow::Result<()> {
        let StageRequest {
            file_id,
            op,
            capability,
            replica,
            payload,
            origin,
            responder,
            ..
        } = req;
        let kind = op.kind();
        self.stats.record_processed();

        let outcome = match op {
            _ if origin == Origin::External && kind.is_internal_only() => {
                if let Some(payload) = payload {
                    payload.release();
                }
                Err(HandlerFailure::Rejected(OsdError::InvalidArgument(format!(
                    "{kind:?} is not a client operation"
                ))))
            }
            Operation::PingFile => self.ping_file(&file_id),
            Operation::CheckDeleteOnClose => Ok(Reply::DeleteOnClose(
                self.open_files.set_delete_on_close(&file_id),
            )),
            Operation::CloseFile => Ok(Reply::Closed(self.close_file(&file_id))),
            Operation::ViewIdChanged { version, .. } => self
                .views
                .on_external_view_change(&file_id, version)
                .await
                .map(|adopted| Reply::ViewApplied { adopted })
                .map_err(HandlerFailure::Rejected),
            op => {
                self.process(file_id.clone(), op, capability, replica, payload)
                    .await
            }
        };

        match outcome {
            Ok(reply) => {
                responder.send(Ok(reply));
                Ok(())
            }
            Err(HandlerFailure::Rejected(err)) => {
                debug!(shard = self.shard, file_id = %file_id, op = ?kind, error = %err, "request rejected");
                self.stats.record_rejected();
                responder.send(Err(err));
                Ok(())
            }
            Err(HandlerFailure::Fault(err)) => {
                responder.send(Err(OsdError::Internal(format!("{err:#}"))));
                Err(err.context(format!("{kind:?} on {file_id}")))
            }
        }
    }

    async fn process(
        &mut self,
        file_id: FileId,
        op: Operation,
        capability: Option<Capability>,
        replica: Option<ReplicaDescriptor>,
        payload: Option<PooledBuffer>,
    ) -> Result<Reply, HandlerFailure> {
        if file_id.is_empty() {
            return Err(OsdError::InvalidArgument("file id must not be empty".to_string()).into());
        }
        let now = unix_time_ms();

        if let Some(procedure) = op.procedure() {
            match &capability {
                Some(cap) => self.capabilities.validate(cap, &file_id, procedure, now)?,
                None if self.capabilities.ignores_capabilities() => {}
                None => {
                    return Err(OsdError::InvalidArgument(
                        "request requires a capability".to_string(),
                    )
                    .into());
                }
            }
        }

        let invalidation = matches!(op, Operation::InvalidateView { .. });
        if let Some(replica) = replica.as_ref().filter(|_| !invalidation) {
            if replica.policy != ReplicaPolicy::Single {
                self.views.validate_view(&file_id, replica).await?;
            }
        }

        let deadline = now.saturating_add(self.config.open_extension.as_millis() as u64);
        let (cow_policy, newly_opened) =
            self.open_files
                .open_or_refresh(&file_id, capability.as_ref(), deadline);
        self.stats.set_open_files(self.open_files.len());
        if newly_opened {
            debug!(shard = self.shard, file_id = %file_id, ?cow_policy, "opened file");
        }

        match op {
            Operation::AcquireLock(lock) => Ok(Reply::Lock(
                self.open_files.acquire_lock(&file_id, lock.into_lock())?,
            )),
            Operation::CheckLock(lock) => Ok(Reply::Lock(
                self.open_files.check_lock(&file_id, lock.into_lock())?,
            )),
            Operation::ReleaseLock(owner) => {
                self.open_files.release_lock(&file_id, &owner)?;
                Ok(Reply::Done)
            }
            Operation::InvalidateView {
                require_current_view,
            } => {
                let replica = replica.ok_or_else(|| {
                    OsdError::InvalidArgument("invalidation requires a replica view".to_string())
                })?;
                let credentials = capability.as_ref().map_or_else(
                    || FileCredentials {
                        subject: String::new(),
                        signature: String::new(),
                    },
                    Capability::credentials,
                );
                let lease = self
                    .views
                    .invalidate(&file_id, &replica, &credentials, require_current_view)
                    .await?;
                Ok(Reply::Invalidated(lease))
            }
            op => {
                let kind = op.kind();
                let handler = self
                    .handlers
                    .get(kind)
                    .cloned()
                    .ok_or_else(|| HandlerFailure::Fault(anyhow!("no handler for {kind:?}")))?;
                let call = HandlerCall {
                    file_id,
                    op,
                    capability,
                    cow_policy,
                    newly_opened,
                    payload,
                };
                match AssertUnwindSafe(handler.handle(call)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => Err(HandlerFailure::Fault(anyhow!(
                        "{kind:?} handler panicked: {}",
                        panic_message(panic.as_ref())
                    ))),
                }
            }
        }
    }

    fn ping_file(&mut self, file_id: &FileId) -> Result<Reply, HandlerFailure> {
        let deadline = unix_time_ms().saturating_add(self.config.open_extension.as_millis() as u64);
        if self.open_files.refresh(file_id, deadline, false).is_none() {
            return Err(OsdError::NotOpen(file_id.to_string()).into());
        }
        let deadline_ms = self
            .open_files
            .get(file_id)
            .map_or(deadline, OpenFile::deadline_ms);
        Ok(Reply::Pinged { deadline_ms })
    }

    fn close_file(&mut self, file_id: &FileId) -> bool {
        match self.open_files.close(file_id) {
            Some(entry) => {
                self.finish_close(entry);
                self.stats.set_open_files(self.open_files.len());
                true
            }
            None => false,
        }
    }

    fn sweep(&mut self) {
        let report = self.open_files.sweep(unix_time_ms());
        // Capabilities of requests refused before their file was opened.
        let open_files = &self.open_files;
        let stale = self.capabilities.retain_files(|file_id| {
            open_files.contains(file_id) || report.closed.iter().any(|entry| entry.file_id() == file_id)
        });
        if stale > 0 {
            debug!(shard = self.shard, dropped_capabilities = stale, "evicted capabilities of files not open");
        }
        if report.closed.is_empty() && report.versioned.is_empty() {
            return;
        }
        debug!(
            shard = self.shard,
            closed = report.closed.len(),
            versioned = report.versioned.len(),
            "open file sweep"
        );
        for entry in report.closed {
            self.finish_close(entry);
        }
        for file_id in report.versioned {
            self.emit(FileEvent::VersionCreated { file_id });
        }
        self.stats.set_open_files(self.open_files.len());
    }

    fn finish_close(&mut self, entry: OpenFile) {
        let file_id = entry.file_id().clone();
        let dropped = self.capabilities.forget_file(&file_id);
        self.views.forget(&file_id);

        let mut deleted = false;
        if entry.delete_on_close() {
            match self.storage.delete_file(&file_id) {
                Ok(()) => deleted = true,
                Err(err) => {
                    warn!(shard = self.shard, file_id = %file_id, error = ?err, "delete on close failed")
                }
            }
        }
        debug!(shard = self.shard, file_id = %file_id, dropped_capabilities = dropped, deleted, "closed file");
        self.emit(FileEvent::Closed {
            file_id,
            cow_policy: entry.cow_policy(),
            written: entry.is_written(),
            deleted,
        });
    }

    fn emit(&self, event: FileEvent) {
        if let Some(events) = &self.events {
            // Nobody listening is fine.
            let _ = events.send(event);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
