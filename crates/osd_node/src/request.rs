//! Requests, operations and completions flowing through a stage.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use osd_lease::lease::{CellId, LeaseState, ReplicaDescriptor};
use tokio::sync::oneshot;

use crate::buffer::{PooledBuffer, PAYLOAD_BUFFER_SIZE};
use crate::capability::{Capability, Procedure};
use crate::error::OsdError;
use crate::open_files::{AdvisoryLock, LockOwner};

/// File identifier, `<volume>:<file number>` by convention.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(Arc<str>);

impl FileId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(Arc::from(raw.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Tenant/volume prefix used for quality-of-service grouping.
    pub fn volume(&self) -> &str {
        match self.0.split_once(':') {
            Some((volume, _)) => volume,
            None => &self.0,
        }
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for FileId {
    fn from(raw: String) -> Self {
        Self(Arc::from(raw))
    }
}

/// Byte-range lock request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRequest {
    pub owner: LockOwner,
    pub offset: u64,
    /// Zero locks to the end of the file.
    pub length: u64,
    pub exclusive: bool,
}

impl LockRequest {
    pub fn into_lock(self) -> AdvisoryLock {
        AdvisoryLock {
            owner: self.owner,
            offset: self.offset,
            length: self.length,
            exclusive: self.exclusive,
        }
    }
}

#[derive(Debug)]
pub enum Operation {
    Read { offset: u64, length: u64 },
    /// Payload travels in `StageRequest::payload`.
    Write { offset: u64 },
    Truncate { new_size: u64 },
    Delete,
    AcquireLock(LockRequest),
    CheckLock(LockRequest),
    ReleaseLock(LockOwner),
    /// Invalidate the local replica; the request's replica descriptor names the view.
    InvalidateView { require_current_view: bool },
    // Internal follow-up operations.
    PingFile,
    CheckDeleteOnClose,
    CloseFile,
    ViewIdChanged { cell: CellId, version: u64 },
}

/// Dispatch tag of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
    Truncate,
    Delete,
    AcquireLock,
    CheckLock,
    ReleaseLock,
    InvalidateView,
    PingFile,
    CheckDeleteOnClose,
    CloseFile,
    ViewIdChanged,
}

impl OpKind {
    /// Operations executed by a registered `OperationHandler`.
    pub const HANDLED: [OpKind; 4] = [Self::Read, Self::Write, Self::Truncate, Self::Delete];

    pub fn is_handled(self) -> bool {
        Self::HANDLED.contains(&self)
    }

    /// Follow-up operations only the node itself may issue.
    pub fn is_internal_only(self) -> bool {
        matches!(
            self,
            Self::PingFile | Self::CheckDeleteOnClose | Self::CloseFile | Self::ViewIdChanged
        )
    }
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Read { .. } => OpKind::Read,
            Self::Write { .. } => OpKind::Write,
            Self::Truncate { .. } => OpKind::Truncate,
            Self::Delete => OpKind::Delete,
            Self::AcquireLock(_) => OpKind::AcquireLock,
            Self::CheckLock(_) => OpKind::CheckLock,
            Self::ReleaseLock(_) => OpKind::ReleaseLock,
            Self::InvalidateView { .. } => OpKind::InvalidateView,
            Self::PingFile => OpKind::PingFile,
            Self::CheckDeleteOnClose => OpKind::CheckDeleteOnClose,
            Self::CloseFile => OpKind::CloseFile,
            Self::ViewIdChanged { .. } => OpKind::ViewIdChanged,
        }
    }

    /// Capability check required before the operation runs, if any.
    pub fn procedure(&self) -> Option<Procedure> {
        match self {
            Self::Read { .. } => Some(Procedure::Read),
            Self::Write { .. } => Some(Procedure::Write),
            Self::Truncate { .. } => Some(Procedure::Truncate),
            Self::Delete => Some(Procedure::Delete),
            Self::AcquireLock(_) | Self::CheckLock(_) | Self::ReleaseLock(_) => {
                Some(Procedure::Lock)
            }
            Self::InvalidateView { .. } => Some(Procedure::ReplicaMaintenance),
            Self::PingFile | Self::CheckDeleteOnClose | Self::CloseFile => None,
            Self::ViewIdChanged { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// Client or peer request; subject to admission control.
    External,
    /// Follow-up work the node already committed to; never rejected by the limit.
    Internal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Done,
    Data(Bytes),
    Lock(AdvisoryLock),
    Invalidated(LeaseState),
    DeleteOnClose(bool),
    Pinged { deadline_ms: u64 },
    Closed(bool),
    ViewApplied { adopted: bool },
}

pub type OpResult = Result<Reply, OsdError>;

/// Sending half of a request's completion. Consumed on first use.
#[derive(Debug)]
pub struct Responder(oneshot::Sender<OpResult>);

impl Responder {
    pub fn send(self, result: OpResult) {
        // The caller may have stopped waiting; that is not an error here.
        let _ = self.0.send(result);
    }
}

/// Receiving half of a request's completion.
///
/// Resolves to `StageTerminated` if the request was dropped without an answer.
#[derive(Debug)]
pub struct Completion(oneshot::Receiver<OpResult>);

impl Future for Completion {
    type Output = OpResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(OsdError::StageTerminated)))
    }
}

pub fn completion() -> (Responder, Completion) {
    let (tx, rx) = oneshot::channel();
    (Responder(tx), Completion(rx))
}

/// Upper bound of `StageRequest::cost`.
pub const MAX_REQUEST_COST: u64 = PAYLOAD_BUFFER_SIZE as u64;

/// A typed request queued on a stage.
#[derive(Debug)]
pub struct StageRequest {
    pub file_id: FileId,
    pub op: Operation,
    pub capability: Option<Capability>,
    /// Replica-set view the request was issued against (replicated files only).
    pub replica: Option<ReplicaDescriptor>,
    pub payload: Option<PooledBuffer>,
    pub origin: Origin,
    pub enqueued_at: Instant,
    pub(crate) responder: Responder,
}

impl StageRequest {
    pub fn external(file_id: impl Into<FileId>, op: Operation) -> (Self, Completion) {
        Self::with_origin(file_id.into(), op, Origin::External)
    }

    pub fn internal(file_id: impl Into<FileId>, op: Operation) -> (Self, Completion) {
        Self::with_origin(file_id.into(), op, Origin::Internal)
    }

    fn with_origin(file_id: FileId, op: Operation, origin: Origin) -> (Self, Completion) {
        let (responder, done) = completion();
        let req = Self {
            file_id,
            op,
            capability: None,
            replica: None,
            payload: None,
            origin,
            enqueued_at: Instant::now(),
            responder,
        };
        (req, done)
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }

    pub fn with_replica(mut self, replica: ReplicaDescriptor) -> Self {
        self.replica = Some(replica);
        self
    }

    pub fn with_payload(mut self, payload: PooledBuffer) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Scheduling cost: payload bytes for data transfers, 1 for metadata-only ops.
    /// Never more than one payload buffer, whatever length the client asks for.
    pub fn cost(&self) -> u64 {
        let bytes = match &self.op {
            Operation::Read { length, .. } => *length,
            Operation::Write { .. } => self.payload.as_ref().map_or(0, |p| p.len() as u64),
            _ => 0,
        };
        bytes.clamp(1, MAX_REQUEST_COST)
    }

    /// Complete the request with an error, returning its payload buffer first.
    pub fn fail(mut self, err: OsdError) {
        if let Some(payload) = self.payload.take() {
            payload.release();
        }
        self.responder.send(Err(err));
    }
}
