//! Operation handlers invoked by a stage once a request has been admitted,
//! authorized, and view-checked.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::capability::Capability;
use crate::error::{HandlerFailure, OsdError};
use crate::open_files::CowPolicy;
use crate::request::{FileId, OpKind, Operation, Reply};
use crate::storage::StorageEngine;

/// Everything a handler gets to see about one request.
#[derive(Debug)]
pub struct HandlerCall {
    pub file_id: FileId,
    pub op: Operation,
    pub capability: Option<Capability>,
    pub cow_policy: CowPolicy,
    /// The request opened the file.
    pub newly_opened: bool,
    pub payload: Option<crate::buffer::PooledBuffer>,
}

/// Executes one operation kind. Calls for the same file never overlap.
#[async_trait]
pub trait OperationHandler: Send + Sync + 'static {
    async fn handle(&self, call: HandlerCall) -> Result<Reply, HandlerFailure>;
}

/// Dispatch table keyed by operation kind, built once per pipeline.
#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<OpKind, Arc<dyn OperationHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route every handled operation kind to `handler`.
    pub fn uniform(handler: Arc<dyn OperationHandler>) -> Self {
        let mut table = Self::new();
        for kind in OpKind::HANDLED {
            table = table.register(kind, handler.clone());
        }
        table
    }

    pub fn register(mut self, kind: OpKind, handler: Arc<dyn OperationHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: OpKind) -> Option<&Arc<dyn OperationHandler>> {
        self.handlers.get(&kind)
    }

    /// Every handled operation kind must have a handler.
    pub fn ensure_complete(&self) -> anyhow::Result<()> {
        let missing: Vec<OpKind> = OpKind::HANDLED
            .into_iter()
            .filter(|kind| !self.handlers.contains_key(kind))
            .collect();
        anyhow::ensure!(missing.is_empty(), "no handler registered for {missing:?}");
        Ok(())
    }
}

/// Default data path: files striped over fixed-size objects in a
/// `StorageEngine`.
pub struct ObjectHandler {
    storage: Arc<dyn StorageEngine>,
    object_size: u64,
}

impl ObjectHandler {
    pub fn new(storage: Arc<dyn StorageEngine>, object_size: u64) -> Self {
        Self {
            storage,
            object_size: object_size.max(1),
        }
    }

    fn io(file_id: &FileId, err: anyhow::Error) -> HandlerFailure {
        HandlerFailure::Rejected(OsdError::Io(format!("{file_id}: {err:#}")))
    }

    fn file_size(&self, file_id: &FileId) -> anyhow::Result<u64> {
        let Some(&last) = self.storage.object_numbers(file_id)?.last() else {
            return Ok(0);
        };
        let len = self
            .storage
            .read_object(file_id, last)?
            .map_or(0, |data| data.len() as u64);
        Ok(last * self.object_size + len)
    }

    fn read(&self, file_id: &FileId, offset: u64, length: u64) -> anyhow::Result<Bytes> {
        let end = offset.saturating_add(length).min(self.file_size(file_id)?);
        let mut out = Vec::with_capacity(end.saturating_sub(offset) as usize);
        let mut pos = offset;
        while pos < end {
            let object_no = pos / self.object_size;
            let within = (pos % self.object_size) as usize;
            let take = (self.object_size - within as u64).min(end - pos) as usize;
            let data = self.storage.read_object(file_id, object_no)?.unwrap_or_default();
            let mut chunk = vec![0u8; take];
            if within < data.len() {
                let available = (data.len() - within).min(take);
                chunk[..available].copy_from_slice(&data[within..within + available]);
            }
            out.extend_from_slice(&chunk);
            pos += take as u64;
        }
        Ok(Bytes::from(out))
    }

    fn write(&self, file_id: &FileId, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let mut pos = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let object_no = pos / self.object_size;
            let within = (pos % self.object_size) as usize;
            let take = ((self.object_size as usize) - within).min(rest.len());
            let mut object = self.storage.read_object(file_id, object_no)?.unwrap_or_default();
            if object.len() < within + take {
                object.resize(within + take, 0);
            }
            object[within..within + take].copy_from_slice(&rest[..take]);
            self.storage.write_object(file_id, object_no, &object)?;
            rest = &rest[take..];
            pos += take as u64;
        }
        Ok(())
    }

    fn truncate(&self, file_id: &FileId, new_size: u64) -> anyhow::Result<()> {
        for object_no in self.storage.object_numbers(file_id)? {
            let start = object_no * self.object_size;
            if start >= new_size {
                self.storage.delete_object(file_id, object_no)?;
            } else if start + self.object_size > new_size {
                let keep = (new_size - start) as usize;
                if let Some(mut object) = self.storage.read_object(file_id, object_no)? {
                    if object.len() > keep {
                        object.truncate(keep);
                        self.storage.write_object(file_id, object_no, &object)?;
                    }
                }
            }
        }
        if new_size > self.file_size(file_id)? {
            let last = (new_size - 1) / self.object_size;
            let len = (new_size - last * self.object_size) as usize;
            let mut object = self.storage.read_object(file_id, last)?.unwrap_or_default();
            object.resize(len, 0);
            self.storage.write_object(file_id, last, &object)?;
        }
        Ok(())
    }
}

#[async_trait]
impl OperationHandler for ObjectHandler {
    async fn handle(&self, call: HandlerCall) -> Result<Reply, HandlerFailure> {
        let HandlerCall {
            file_id,
            op,
            payload,
            cow_policy,
            ..
        } = call;
        debug!(file_id = %file_id, op = ?op.kind(), ?cow_policy, "object operation");
        match op {
            Operation::Read { offset, length } => self
                .read(&file_id, offset, length)
                .map(Reply::Data)
                .map_err(|err| Self::io(&file_id, err)),
            Operation::Write { offset } => {
                let payload = payload.ok_or_else(|| {
                    OsdError::InvalidArgument("write request without payload".to_string())
                })?;
                let res = self.write(&file_id, offset, payload.as_slice());
                payload.release();
                res.map(|_| Reply::Done).map_err(|err| Self::io(&file_id, err))
            }
            Operation::Truncate { new_size } => self
                .truncate(&file_id, new_size)
                .map(|_| Reply::Done)
                .map_err(|err| Self::io(&file_id, err)),
            Operation::Delete => self
                .storage
                .delete_file(&file_id)
                .map(|_| Reply::Done)
                .map_err(|err| Self::io(&file_id, err)),
            other => Err(HandlerFailure::Fault(anyhow!(
                "{:?} routed to the object handler",
                other.kind()
            ))),
        }
    }
}
