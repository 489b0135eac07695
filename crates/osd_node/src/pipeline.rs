//! Sharded request pipeline.
//!
//! Files are hashed onto a fixed set of stages. All requests for one file
//! land on the same stage, which serializes them; different files proceed
//! in parallel on different stages.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use osd_lease::lease::{CellId, ViewListener};
use tracing::{info, warn};

use crate::buffer::{BufferPool, PAYLOAD_BUFFER_SIZE};
use crate::config::PipelineConfig;
use crate::error::OsdError;
use crate::request::{Completion, FileId, Operation, Origin, StageRequest};
use crate::stage::{Stage, StageDeps, StageHandle};
use crate::stats::StatsSnapshot;

/// Payload buffers pooled per pipeline.
const POOLED_BUFFERS: usize = 256;

/// `DefaultHasher` output is only stable within one build of the binary, so
/// shard numbers must never be persisted or compared across nodes.
pub fn hash_file_id(file_id: &FileId) -> u64 {
    let mut hasher = DefaultHasher::new();
    file_id.as_str().hash(&mut hasher);
    hasher.finish()
}

pub struct Pipeline {
    stages: Vec<StageHandle>,
    buffers: Arc<BufferPool>,
}

impl Pipeline {
    pub fn start(config: PipelineConfig, deps: StageDeps) -> anyhow::Result<Arc<Self>> {
        anyhow::ensure!(config.shards > 0, "pipeline requires at least one stage");
        let stages = (0..config.shards)
            .map(|shard| Stage::spawn(shard, config.stage.clone(), deps.clone()))
            .collect::<anyhow::Result<Vec<_>>>()?;
        info!(
            shards = config.shards,
            queue_capacity = config.stage.queue_capacity,
            scheduling = ?config.stage.scheduling,
            "pipeline started"
        );
        Ok(Arc::new(Self {
            stages,
            buffers: BufferPool::new(PAYLOAD_BUFFER_SIZE, POOLED_BUFFERS),
        }))
    }

    pub fn shards(&self) -> usize {
        self.stages.len()
    }

    pub fn shard_for(&self, file_id: &FileId) -> usize {
        (hash_file_id(file_id) as usize) % self.stages.len()
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Route a request to the stage owning its file.
    ///
    /// A refused request has already been completed with the same error.
    pub fn submit(&self, req: StageRequest) -> Result<(), OsdError> {
        let shard = self.shard_for(&req.file_id);
        self.stages[shard].submit(req)
    }

    /// Convenience for internal follow-ups that need no payload.
    pub fn submit_internal(&self, file_id: FileId, op: Operation) -> Result<Completion, OsdError> {
        let (req, done) = StageRequest::internal(file_id, op);
        debug_assert_eq!(req.origin, Origin::Internal);
        self.submit(req)?;
        Ok(done)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stages
            .iter()
            .map(StageHandle::stats)
            .fold(StatsSnapshot::default(), StatsSnapshot::merge)
    }

    pub fn shard_stats(&self) -> Vec<StatsSnapshot> {
        self.stages.iter().map(StageHandle::stats).collect()
    }

    /// Shards whose stage stopped after a fault.
    pub fn failed_shards(&self) -> Vec<usize> {
        self.stages
            .iter()
            .filter(|stage| !stage.is_running())
            .map(StageHandle::shard)
            .collect()
    }

    /// Stop all stages after draining their queues. Returns the first stage error.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let mut first_err = None;
        for stage in &self.stages {
            if let Err(err) = stage.shutdown().await {
                warn!(shard = stage.shard(), error = ?err, "stage ended with error");
                first_err.get_or_insert(err);
            }
        }
        info!("pipeline stopped");
        first_err.map_or(Ok(()), Err)
    }
}

impl ViewListener for Pipeline {
    fn view_id_changed(&self, cell: CellId, version: u64) {
        let Some(file_id) = cell.file_id().map(FileId::new) else {
            warn!(cell = %cell, "ignoring view announcement for malformed cell id");
            return;
        };
        let op = Operation::ViewIdChanged { cell, version };
        if let Err(err) = self.submit_internal(file_id.clone(), op) {
            warn!(file_id = %file_id, version, error = %err, "dropping view announcement");
        }
    }
}
