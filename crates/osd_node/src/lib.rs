//! Request-processing core of an object storage node.
//!
//! Requests are hashed by file id onto a fixed set of stages. Each stage
//! admits requests through a bounded queue, validates capabilities, checks
//! the replica view, tracks open files, and runs the operation handler, one
//! request at a time. Lease coordination lives in the `osd_lease` crate.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod buffer;
pub mod capability;
pub mod config;
pub mod error;
pub mod handler;
pub mod open_files;
pub mod pipeline;
pub mod queue;
pub mod request;
pub mod scheduler;
pub mod stage;
pub mod stats;
pub mod storage;
pub mod view;

pub use error::{HandlerFailure, OsdError};
pub use pipeline::Pipeline;
pub use request::{Completion, FileId, Operation, Reply, StageRequest};
pub use stage::{FileEvent, StageDeps};

/// Wall-clock unix time in milliseconds.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
