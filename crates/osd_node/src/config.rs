use std::time::Duration;

use crate::queue::{Discipline, Fifo};
use crate::request::StageRequest;
use crate::scheduler::{QosConfig, WeightedFairQueue};

/// How long a request keeps its file open.
pub const DEFAULT_OPEN_EXTENSION: Duration = Duration::from_secs(30);
/// Interval of the open-file deadline sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Verified capabilities remembered per open file.
pub const DEFAULT_CAPABILITY_CACHE: usize = 20;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
/// View records kept in memory per stage.
pub const DEFAULT_VIEW_CACHE: usize = 2048;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Scheduling {
    #[default]
    Fifo,
    WeightedFair(QosConfig),
}

impl Scheduling {
    pub(crate) fn discipline(&self) -> Box<dyn Discipline<StageRequest>> {
        match self {
            Self::Fifo => Box::new(Fifo::default()),
            Self::WeightedFair(config) => Box::new(WeightedFairQueue::new(config.clone())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StageConfig {
    pub queue_capacity: usize,
    pub open_extension: Duration,
    pub sweep_interval: Duration,
    pub capability_cache: usize,
    pub view_cache: usize,
    /// Skip signature, expiry and mode checks.
    pub ignore_capabilities: bool,
    pub scheduling: Scheduling,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            open_extension: DEFAULT_OPEN_EXTENSION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            capability_cache: DEFAULT_CAPABILITY_CACHE,
            view_cache: DEFAULT_VIEW_CACHE,
            ignore_capabilities: false,
            scheduling: Scheduling::Fifo,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Number of stages; files are hashed onto them.
    pub shards: usize,
    pub stage: StageConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            stage: StageConfig::default(),
        }
    }
}
