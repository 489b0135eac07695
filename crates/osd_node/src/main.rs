use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use osd_lease::lease::{CellId, LocalCoordinator, ReplicaDescriptor, ReplicaPolicy};
use osd_node::capability::{AccessMode, Capability, Sha256Signer};
use osd_node::config::{PipelineConfig, Scheduling, StageConfig};
use osd_node::handler::{HandlerTable, ObjectHandler};
use osd_node::open_files::LockOwner;
use osd_node::request::LockRequest;
use osd_node::scheduler::QosConfig;
use osd_node::storage::{FjallStorage, MemoryStorage, StorageEngine};
use osd_node::{
    unix_time_ms, Completion, FileEvent, FileId, Operation, OsdError, Pipeline, StageDeps,
    StageRequest,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "osd-node")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the request pipeline, optionally driving it with synthetic load.
    Run(NodeArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SchedulingMode {
    Fifo,
    Wfq,
}

#[derive(Parser, Debug)]
struct NodeArgs {
    /// Directory for the fjall keyspace. Keeps everything in memory when unset.
    #[arg(long, env = "OSD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Number of processing stages; files are hashed onto them.
    #[arg(long, env = "OSD_SHARDS", default_value_t = 4)]
    shards: usize,

    /// Queued external requests per stage before new ones are refused.
    #[arg(long, env = "OSD_QUEUE_CAPACITY", default_value_t = 1024)]
    queue_capacity: usize,

    /// How long a request keeps its file open (ms).
    #[arg(long, env = "OSD_OPEN_EXTENSION_MS", default_value_t = 30_000)]
    open_extension_ms: u64,

    /// Open-file sweep interval (ms).
    #[arg(long, env = "OSD_SWEEP_INTERVAL_MS", default_value_t = 60_000)]
    sweep_interval_ms: u64,

    /// Verified capabilities cached per open file.
    #[arg(long, env = "OSD_CAPABILITY_CACHE", default_value_t = 20)]
    capability_cache: usize,

    /// View records cached per stage.
    #[arg(long, env = "OSD_VIEW_CACHE", default_value_t = 2048)]
    view_cache: usize,

    /// Accept every capability without checking it.
    #[arg(long, env = "OSD_IGNORE_CAPABILITIES", default_value_t = false)]
    ignore_capabilities: bool,

    /// Shared secret used to verify capability signatures.
    #[arg(long, env = "OSD_CAPABILITY_SECRET", default_value = "osd-dev-secret")]
    capability_secret: String,

    #[arg(long, env = "OSD_SCHEDULING", value_enum, default_value = "fifo")]
    scheduling: SchedulingMode,

    /// JSON file with weighted-fair-queueing weights (implies `--scheduling wfq`).
    #[arg(long, env = "OSD_QOS_CONFIG")]
    qos_config: Option<PathBuf>,

    /// Object size of the data path (bytes).
    #[arg(long, env = "OSD_OBJECT_SIZE", default_value_t = 128 * 1024)]
    object_size: u64,

    /// Simulated lease coordinator latency (ms).
    #[arg(long, env = "OSD_COORDINATOR_LATENCY_MS", default_value_t = 0)]
    coordinator_latency_ms: u64,

    /// Stats log interval (ms).
    #[arg(long, env = "OSD_STATS_INTERVAL_MS", default_value_t = 5_000)]
    stats_interval_ms: u64,

    /// Synthetic load clients; 0 runs the pipeline idle until ctrl-c.
    #[arg(long, default_value_t = 0)]
    load_clients: usize,

    /// Distinct files touched by the synthetic load.
    #[arg(long, default_value_t = 64)]
    load_files: usize,

    /// Volumes the synthetic files are spread over.
    #[arg(long, default_value_t = 2)]
    load_volumes: usize,

    /// Percent of synthetic operations that are writes.
    #[arg(long, default_value_t = 30)]
    write_pct: u8,

    /// Synthetic load runtime; the node stops afterwards.
    #[arg(long, default_value = "30s")]
    duration: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fjall=warn,lsm_tree=warn".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run_node(args).await,
    }
}

fn scheduling(args: &NodeArgs) -> anyhow::Result<Scheduling> {
    match (&args.qos_config, args.scheduling) {
        (Some(path), _) => Ok(Scheduling::WeightedFair(QosConfig::load(path)?)),
        (None, SchedulingMode::Wfq) => Ok(Scheduling::WeightedFair(QosConfig::default())),
        (None, SchedulingMode::Fifo) => Ok(Scheduling::Fifo),
    }
}

async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.shards > 0, "--shards must be > 0");
    anyhow::ensure!(args.write_pct <= 100, "--write-pct must be <= 100");
    anyhow::ensure!(args.load_volumes > 0, "--load-volumes must be > 0");

    let storage: Arc<dyn StorageEngine> = match &args.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("create data dir")?;
            Arc::new(FjallStorage::open_dir(dir)?)
        }
        None => Arc::new(MemoryStorage::new()),
    };
    let coordinator = Arc::new(LocalCoordinator::with_latency(Duration::from_millis(
        args.coordinator_latency_ms,
    )));
    let signer = Arc::new(Sha256Signer::new(args.capability_secret.as_bytes()));
    let handlers = Arc::new(HandlerTable::uniform(Arc::new(ObjectHandler::new(
        storage.clone(),
        args.object_size,
    ))));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                FileEvent::Closed {
                    file_id,
                    cow_policy,
                    written,
                    deleted,
                } => debug!(file_id = %file_id, ?cow_policy, written, deleted, "file closed"),
                FileEvent::VersionCreated { file_id } => {
                    debug!(file_id = %file_id, "new file version")
                }
            }
        }
    });

    let config = PipelineConfig {
        shards: args.shards,
        stage: StageConfig {
            queue_capacity: args.queue_capacity,
            open_extension: Duration::from_millis(args.open_extension_ms),
            sweep_interval: Duration::from_millis(args.sweep_interval_ms.max(1)),
            capability_cache: args.capability_cache,
            view_cache: args.view_cache,
            ignore_capabilities: args.ignore_capabilities,
            scheduling: scheduling(&args)?,
        },
    };
    let pipeline = Pipeline::start(
        config,
        StageDeps {
            storage: storage.clone(),
            coordinator: coordinator.clone(),
            verifier: signer.clone(),
            handlers,
            events: Some(events_tx),
        },
    )?;
    coordinator.subscribe(pipeline.clone());

    let stats_task = {
        let pipeline = pipeline.clone();
        let interval = Duration::from_millis(args.stats_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stats = pipeline.stats();
                info!(
                    queue_depth = stats.queue_depth,
                    open_files = stats.open_files,
                    processed = stats.processed,
                    rejected = stats.rejected,
                    overloaded = stats.overloaded,
                    faults = stats.faults,
                    "pipeline stats"
                );
                let failed = pipeline.failed_shards();
                if !failed.is_empty() {
                    warn!(?failed, "stages stopped after a fault");
                }
            }
        })
    };

    if args.load_clients == 0 {
        info!("pipeline idle; waiting for ctrl-c");
        tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    } else {
        let outcome = tokio::select! {
            res = run_load(&args, pipeline.clone(), coordinator.clone(), signer) => res,
            res = tokio::signal::ctrl_c() => res.context("wait for ctrl-c"),
        };
        outcome?;
    }

    stats_task.abort();
    pipeline.shutdown().await?;
    let stats = pipeline.stats();
    info!(summary = %serde_json::to_string(&stats)?, "final stats");
    Ok(())
}

async fn run_load(
    args: &NodeArgs,
    pipeline: Arc<Pipeline>,
    coordinator: Arc<LocalCoordinator>,
    signer: Arc<Sha256Signer>,
) -> anyhow::Result<()> {
    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let duration: Duration = args.duration.into();
    let deadline = time::Instant::now() + duration;
    let files = (0..args.load_files.max(1))
        .map(|i| FileId::new(format!("vol{}:{i}", i % args.load_volumes)))
        .collect::<Vec<_>>();
    let views = Arc::new(files.iter().map(|_| AtomicU64::new(1)).collect::<Vec<_>>());
    info!(clients = args.load_clients, files = files.len(), seed, ?duration, "starting synthetic load");

    let announcer = {
        let files = files.clone();
        let views = views.clone();
        tokio::spawn(async move {
            let mut rng = SmallRng::seed_from_u64(seed);
            let mut ticker = time::interval(Duration::from_millis(250));
            while time::Instant::now() < deadline {
                ticker.tick().await;
                let idx = rng.gen_range(0..files.len());
                let version = views[idx].fetch_add(1, Ordering::Relaxed) + 1;
                coordinator.announce(&CellId::for_file(files[idx].as_str()), version);
            }
        })
    };

    let mut tasks = Vec::with_capacity(args.load_clients);
    for client_id in 0..args.load_clients {
        let client = LoadClient {
            client_id,
            pipeline: pipeline.clone(),
            signer: signer.clone(),
            files: files.clone(),
            views: views.clone(),
            write_pct: args.write_pct,
            // Mix the base seed with the client id for deterministic per-client RNG.
            rng: SmallRng::seed_from_u64(seed ^ (client_id as u64).wrapping_mul(0x9e3779b97f4a7c15)),
        };
        tasks.push(tokio::spawn(client.run(deadline)));
    }

    let mut totals = LoadTotals::default();
    for task in tasks {
        totals.merge(task.await.context("load client panicked")?);
    }
    announcer.abort();
    info!(
        ok = totals.ok,
        overloaded = totals.overloaded,
        stale_view = totals.stale_view,
        other_errors = totals.other_errors,
        "synthetic load finished"
    );
    Ok(())
}

#[derive(Default)]
struct LoadTotals {
    ok: u64,
    overloaded: u64,
    stale_view: u64,
    other_errors: u64,
}

impl LoadTotals {
    fn merge(&mut self, other: LoadTotals) {
        self.ok += other.ok;
        self.overloaded += other.overloaded;
        self.stale_view += other.stale_view;
        self.other_errors += other.other_errors;
    }
}

struct LoadClient {
    client_id: usize,
    pipeline: Arc<Pipeline>,
    signer: Arc<Sha256Signer>,
    files: Vec<FileId>,
    views: Arc<Vec<AtomicU64>>,
    write_pct: u8,
    rng: SmallRng,
}

impl LoadClient {
    async fn run(mut self, deadline: time::Instant) -> LoadTotals {
        let mut totals = LoadTotals::default();
        while time::Instant::now() < deadline {
            let idx = self.rng.gen_range(0..self.files.len());
            let (req, done) = self.next_request(idx);
            // A refused request is completed with the same error.
            let _ = self.pipeline.submit(req);
            match done.await {
                Ok(_) => totals.ok += 1,
                Err(OsdError::Overloaded { .. }) => {
                    totals.overloaded += 1;
                    time::sleep(Duration::from_millis(1)).await;
                }
                Err(OsdError::InvalidView(_)) => totals.stale_view += 1,
                Err(err) => {
                    totals.other_errors += 1;
                    debug!(client = self.client_id, error = %err, "load request failed");
                }
            }
        }
        totals
    }

    fn next_request(&mut self, idx: usize) -> (StageRequest, Completion) {
        let file_id = self.files[idx].clone();
        let roll = self.rng.gen_range(0..100u8);
        let capability = self.signer.sign(Capability {
            subject: format!("client-{}", self.client_id),
            file_id: file_id.to_string(),
            access_mode: AccessMode::RDWR,
            expires_ms: unix_time_ms() + 60_000,
            epoch: 0,
            priority: (self.client_id % 2) as u32,
            snapshots_enabled: self.client_id % 3 == 0,
            signature: String::new(),
        });
        let replica = ReplicaDescriptor {
            version: self.views[idx].load(Ordering::Relaxed),
            policy: ReplicaPolicy::WriteQuorumReadQuorum,
            replicas: vec!["local".to_string()],
        };

        let (req, done) = if roll < self.write_pct {
            let len = self.rng.gen_range(1..4096usize);
            let data = vec![self.client_id as u8; len];
            let offset = self.rng.gen_range(0..1u64 << 20);
            let (req, done) = StageRequest::external(file_id, Operation::Write { offset });
            (req.with_payload(self.pipeline.buffers().copy_from(&data)), done)
        } else if roll < self.write_pct.saturating_add(5) {
            let op = Operation::AcquireLock(LockRequest {
                owner: LockOwner {
                    client_uuid: format!("client-{}", self.client_id),
                    pid: 1,
                },
                offset: self.rng.gen_range(0..1024),
                length: 64,
                exclusive: self.rng.gen_bool(0.5),
            });
            StageRequest::external(file_id, op)
        } else {
            let op = Operation::Read {
                offset: self.rng.gen_range(0..1u64 << 20),
                length: 4096,
            };
            StageRequest::external(file_id, op)
        };
        (req.with_capability(capability).with_replica(replica), done)
    }
}
