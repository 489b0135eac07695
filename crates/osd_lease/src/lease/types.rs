//! Shared types for the lease coordination contract.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the coordinator implementations and the storage node stages.

use std::fmt;

use async_trait::async_trait;

/// Prefix of every cell id derived from a file id.
pub const CELL_PREFIX: &str = "file/";

/// Identifier of one lease cell. Each replicated file owns exactly one cell.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(String);

impl CellId {
    pub fn for_file(file_id: &str) -> Self {
        Self(format!("{CELL_PREFIX}{file_id}"))
    }

    /// Wrap a raw cell id received from the coordinator.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Resolve the file id this cell coordinates, if the id is well-formed.
    pub fn file_id(&self) -> Option<&str> {
        self.0
            .strip_prefix(CELL_PREFIX)
            .filter(|file_id| !file_id.is_empty())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Replica-set view as exchanged with the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewState {
    pub version: u64,
    pub invalidated: bool,
}

impl ViewState {
    pub const fn valid(version: u64) -> Self {
        Self {
            version,
            invalidated: false,
        }
    }
}

/// Role of the local replica in its lease cell at the time of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseState {
    /// The file is not lease-coordinated.
    None,
    /// The cell is known but not open on this node.
    Idle,
    Backup,
    Primary,
}

/// Update policy of a file's replica set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReplicaPolicy {
    /// Single copy, no replication.
    Single,
    /// Read-only replication; replicas never diverge after sealing.
    ReadOnly,
    /// Write all, read one.
    WriteAllReadOne,
    /// Write quorum, read quorum.
    WriteQuorumReadQuorum,
}

impl ReplicaPolicy {
    /// Read/write replication is coordinated through the lease cell.
    pub fn requires_quorum(self) -> bool {
        matches!(self, Self::WriteAllReadOne | Self::WriteQuorumReadQuorum)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "" | "none" => Some(Self::Single),
            "ronly" => Some(Self::ReadOnly),
            "WaR1" => Some(Self::WriteAllReadOne),
            "WqRq" => Some(Self::WriteQuorumReadQuorum),
            _ => None,
        }
    }
}

/// Placement metadata of a replica set at one view version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaDescriptor {
    pub version: u64,
    pub policy: ReplicaPolicy,
    /// Storage node ids holding a replica, head first.
    pub replicas: Vec<String>,
}

impl ReplicaDescriptor {
    pub fn single() -> Self {
        Self {
            version: 0,
            policy: ReplicaPolicy::Single,
            replicas: Vec::new(),
        }
    }
}

/// Credentials forwarded to the coordinator when it contacts peer replicas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileCredentials {
    pub subject: String,
    pub signature: String,
}

/// Lease/consensus coordinator consumed by the storage node.
///
/// Calls may be slow or fail; callers await them from the stage owning the
/// file, so a slow cell only delays that file's shard.
#[async_trait]
pub trait LeaseCoordinator: Send + Sync + 'static {
    /// Install `view` as the current view of `cell`.
    async fn set_view(&self, cell: &CellId, file_id: &str, view: ViewState) -> anyhow::Result<()>;

    /// Invalidate the replica set of `file_id` on all peers and report the
    /// local lease state observed while doing so.
    async fn invalidate_replica_set(
        &self,
        file_id: &str,
        credentials: &FileCredentials,
        replica: &ReplicaDescriptor,
    ) -> anyhow::Result<LeaseState>;
}

/// Receiver of out-of-band view-id announcements.
///
/// Delivery is at-least-once and may be reordered; implementations must be
/// idempotent.
pub trait ViewListener: Send + Sync + 'static {
    fn view_id_changed(&self, cell: CellId, version: u64);
}
