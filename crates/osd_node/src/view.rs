//! Replica-set view consistency.
//!
//! Every replicated file carries a monotonically increasing view version and
//! an `invalidated` flag. Requests based on an older view are refused; newer
//! views are adopted, persisted, and echoed to the lease coordinator. A stage
//! owns one controller, so all calls for a file are serialized by the stage.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use osd_lease::lease::{
    CellId, FileCredentials, LeaseCoordinator, LeaseState, ReplicaDescriptor, ViewState,
};
use tracing::{debug, info, warn};

use crate::error::{OsdError, ViewRejection};
use crate::request::FileId;
use crate::storage::{StorageEngine, ViewRecord};
use crate::unix_time_ms;

/// Result of an accepted view check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewDecision {
    /// The request matches the stored view.
    Current,
    /// The request carried a newer view, which is now stored.
    Adopted { previous: u64 },
}

pub struct ViewController {
    storage: Arc<dyn StorageEngine>,
    coordinator: Arc<dyn LeaseCoordinator>,
    cache: LruCache<FileId, ViewRecord>,
}

impl ViewController {
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        coordinator: Arc<dyn LeaseCoordinator>,
        cache_capacity: usize,
    ) -> Self {
        Self {
            storage,
            coordinator,
            cache: LruCache::new(NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Current view of `file_id`, loading it from storage on a cache miss.
    pub fn current(&mut self, file_id: &FileId) -> Result<ViewRecord, OsdError> {
        if let Some(record) = self.cache.get(file_id) {
            return Ok(*record);
        }
        let record = self
            .storage
            .view_record(file_id)
            .map_err(|err| OsdError::Io(format!("load view of {file_id}: {err:#}")))?;
        self.cache.put(file_id.clone(), record);
        Ok(record)
    }

    // The cache only changes after the write succeeded.
    fn store(&mut self, file_id: &FileId, record: ViewRecord) -> Result<(), OsdError> {
        if let Err(err) = self.storage.set_view_record(file_id, &record) {
            warn!(file_id = %file_id, version = record.version, error = ?err, "failed to persist view");
            return Err(OsdError::Io(format!("persist view of {file_id}: {err:#}")));
        }
        self.cache.put(file_id.clone(), record);
        Ok(())
    }

    async fn echo_view(&self, file_id: &FileId, version: u64) {
        let cell = CellId::for_file(file_id.as_str());
        if let Err(err) = self
            .coordinator
            .set_view(&cell, file_id.as_str(), ViewState::valid(version))
            .await
        {
            // Peers converge through the next announcement.
            warn!(file_id = %file_id, version, error = ?err, "failed to install view at lease coordinator");
        }
    }

    /// Check the view a request was issued against.
    pub async fn validate_view(
        &mut self,
        file_id: &FileId,
        replica: &ReplicaDescriptor,
    ) -> Result<ViewDecision, OsdError> {
        let current = self.current(file_id)?;
        let requested = replica.version;

        if requested == current.version && !current.invalidated {
            return Ok(ViewDecision::Current);
        }
        if requested > current.version {
            self.store(
                file_id,
                ViewRecord {
                    version: requested,
                    invalidated: false,
                    modified_ms: unix_time_ms(),
                },
            )?;
            info!(file_id = %file_id, from = current.version, to = requested, "adopted newer view");
            if replica.policy.requires_quorum() {
                self.echo_view(file_id, requested).await;
            }
            return Ok(ViewDecision::Adopted {
                previous: current.version,
            });
        }

        let rejection = if requested < current.version {
            ViewRejection::Outdated {
                request: requested,
                current: current.version,
            }
        } else {
            ViewRejection::Invalidated {
                current: current.version,
            }
        };
        debug!(file_id = %file_id, %rejection, "rejecting request");
        Err(rejection.into())
    }

    /// Mark the local replica invalid so no request is served from it until
    /// a newer view is installed.
    pub async fn invalidate(
        &mut self,
        file_id: &FileId,
        replica: &ReplicaDescriptor,
        credentials: &FileCredentials,
        require_current_view: bool,
    ) -> Result<LeaseState, OsdError> {
        let current = self.current(file_id)?;
        let requested = replica.version;

        if require_current_view && !current.invalidated && current.version > requested {
            return Err(ViewRejection::Outdated {
                request: requested,
                current: current.version,
            }
            .into());
        }

        let next = ViewRecord {
            version: current.version.max(requested),
            invalidated: true,
            modified_ms: unix_time_ms(),
        };
        self.store(file_id, next)?;
        info!(file_id = %file_id, version = next.version, "invalidated replica");

        if !replica.policy.requires_quorum() {
            return Ok(LeaseState::None);
        }
        self.coordinator
            .invalidate_replica_set(file_id.as_str(), credentials, replica)
            .await
            .map_err(|err| OsdError::Lease(format!("{err:#}")))
    }

    /// Apply a view id announced by the lease coordinator.
    ///
    /// Never rejects; stale or repeated announcements are ignored. Returns
    /// whether the view was adopted.
    pub async fn on_external_view_change(
        &mut self,
        file_id: &FileId,
        version: u64,
    ) -> Result<bool, OsdError> {
        let current = self.current(file_id)?;
        if version <= current.version {
            debug!(file_id = %file_id, version, current = current.version, "ignoring stale view announcement");
            return Ok(false);
        }
        self.store(
            file_id,
            ViewRecord {
                version,
                invalidated: false,
                modified_ms: unix_time_ms(),
            },
        )?;
        info!(file_id = %file_id, from = current.version, to = version, "installed announced view");
        self.echo_view(file_id, version).await;
        Ok(true)
    }

    pub fn forget(&mut self, file_id: &FileId) {
        self.cache.pop(file_id);
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
