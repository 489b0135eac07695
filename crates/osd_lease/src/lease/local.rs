//! In-process lease coordinator.
//!
//! Keeps the latest view per cell in memory and fans out announcements to
//! subscribed listeners. Single-node deployments use it as the real
//! coordinator; tests use the call log and failure injection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    CellId, FileCredentials, LeaseCoordinator, LeaseState, ReplicaDescriptor, ViewListener,
    ViewState,
};

/// One recorded coordinator call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoordinatorCall {
    SetView {
        cell: CellId,
        file_id: String,
        view: ViewState,
    },
    InvalidateReplicaSet {
        file_id: String,
        replica_version: u64,
    },
}

#[derive(Default)]
struct LocalState {
    views: HashMap<CellId, ViewState>,
    lease_states: HashMap<String, LeaseState>,
    listeners: Vec<Arc<dyn ViewListener>>,
    calls: Vec<CoordinatorCall>,
    fail_next: usize,
}

#[derive(Default)]
pub struct LocalCoordinator {
    inner: Mutex<LocalState>,
    latency: Duration,
}

impl LocalCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every coordinator call by `latency` to emulate a remote service.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            inner: Mutex::new(LocalState::default()),
            latency,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, listener: Arc<dyn ViewListener>) {
        self.state().listeners.push(listener);
    }

    /// Announce a new view id for `cell` to every subscribed listener.
    pub fn announce(&self, cell: &CellId, version: u64) {
        let listeners = {
            let mut state = self.state();
            let entry = state
                .views
                .entry(cell.clone())
                .or_insert(ViewState::valid(version));
            if version >= entry.version {
                *entry = ViewState::valid(version);
            }
            state.listeners.clone()
        };
        tracing::debug!(cell = %cell, version, listeners = listeners.len(), "announcing view id");
        for listener in listeners {
            listener.view_id_changed(cell.clone(), version);
        }
    }

    /// Lease state reported by the next invalidation of `file_id`.
    pub fn set_lease_state(&self, file_id: &str, lease_state: LeaseState) {
        self.state()
            .lease_states
            .insert(file_id.to_string(), lease_state);
    }

    /// Fail the next `count` coordinator calls.
    pub fn fail_next_calls(&self, count: usize) {
        self.state().fail_next = count;
    }

    pub fn calls(&self) -> Vec<CoordinatorCall> {
        self.state().calls.clone()
    }

    pub fn view(&self, cell: &CellId) -> Option<ViewState> {
        self.state().views.get(cell).copied()
    }

    async fn simulate_call(&self, call: CoordinatorCall) -> anyhow::Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.state();
        state.calls.push(call);
        if state.fail_next > 0 {
            state.fail_next -= 1;
            anyhow::bail!("lease coordinator unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseCoordinator for LocalCoordinator {
    async fn set_view(&self, cell: &CellId, file_id: &str, view: ViewState) -> anyhow::Result<()> {
        self.simulate_call(CoordinatorCall::SetView {
            cell: cell.clone(),
            file_id: file_id.to_string(),
            view,
        })
        .await?;

        let mut state = self.state();
        let current = state.views.entry(cell.clone()).or_insert(view);
        // Never move a cell backwards.
        if view.version >= current.version {
            *current = view;
        }
        Ok(())
    }

    async fn invalidate_replica_set(
        &self,
        file_id: &str,
        _credentials: &FileCredentials,
        replica: &ReplicaDescriptor,
    ) -> anyhow::Result<LeaseState> {
        self.simulate_call(CoordinatorCall::InvalidateReplicaSet {
            file_id: file_id.to_string(),
            replica_version: replica.version,
        })
        .await?;

        let mut state = self.state();
        let cell = CellId::for_file(file_id);
        let current = state.views.entry(cell).or_insert(ViewState {
            version: replica.version,
            invalidated: true,
        });
        current.version = current.version.max(replica.version);
        current.invalidated = true;
        Ok(state
            .lease_states
            .get(file_id)
            .copied()
            .unwrap_or(LeaseState::Idle))
    }
}
