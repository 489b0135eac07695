//! Bounded admission queue in front of a stage.
//!
//! External requests are refused with `Overloaded` once the queue holds
//! `capacity` entries. Internal follow-up requests bypass the limit: the
//! stage itself produces them and refusing would strand work the node has
//! already accepted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::OsdError;
use crate::request::{Origin, StageRequest};
use crate::stats::StageStats;

/// Ordering policy for queued requests.
pub trait Discipline<T>: Send {
    fn push(&mut self, item: T);
    fn pop(&mut self) -> Option<T>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// First in, first out.
pub struct Fifo<T>(VecDeque<T>);

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self(VecDeque::new())
    }
}

impl<T: Send> Discipline<T> for Fifo<T> {
    fn push(&mut self, item: T) {
        self.0.push_back(item);
    }

    fn pop(&mut self) -> Option<T> {
        self.0.pop_front()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

pub(crate) enum Dequeued {
    Request(StageRequest),
    TimedOut,
    Closed,
}

struct QueueState {
    items: Box<dyn Discipline<StageRequest>>,
    closed: bool,
}

pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    stats: Arc<StageStats>,
}

impl AdmissionQueue {
    pub fn new(
        capacity: usize,
        discipline: Box<dyn Discipline<StageRequest>>,
        stats: Arc<StageStats>,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: discipline,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            stats,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn depth(&self) -> usize {
        self.state().items.len()
    }

    /// Queue a request or complete it immediately with the refusal.
    ///
    /// On refusal the payload buffer is released before the caller's
    /// completion fires.
    pub fn submit(&self, req: StageRequest) -> Result<(), OsdError> {
        let mut state = self.state();
        let refusal = if state.closed {
            Some(OsdError::StageTerminated)
        } else if req.origin == Origin::External && state.items.len() >= self.capacity {
            self.stats.record_overloaded();
            Some(OsdError::Overloaded {
                depth: state.items.len(),
            })
        } else {
            None
        };
        if let Some(err) = refusal {
            drop(state);
            req.fail(err.clone());
            return Err(err);
        }
        state.items.push(req);
        self.stats.set_queue_depth(state.items.len());
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next request until `deadline`.
    ///
    /// A closed queue still hands out what it holds before reporting `Closed`.
    pub(crate) async fn next(&self, deadline: Instant) -> Dequeued {
        loop {
            {
                let mut state = self.state();
                if let Some(req) = state.items.pop() {
                    self.stats.set_queue_depth(state.items.len());
                    return Dequeued::Request(req);
                }
                if state.closed {
                    return Dequeued::Closed;
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Dequeued::TimedOut,
            }
        }
    }

    /// Stop admitting requests. Already queued requests are still served.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_one();
    }

    /// Close the queue and take everything still in it.
    pub(crate) fn close_and_drain(&self) -> Vec<StageRequest> {
        let mut state = self.state();
        state.closed = true;
        let mut drained = Vec::with_capacity(state.items.len());
        while let Some(req) = state.items.pop() {
            drained.push(req);
        }
        self.stats.set_queue_depth(0);
        drained
    }
}
