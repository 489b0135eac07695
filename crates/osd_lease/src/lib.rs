//! Lease coordination contract crate.
//!
//! Storage nodes rely on an external lease/consensus service that elects a
//! primary per replica-set cell and announces view-id changes. The API surface
//! is intentionally small: the node registers a `ViewListener`, the service
//! implements `LeaseCoordinator`.

pub mod lease;
