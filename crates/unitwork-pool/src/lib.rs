//! Engine routing for Unitwork sessions.
//!
//! `unitwork-pool` decides which physical engine serves an operation. Each
//! resource type may carry an [`EngineRoute`] with read engines (a replica set)
//! and a write engine (the primary); the [`EngineRouter`] also carries a
//! default engine for resources without a route.
//!
//! Sessions consult the router once per operation: the write engine while
//! flushing, a read engine otherwise, then the default engine.

pub mod router;

pub use router::{EngineRoute, EngineRouter, EngineRouterBuilder, ReplicaStrategy};
