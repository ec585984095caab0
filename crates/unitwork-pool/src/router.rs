//! Read/write engine routing per resource type.
//!
//! Provides `EngineRouter` which routes reads to replica engines and writes to
//! the primary engine of each resource type, falling back to a router-wide
//! default engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use unitwork_core::{ConcurrencyMode, EngineHandle, ResourceType};

/// Strategy for selecting which read engine to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaStrategy {
    /// Rotate through read engines in order.
    #[default]
    RoundRobin,
    /// Pick a pseudo-random read engine each time.
    Random,
}

/// Engines serving one resource type.
#[derive(Debug, Clone, Default)]
pub struct EngineRoute {
    /// Read engines (replica set). Empty means "no read suggestion".
    pub read: Vec<EngineHandle>,
    /// Write engine (primary).
    pub write: Option<EngineHandle>,
}

impl EngineRoute {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a read engine.
    #[must_use]
    pub fn read(mut self, engine: EngineHandle) -> Self {
        self.read.push(engine);
        self
    }

    /// Set the write engine.
    #[must_use]
    pub fn write(mut self, engine: EngineHandle) -> Self {
        self.write = Some(engine);
        self
    }
}

/// Maps resource types to read, write and default engines.
///
/// Routes are immutable once the router is built; share it as
/// `Arc<EngineRouter>` between session factories.
///
/// # Example
///
/// ```ignore
/// let router = EngineRouter::builder()
///     .default_engine(primary.handle())
///     .route("Order", EngineRoute::new().read(replica.handle()).write(primary.handle()))
///     .build();
///
/// // Reads go to the replica
/// let engine = router.get_read_engine(Some(&order), ConcurrencyMode::Blocking);
///
/// // Writes go to the primary
/// let engine = router.get_write_engine(Some(&order), ConcurrencyMode::Blocking);
/// ```
pub struct EngineRouter {
    /// Per-resource routes, keyed by resource name.
    routes: HashMap<String, EngineRoute>,
    /// Router-wide default engine.
    default: Option<EngineHandle>,
    /// Selection strategy for read engines.
    strategy: ReplicaStrategy,
    /// Counter for replica selection.
    round_robin_counter: AtomicUsize,
}

impl EngineRouter {
    /// Create a router builder.
    pub fn builder() -> EngineRouterBuilder {
        EngineRouterBuilder::default()
    }

    /// Router default engine, used when a route makes no suggestion.
    pub fn get_engine(
        &self,
        _resource: Option<&ResourceType>,
        mode: ConcurrencyMode,
    ) -> Option<EngineHandle> {
        self.default.as_ref().filter(|e| e.supports(mode)).cloned()
    }

    /// Engine for read operations on `resource`.
    ///
    /// If several read engines are configured, selects one based on the
    /// configured strategy, skipping engines that cannot serve `mode`.
    pub fn get_read_engine(
        &self,
        resource: Option<&ResourceType>,
        mode: ConcurrencyMode,
    ) -> Option<EngineHandle> {
        let route = self.route(resource?)?;
        let candidates: Vec<&EngineHandle> =
            route.read.iter().filter(|e| e.supports(mode)).collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = self.select_replica(candidates.len());
        let engine = candidates[idx].clone();
        tracing::trace!(engine = engine.name(), %mode, "Selected read engine");
        Some(engine)
    }

    /// Engine for write operations on `resource` (always the primary).
    pub fn get_write_engine(
        &self,
        resource: Option<&ResourceType>,
        mode: ConcurrencyMode,
    ) -> Option<EngineHandle> {
        self.route(resource?)?
            .write
            .as_ref()
            .filter(|e| e.supports(mode))
            .cloned()
    }

    /// Route configured for `resource`, if any.
    pub fn route(&self, resource: &ResourceType) -> Option<&EngineRoute> {
        self.routes.get(resource.name())
    }

    /// Number of configured routes.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Get the current strategy.
    pub fn strategy(&self) -> ReplicaStrategy {
        self.strategy
    }

    fn select_replica(&self, len: usize) -> usize {
        match self.strategy {
            ReplicaStrategy::RoundRobin => {
                let idx = self.round_robin_counter.fetch_add(1, Ordering::Relaxed);
                idx % len
            }
            ReplicaStrategy::Random => {
                // Mix counter bits to approximate uniform distribution without
                // pulling in a random number generator dependency.
                let seq = self.round_robin_counter.fetch_add(1, Ordering::Relaxed);
                // Multiplicative hash (Knuth's) to spread sequential values
                let mixed = seq.wrapping_mul(2_654_435_761);
                mixed % len
            }
        }
    }
}

impl std::fmt::Debug for EngineRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRouter")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .field("default", &self.default.as_ref().map(EngineHandle::name))
            .field("strategy", &self.strategy)
            .field(
                "round_robin_counter",
                &self.round_robin_counter.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// Builder for [`EngineRouter`].
#[derive(Debug, Default)]
pub struct EngineRouterBuilder {
    routes: HashMap<String, EngineRoute>,
    default: Option<EngineHandle>,
    strategy: ReplicaStrategy,
}

impl EngineRouterBuilder {
    /// Set the router-wide default engine.
    #[must_use]
    pub fn default_engine(mut self, engine: EngineHandle) -> Self {
        self.default = Some(engine);
        self
    }

    /// Configure the route of a resource type, replacing any previous one.
    #[must_use]
    pub fn route(mut self, resource: impl Into<String>, route: EngineRoute) -> Self {
        self.routes.insert(resource.into(), route);
        self
    }

    /// Set the read engine selection strategy.
    #[must_use]
    pub fn strategy(mut self, strategy: ReplicaStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn build(self) -> EngineRouter {
        EngineRouter {
            routes: self.routes,
            default: self.default,
            strategy: self.strategy,
            round_robin_counter: AtomicUsize::new(0),
        }
    }
}
