//! The blocking unit-of-work session.
//!
//! A [`Session`] resolves a bind per operation (explicit bind, then the
//! router, then per-resource binds), keeps one connection per engine it has
//! touched, and coordinates flushing tracked changes before a commit.
//!
//! Sessions are cheap handles: clones share one unit of work. A session is
//! never driven by two operations at the same time; the internal lock only
//! protects bookkeeping.
//!
//! # Example
//!
//! ```ignore
//! let session = Session::builder().routing(router).build();
//!
//! // Pending insert, written on flush
//! session.add(&order, Row::new().with("id", 42).with("total", 10))?;
//!
//! // Reads go to the read engine, after an auto-flush
//! let row = session.get(&order, 42)?;
//!
//! // Flush and commit, keeping objects fresh for this commit only
//! session.commit(Some(false))?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use unitwork_core::{
    ConcurrencyMode, ConfigErrorKind, Connection, EngineHandle, Error, Identity, ObjectKey,
    ResourceType, Result, Row, Statement, UsageErrorKind,
};
use unitwork_pool::EngineRouter;

use crate::bulk::{BulkScope, SessionBulk};
use crate::context::Context;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Whether to begin a transaction on the first connection to an engine.
    pub auto_begin: bool,
    /// Whether to flush pending changes before read statements.
    pub auto_flush: bool,
    /// Whether to expire objects after commit (reload from storage on next access).
    pub expire_on_commit: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            auto_flush: true,
            expire_on_commit: true,
        }
    }
}

impl SessionConfig {
    /// Parse a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Error::custom_from)
    }

    #[must_use]
    pub fn with_auto_begin(mut self, value: bool) -> Self {
        self.auto_begin = value;
        self
    }

    #[must_use]
    pub fn with_auto_flush(mut self, value: bool) -> Self {
        self.auto_flush = value;
        self
    }

    #[must_use]
    pub fn with_expire_on_commit(mut self, value: bool) -> Self {
        self.expire_on_commit = value;
        self
    }
}

// ============================================================================
// Object and Transaction State
// ============================================================================

/// State of a tracked object in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// New object, needs INSERT on flush.
    New,
    /// Persistent object loaded from or written to storage.
    Persistent,
    /// Object marked for deletion, needs DELETE on flush.
    Deleted,
    /// Object detached from session.
    Detached,
    /// Object expired, needs reload from storage.
    Expired,
}

/// Lifecycle of the session's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    Inactive,
    Active,
    Committed,
    RolledBack,
    Closed,
}

/// A tracked object in the session.
struct TrackedObject {
    resource: ResourceType,
    row: Row,
    state: ObjectState,
}

struct BoundConnection {
    engine: String,
    conn: Box<dyn Connection>,
}

#[derive(Default)]
struct SessionState {
    transaction: TransactionState,
    flushing: bool,
    expire_on_commit: bool,
    /// Identity map: ObjectKey -> TrackedObject.
    identity_map: HashMap<ObjectKey, TrackedObject>,
    /// Objects marked as new (need INSERT).
    pending_new: Vec<ObjectKey>,
    /// Objects marked as deleted (need DELETE).
    pending_delete: Vec<ObjectKey>,
    /// Objects that are dirty (need UPDATE).
    pending_dirty: Vec<ObjectKey>,
    /// One connection per engine touched, blocking sessions only.
    connections: Vec<BoundConnection>,
}

impl SessionState {
    fn has_pending(&self) -> bool {
        !(self.pending_new.is_empty()
            && self.pending_delete.is_empty()
            && self.pending_dirty.is_empty())
    }
}

struct SessionShared {
    id: u64,
    mode: ConcurrencyMode,
    bind: Option<EngineHandle>,
    routing: Option<Arc<EngineRouter>>,
    binds: HashMap<String, EngineHandle>,
    config: SessionConfig,
    closed: Arc<AtomicBool>,
    state: Mutex<SessionState>,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Session`], also the captured state of session factories.
#[derive(Debug, Clone, Default)]
pub struct SessionBuilder {
    bind: Option<EngineHandle>,
    routing: Option<Arc<EngineRouter>>,
    binds: HashMap<String, EngineHandle>,
    config: SessionConfig,
}

impl SessionBuilder {
    /// Use `engine` for every operation, bypassing routing.
    #[must_use]
    pub fn bind(mut self, engine: EngineHandle) -> Self {
        self.bind = Some(engine);
        self
    }

    #[must_use]
    pub fn routing(mut self, router: Arc<EngineRouter>) -> Self {
        self.routing = Some(router);
        self
    }

    /// Fallback bind for one resource type, used when routing has no answer.
    #[must_use]
    pub fn bind_resource(mut self, resource: impl Into<String>, engine: EngineHandle) -> Self {
        self.binds.insert(resource.into(), engine);
        self
    }

    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Session {
        self.build_with_mode(ConcurrencyMode::Blocking)
    }

    pub(crate) fn build_with_mode(self, mode: ConcurrencyMode) -> Session {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let state = SessionState {
            expire_on_commit: self.config.expire_on_commit,
            ..SessionState::default()
        };
        tracing::debug!(session = id, %mode, "Creating session");
        Session {
            shared: Arc::new(SessionShared {
                id,
                mode,
                bind: self.bind,
                routing: self.routing,
                binds: self.binds,
                config: self.config,
                closed: Arc::new(AtomicBool::new(false)),
                state: Mutex::new(state),
            }),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// The blocking unit-of-work manager.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Process-unique session id, used in logs.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn mode(&self) -> ConcurrencyMode {
        self.shared.mode
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn routing(&self) -> Option<&Arc<EngineRouter>> {
        self.shared.routing.as_ref()
    }

    /// Whether both handles share one unit of work.
    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn is_flushing(&self) -> bool {
        self.lock().flushing
    }

    pub(crate) fn liveness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shared.closed)
    }

    // ========================================================================
    // Bind Resolution
    // ========================================================================

    /// Engine serving the next operation on `resource`.
    ///
    /// Resolution order: the explicit bind, then the router (write engine
    /// while flushing, read engine otherwise, then the router default), then
    /// the per-resource binds.
    pub fn get_bind(&self, resource: Option<&ResourceType>) -> Result<EngineHandle> {
        let shared = &self.shared;
        if let Some(bind) = &shared.bind {
            return Ok(bind.clone());
        }

        if let Some(router) = &shared.routing {
            let flushing = self.is_flushing();
            let routed = if flushing {
                router.get_write_engine(resource, shared.mode)
            } else {
                router.get_read_engine(resource, shared.mode)
            };
            if let Some(engine) = routed.or_else(|| router.get_engine(resource, shared.mode)) {
                tracing::debug!(
                    session = shared.id,
                    engine = engine.name(),
                    flushing,
                    "Resolved bind from router"
                );
                return Ok(engine);
            }
        }

        if let Some(engine) = resource.and_then(|r| shared.binds.get(r.name())) {
            return Ok(engine.clone());
        }

        Err(Error::config(
            ConfigErrorKind::NoBind,
            match resource {
                Some(r) => format!("No engine is configured for resource {r}"),
                None => "No engine is configured for this session".to_string(),
            },
        ))
    }

    // ========================================================================
    // Statement Execution
    // ========================================================================

    /// Execute a statement against the bind resolved for its resource.
    #[tracing::instrument(level = "debug", skip(self, statement), fields(session = self.shared.id, verb = statement.verb()))]
    pub fn execute(&self, statement: &Statement) -> Result<Vec<Row>> {
        self.ensure_mode(ConcurrencyMode::Blocking)?;
        self.ensure_open()?;
        if self.needs_autoflush(statement) {
            self.flush()?;
        }
        let bind = self.get_bind(Some(statement.resource()))?;
        self.execute_on(&bind, statement)
    }

    fn execute_on(&self, bind: &EngineHandle, statement: &Statement) -> Result<Vec<Row>> {
        let mut state = self.lock();
        let idx = match state
            .connections
            .iter()
            .position(|c| c.engine == bind.name())
        {
            Some(idx) => idx,
            None => {
                let engine = bind.as_blocking().ok_or_else(|| {
                    Error::usage(
                        UsageErrorKind::UnsupportedBind,
                        format!("Engine {} has no blocking interface", bind.name()),
                    )
                })?;
                let mut conn = engine.connect()?;
                if self.shared.config.auto_begin {
                    tracing::info!(session = self.shared.id, engine = bind.name(), "Beginning transaction");
                    conn.begin()?;
                    state.transaction = TransactionState::Active;
                }
                state.connections.push(BoundConnection {
                    engine: bind.name().to_string(),
                    conn,
                });
                state.connections.len() - 1
            }
        };
        state.connections[idx].conn.execute(statement)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::usage(
                UsageErrorKind::SessionClosed,
                format!("Session {} is closed", self.shared.id),
            ));
        }
        Ok(())
    }

    pub(crate) fn ensure_mode(&self, mode: ConcurrencyMode) -> Result<()> {
        if self.shared.mode != mode {
            return Err(Error::usage(
                UsageErrorKind::ModeMismatch,
                format!(
                    "Session {} runs in {} mode, not {mode}",
                    self.shared.id, self.shared.mode
                ),
            ));
        }
        Ok(())
    }

    /// Whether a read should flush pending changes first.
    pub(crate) fn needs_autoflush(&self, statement: &Statement) -> bool {
        if statement.is_write() || !self.shared.config.auto_flush {
            return false;
        }
        let state = self.lock();
        !state.flushing && state.has_pending()
    }

    // ========================================================================
    // Object Tracking
    // ========================================================================

    /// Add a new row to the session; it is INSERTed on the next flush.
    #[tracing::instrument(level = "debug", skip(self, row))]
    pub fn add(&self, resource: &ResourceType, row: Row) -> Result<()> {
        self.ensure_open()?;
        let key = Self::key_of(resource, &row)?;
        tracing::info!(resource = resource.name(), identity = %key.identity(), "Adding object to session");

        let mut state = self.lock();
        if let Some(tracked) = state.identity_map.get_mut(&key) {
            let previous = tracked.state;
            tracked.row = row;
            match previous {
                ObjectState::Deleted => {
                    tracked.state = ObjectState::Persistent;
                    state.pending_delete.retain(|k| k != &key);
                    Self::mark_dirty(&mut state, key);
                }
                ObjectState::Detached => {
                    tracked.state = ObjectState::New;
                    state.pending_new.push(key);
                }
                ObjectState::Persistent | ObjectState::Expired => {
                    Self::mark_dirty(&mut state, key);
                }
                ObjectState::New => {}
            }
            return Ok(());
        }

        state.identity_map.insert(
            key.clone(),
            TrackedObject {
                resource: resource.clone(),
                row,
                state: ObjectState::New,
            },
        );
        state.pending_new.push(key);
        Ok(())
    }

    /// Record changed fields of a row; they are UPDATEd on the next flush.
    ///
    /// Untracked rows are assumed to exist in storage.
    #[tracing::instrument(level = "debug", skip(self, row))]
    pub fn update(&self, resource: &ResourceType, row: Row) -> Result<()> {
        self.ensure_open()?;
        let key = Self::key_of(resource, &row)?;

        let mut state = self.lock();
        match state.identity_map.get_mut(&key) {
            Some(tracked) => {
                tracked.row.merge(&row);
                let current = tracked.state;
                match current {
                    ObjectState::New => {}
                    ObjectState::Deleted | ObjectState::Detached => {
                        return Err(Error::usage(
                            UsageErrorKind::MissingIdentity,
                            format!("{resource} {} is no longer tracked", key.identity()),
                        ));
                    }
                    ObjectState::Persistent | ObjectState::Expired => {
                        Self::mark_dirty(&mut state, key);
                    }
                }
            }
            None => {
                state.identity_map.insert(
                    key.clone(),
                    TrackedObject {
                        resource: resource.clone(),
                        row,
                        state: ObjectState::Persistent,
                    },
                );
                Self::mark_dirty(&mut state, key);
            }
        }
        Ok(())
    }

    /// Mark a row for deletion; it is DELETEd on the next flush.
    #[tracing::instrument(level = "debug", skip(self, identity))]
    pub fn delete(&self, resource: &ResourceType, identity: impl Into<Identity>) -> Result<()> {
        self.ensure_open()?;
        let key = ObjectKey::new(resource, identity.into());
        tracing::info!(resource = resource.name(), identity = %key.identity(), "Marking object for deletion");

        let mut state = self.lock();
        match state.identity_map.get(&key).map(|t| t.state) {
            Some(ObjectState::New) => {
                // Never written, forget it entirely
                state.identity_map.remove(&key);
                state.pending_new.retain(|k| k != &key);
            }
            Some(ObjectState::Persistent | ObjectState::Expired) => {
                if let Some(tracked) = state.identity_map.get_mut(&key) {
                    tracked.state = ObjectState::Deleted;
                }
                state.pending_dirty.retain(|k| k != &key);
                state.pending_delete.push(key);
            }
            Some(ObjectState::Deleted | ObjectState::Detached) => {}
            None => {
                state.identity_map.insert(
                    key.clone(),
                    TrackedObject {
                        resource: resource.clone(),
                        row: resource.identity_row(key.identity()),
                        state: ObjectState::Deleted,
                    },
                );
                state.pending_delete.push(key);
            }
        }
        Ok(())
    }

    /// Get a row by identity, from the identity map when it is fresh.
    #[tracing::instrument(level = "debug", skip(self, identity))]
    pub fn get(&self, resource: &ResourceType, identity: impl Into<Identity>) -> Result<Option<Row>> {
        let identity = identity.into();
        let key = ObjectKey::new(resource, identity.clone());
        if let Some(row) = self.lookup(&key) {
            return Ok(Some(row));
        }

        tracing::debug!(resource = resource.name(), %identity, "Loading object from storage");
        let rows = self.execute(&Statement::select_identities(
            resource.clone(),
            vec![identity],
        ))?;
        Ok(self.track_loaded(resource, rows.into_iter().next()))
    }

    pub(crate) fn lookup(&self, key: &ObjectKey) -> Option<Row> {
        let state = self.lock();
        state
            .identity_map
            .get(key)
            .filter(|t| matches!(t.state, ObjectState::New | ObjectState::Persistent))
            .map(|t| t.row.clone())
    }

    pub(crate) fn track_loaded(&self, resource: &ResourceType, row: Option<Row>) -> Option<Row> {
        let row = row?;
        let Some(key) = ObjectKey::from_row(resource, &row) else {
            return Some(row);
        };
        let mut state = self.lock();
        match state.identity_map.get_mut(&key) {
            Some(tracked) => match tracked.state {
                ObjectState::Expired | ObjectState::Detached => {
                    tracked.row = row.clone();
                    tracked.state = ObjectState::Persistent;
                    Some(row)
                }
                ObjectState::Deleted => None,
                ObjectState::New | ObjectState::Persistent => Some(tracked.row.clone()),
            },
            None => {
                state.identity_map.insert(
                    key,
                    TrackedObject {
                        resource: resource.clone(),
                        row: row.clone(),
                        state: ObjectState::Persistent,
                    },
                );
                Some(row)
            }
        }
    }

    /// State of a tracked object, if tracked.
    pub fn object_state(&self, resource: &ResourceType, identity: impl Into<Identity>) -> Option<ObjectState> {
        let key = ObjectKey::new(resource, identity.into());
        self.lock().identity_map.get(&key).map(|t| t.state)
    }

    /// Check if an object is tracked by this session.
    pub fn contains(&self, resource: &ResourceType, identity: impl Into<Identity>) -> bool {
        let key = ObjectKey::new(resource, identity.into());
        self.lock().identity_map.contains_key(&key)
    }

    /// Detach an object from the session.
    pub fn expunge(&self, resource: &ResourceType, identity: impl Into<Identity>) {
        let key = ObjectKey::new(resource, identity.into());
        let mut state = self.lock();
        if let Some(tracked) = state.identity_map.get_mut(&key) {
            tracked.state = ObjectState::Detached;
        }
        state.pending_new.retain(|k| k != &key);
        state.pending_delete.retain(|k| k != &key);
        state.pending_dirty.retain(|k| k != &key);
    }

    /// Detach all objects from the session.
    pub fn expunge_all(&self) {
        Self::detach_all(&mut self.lock());
    }

    fn detach_all(state: &mut SessionState) {
        for tracked in state.identity_map.values_mut() {
            tracked.state = ObjectState::Detached;
        }
        state.pending_new.clear();
        state.pending_delete.clear();
        state.pending_dirty.clear();
    }

    fn key_of(resource: &ResourceType, row: &Row) -> Result<ObjectKey> {
        ObjectKey::from_row(resource, row).ok_or_else(|| {
            Error::usage(
                UsageErrorKind::MissingIdentity,
                format!(
                    "{resource} row lacks identity fields {:?}",
                    resource.identity_fields()
                ),
            )
        })
    }

    fn mark_dirty(state: &mut SessionState, key: ObjectKey) {
        if !state.pending_dirty.contains(&key) {
            state.pending_dirty.push(key);
        }
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Flush pending changes to storage.
    ///
    /// Executes DELETE, INSERT and UPDATE statements, in that order, against
    /// the write bind of each resource. Does NOT commit.
    #[tracing::instrument(level = "debug", skip(self), fields(session = self.shared.id))]
    pub fn flush(&self) -> Result<()> {
        self.ensure_mode(ConcurrencyMode::Blocking)?;
        self.ensure_open()?;
        let Some(plan) = self.begin_flush() else {
            return Ok(());
        };
        let start = Instant::now();

        for statement in plan.statements() {
            let bind = self.get_bind(Some(statement.resource()))?;
            self.execute_on(&bind, statement)?;
        }
        plan.complete();

        tracing::info!(elapsed_ms = start.elapsed().as_millis(), "Flush completed");
        Ok(())
    }

    /// Take the pending changes and enter the flushing phase.
    ///
    /// Returns `None` when nothing is pending. Dropping the plan without
    /// completing it puts the changes back.
    pub(crate) fn begin_flush(&self) -> Option<FlushPlan> {
        let mut state = self.lock();
        if !state.has_pending() {
            return None;
        }

        tracing::info!(
            inserts = state.pending_new.len(),
            deletes = state.pending_delete.len(),
            updates = state.pending_dirty.len(),
            "Starting flush"
        );

        let deletes = std::mem::take(&mut state.pending_delete);
        let inserts = std::mem::take(&mut state.pending_new);
        let updates = std::mem::take(&mut state.pending_dirty);

        let mut statements = Vec::with_capacity(deletes.len() + inserts.len() + updates.len());
        // 1. DELETEs first
        for key in &deletes {
            if let Some(tracked) = state.identity_map.get(key) {
                statements.push(Statement::Delete {
                    resource: tracked.resource.clone(),
                    identity: key.identity().clone(),
                });
            }
        }
        // 2. INSERTs
        for key in &inserts {
            if let Some(tracked) = state.identity_map.get(key) {
                statements.push(Statement::Insert {
                    resource: tracked.resource.clone(),
                    row: tracked.row.clone(),
                });
            }
        }
        // 3. UPDATEs
        for key in &updates {
            if let Some(tracked) = state.identity_map.get(key) {
                statements.push(Statement::Update {
                    resource: tracked.resource.clone(),
                    identity: key.identity().clone(),
                    row: tracked.row.clone(),
                });
            }
        }

        state.flushing = true;
        drop(state);

        Some(FlushPlan {
            session: self.clone(),
            deletes,
            inserts,
            updates,
            statements,
            completed: false,
        })
    }

    /// Commit the current transaction.
    ///
    /// `expire` overrides the expire-on-commit policy for this commit only;
    /// the previous policy is restored even if the commit fails.
    #[tracing::instrument(level = "debug", skip(self), fields(session = self.shared.id))]
    pub fn commit(&self, expire: Option<bool>) -> Result<()> {
        let _restore = expire.map(|value| self.set_expire_on_commit(value));
        self.commit_transaction()
    }

    fn commit_transaction(&self) -> Result<()> {
        self.ensure_mode(ConcurrencyMode::Blocking)?;
        self.ensure_open()?;
        tracing::info!("Committing transaction");

        self.flush()?;

        let connections = std::mem::take(&mut self.lock().connections);
        let mut failure = None;
        for BoundConnection { engine, mut conn } in connections {
            if failure.is_none() {
                if let Err(e) = conn.commit() {
                    tracing::warn!(engine = %engine, error = %e, "Commit failed");
                    failure = Some(e);
                    Self::rollback_quietly(&engine, conn.as_mut());
                }
            } else {
                Self::rollback_quietly(&engine, conn.as_mut());
            }
            if let Err(e) = conn.close() {
                tracing::warn!(engine = %engine, error = %e, "Failed to close connection");
            }
        }

        match failure {
            Some(e) => {
                self.after_rollback();
                Err(e)
            }
            None => {
                self.after_commit();
                Ok(())
            }
        }
    }

    fn rollback_quietly(engine: &str, conn: &mut dyn Connection) {
        if let Err(e) = conn.rollback() {
            tracing::warn!(engine = %engine, error = %e, "Rollback failed");
        }
    }

    /// Rollback the current transaction and discard pending changes.
    #[tracing::instrument(level = "debug", skip(self), fields(session = self.shared.id))]
    pub fn rollback(&self) -> Result<()> {
        self.ensure_mode(ConcurrencyMode::Blocking)?;
        if self.is_closed() {
            return Ok(());
        }
        tracing::info!("Rolling back transaction");

        let connections = std::mem::take(&mut self.lock().connections);
        let mut failure = None;
        for BoundConnection { engine, mut conn } in connections {
            if let Err(e) = conn.rollback() {
                tracing::warn!(engine = %engine, error = %e, "Rollback failed");
                failure.get_or_insert(e);
            }
            if let Err(e) = conn.close() {
                tracing::warn!(engine = %engine, error = %e, "Failed to close connection");
            }
        }
        self.after_rollback();
        failure.map_or(Ok(()), Err)
    }

    /// Close the session: roll back, release connections, detach objects.
    ///
    /// Closing twice is a no-op. Any later I/O fails with a usage error.
    #[tracing::instrument(level = "debug", skip(self), fields(session = self.shared.id))]
    pub fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let result = match self.shared.mode {
            ConcurrencyMode::Blocking => self.rollback(),
            ConcurrencyMode::Cooperative => Ok(()),
        };
        self.mark_closed();
        result
    }

    pub(crate) fn mark_transaction_active(&self) {
        self.lock().transaction = TransactionState::Active;
    }

    pub(crate) fn after_commit(&self) {
        let mut state = self.lock();
        if state.transaction == TransactionState::Active {
            state.transaction = TransactionState::Committed;
        }
        if state.expire_on_commit {
            for tracked in state.identity_map.values_mut() {
                if tracked.state == ObjectState::Persistent {
                    tracked.state = ObjectState::Expired;
                }
            }
        }
    }

    pub(crate) fn after_rollback(&self) {
        let mut state = self.lock();
        state.pending_new.clear();
        state.pending_delete.clear();
        state.pending_dirty.clear();

        // Revert objects: new ones vanish, deleted ones come back
        state.identity_map.retain(|_, tracked| tracked.state != ObjectState::New);
        for tracked in state.identity_map.values_mut() {
            if tracked.state == ObjectState::Deleted {
                tracked.state = ObjectState::Persistent;
            }
        }

        if state.transaction == TransactionState::Active {
            state.transaction = TransactionState::RolledBack;
        }
    }

    /// Mark the session closed without touching storage.
    pub(crate) fn mark_closed(&self) {
        let mut state = self.lock();
        Self::detach_all(&mut state);
        // Connections still held are dropped unclosed; the engine owns cleanup
        state.connections.clear();
        state.transaction = TransactionState::Closed;
        self.shared.closed.store(true, Ordering::Release);
        tracing::info!(session = self.shared.id, "Session closed");
    }

    // ========================================================================
    // Expire-on-commit Override
    // ========================================================================

    /// Current expire-on-commit policy.
    pub fn expire_on_commit(&self) -> bool {
        self.lock().expire_on_commit
    }

    /// Replace the expire-on-commit policy until the guard drops.
    pub fn set_expire_on_commit(&self, value: bool) -> ExpireOnCommitGuard {
        let previous = std::mem::replace(&mut self.lock().expire_on_commit, value);
        ExpireOnCommitGuard {
            session: self.clone(),
            previous,
        }
    }

    // ========================================================================
    // Bulk
    // ========================================================================

    /// Open a bulk scope bound to this session.
    ///
    /// The registry is the ambient bulk of `ctx` until the scope drops; it
    /// stays inspectable afterwards.
    pub fn bulk<'c>(&self, ctx: &'c Context, proxy_reference: bool) -> BulkScope<'c, SessionBulk> {
        let bulk = SessionBulk::new(self.clone(), proxy_reference);
        let guard = ctx.enter_bulk(bulk.clone());
        BulkScope::new(bulk, guard)
    }

    // ========================================================================
    // Debug Diagnostics
    // ========================================================================

    /// Get count of objects pending INSERT.
    pub fn pending_new_count(&self) -> usize {
        self.lock().pending_new.len()
    }

    /// Get count of objects pending DELETE.
    pub fn pending_delete_count(&self) -> usize {
        self.lock().pending_delete.len()
    }

    /// Get count of dirty objects pending UPDATE.
    pub fn pending_dirty_count(&self) -> usize {
        self.lock().pending_dirty.len()
    }

    /// Get total tracked object count.
    pub fn tracked_count(&self) -> usize {
        self.lock().identity_map.len()
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.lock().transaction
    }

    /// Whether a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.transaction_state() == TransactionState::Active
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        let state = self.lock();
        SessionDebugInfo {
            id: self.shared.id,
            mode: self.shared.mode,
            tracked: state.identity_map.len(),
            pending_new: state.pending_new.len(),
            pending_delete: state.pending_delete.len(),
            pending_dirty: state.pending_dirty.len(),
            transaction: state.transaction,
            connections: state.connections.iter().map(|c| c.engine.clone()).collect(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("mode", &self.shared.mode)
            .field("bind", &self.shared.bind.as_ref().map(EngineHandle::name))
            .field("routed", &self.shared.routing.is_some())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Debug information about session state.
#[derive(Debug, Clone)]
pub struct SessionDebugInfo {
    pub id: u64,
    pub mode: ConcurrencyMode,
    /// Total tracked objects.
    pub tracked: usize,
    /// Objects pending INSERT.
    pub pending_new: usize,
    /// Objects pending DELETE.
    pub pending_delete: usize,
    /// Objects pending UPDATE.
    pub pending_dirty: usize,
    pub transaction: TransactionState,
    /// Engines with an open connection.
    pub connections: Vec<String>,
}

// ============================================================================
// Guards
// ============================================================================

/// Restores the previous expire-on-commit policy when dropped.
#[must_use = "the previous policy is restored as soon as the guard drops"]
pub struct ExpireOnCommitGuard {
    session: Session,
    previous: bool,
}

impl ExpireOnCommitGuard {
    /// The policy that will be restored.
    pub fn previous(&self) -> bool {
        self.previous
    }
}

impl Drop for ExpireOnCommitGuard {
    fn drop(&mut self) {
        self.session.lock().expire_on_commit = self.previous;
    }
}

/// Pending changes taken out of a session for one flush.
pub(crate) struct FlushPlan {
    session: Session,
    deletes: Vec<ObjectKey>,
    inserts: Vec<ObjectKey>,
    updates: Vec<ObjectKey>,
    statements: Vec<Statement>,
    completed: bool,
}

impl FlushPlan {
    pub(crate) fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Record the flush as written.
    pub(crate) fn complete(mut self) {
        {
            let mut state = self.session.lock();
            for key in &self.deletes {
                state.identity_map.remove(key);
            }
            for key in self.inserts.iter().chain(&self.updates) {
                if let Some(tracked) = state.identity_map.get_mut(key) {
                    tracked.state = ObjectState::Persistent;
                }
            }
        }
        self.completed = true;
    }
}

impl Drop for FlushPlan {
    fn drop(&mut self) {
        let mut state = self.session.lock();
        if !self.completed {
            // Put the changes back ahead of anything queued meanwhile
            restore(&mut state.pending_delete, &mut self.deletes);
            restore(&mut state.pending_new, &mut self.inserts);
            restore(&mut state.pending_dirty, &mut self.updates);
        }
        state.flushing = false;
    }
}

fn restore(pending: &mut Vec<ObjectKey>, taken: &mut Vec<ObjectKey>) {
    let queued = std::mem::replace(pending, std::mem::take(taken));
    for key in queued {
        if !pending.contains(&key) {
            pending.push(key);
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
