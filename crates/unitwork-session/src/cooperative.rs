//! The cooperative session.
//!
//! A [`CooperativeSession`] mirrors [`Session`] but suspends at every I/O
//! operation. Bind resolution, the flushing flag, pending changes and the
//! identity map live in an internally owned `Session` built in cooperative
//! mode; this type only owns the cooperative connections.
//!
//! A connection is taken out of the session while an operation awaits it and
//! put back afterwards, so no lock is held across a suspension point.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use asupersync::{Cx, Outcome};
use unitwork_core::{
    AsyncConnection, ConcurrencyMode, EngineHandle, Error, Identity, ObjectKey, ResourceType,
    Row, Statement, UsageErrorKind,
};

use crate::bulk::{AsyncSessionBulk, BulkScope};
use crate::context::Context;
use crate::session::{
    ExpireOnCommitGuard, SessionBuilder, SessionDebugInfo, TransactionState, Session,
};

struct AsyncBound {
    engine: String,
    /// `None` while an operation is using the connection.
    conn: Option<Box<dyn AsyncConnection>>,
}

/// A connection taken out of its slot for one operation.
///
/// Dropping it puts the connection back, or frees the slot when none was
/// established.
struct Checkout<'s> {
    session: &'s CooperativeSession,
    engine: String,
    conn: Option<Box<dyn AsyncConnection>>,
}

impl Checkout<'_> {
    async fn execute(&mut self, cx: &Cx, statement: &Statement) -> Outcome<Vec<Row>, Error> {
        match self.conn.as_mut() {
            Some(conn) => conn.execute(cx, statement).await,
            None => Outcome::Err(self.session.busy(&self.engine)),
        }
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        let mut connections = self.session.lock_connections();
        match self.conn.take() {
            Some(conn) => {
                if let Some(bound) = connections.iter_mut().find(|b| b.engine == self.engine) {
                    bound.conn = Some(conn);
                }
                // Otherwise the session closed while the operation ran
            }
            None => connections.retain(|b| b.engine != self.engine),
        }
    }
}

impl SessionBuilder {
    /// Build a cooperative session.
    pub fn build_cooperative(self) -> CooperativeSession {
        CooperativeSession {
            sync: self.build_with_mode(ConcurrencyMode::Cooperative),
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// The cooperative unit-of-work manager.
#[derive(Clone)]
pub struct CooperativeSession {
    sync: Session,
    connections: Arc<Mutex<Vec<AsyncBound>>>,
}

impl CooperativeSession {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// The delegate session carrying bind resolution and object tracking.
    pub fn sync_session(&self) -> &Session {
        &self.sync
    }

    pub fn id(&self) -> u64 {
        self.sync.id()
    }

    pub fn is_closed(&self) -> bool {
        self.sync.is_closed()
    }

    /// Whether both handles share one unit of work.
    pub fn ptr_eq(&self, other: &CooperativeSession) -> bool {
        self.sync.ptr_eq(&other.sync)
    }

    pub fn get_bind(&self, resource: Option<&ResourceType>) -> unitwork_core::Result<EngineHandle> {
        self.sync.get_bind(resource)
    }

    fn lock_connections(&self) -> MutexGuard<'_, Vec<AsyncBound>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Statement Execution
    // ========================================================================

    /// Execute a statement against the bind resolved for its resource.
    #[tracing::instrument(level = "debug", skip(self, cx, statement), fields(session = self.sync.id(), verb = statement.verb()))]
    pub async fn execute(&self, cx: &Cx, statement: &Statement) -> Outcome<Vec<Row>, Error> {
        try_result!(self.sync.ensure_open());
        if self.sync.needs_autoflush(statement) {
            try_outcome!(self.flush(cx).await);
        }
        let bind = try_result!(self.sync.get_bind(Some(statement.resource())));
        self.execute_on(cx, &bind, statement).await
    }

    async fn execute_on(
        &self,
        cx: &Cx,
        bind: &EngineHandle,
        statement: &Statement,
    ) -> Outcome<Vec<Row>, Error> {
        let mut checkout = try_outcome!(self.checkout(cx, bind).await);
        checkout.execute(cx, statement).await
    }

    /// Take the connection to `bind` out of the session, connecting first
    /// when the engine was not touched yet.
    async fn checkout(&self, cx: &Cx, bind: &EngineHandle) -> Outcome<Checkout<'_>, Error> {
        {
            let mut connections = self.lock_connections();
            if let Some(bound) = connections.iter_mut().find(|b| b.engine == bind.name()) {
                return match bound.conn.take() {
                    Some(conn) => Outcome::Ok(Checkout {
                        session: self,
                        engine: bind.name().to_string(),
                        conn: Some(conn),
                    }),
                    None => Outcome::Err(self.busy(bind.name())),
                };
            }
            // Placeholder so a concurrent operation sees the session busy
            connections.push(AsyncBound {
                engine: bind.name().to_string(),
                conn: None,
            });
        }
        // Until it holds a connection, dropping the checkout removes the placeholder.
        let mut checkout = Checkout {
            session: self,
            engine: bind.name().to_string(),
            conn: None,
        };

        let Some(engine) = bind.as_cooperative() else {
            return Outcome::Err(Error::usage(
                UsageErrorKind::UnsupportedBind,
                format!("Engine {} has no cooperative interface", bind.name()),
            ));
        };

        let mut conn = try_outcome!(engine.connect(cx).await);
        if self.sync.config().auto_begin {
            tracing::info!(session = self.sync.id(), engine = bind.name(), "Beginning transaction");
            try_outcome!(conn.begin(cx).await);
            self.sync.mark_transaction_active();
        }

        checkout.conn = Some(conn);
        Outcome::Ok(checkout)
    }

    fn busy(&self, engine: &str) -> Error {
        Error::usage(
            UsageErrorKind::SessionBusy,
            format!(
                "Session {} is already running an operation on {}",
                self.sync.id(),
                engine
            ),
        )
    }

    /// Take every connection out of the session.
    ///
    /// With `strict`, a connection still in use makes the session busy;
    /// otherwise it is skipped.
    fn take_connections(
        &self,
        strict: bool,
    ) -> unitwork_core::Result<Vec<(String, Box<dyn AsyncConnection>)>> {
        let mut connections = self.lock_connections();
        if strict {
            if let Some(busy) = connections.iter().find(|b| b.conn.is_none()) {
                return Err(Error::usage(
                    UsageErrorKind::SessionBusy,
                    format!(
                        "Session {} is still running an operation on {}",
                        self.sync.id(),
                        busy.engine
                    ),
                ));
            }
        }
        Ok(connections
            .drain(..)
            .filter_map(|b| b.conn.map(|conn| (b.engine, conn)))
            .collect())
    }

    // ========================================================================
    // Object Tracking
    // ========================================================================

    /// Add a new row to the session; it is INSERTed on the next flush.
    pub fn add(&self, resource: &ResourceType, row: Row) -> unitwork_core::Result<()> {
        self.sync.add(resource, row)
    }

    /// Record changed fields of a row; they are UPDATEd on the next flush.
    pub fn update(&self, resource: &ResourceType, row: Row) -> unitwork_core::Result<()> {
        self.sync.update(resource, row)
    }

    /// Mark a row for deletion; it is DELETEd on the next flush.
    pub fn delete(&self, resource: &ResourceType, identity: impl Into<Identity>) -> unitwork_core::Result<()> {
        self.sync.delete(resource, identity)
    }

    /// Get a row by identity, from the identity map when it is fresh.
    #[tracing::instrument(level = "debug", skip(self, cx, identity))]
    pub async fn get(
        &self,
        cx: &Cx,
        resource: &ResourceType,
        identity: impl Into<Identity>,
    ) -> Outcome<Option<Row>, Error> {
        let identity = identity.into();
        let key = ObjectKey::new(resource, identity.clone());
        if let Some(row) = self.sync.lookup(&key) {
            return Outcome::Ok(Some(row));
        }

        let statement = Statement::select_identities(resource.clone(), vec![identity]);
        let rows = try_outcome!(self.execute(cx, &statement).await);
        Outcome::Ok(self.sync.track_loaded(resource, rows.into_iter().next()))
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Flush pending changes to storage without committing.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = self.sync.id()))]
    pub async fn flush(&self, cx: &Cx) -> Outcome<(), Error> {
        try_result!(self.sync.ensure_open());
        let Some(plan) = self.sync.begin_flush() else {
            return Outcome::Ok(());
        };
        let start = Instant::now();

        for statement in plan.statements() {
            let bind = try_result!(self.sync.get_bind(Some(statement.resource())));
            try_outcome!(self.execute_on(cx, &bind, statement).await);
        }
        plan.complete();

        tracing::info!(elapsed_ms = start.elapsed().as_millis(), "Flush completed");
        Outcome::Ok(())
    }

    /// Commit the current transaction.
    ///
    /// `expire` overrides the expire-on-commit policy for this commit only;
    /// the previous policy is restored on every exit path, including a
    /// dropped future.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = self.sync.id()))]
    pub async fn commit(&self, cx: &Cx, expire: Option<bool>) -> Outcome<(), Error> {
        let _restore = expire.map(|value| self.sync.set_expire_on_commit(value));
        try_result!(self.sync.ensure_open());
        tracing::info!("Committing transaction");

        try_outcome!(self.flush(cx).await);

        let connections = try_result!(self.take_connections(true));
        let mut failure = None;
        for (engine, mut conn) in connections {
            if failure.is_none() {
                match conn.commit(cx).await {
                    Outcome::Ok(()) => {}
                    other => {
                        tracing::warn!(engine = %engine, "Commit failed");
                        failure = Some(other);
                        rollback_quietly(cx, &engine, conn.as_mut()).await;
                    }
                }
            } else {
                rollback_quietly(cx, &engine, conn.as_mut()).await;
            }
            close_quietly(cx, &engine, conn).await;
        }

        match failure {
            Some(outcome) => {
                self.sync.after_rollback();
                outcome
            }
            None => {
                self.sync.after_commit();
                Outcome::Ok(())
            }
        }
    }

    /// Rollback the current transaction and discard pending changes.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = self.sync.id()))]
    pub async fn rollback(&self, cx: &Cx) -> Outcome<(), Error> {
        if self.sync.is_closed() {
            return Outcome::Ok(());
        }
        tracing::info!("Rolling back transaction");

        let connections = try_result!(self.take_connections(false));
        let mut failure = None;
        for (engine, mut conn) in connections {
            match conn.rollback(cx).await {
                Outcome::Ok(()) => {}
                other => {
                    tracing::warn!(engine = %engine, "Rollback failed");
                    failure.get_or_insert(other);
                }
            }
            close_quietly(cx, &engine, conn).await;
        }
        self.sync.after_rollback();
        failure.unwrap_or(Outcome::Ok(()))
    }

    /// Close the session: roll back, release connections, detach objects.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = self.sync.id()))]
    pub async fn close(&self, cx: &Cx) -> Outcome<(), Error> {
        if self.sync.is_closed() {
            return Outcome::Ok(());
        }
        let result = self.rollback(cx).await;
        self.sync.mark_closed();
        result
    }

    /// Close without suspending: connections are dropped, not rolled back.
    ///
    /// Used when a scope future is dropped mid-flight; the engine discards
    /// the abandoned transactions.
    pub fn close_now(&self) {
        if self.sync.is_closed() {
            return;
        }
        let abandoned = self.lock_connections().drain(..).count();
        if abandoned > 0 {
            tracing::warn!(session = self.sync.id(), abandoned, "Dropping connections without rollback");
        }
        self.sync.mark_closed();
    }

    // ========================================================================
    // Expire-on-commit, Bulk, Diagnostics
    // ========================================================================

    pub fn expire_on_commit(&self) -> bool {
        self.sync.expire_on_commit()
    }

    /// Replace the expire-on-commit policy until the guard drops.
    pub fn set_expire_on_commit(&self, value: bool) -> ExpireOnCommitGuard {
        self.sync.set_expire_on_commit(value)
    }

    /// Open a bulk scope bound to this session.
    pub fn bulk<'c>(&self, ctx: &'c Context, proxy_reference: bool) -> BulkScope<'c, AsyncSessionBulk> {
        let bulk = AsyncSessionBulk::new(self.clone(), proxy_reference);
        let guard = ctx.enter_bulk(bulk.clone());
        BulkScope::new(bulk, guard)
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.sync.transaction_state()
    }

    pub fn in_transaction(&self) -> bool {
        self.sync.in_transaction()
    }

    pub fn debug_state(&self) -> SessionDebugInfo {
        let mut info = self.sync.debug_state();
        info.connections = self
            .lock_connections()
            .iter()
            .map(|b| b.engine.clone())
            .collect();
        info
    }
}

async fn rollback_quietly(cx: &Cx, engine: &str, conn: &mut dyn AsyncConnection) {
    match conn.rollback(cx).await {
        Outcome::Ok(()) => {}
        Outcome::Err(e) => tracing::warn!(engine = %engine, error = %e, "Rollback failed"),
        _ => tracing::warn!(engine = %engine, "Rollback interrupted"),
    }
}

async fn close_quietly(cx: &Cx, engine: &str, conn: Box<dyn AsyncConnection>) {
    match conn.close(cx).await {
        Outcome::Ok(()) => {}
        Outcome::Err(e) => tracing::warn!(engine = %engine, error = %e, "Failed to close connection"),
        _ => tracing::warn!(engine = %engine, "Close interrupted"),
    }
}

impl fmt::Debug for CooperativeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CooperativeSession")
            .field("sync", &self.sync)
            .field("connections", &self.lock_connections().len())
            .finish()
    }
}
