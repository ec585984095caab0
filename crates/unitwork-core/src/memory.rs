//! In-memory storage engine.
//!
//! `MemoryEngine` implements both the blocking and the cooperative engine
//! faces over one shared store. Writes inside a transaction are buffered per
//! connection and applied on commit. Every executed statement is logged so
//! callers can observe routing decisions and round-trip counts.
//!
//! # Example
//!
//! ```ignore
//! let engine = MemoryEngine::new("primary");
//! engine.seed(&order, [Row::new().with("id", 42).with("total", 10)]);
//! let handle = engine.handle();
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use asupersync::{Cx, Outcome};

use crate::engine::{AsyncConnection, AsyncEngine, BoxFuture, Connection, Engine, EngineHandle};
use crate::error::{Error, Result};
use crate::resource::{Identity, ResourceType};
use crate::row::Row;
use crate::statement::{Filter, Projection, Statement};

type Table = Vec<(Identity, Row)>;

#[derive(Default)]
struct MemoryStore {
    tables: HashMap<String, Table>,
    log: Vec<Statement>,
    stats: MemoryStats,
    fail_next: Option<String>,
}

/// Counters describing how an engine was used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connects: usize,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub closes: usize,
}

/// An in-memory engine. Clones share the same store.
#[derive(Clone)]
pub struct MemoryEngine {
    name: Arc<str>,
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryEngine {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            store: Arc::new(Mutex::new(MemoryStore::default())),
        }
    }

    /// Another engine (with its own name and log) over the same data, the way
    /// a replica mirrors its primary.
    pub fn replica(&self, name: impl Into<Arc<str>>) -> MemoryEngine {
        let tables = self.lock().tables.clone();
        let replica = MemoryEngine::new(name);
        replica.lock().tables = tables;
        replica
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle exposing both faces of this engine.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle::dual(
            Arc::clone(&self.name),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
        )
    }

    /// Handle exposing only the blocking face.
    pub fn blocking_handle(&self) -> EngineHandle {
        EngineHandle::blocking(Arc::clone(&self.name), Arc::new(self.clone()))
    }

    /// Handle exposing only the cooperative face.
    pub fn cooperative_handle(&self) -> EngineHandle {
        EngineHandle::cooperative(Arc::clone(&self.name), Arc::new(self.clone()))
    }

    /// Insert committed rows directly, bypassing the statement log.
    pub fn seed(&self, resource: &ResourceType, rows: impl IntoIterator<Item = Row>) {
        let mut store = self.lock();
        let table = store.tables.entry(resource.table().to_string()).or_default();
        for row in rows {
            if let Some(identity) = resource.identity_of(&row) {
                table.retain(|(id, _)| id != &identity);
                table.push((identity, row));
            }
        }
    }

    /// Committed rows of a resource, in insertion order.
    pub fn rows(&self, resource: &ResourceType) -> Vec<Row> {
        self.lock()
            .tables
            .get(resource.table())
            .map(|t| t.iter().map(|(_, row)| row.clone()).collect())
            .unwrap_or_default()
    }

    /// Every statement executed so far, in order.
    pub fn statements(&self) -> Vec<Statement> {
        self.lock().log.clone()
    }

    /// Number of executed selects.
    pub fn select_count(&self) -> usize {
        self.lock().log.iter().filter(|s| !s.is_write()).count()
    }

    /// Number of executed writes.
    pub fn write_count(&self) -> usize {
        self.lock().log.iter().filter(|s| s.is_write()).count()
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats
    }

    /// Make the next executed statement fail with `message`.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.lock().fail_next = Some(message.into());
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self) -> MemoryConnection {
        self.lock().stats.connects += 1;
        tracing::trace!(engine = %self.name, "Opening memory connection");
        MemoryConnection {
            engine: self.clone(),
            in_transaction: false,
            buffer: Vec::new(),
        }
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = self.lock();
        f.debug_struct("MemoryEngine")
            .field("name", &self.name)
            .field("tables", &store.tables.len())
            .field("statements", &store.log.len())
            .field("stats", &store.stats)
            .finish()
    }
}

impl Engine for MemoryEngine {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(self.open()))
    }
}

impl AsyncEngine for MemoryEngine {
    fn connect<'a>(&'a self, _cx: &'a Cx) -> BoxFuture<'a, Outcome<Box<dyn AsyncConnection>, Error>> {
        Box::pin(async move {
            let conn: Box<dyn AsyncConnection> = Box::new(self.open());
            Outcome::Ok(conn)
        })
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A connection to a [`MemoryEngine`].
pub struct MemoryConnection {
    engine: MemoryEngine,
    in_transaction: bool,
    /// Writes waiting for commit.
    buffer: Vec<Statement>,
}

impl MemoryConnection {
    fn run(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        let mut store = self.engine.lock();
        store.log.push(statement.clone());
        if let Some(message) = store.fail_next.take() {
            return Err(Error::engine(self.engine.name(), message));
        }

        match statement {
            Statement::Select {
                resource,
                projection,
                filter,
            } => {
                let mut table = store.tables.get(resource.table()).cloned().unwrap_or_default();
                for pending in self.buffer.iter().filter(|s| s.resource() == resource) {
                    apply(&mut table, pending, self.engine.name())?;
                }
                let rows = table
                    .into_iter()
                    .filter(|(identity, _)| match filter {
                        Filter::All => true,
                        Filter::IdentityIn(ids) => ids.contains(identity),
                    })
                    .map(|(_, row)| match projection {
                        Projection::All => row,
                        Projection::Fields(fields) => row.project(fields),
                    })
                    .collect();
                Ok(rows)
            }
            write if self.in_transaction => {
                // Validate against the current view before buffering.
                let mut view = store
                    .tables
                    .get(write.resource().table())
                    .cloned()
                    .unwrap_or_default();
                for pending in self.buffer.iter().filter(|s| s.resource() == write.resource()) {
                    apply(&mut view, pending, self.engine.name())?;
                }
                apply(&mut view, write, self.engine.name())?;
                self.buffer.push(write.clone());
                Ok(Vec::new())
            }
            write => {
                let table = store
                    .tables
                    .entry(write.resource().table().to_string())
                    .or_default();
                apply(table, write, self.engine.name())?;
                Ok(Vec::new())
            }
        }
    }

    fn begin_tx(&mut self) -> Result<()> {
        self.engine.lock().stats.begins += 1;
        self.in_transaction = true;
        Ok(())
    }

    fn commit_tx(&mut self) -> Result<()> {
        let mut store = self.engine.lock();
        store.stats.commits += 1;
        let writes = std::mem::take(&mut self.buffer);
        self.in_transaction = false;

        // Staged on copies: storage only changes once every write applied.
        let mut staged: HashMap<String, Table> = HashMap::new();
        for write in &writes {
            let name = write.resource().table();
            let table = staged
                .entry(name.to_string())
                .or_insert_with(|| store.tables.get(name).cloned().unwrap_or_default());
            apply(table, write, self.engine.name())?;
        }
        store.tables.extend(staged);
        Ok(())
    }

    fn rollback_tx(&mut self) -> Result<()> {
        self.engine.lock().stats.rollbacks += 1;
        self.buffer.clear();
        self.in_transaction = false;
        Ok(())
    }

    fn close_conn(&mut self) {
        self.buffer.clear();
        self.in_transaction = false;
        self.engine.lock().stats.closes += 1;
    }
}

fn apply(table: &mut Table, statement: &Statement, engine: &str) -> Result<()> {
    match statement {
        Statement::Select { .. } => Ok(()),
        Statement::Insert { resource, row } => {
            let Some(identity) = resource.identity_of(row) else {
                return Err(Error::engine(
                    engine,
                    format!("cannot insert {resource} without identity"),
                ));
            };
            if table.iter().any(|(id, _)| id == &identity) {
                return Err(Error::engine(
                    engine,
                    format!("duplicate identity {identity} for {resource}"),
                ));
            }
            table.push((identity, row.clone()));
            Ok(())
        }
        Statement::Update {
            resource,
            identity,
            row,
        } => match table.iter_mut().find(|(id, _)| id == identity) {
            Some((_, existing)) => {
                existing.merge(row);
                Ok(())
            }
            None => Err(Error::engine(
                engine,
                format!("no {resource} with identity {identity}"),
            )),
        },
        Statement::Delete { identity, .. } => {
            table.retain(|(id, _)| id != identity);
            Ok(())
        }
    }
}

impl Connection for MemoryConnection {
    fn execute(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        self.run(statement)
    }

    fn begin(&mut self) -> Result<()> {
        self.begin_tx()
    }

    fn commit(&mut self) -> Result<()> {
        self.commit_tx()
    }

    fn rollback(&mut self) -> Result<()> {
        self.rollback_tx()
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.close_conn();
        Ok(())
    }
}

fn outcome<T>(result: Result<T>) -> Outcome<T, Error> {
    match result {
        Ok(v) => Outcome::Ok(v),
        Err(e) => Outcome::Err(e),
    }
}

impl AsyncConnection for MemoryConnection {
    fn execute<'a>(
        &'a mut self,
        _cx: &'a Cx,
        statement: &'a Statement,
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>> {
        Box::pin(async move { outcome(self.run(statement)) })
    }

    fn begin<'a>(&'a mut self, _cx: &'a Cx) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move { outcome(self.begin_tx()) })
    }

    fn commit<'a>(&'a mut self, _cx: &'a Cx) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move { outcome(self.commit_tx()) })
    }

    fn rollback<'a>(&'a mut self, _cx: &'a Cx) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move { outcome(self.rollback_tx()) })
    }

    fn close<'a>(mut self: Box<Self>, _cx: &'a Cx) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move {
            self.close_conn();
            Outcome::Ok(())
        })
    }
}
