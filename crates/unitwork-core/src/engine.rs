//! Storage engine contracts.
//!
//! The session layer never talks to a driver directly. It binds each operation
//! to an [`EngineHandle`] and opens at most one connection per engine for the
//! lifetime of a transaction. Engines come in two faces:
//!
//! - [`Engine`] / [`Connection`]: blocking, every call runs to completion on the
//!   calling thread.
//! - [`AsyncEngine`] / [`AsyncConnection`]: cooperative, every call is a
//!   suspension point returning an [`Outcome`].
//!
//! A single physical pool may expose both faces through one handle.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use asupersync::{Cx, Outcome};

use crate::error::Result;
use crate::row::Row;
use crate::statement::Statement;
use crate::Error;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Scheduling model a session runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConcurrencyMode {
    /// Operations block the calling thread until they complete.
    Blocking,
    /// Operations suspend at I/O and resume on the same task.
    Cooperative,
}

impl ConcurrencyMode {
    pub fn is_cooperative(self) -> bool {
        self == ConcurrencyMode::Cooperative
    }
}

impl fmt::Display for ConcurrencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcurrencyMode::Blocking => f.write_str("blocking"),
            ConcurrencyMode::Cooperative => f.write_str("cooperative"),
        }
    }
}

// ============================================================================
// Blocking face
// ============================================================================

/// A blocking connection holding at most one open transaction.
pub trait Connection: Send {
    /// Execute a statement, returning the produced rows (empty for writes).
    fn execute(&mut self, statement: &Statement) -> Result<Vec<Row>>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// Release the connection back to its pool.
    fn close(self: Box<Self>) -> Result<()>;
}

/// A blocking connection source.
pub trait Engine: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Connection>>;
}

// ============================================================================
// Cooperative face
// ============================================================================

/// A cooperative connection holding at most one open transaction.
pub trait AsyncConnection: Send {
    fn execute<'a>(
        &'a mut self,
        cx: &'a Cx,
        statement: &'a Statement,
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>>;

    fn begin<'a>(&'a mut self, cx: &'a Cx) -> BoxFuture<'a, Outcome<(), Error>>;

    fn commit<'a>(&'a mut self, cx: &'a Cx) -> BoxFuture<'a, Outcome<(), Error>>;

    fn rollback<'a>(&'a mut self, cx: &'a Cx) -> BoxFuture<'a, Outcome<(), Error>>;

    fn close<'a>(self: Box<Self>, cx: &'a Cx) -> BoxFuture<'a, Outcome<(), Error>>;
}

/// A cooperative connection source.
pub trait AsyncEngine: Send + Sync {
    fn connect<'a>(&'a self, cx: &'a Cx) -> BoxFuture<'a, Outcome<Box<dyn AsyncConnection>, Error>>;
}

// ============================================================================
// Engine Handle
// ============================================================================

/// Named reference to one physical connection pool.
///
/// Handles compare equal by name. Cloning is cheap.
#[derive(Clone)]
pub struct EngineHandle {
    name: Arc<str>,
    blocking: Option<Arc<dyn Engine>>,
    cooperative: Option<Arc<dyn AsyncEngine>>,
}

impl EngineHandle {
    /// Handle exposing only a blocking face.
    pub fn blocking(name: impl Into<Arc<str>>, engine: Arc<dyn Engine>) -> Self {
        Self {
            name: name.into(),
            blocking: Some(engine),
            cooperative: None,
        }
    }

    /// Handle exposing only a cooperative face.
    pub fn cooperative(name: impl Into<Arc<str>>, engine: Arc<dyn AsyncEngine>) -> Self {
        Self {
            name: name.into(),
            blocking: None,
            cooperative: Some(engine),
        }
    }

    /// Handle exposing both faces of the same pool.
    pub fn dual(
        name: impl Into<Arc<str>>,
        blocking: Arc<dyn Engine>,
        cooperative: Arc<dyn AsyncEngine>,
    ) -> Self {
        Self {
            name: name.into(),
            blocking: Some(blocking),
            cooperative: Some(cooperative),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the handle can serve sessions running under `mode`.
    pub fn supports(&self, mode: ConcurrencyMode) -> bool {
        match mode {
            ConcurrencyMode::Blocking => self.blocking.is_some(),
            ConcurrencyMode::Cooperative => self.cooperative.is_some(),
        }
    }

    pub fn as_blocking(&self) -> Option<&Arc<dyn Engine>> {
        self.blocking.as_ref()
    }

    pub fn as_cooperative(&self) -> Option<&Arc<dyn AsyncEngine>> {
        self.cooperative.as_ref()
    }
}

impl PartialEq for EngineHandle {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for EngineHandle {}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("name", &self.name)
            .field("blocking", &self.blocking.is_some())
            .field("cooperative", &self.cooperative.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoEngine;

    impl Engine for NoEngine {
        fn connect(&self) -> Result<Box<dyn Connection>> {
            Err(Error::engine("none", "cannot connect"))
        }
    }

    #[test]
    fn test_handle_mode_support() {
        let handle = EngineHandle::blocking("primary", Arc::new(NoEngine));
        assert!(handle.supports(ConcurrencyMode::Blocking));
        assert!(!handle.supports(ConcurrencyMode::Cooperative));
        assert_eq!(handle.name(), "primary");
        assert!(handle.as_cooperative().is_none());
    }

    #[test]
    fn test_handle_equality_by_name() {
        let a = EngineHandle::blocking("primary", Arc::new(NoEngine));
        let b = EngineHandle::blocking("primary", Arc::new(NoEngine));
        let c = EngineHandle::blocking("replica", Arc::new(NoEngine));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
