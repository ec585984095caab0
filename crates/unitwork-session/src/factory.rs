//! Session factories.
//!
//! A maker captures bind, routing, per-resource binds and config, and stamps
//! out sessions. A scoped maker keys one session per execution unit through a
//! scope key function and hands back the same session until it is removed.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use asupersync::{Cx, Outcome};
use unitwork_core::{EngineHandle, Error, Result};
use unitwork_pool::EngineRouter;

use crate::cooperative::CooperativeSession;
use crate::session::{Session, SessionBuilder, SessionConfig};

/// Identifies one execution unit for scoped factories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeKey(u64);

impl ScopeKey {
    /// Key derived from any hashable value (a task id, a request id).
    pub fn of<T: Hash + ?Sized>(value: &T) -> Self {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        ScopeKey(hasher.finish())
    }

    /// Key of the calling thread.
    pub fn current_thread() -> Self {
        Self::of(&std::thread::current().id())
    }
}

/// Function returning the key of the calling execution unit.
pub type ScopeFn = Arc<dyn Fn() -> ScopeKey + Send + Sync>;

// ============================================================================
// Makers
// ============================================================================

/// Creates blocking sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionMaker {
    builder: SessionBuilder,
}

impl SessionMaker {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bind(mut self, engine: EngineHandle) -> Self {
        self.builder = self.builder.bind(engine);
        self
    }

    #[must_use]
    pub fn routing(mut self, router: Arc<EngineRouter>) -> Self {
        self.builder = self.builder.routing(router);
        self
    }

    #[must_use]
    pub fn bind_resource(mut self, resource: impl Into<String>, engine: EngineHandle) -> Self {
        self.builder = self.builder.bind_resource(resource, engine);
        self
    }

    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.builder = self.builder.config(config);
        self
    }

    pub fn create(&self) -> Session {
        self.builder.clone().build()
    }
}

impl From<SessionBuilder> for SessionMaker {
    fn from(builder: SessionBuilder) -> Self {
        Self { builder }
    }
}

/// Creates cooperative sessions.
#[derive(Debug, Clone, Default)]
pub struct AsyncSessionMaker {
    builder: SessionBuilder,
}

impl AsyncSessionMaker {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bind(mut self, engine: EngineHandle) -> Self {
        self.builder = self.builder.bind(engine);
        self
    }

    #[must_use]
    pub fn routing(mut self, router: Arc<EngineRouter>) -> Self {
        self.builder = self.builder.routing(router);
        self
    }

    #[must_use]
    pub fn bind_resource(mut self, resource: impl Into<String>, engine: EngineHandle) -> Self {
        self.builder = self.builder.bind_resource(resource, engine);
        self
    }

    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.builder = self.builder.config(config);
        self
    }

    pub fn create(&self) -> CooperativeSession {
        self.builder.clone().build_cooperative()
    }
}

impl From<SessionBuilder> for AsyncSessionMaker {
    fn from(builder: SessionBuilder) -> Self {
        Self { builder }
    }
}

// ============================================================================
// Scoped Makers
// ============================================================================

struct ScopedRegistry<S> {
    scopefunc: ScopeFn,
    sessions: Mutex<HashMap<ScopeKey, S>>,
}

impl<S: Clone> ScopedRegistry<S> {
    fn new(scopefunc: ScopeFn) -> Self {
        Self {
            scopefunc,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ScopeKey, S>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_or_create(&self, create: impl FnOnce() -> S) -> S {
        let key = (self.scopefunc)();
        self.lock().entry(key).or_insert_with(create).clone()
    }

    fn take(&self) -> Option<S> {
        let key = (self.scopefunc)();
        self.lock().remove(&key)
    }

    fn has(&self) -> bool {
        let key = (self.scopefunc)();
        self.lock().contains_key(&key)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// One blocking session per execution unit.
#[derive(Clone)]
pub struct ScopedSessionMaker {
    maker: SessionMaker,
    registry: Arc<ScopedRegistry<Session>>,
}

impl ScopedSessionMaker {
    /// Scope sessions by the calling thread.
    pub fn new(maker: SessionMaker) -> Self {
        Self::with_scopefunc(maker, Arc::new(ScopeKey::current_thread))
    }

    pub fn with_scopefunc(maker: SessionMaker, scopefunc: ScopeFn) -> Self {
        Self {
            maker,
            registry: Arc::new(ScopedRegistry::new(scopefunc)),
        }
    }

    /// Session of the calling execution unit, created on first use.
    ///
    /// A session closed behind the registry's back is replaced.
    pub fn get(&self) -> Session {
        let session = self.registry.get_or_create(|| self.maker.create());
        if session.is_closed() {
            self.registry.take();
            return self.registry.get_or_create(|| self.maker.create());
        }
        session
    }

    /// Close and forget the session of the calling execution unit.
    pub fn remove(&self) -> Result<()> {
        match self.registry.take() {
            Some(session) => {
                tracing::debug!(session = session.id(), "Removing scoped session");
                session.close()
            }
            None => Ok(()),
        }
    }

    pub fn has_session(&self) -> bool {
        self.registry.has()
    }

    /// Number of execution units holding a session.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }
}

impl fmt::Debug for ScopedSessionMaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedSessionMaker")
            .field("maker", &self.maker)
            .field("sessions", &self.registry.len())
            .finish()
    }
}

/// One cooperative session per execution unit.
///
/// Cooperative tasks share threads, so the caller supplies a per-task key.
#[derive(Clone)]
pub struct AsyncScopedSessionMaker {
    maker: AsyncSessionMaker,
    registry: Arc<ScopedRegistry<CooperativeSession>>,
}

impl AsyncScopedSessionMaker {
    pub fn new(maker: AsyncSessionMaker, scopefunc: ScopeFn) -> Self {
        Self {
            maker,
            registry: Arc::new(ScopedRegistry::new(scopefunc)),
        }
    }

    pub fn get(&self) -> CooperativeSession {
        let session = self.registry.get_or_create(|| self.maker.create());
        if session.is_closed() {
            self.registry.take();
            return self.registry.get_or_create(|| self.maker.create());
        }
        session
    }

    /// Close and forget the session of the calling execution unit.
    pub async fn remove(&self, cx: &Cx) -> Outcome<(), Error> {
        match self.registry.take() {
            Some(session) => {
                tracing::debug!(session = session.id(), "Removing scoped session");
                session.close(cx).await
            }
            None => Outcome::Ok(()),
        }
    }

    /// Forget the session of the calling execution unit, closing it without
    /// suspending.
    pub fn remove_now(&self) {
        if let Some(session) = self.registry.take() {
            session.close_now();
        }
    }

    pub fn has_session(&self) -> bool {
        self.registry.has()
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }
}

impl fmt::Debug for AsyncScopedSessionMaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncScopedSessionMaker")
            .field("maker", &self.maker)
            .field("sessions", &self.registry.len())
            .finish()
    }
}

// ============================================================================
// Factories
// ============================================================================

/// Any blocking session factory.
#[derive(Debug, Clone)]
pub enum SessionFactory {
    Plain(SessionMaker),
    Scoped(ScopedSessionMaker),
}

impl SessionFactory {
    pub fn session(&self) -> Session {
        match self {
            SessionFactory::Plain(maker) => maker.create(),
            SessionFactory::Scoped(scoped) => scoped.get(),
        }
    }

    pub fn is_scoped(&self) -> bool {
        matches!(self, SessionFactory::Scoped(_))
    }

    /// Release a session obtained from this factory: recycle it through the
    /// removal hook when scoped, close it otherwise.
    pub fn release(&self, session: &Session) -> Result<()> {
        match self {
            SessionFactory::Plain(_) => session.close(),
            SessionFactory::Scoped(scoped) => scoped.remove(),
        }
    }
}

impl From<SessionMaker> for SessionFactory {
    fn from(maker: SessionMaker) -> Self {
        SessionFactory::Plain(maker)
    }
}

impl From<ScopedSessionMaker> for SessionFactory {
    fn from(scoped: ScopedSessionMaker) -> Self {
        SessionFactory::Scoped(scoped)
    }
}

/// Any cooperative session factory.
#[derive(Debug, Clone)]
pub enum AsyncSessionFactory {
    Plain(AsyncSessionMaker),
    Scoped(AsyncScopedSessionMaker),
}

impl AsyncSessionFactory {
    pub fn session(&self) -> CooperativeSession {
        match self {
            AsyncSessionFactory::Plain(maker) => maker.create(),
            AsyncSessionFactory::Scoped(scoped) => scoped.get(),
        }
    }

    pub fn is_scoped(&self) -> bool {
        matches!(self, AsyncSessionFactory::Scoped(_))
    }

    pub async fn release(&self, cx: &Cx, session: &CooperativeSession) -> Outcome<(), Error> {
        match self {
            AsyncSessionFactory::Plain(_) => session.close(cx).await,
            AsyncSessionFactory::Scoped(scoped) => scoped.remove(cx).await,
        }
    }

    /// Release without suspending, for dropped scope futures.
    pub fn release_now(&self, session: &CooperativeSession) {
        match self {
            AsyncSessionFactory::Plain(_) => session.close_now(),
            AsyncSessionFactory::Scoped(scoped) => scoped.remove_now(),
        }
    }
}

impl From<AsyncSessionMaker> for AsyncSessionFactory {
    fn from(maker: AsyncSessionMaker) -> Self {
        AsyncSessionFactory::Plain(maker)
    }
}

impl From<AsyncScopedSessionMaker> for AsyncSessionFactory {
    fn from(scoped: AsyncScopedSessionMaker) -> Self {
        AsyncSessionFactory::Scoped(scoped)
    }
}

// ============================================================================
// Application
// ============================================================================

/// The current application: its registered session factories.
#[derive(Debug, Clone, Default)]
pub struct Application {
    name: String,
    session: Option<SessionFactory>,
    async_session: Option<AsyncSessionFactory>,
}

impl Application {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_session_factory(mut self, factory: impl Into<SessionFactory>) -> Self {
        self.session = Some(factory.into());
        self
    }

    #[must_use]
    pub fn with_async_session_factory(mut self, factory: impl Into<AsyncSessionFactory>) -> Self {
        self.async_session = Some(factory.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_factory(&self) -> Option<&SessionFactory> {
        self.session.as_ref()
    }

    pub fn async_session_factory(&self) -> Option<&AsyncSessionFactory> {
        self.async_session.as_ref()
    }
}
