//! Ambient state for one execution unit.
//!
//! A [`Context`] carries three slots: the current session, the current bulk
//! registry and the current application. Each slot is set with a token that
//! restores the previous value, so nested scopes unwind symmetrically.
//!
//! Clones of a `Context` share one execution unit. A child unit (a spawned
//! task, another thread) takes [`Context::fork`], which snapshots the current
//! values into independent storage.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use unitwork_core::ConcurrencyMode;

use crate::bulk::{AsyncSessionBulk, BulkRegistry, SessionBulk};
use crate::cooperative::CooperativeSession;
use crate::factory::Application;
use crate::session::Session;

/// The ambient session, in either concurrency mode.
#[derive(Clone)]
pub enum AnySession {
    Blocking(Session),
    Cooperative(CooperativeSession),
}

impl AnySession {
    pub fn mode(&self) -> ConcurrencyMode {
        match self {
            AnySession::Blocking(_) => ConcurrencyMode::Blocking,
            AnySession::Cooperative(_) => ConcurrencyMode::Cooperative,
        }
    }

    /// The blocking session carrying flags and bind resolution.
    ///
    /// For a cooperative session this is its internally owned delegate.
    pub fn sync_session(&self) -> &Session {
        match self {
            AnySession::Blocking(session) => session,
            AnySession::Cooperative(session) => session.sync_session(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sync_session().is_closed()
    }
}

impl fmt::Debug for AnySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnySession")
            .field("mode", &self.mode())
            .field("id", &self.sync_session().id())
            .finish()
    }
}

impl From<Session> for AnySession {
    fn from(session: Session) -> Self {
        AnySession::Blocking(session)
    }
}

impl From<CooperativeSession> for AnySession {
    fn from(session: CooperativeSession) -> Self {
        AnySession::Cooperative(session)
    }
}

/// The ambient bulk registry, in either concurrency mode.
#[derive(Clone)]
pub enum AnyBulk {
    Blocking(SessionBulk),
    Cooperative(AsyncSessionBulk),
}

impl AnyBulk {
    pub fn registry(&self) -> &BulkRegistry {
        match self {
            AnyBulk::Blocking(bulk) => bulk.registry(),
            AnyBulk::Cooperative(bulk) => bulk.registry(),
        }
    }

    pub fn mode(&self) -> ConcurrencyMode {
        match self {
            AnyBulk::Blocking(_) => ConcurrencyMode::Blocking,
            AnyBulk::Cooperative(_) => ConcurrencyMode::Cooperative,
        }
    }
}

impl fmt::Debug for AnyBulk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyBulk")
            .field("mode", &self.mode())
            .field("entries", &self.registry().len())
            .finish()
    }
}

impl From<SessionBulk> for AnyBulk {
    fn from(bulk: SessionBulk) -> Self {
        AnyBulk::Blocking(bulk)
    }
}

impl From<AsyncSessionBulk> for AnyBulk {
    fn from(bulk: AsyncSessionBulk) -> Self {
        AnyBulk::Cooperative(bulk)
    }
}

#[derive(Clone, Default)]
struct Slots {
    session: Option<AnySession>,
    bulk: Option<AnyBulk>,
    app: Option<Arc<Application>>,
}

/// Previous value of one slot, restored by [`Context::reset`].
#[must_use = "dropping a token without resetting leaves the slot published"]
pub struct ContextToken(Previous);

enum Previous {
    Session(Option<AnySession>),
    Bulk(Option<AnyBulk>),
    App(Option<Arc<Application>>),
}

/// Explicit ambient state handle.
///
/// Clones share one execution unit. Concurrent units interleaving scopes on
/// clones restore each other's slots out of order, so give each concurrent
/// unit its own [`Context::fork`].
#[derive(Clone, Default)]
pub struct Context {
    slots: Arc<Mutex<Slots>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context whose application slot is already set.
    pub fn with_app(app: Application) -> Self {
        let ctx = Self::new();
        ctx.lock().app = Some(Arc::new(app));
        ctx
    }

    /// Snapshot the current values into an isolated context.
    pub fn fork(&self) -> Context {
        let slots = self.lock().clone();
        Context {
            slots: Arc::new(Mutex::new(slots)),
        }
    }

    /// Whether both handles share one execution unit.
    pub fn same_unit(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.slots, &other.slots)
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session(&self) -> Option<AnySession> {
        self.lock().session.clone()
    }

    pub fn bulk(&self) -> Option<AnyBulk> {
        self.lock().bulk.clone()
    }

    pub fn app(&self) -> Option<Arc<Application>> {
        self.lock().app.clone()
    }

    pub fn set_session(&self, session: Option<AnySession>) -> ContextToken {
        let previous = std::mem::replace(&mut self.lock().session, session);
        ContextToken(Previous::Session(previous))
    }

    pub fn set_bulk(&self, bulk: Option<AnyBulk>) -> ContextToken {
        let previous = std::mem::replace(&mut self.lock().bulk, bulk);
        ContextToken(Previous::Bulk(previous))
    }

    pub fn set_app(&self, app: Option<Arc<Application>>) -> ContextToken {
        let previous = std::mem::replace(&mut self.lock().app, app);
        ContextToken(Previous::App(previous))
    }

    /// Restore the slot value captured by `token`.
    pub fn reset(&self, token: ContextToken) {
        let mut slots = self.lock();
        match token.0 {
            Previous::Session(previous) => slots.session = previous,
            Previous::Bulk(previous) => slots.bulk = previous,
            Previous::App(previous) => slots.app = previous,
        }
    }

    /// Publish `session` until the returned guard drops.
    pub fn enter_session(&self, session: impl Into<AnySession>) -> ContextGuard<'_> {
        ContextGuard {
            ctx: self,
            token: Some(self.set_session(Some(session.into()))),
        }
    }

    /// Publish `bulk` until the returned guard drops.
    pub fn enter_bulk(&self, bulk: impl Into<AnyBulk>) -> ContextGuard<'_> {
        ContextGuard {
            ctx: self,
            token: Some(self.set_bulk(Some(bulk.into()))),
        }
    }

    /// Publish `app` until the returned guard drops.
    pub fn enter_app(&self, app: Arc<Application>) -> ContextGuard<'_> {
        ContextGuard {
            ctx: self,
            token: Some(self.set_app(Some(app))),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.lock();
        f.debug_struct("Context")
            .field("session", &slots.session)
            .field("bulk", &slots.bulk)
            .field("app", &slots.app.as_ref().map(|app| app.name().to_string()))
            .finish()
    }
}

/// Resets one context slot when dropped.
#[must_use = "the slot is reset as soon as the guard drops"]
pub struct ContextGuard<'c> {
    ctx: &'c Context,
    token: Option<ContextToken>,
}

impl ContextGuard<'_> {
    /// Reset the slot now.
    pub fn exit(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(token) = self.token.take() {
            self.ctx.reset(token);
        }
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
