//! Scoped session acquisition.
//!
//! [`session_scope`] and [`cooperative_scope`] hand a session to a body:
//! the ambient session of the context when there is one, otherwise a fresh
//! session published as ambient for the duration of the body. A scope that
//! creates its session also finishes it: the exit action runs after a
//! successful body, a failed body is rolled back, and the session is
//! un-published and released on every exit path, panics and dropped futures
//! included.

use std::future::Future;

use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use unitwork_core::{ConcurrencyMode, ConfigErrorKind, Error, Result, UsageErrorKind};

use crate::context::{AnySession, Context, ContextGuard};
use crate::cooperative::CooperativeSession;
use crate::factory::{AsyncSessionFactory, SessionFactory};
use crate::session::{ExpireOnCommitGuard, Session};

/// What to do when the context has no ambient session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnMissing {
    #[default]
    Create,
    Raise,
}

/// Action applied after a successful body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnExit {
    Commit,
    Flush,
    Rollback,
    #[default]
    None,
}

/// Options of one scope.
#[derive(Debug, Clone)]
pub struct ScopeOptions<F = SessionFactory> {
    using: Option<F>,
    new_session: bool,
    on_missing: OnMissing,
    on_exit: OnExit,
    expire: Option<bool>,
}

/// Options of one cooperative scope.
pub type AsyncScopeOptions = ScopeOptions<AsyncSessionFactory>;

impl<F> Default for ScopeOptions<F> {
    fn default() -> Self {
        Self {
            using: None,
            new_session: false,
            on_missing: OnMissing::Create,
            on_exit: OnExit::None,
            expire: None,
        }
    }
}

impl<F> ScopeOptions<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create sessions from `factory` instead of the application's.
    #[must_use]
    pub fn using(mut self, factory: impl Into<F>) -> Self {
        self.using = Some(factory.into());
        self
    }

    /// Always create a session, shadowing any ambient one.
    #[must_use]
    pub fn new_session(mut self, value: bool) -> Self {
        self.new_session = value;
        self
    }

    #[must_use]
    pub fn on_missing(mut self, on_missing: OnMissing) -> Self {
        self.on_missing = on_missing;
        self
    }

    #[must_use]
    pub fn on_exit(mut self, on_exit: OnExit) -> Self {
        self.on_exit = on_exit;
        self
    }

    /// Expire-on-commit override for the exit commit.
    #[must_use]
    pub fn expire(mut self, expire: Option<bool>) -> Self {
        self.expire = expire;
        self
    }
}

fn mode_mismatch(expected: ConcurrencyMode, found: ConcurrencyMode) -> Error {
    Error::usage(
        UsageErrorKind::ModeMismatch,
        format!(
            "Invalid session type found in the current context. Expected a {expected} session but found a {found} session."
        ),
    )
}

fn no_session() -> Error {
    Error::config(
        ConfigErrorKind::NoSession,
        "No session found in the current context.",
    )
}

fn no_factory() -> Error {
    Error::config(
        ConfigErrorKind::NoFactory,
        "No session factory available in the current context.",
    )
}

// ============================================================================
// Blocking
// ============================================================================

/// Run `body` with the ambient session, or with a new one.
#[tracing::instrument(level = "debug", skip(ctx, options, body), fields(on_exit = ?options.on_exit))]
pub fn session_scope<T, B>(ctx: &Context, options: ScopeOptions<SessionFactory>, body: B) -> Result<T>
where
    B: FnOnce(&Session) -> Result<T>,
{
    if !options.new_session {
        match ctx.session() {
            Some(AnySession::Blocking(session)) => {
                let value = body(&session)?;
                finish(&session, options.on_exit, options.expire)?;
                return Ok(value);
            }
            Some(AnySession::Cooperative(_)) => {
                return Err(mode_mismatch(
                    ConcurrencyMode::Blocking,
                    ConcurrencyMode::Cooperative,
                ));
            }
            None if options.on_missing == OnMissing::Raise => return Err(no_session()),
            None => {}
        }
    }

    let factory = match options.using {
        Some(factory) => factory,
        None => ctx
            .app()
            .and_then(|app| app.session_factory().cloned())
            .ok_or_else(no_factory)?,
    };

    let session = factory.session();
    tracing::debug!(session = session.id(), scoped = factory.is_scoped(), "Opened scope session");
    let scope = OwnedScope {
        publication: Some(ctx.enter_session(session.clone())),
        factory,
        session,
        released: false,
    };

    match body(&scope.session) {
        Ok(value) => {
            finish(&scope.session, options.on_exit, options.expire)?;
            scope.release()?;
            Ok(value)
        }
        Err(cause) => {
            tracing::warn!(session = scope.session.id(), error = %cause, "Scope failed, rolling back");
            if let Err(e) = scope.session.rollback() {
                tracing::warn!(session = scope.session.id(), error = %e, "Rollback after scope failure failed");
            }
            if let Err(e) = scope.release() {
                tracing::warn!(error = %e, "Failed to release scope session");
            }
            Err(Error::operation(cause))
        }
    }
}

fn finish(session: &Session, on_exit: OnExit, expire: Option<bool>) -> Result<()> {
    match on_exit {
        OnExit::Commit => session.commit(expire),
        OnExit::Flush => session.flush(),
        OnExit::Rollback => session.rollback(),
        OnExit::None => Ok(()),
    }
}

/// A session created by a blocking scope.
///
/// Dropping it un-publishes the session and then releases it through its
/// factory.
struct OwnedScope<'c> {
    publication: Option<ContextGuard<'c>>,
    factory: SessionFactory,
    session: Session,
    released: bool,
}

impl OwnedScope<'_> {
    fn release(mut self) -> Result<()> {
        self.released = true;
        self.publication.take();
        self.factory.release(&self.session)
    }
}

impl Drop for OwnedScope<'_> {
    fn drop(&mut self) {
        self.publication.take();
        if !self.released {
            if let Err(e) = self.factory.release(&self.session) {
                tracing::warn!(session = self.session.id(), error = %e, "Failed to release scope session");
            }
        }
    }
}

// ============================================================================
// Cooperative
// ============================================================================

/// Run `body` with the ambient cooperative session, or with a new one.
///
/// A body `Err` is rolled back and wrapped. `Cancelled` and `Panicked`
/// outcomes are rolled back and propagated unchanged.
pub async fn cooperative_scope<T, B, Fut>(
    ctx: &Context,
    cx: &Cx,
    options: AsyncScopeOptions,
    body: B,
) -> Outcome<T, Error>
where
    B: FnOnce(CooperativeSession) -> Fut,
    Fut: Future<Output = Outcome<T, Error>>,
{
    if !options.new_session {
        match ctx.session() {
            Some(AnySession::Cooperative(session)) => {
                let value = try_outcome!(body(session.clone()).await);
                try_outcome!(finish_cooperative(cx, &session, options.on_exit, options.expire).await);
                return Outcome::Ok(value);
            }
            Some(AnySession::Blocking(_)) => {
                return Outcome::Err(mode_mismatch(
                    ConcurrencyMode::Cooperative,
                    ConcurrencyMode::Blocking,
                ));
            }
            None if options.on_missing == OnMissing::Raise => return Outcome::Err(no_session()),
            None => {}
        }
    }

    let factory = match options.using {
        Some(factory) => factory,
        None => match ctx.app().and_then(|app| app.async_session_factory().cloned()) {
            Some(factory) => factory,
            None => return Outcome::Err(no_factory()),
        },
    };

    let session = factory.session();
    tracing::debug!(session = session.id(), scoped = factory.is_scoped(), "Opened cooperative scope session");
    let mut scope = OwnedAsyncScope {
        publication: Some(ctx.enter_session(session.clone())),
        factory,
        session,
        released: false,
    };

    let outcome = body(scope.session.clone()).await;
    let outcome = match outcome {
        Outcome::Ok(value) => {
            match finish_cooperative(cx, &scope.session, options.on_exit, options.expire).await {
                Outcome::Ok(()) => Outcome::Ok(value),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
        Outcome::Err(cause) => {
            tracing::warn!(session = scope.session.id(), error = %cause, "Scope failed, rolling back");
            rollback_after_failure(cx, &scope.session).await;
            Outcome::Err(Error::operation(cause))
        }
        Outcome::Cancelled(r) => {
            tracing::warn!(session = scope.session.id(), "Scope cancelled, rolling back");
            rollback_after_failure(cx, &scope.session).await;
            Outcome::Cancelled(r)
        }
        Outcome::Panicked(p) => {
            tracing::warn!(session = scope.session.id(), "Scope panicked, rolling back");
            rollback_after_failure(cx, &scope.session).await;
            Outcome::Panicked(p)
        }
    };

    let released = scope.release(cx).await;
    match (outcome, released) {
        (Outcome::Ok(value), Outcome::Ok(())) => Outcome::Ok(value),
        (Outcome::Ok(_), Outcome::Err(e)) => Outcome::Err(e),
        (Outcome::Ok(_), Outcome::Cancelled(r)) => Outcome::Cancelled(r),
        (Outcome::Ok(_), Outcome::Panicked(p)) => Outcome::Panicked(p),
        (failure, _) => failure,
    }
}

async fn finish_cooperative(
    cx: &Cx,
    session: &CooperativeSession,
    on_exit: OnExit,
    expire: Option<bool>,
) -> Outcome<(), Error> {
    match on_exit {
        OnExit::Commit => session.commit(cx, expire).await,
        OnExit::Flush => session.flush(cx).await,
        OnExit::Rollback => session.rollback(cx).await,
        OnExit::None => Outcome::Ok(()),
    }
}

async fn rollback_after_failure(cx: &Cx, session: &CooperativeSession) {
    match session.rollback(cx).await {
        Outcome::Ok(()) => {}
        Outcome::Err(e) => {
            tracing::warn!(session = session.id(), error = %e, "Rollback after scope failure failed");
        }
        _ => tracing::warn!(session = session.id(), "Rollback after scope failure interrupted"),
    }
}

/// A session created by a cooperative scope.
///
/// Released through the factory once the body finishes. When the scope
/// future is dropped first, the guard un-publishes the session and closes it
/// without suspending.
struct OwnedAsyncScope<'c> {
    publication: Option<ContextGuard<'c>>,
    factory: AsyncSessionFactory,
    session: CooperativeSession,
    released: bool,
}

impl OwnedAsyncScope<'_> {
    async fn release(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.publication.take();
        let outcome = self.factory.release(cx, &self.session).await;
        self.released = true;
        outcome
    }
}

impl Drop for OwnedAsyncScope<'_> {
    fn drop(&mut self) {
        self.publication.take();
        if !self.released {
            tracing::warn!(session = self.session.id(), "Scope dropped before release");
            self.factory.release_now(&self.session);
        }
    }
}

// ============================================================================
// Expire-on-commit
// ============================================================================

/// Override the expire-on-commit policy of `session`, or of the ambient
/// session, until the guard drops.
pub fn set_expire_on_commit(
    ctx: &Context,
    value: bool,
    session: Option<&AnySession>,
) -> Result<ExpireOnCommitGuard> {
    let session = match session {
        Some(session) => session.clone(),
        None => ctx.session().ok_or_else(no_session)?,
    };
    Ok(session.sync_session().set_expire_on_commit(value))
}
