//! Sessions, session scopes and bulk resolution for Unitwork.
//!
//! The [`Session`] is the central unit-of-work manager. It resolves the engine
//! serving each operation, tracks rows added, updated and deleted, and
//! coordinates flushing them before a commit. [`CooperativeSession`] offers
//! the same contract with every I/O operation as a suspension point.
//!
//! # Design Philosophy
//!
//! - **Explicit ambient state**: the current session, bulk registry and
//!   application live in a [`Context`] passed to scopes, never in a global.
//! - **One contract, two schedulers**: the cooperative session delegates bind
//!   resolution and object tracking to a blocking session it owns.
//! - **Guaranteed release**: scopes roll back and release on every exit path.
//! - **Storage-agnostic resolution**: the bulk [`Resolver`] is a state machine
//!   that yields queries and consumes rows.
//!
//! # Example
//!
//! ```ignore
//! let ctx = Context::with_app(
//!     Application::new("shop").with_session_factory(SessionMaker::new().routing(router)),
//! );
//!
//! session_scope(&ctx, ScopeOptions::new().on_exit(OnExit::Commit), |session| {
//!     let bulk = session.bulk(&ctx, true);
//!     let order = bulk.register_reference(&order_type, 42)?;
//!     bulk.resolve(ResolveOptions::new().strategy(ResolveStrategy::Hydrate))?;
//!     session.update(&order_type, order.fields().with("status", "paid"))
//! })?;
//! ```

/// Unwrap an `Outcome`, returning early on anything but `Ok`.
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            ::asupersync::Outcome::Ok(value) => value,
            ::asupersync::Outcome::Err(e) => return ::asupersync::Outcome::Err(e),
            ::asupersync::Outcome::Cancelled(r) => return ::asupersync::Outcome::Cancelled(r),
            ::asupersync::Outcome::Panicked(p) => return ::asupersync::Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result` inside a function returning `Outcome`.
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return ::asupersync::Outcome::Err(e),
        }
    };
}

pub mod bulk;
pub mod context;
pub mod cooperative;
pub mod dependency;
pub mod factory;
pub mod resolver;
pub mod scope;
pub mod session;

pub use bulk::{
    AsyncSessionBulk, BulkEntry, BulkRegistry, BulkScope, EntryId, EntryKind, EntryStatus,
    InstanceState, ResourceRef, SessionBulk,
};
pub use context::{AnyBulk, AnySession, Context, ContextGuard, ContextToken};
pub use cooperative::CooperativeSession;
pub use dependency::{async_session_dependency, session_dependency};
pub use factory::{
    Application, AsyncScopedSessionMaker, AsyncSessionFactory, AsyncSessionMaker, ScopeFn,
    ScopeKey, ScopedSessionMaker, SessionFactory, SessionMaker,
};
pub use resolver::{
    ResolveOptions, ResolveQuery, ResolveReport, ResolveScope, ResolveStrategy, Resolver,
    ResolverStep,
};
pub use scope::{
    AsyncScopeOptions, OnExit, OnMissing, ScopeOptions, cooperative_scope, session_scope,
    set_expire_on_commit,
};
pub use session::{
    ExpireOnCommitGuard, ObjectState, Session, SessionBuilder, SessionConfig, SessionDebugInfo,
    TransactionState,
};
