//! Transactional sessions, engine routing and bulk reference resolution.
//!
//! `unitwork` is the facade crate: it re-exports the public surface of the
//! workspace so applications depend on one crate.
//!
//! - [`unitwork_core`]: data model, storage engine contracts, errors and the
//!   in-memory engine.
//! - [`unitwork_pool`]: the [`EngineRouter`] mapping resource types to read,
//!   write and default engines.
//! - [`unitwork_session`]: sessions, scopes, factories, the ambient
//!   [`Context`] and bulk resolution.
//!
//! # Example
//!
//! ```ignore
//! use unitwork::prelude::*;
//!
//! let primary = MemoryEngine::new("primary");
//! let replica = primary.replica("replica");
//! let router = EngineRouter::builder()
//!     .default_engine(primary.handle())
//!     .route("Order", EngineRoute::new().read(replica.handle()).write(primary.handle()))
//!     .build();
//!
//! let ctx = Context::with_app(
//!     Application::new("shop")
//!         .with_session_factory(SessionMaker::new().routing(Arc::new(router))),
//! );
//!
//! session_scope(&ctx, ScopeOptions::new().on_exit(OnExit::Commit), |session| {
//!     session.add(&order, Row::new().with("id", 42).with("total", 10))
//! })?;
//! ```

pub use unitwork_core::{
    AsyncConnection, AsyncEngine, BoxFuture, ConcurrencyMode, ConfigError, ConfigErrorKind,
    Connection, CustomError, Cx, Engine, EngineError, EngineHandle, Error, Filter, Identity,
    MemoryConnection, MemoryEngine, MemoryStats, ObjectKey, OperationError, Outcome, Projection,
    ResolutionError, ResolutionFailure, ResourceType, Result, Row, Statement, UsageError,
    UsageErrorKind, Value,
};
pub use unitwork_pool::{EngineRoute, EngineRouter, EngineRouterBuilder, ReplicaStrategy};
pub use unitwork_session::{
    AnyBulk, AnySession, Application, AsyncScopeOptions, AsyncScopedSessionMaker,
    AsyncSessionBulk, AsyncSessionFactory, AsyncSessionMaker, BulkEntry, BulkRegistry, BulkScope,
    Context, ContextGuard, ContextToken, CooperativeSession, EntryId, EntryKind, EntryStatus,
    ExpireOnCommitGuard, InstanceState, ObjectState, OnExit, OnMissing, ResolveOptions,
    ResolveQuery, ResolveReport, ResolveScope, ResolveStrategy, Resolver, ResolverStep,
    ResourceRef, ScopeFn, ScopeKey, ScopeOptions, ScopedSessionMaker, Session, SessionBuilder,
    SessionBulk, SessionConfig, SessionDebugInfo, SessionFactory, SessionMaker, TransactionState,
    async_session_dependency, cooperative_scope, session_dependency, session_scope,
    set_expire_on_commit,
};

/// Everything an application needs to open scopes and resolve bulks.
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::{
        Application, AsyncScopeOptions, AsyncSessionMaker, BulkRegistry, ConcurrencyMode,
        Context, CooperativeSession, Cx, EngineHandle, EngineRoute, EngineRouter, EntryStatus,
        Error, Identity, InstanceState, MemoryEngine, OnExit, OnMissing, Outcome,
        ResolveOptions, ResolveScope, ResolveStrategy, ResourceRef, ResourceType, Result, Row,
        ScopeOptions, ScopedSessionMaker, Session, SessionConfig, SessionMaker, Statement, Value,
        async_session_dependency, cooperative_scope, session_dependency, session_scope,
    };
}
