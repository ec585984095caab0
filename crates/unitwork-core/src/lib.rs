//! Core types and storage contracts for Unitwork.
//!
//! `unitwork-core` is the **foundation layer** of the workspace. It defines the
//! data model shared by routing, sessions and bulk resolution, and the traits a
//! storage engine implements to be driven by a session.
//!
//! # Role In The Architecture
//!
//! - **Contract layer**: `Engine`/`Connection` (blocking) and
//!   `AsyncEngine`/`AsyncConnection` (cooperative) are implemented by storage
//!   drivers; `EngineHandle` names one pool and exposes either face.
//! - **Data model**: `Value`, `Row`, `ResourceType`, `Identity` and `Statement`
//!   describe what is read and written without committing to a query language.
//! - **Structured concurrency**: re-exports `Cx` and `Outcome` from asupersync so
//!   every cooperative operation is cancel-correct.
//!
//! # Who Uses This Crate
//!
//! - `unitwork-pool` maps resource types to engine handles.
//! - `unitwork-session` binds sessions to engines and executes statements.
//! - `MemoryEngine` backs tests and prototypes.

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod engine;
pub mod error;
pub mod memory;
pub mod resource;
pub mod row;
pub mod statement;
pub mod value;

pub use engine::{
    AsyncConnection, AsyncEngine, BoxFuture, ConcurrencyMode, Connection, Engine, EngineHandle,
};
pub use error::{
    ConfigError, ConfigErrorKind, CustomError, EngineError, Error, OperationError,
    ResolutionError, ResolutionFailure, Result, UsageError, UsageErrorKind,
};
pub use memory::{MemoryConnection, MemoryEngine, MemoryStats};
pub use resource::{Identity, ObjectKey, ResourceType};
pub use row::Row;
pub use statement::{Filter, Projection, Statement};
pub use value::Value;
