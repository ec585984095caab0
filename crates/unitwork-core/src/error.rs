//! Error types for Unitwork.
//!
//! Every fallible operation in the workspace reports an [`Error`]. The variants
//! follow the failure classes a session layer can observe:
//!
//! - [`Error::Config`]: a factory, bind or ambient session is missing where one
//!   is required. Fatal and never retried.
//! - [`Error::Usage`]: the API was used against its contract (mode mismatch,
//!   closed session, concurrent use of one session).
//! - [`Error::Operation`]: a scope body failed; the transaction was rolled back
//!   and the original error is available through [`std::error::Error::source`].
//! - [`Error::Resolution`]: bulk entries could not be resolved.
//! - [`Error::Engine`]: the storage engine reported a failure.
//! - [`Error::Custom`]: an application error raised from inside a scope body.

use std::fmt;

use crate::resource::Identity;

/// The error type for all Unitwork operations.
#[derive(Debug)]
pub enum Error {
    /// Missing factory, bind or ambient session.
    Config(ConfigError),
    /// Contract violation by the caller.
    Usage(UsageError),
    /// A scope body failed and its transaction was rolled back.
    Operation(OperationError),
    /// One or more bulk entries could not be resolved.
    Resolution(ResolutionError),
    /// Failure reported by a storage engine or connection.
    Engine(EngineError),
    /// Application-defined failure raised inside a scope body.
    Custom(CustomError),
}

/// Result type alias for Unitwork operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a configuration error.
    pub fn config(kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for a usage error.
    pub fn usage(kind: UsageErrorKind, message: impl Into<String>) -> Self {
        Error::Usage(UsageError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for an engine error without an underlying source.
    pub fn engine(engine: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Engine(EngineError {
            engine: engine.into(),
            message: message.into(),
            source: None,
        })
    }

    /// Wrap an arbitrary application message.
    pub fn custom(message: impl Into<String>) -> Self {
        Error::Custom(CustomError {
            message: message.into(),
            source: None,
        })
    }

    /// Wrap an arbitrary application error, keeping it as the source.
    pub fn custom_from(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Custom(CustomError {
            message: source.to_string(),
            source: Some(Box::new(source)),
        })
    }

    /// Wrap a failed scope body.
    pub fn operation(cause: Error) -> Self {
        Error::Operation(OperationError {
            message: "An error occurred while executing a database operation.".to_string(),
            cause: Box::new(cause),
        })
    }

    /// Whether this is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Whether this is a usage error.
    pub fn is_usage(&self) -> bool {
        matches!(self, Error::Usage(_))
    }

    /// The configuration error kind, if any.
    pub fn config_kind(&self) -> Option<ConfigErrorKind> {
        match self {
            Error::Config(e) => Some(e.kind),
            _ => None,
        }
    }

    /// The usage error kind, if any.
    pub fn usage_kind(&self) -> Option<UsageErrorKind> {
        match self {
            Error::Usage(e) => Some(e.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Usage(e) => write!(f, "Usage error: {}", e.message),
            Error::Operation(e) => write!(f, "{}", e.message),
            Error::Resolution(e) => write!(f, "{e}"),
            Error::Engine(e) => write!(f, "Engine error [{}]: {}", e.engine, e.message),
            Error::Custom(e) => write!(f, "{}", e.message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Operation(e) => Some(e.cause.as_ref()),
            Error::Engine(e) => e
                .source
                .as_ref()
                .map(|s| s.as_ref() as &(dyn std::error::Error + 'static)),
            Error::Custom(e) => e
                .source
                .as_ref()
                .map(|s| s.as_ref() as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug)]
pub struct ConfigError {
    pub kind: ConfigErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// No session factory was supplied or registered.
    NoFactory,
    /// No engine could be resolved for an operation.
    NoBind,
    /// An outer session was required but none is open.
    NoSession,
}

// ============================================================================
// Usage
// ============================================================================

#[derive(Debug)]
pub struct UsageError {
    pub kind: UsageErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageErrorKind {
    /// The ambient session runs under the other concurrency mode.
    ModeMismatch,
    /// The session was closed.
    SessionClosed,
    /// The session is already serving another operation.
    SessionBusy,
    /// The bind does not support the session's concurrency mode.
    UnsupportedBind,
    /// A row was handed to the session without its identity fields.
    MissingIdentity,
    /// A resolver was fed without an outstanding query.
    ResolverState,
}

// ============================================================================
// Operation
// ============================================================================

/// A scope body failure, chaining the original error.
#[derive(Debug)]
pub struct OperationError {
    pub message: String,
    cause: Box<Error>,
}

impl OperationError {
    /// The error raised by the scope body.
    pub fn cause(&self) -> &Error {
        &self.cause
    }

    /// Take back the error raised by the scope body.
    pub fn into_cause(self) -> Error {
        *self.cause
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Aggregated failure of a bulk resolution.
#[derive(Debug, Clone)]
pub struct ResolutionError {
    pub failures: Vec<ResolutionFailure>,
}

/// One bulk entry that could not be resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionFailure {
    /// Position of the entry in its registry.
    pub entry: usize,
    /// Resource type name of the entry.
    pub resource: String,
    /// Identity the entry was looked up by, when known.
    pub identity: Option<Identity>,
    pub reason: String,
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to resolve {} bulk entr{}",
            self.failures.len(),
            if self.failures.len() == 1 { "y" } else { "ies" }
        )?;
        for failure in &self.failures {
            write!(
                f,
                "; #{} {}: {}",
                failure.entry, failure.resource, failure.reason
            )?;
        }
        Ok(())
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug)]
pub struct EngineError {
    /// Name of the engine that failed.
    pub engine: String,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

// ============================================================================
// Custom
// ============================================================================

#[derive(Debug)]
pub struct CustomError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}
