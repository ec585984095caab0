//! Structured statements handed to storage engines.
//!
//! Statements describe *what* to read or write; turning them into a wire query
//! is the engine's business.

use crate::resource::{Identity, ResourceType};
use crate::row::Row;

/// Fields a select returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    All,
    Fields(Vec<String>),
}

/// Rows a select matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    /// Rows whose identity is one of the listed identities.
    IdentityIn(Vec<Identity>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Select {
        resource: ResourceType,
        projection: Projection,
        filter: Filter,
    },
    Insert {
        resource: ResourceType,
        row: Row,
    },
    Update {
        resource: ResourceType,
        identity: Identity,
        row: Row,
    },
    Delete {
        resource: ResourceType,
        identity: Identity,
    },
}

impl Statement {
    /// Select every field of the rows with the given identities.
    pub fn select_identities(resource: ResourceType, identities: Vec<Identity>) -> Self {
        Statement::Select {
            resource,
            projection: Projection::All,
            filter: Filter::IdentityIn(identities),
        }
    }

    /// Select every row of a resource.
    pub fn select_all(resource: ResourceType) -> Self {
        Statement::Select {
            resource,
            projection: Projection::All,
            filter: Filter::All,
        }
    }

    pub fn resource(&self) -> &ResourceType {
        match self {
            Statement::Select { resource, .. }
            | Statement::Insert { resource, .. }
            | Statement::Update { resource, .. }
            | Statement::Delete { resource, .. } => resource,
        }
    }

    /// Whether the statement modifies storage.
    pub fn is_write(&self) -> bool {
        !matches!(self, Statement::Select { .. })
    }

    /// Short verb used in logs.
    pub fn verb(&self) -> &'static str {
        match self {
            Statement::Select { .. } => "SELECT",
            Statement::Insert { .. } => "INSERT",
            Statement::Update { .. } => "UPDATE",
            Statement::Delete { .. } => "DELETE",
        }
    }
}
