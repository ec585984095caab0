//! Resumable bulk resolution.
//!
//! A [`Resolver`] is a state machine over the pending entries of a
//! [`BulkRegistry`](crate::BulkRegistry). [`Resolver::start`] yields the
//! first query; each [`Resolver::feed`] consumes that query's rows and yields
//! the next query, until [`ResolverStep::Done`]. The resolver never performs
//! I/O itself, so the same protocol serves blocking and cooperative sessions.
//!
//! Entries are batched by resource type: one identity-lookup query per type
//! present in the pending set, issued sequentially. Every batch is issued even
//! when an earlier one had failures, so a raised [`Error::Resolution`] lists
//! every unresolved entry of the call.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use unitwork_core::{
    Error, Filter, Identity, Projection, ResolutionError, ResolutionFailure, ResourceType, Result,
    Row, Statement, UsageErrorKind,
};

use crate::bulk::{lock, EntryId, EntryKind, EntryStatus, InstanceState, SharedState};

/// Which entries a resolution covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveScope {
    #[default]
    All,
    References,
    Values,
}

impl ResolveScope {
    fn includes(self, kind: EntryKind) -> bool {
        match self {
            ResolveScope::All => true,
            ResolveScope::References => kind == EntryKind::Reference,
            ResolveScope::Values => kind == EntryKind::Value,
        }
    }
}

/// How resolved entries are populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveStrategy {
    /// Keep identity fields only.
    #[default]
    Bind,
    /// Overwrite with the fetched row.
    Hydrate,
}

/// Options of one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveOptions {
    /// Fail the whole resolution with an aggregated error once every batch
    /// was issued.
    pub raise_errors: bool,
    pub scope: ResolveScope,
    pub strategy: ResolveStrategy,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            raise_errors: true,
            scope: ResolveScope::All,
            strategy: ResolveStrategy::Bind,
        }
    }
}

impl ResolveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn raise_errors(mut self, value: bool) -> Self {
        self.raise_errors = value;
        self
    }

    #[must_use]
    pub fn scope(mut self, scope: ResolveScope) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub fn strategy(mut self, strategy: ResolveStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// A query the caller must execute and feed back.
#[derive(Debug, Clone)]
pub struct ResolveQuery {
    pub resource: ResourceType,
    /// Entries updated from this query's rows.
    pub targets: Vec<EntryId>,
    pub statement: Statement,
}

#[derive(Debug, Clone)]
pub enum ResolverStep {
    Query(ResolveQuery),
    Done(ResolveReport),
}

/// Summary of a finished resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveReport {
    pub queries: usize,
    pub resolved: usize,
    pub failed: usize,
}

struct Batch {
    resource: ResourceType,
    targets: Vec<EntryId>,
    identities: Vec<Identity>,
}

/// The resolution state machine.
pub struct Resolver {
    state: SharedState,
    options: ResolveOptions,
    batches: VecDeque<Batch>,
    /// Entries without identity, failed without a query.
    unqueryable: Vec<EntryId>,
    outstanding: Option<Batch>,
    /// Failures collected so far, raised together at the end.
    failures: Vec<ResolutionFailure>,
    report: ResolveReport,
    started: bool,
}

impl Resolver {
    pub(crate) fn new(state: SharedState, options: ResolveOptions) -> Self {
        let mut batches: Vec<Batch> = Vec::new();
        let mut unqueryable = Vec::new();
        {
            let guard = lock(&state);
            let pending = guard.entries.iter().filter(|e| {
                e.status == EntryStatus::Pending && options.scope.includes(e.kind)
            });
            for entry in pending {
                let Some(identity) = &entry.identity else {
                    unqueryable.push(entry.id);
                    continue;
                };
                let idx = match batches
                    .iter()
                    .position(|b| b.resource == entry.resource)
                {
                    Some(idx) => idx,
                    None => {
                        batches.push(Batch {
                            resource: entry.resource.clone(),
                            targets: Vec::new(),
                            identities: Vec::new(),
                        });
                        batches.len() - 1
                    }
                };
                let batch = &mut batches[idx];
                batch.targets.push(entry.id);
                if !batch.identities.contains(identity) {
                    batch.identities.push(identity.clone());
                }
            }
        }

        Self {
            state,
            options,
            batches: batches.into(),
            unqueryable,
            outstanding: None,
            failures: Vec::new(),
            report: ResolveReport::default(),
            started: false,
        }
    }

    pub fn options(&self) -> ResolveOptions {
        self.options
    }

    /// Number of queries still to be issued, the outstanding one included.
    pub fn remaining_queries(&self) -> usize {
        self.batches.len() + usize::from(self.outstanding.is_some())
    }

    /// Begin the resolution and yield the first query.
    pub fn start(&mut self) -> Result<ResolverStep> {
        if self.started {
            return Err(Error::usage(
                UsageErrorKind::ResolverState,
                "Resolver was already started",
            ));
        }
        self.started = true;

        let failures = self.fail_unqueryable();
        self.failures.extend(failures);
        self.advance()
    }

    /// Consume the rows of the outstanding query and yield the next step.
    pub fn feed(&mut self, rows: Vec<Row>) -> Result<ResolverStep> {
        let Some(batch) = self.outstanding.take() else {
            return Err(Error::usage(
                UsageErrorKind::ResolverState,
                "Resolver has no outstanding query",
            ));
        };

        let resource = &batch.resource;
        let by_identity: HashMap<Identity, Row> = rows
            .into_iter()
            .filter_map(|row| resource.identity_of(&row).map(|id| (id, row)))
            .collect();

        let mut failures = Vec::new();
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            for target in &batch.targets {
                let entry = &mut state.entries[target.0];
                let fetched = entry.identity.as_ref().and_then(|id| by_identity.get(id));
                match (fetched, entry.identity.as_ref()) {
                    (Some(row), Some(identity)) => {
                        let instance = &mut state.instances[entry.instance];
                        match self.options.strategy {
                            ResolveStrategy::Bind => {
                                instance.fields = resource.identity_row(identity);
                                instance.state = InstanceState::Detached;
                            }
                            ResolveStrategy::Hydrate => {
                                instance.fields = row.clone();
                                instance.state = InstanceState::Persistent;
                            }
                        }
                        entry.status = EntryStatus::Resolved;
                        entry.error = None;
                        self.report.resolved += 1;
                    }
                    _ => {
                        let reason = "not found".to_string();
                        entry.status = EntryStatus::Failed;
                        entry.error = Some(reason.clone());
                        self.report.failed += 1;
                        failures.push(ResolutionFailure {
                            entry: target.index(),
                            resource: resource.name().to_string(),
                            identity: entry.identity.clone(),
                            reason,
                        });
                    }
                }
            }
        }

        if !failures.is_empty() {
            tracing::warn!(
                resource = resource.name(),
                failed = failures.len(),
                "Bulk entries could not be resolved"
            );
            self.failures.extend(failures);
        }
        self.advance()
    }

    fn fail_unqueryable(&mut self) -> Vec<ResolutionFailure> {
        let mut guard = lock(&self.state);
        let mut failures = Vec::with_capacity(self.unqueryable.len());
        for id in std::mem::take(&mut self.unqueryable) {
            let entry = &mut guard.entries[id.0];
            let reason = format!("missing identity fields {:?}", entry.resource.identity_fields());
            entry.status = EntryStatus::Failed;
            entry.error = Some(reason.clone());
            self.report.failed += 1;
            failures.push(ResolutionFailure {
                entry: id.index(),
                resource: entry.resource.name().to_string(),
                identity: None,
                reason,
            });
        }
        failures
    }

    fn advance(&mut self) -> Result<ResolverStep> {
        let Some(batch) = self.batches.pop_front() else {
            tracing::debug!(
                queries = self.report.queries,
                resolved = self.report.resolved,
                failed = self.report.failed,
                "Bulk resolution finished"
            );
            let failures = std::mem::take(&mut self.failures);
            if self.options.raise_errors && !failures.is_empty() {
                return Err(Error::Resolution(ResolutionError { failures }));
            }
            return Ok(ResolverStep::Done(self.report));
        };

        let projection = match self.options.strategy {
            ResolveStrategy::Bind => Projection::Fields(batch.resource.identity_fields().to_vec()),
            ResolveStrategy::Hydrate => Projection::All,
        };
        let query = ResolveQuery {
            resource: batch.resource.clone(),
            targets: batch.targets.clone(),
            statement: Statement::Select {
                resource: batch.resource.clone(),
                projection,
                filter: Filter::IdentityIn(batch.identities.clone()),
            },
        };
        self.report.queries += 1;
        tracing::debug!(
            resource = batch.resource.name(),
            identities = batch.identities.len(),
            targets = batch.targets.len(),
            "Issuing bulk query"
        );
        self.outstanding = Some(batch);
        Ok(ResolverStep::Query(query))
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("options", &self.options)
            .field("remaining_queries", &self.remaining_queries())
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}
