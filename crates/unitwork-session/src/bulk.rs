//! Bulk registration of resource references and values.
//!
//! A [`BulkRegistry`] collects, in order, references (identities to fetch) and
//! values (instances whose fields may be stale). Instances live in an arena;
//! with proxying enabled a proxy table maps each [`ObjectKey`] to one arena
//! slot, so every reference to the same identity observes the same instance.
//!
//! The registry belongs to one session. Once that session closes, the
//! registry refuses new work; existing entries stay inspectable.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use asupersync::{Cx, Outcome};
use unitwork_core::{
    Error, Identity, ObjectKey, ResourceType, Result, Row, UsageErrorKind, Value,
};

use crate::context::ContextGuard;
use crate::cooperative::CooperativeSession;
use crate::resolver::{ResolveOptions, ResolveReport, Resolver, ResolverStep};
use crate::session::Session;

/// Position of an entry in its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) usize);

impl EntryId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Lazy pointer to an identity, not yet fetched.
    Reference,
    /// In-memory instance awaiting hydration.
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Resolved,
    Failed,
}

/// Lifetime state of a registered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Never loaded.
    Transient,
    /// Bound by identity only.
    Detached,
    /// Fully loaded from storage.
    Persistent,
}

/// One registered reference or value.
#[derive(Debug, Clone)]
pub struct BulkEntry {
    pub id: EntryId,
    pub kind: EntryKind,
    pub resource: ResourceType,
    pub identity: Option<Identity>,
    pub status: EntryStatus,
    /// Why the entry failed, when it did.
    pub error: Option<String>,
    pub(crate) instance: usize,
}

pub(crate) struct Instance {
    pub(crate) fields: Row,
    pub(crate) state: InstanceState,
}

#[derive(Default)]
pub(crate) struct BulkState {
    pub(crate) entries: Vec<BulkEntry>,
    pub(crate) instances: Vec<Instance>,
    proxies: HashMap<ObjectKey, usize>,
}

pub(crate) type SharedState = Arc<Mutex<BulkState>>;

pub(crate) fn lock(state: &SharedState) -> MutexGuard<'_, BulkState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Registry
// ============================================================================

/// Ordered registry of pending references and values.
#[derive(Clone)]
pub struct BulkRegistry {
    state: SharedState,
    proxy_reference: bool,
    session_id: u64,
    session_closed: Arc<AtomicBool>,
}

impl BulkRegistry {
    pub(crate) fn new(session_id: u64, session_closed: Arc<AtomicBool>, proxy_reference: bool) -> Self {
        Self {
            state: SharedState::default(),
            proxy_reference,
            session_id,
            session_closed,
        }
    }

    /// Whether the owning session is still open.
    pub fn is_valid(&self) -> bool {
        !self.session_closed.load(Ordering::Acquire)
    }

    pub fn proxy_reference(&self) -> bool {
        self.proxy_reference
    }

    pub(crate) fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::usage(
                UsageErrorKind::SessionClosed,
                format!("Bulk registry of session {} is no longer valid", self.session_id),
            ))
        }
    }

    /// Register a reference to `identity`.
    ///
    /// With proxying, references to one identity share a single instance.
    pub fn register_reference(
        &self,
        resource: &ResourceType,
        identity: impl Into<Identity>,
    ) -> Result<ResourceRef> {
        self.ensure_valid()?;
        let identity = identity.into();
        let mut state = lock(&self.state);

        let instance = if self.proxy_reference {
            let key = ObjectKey::new(resource, identity.clone());
            match state.proxies.get(&key) {
                Some(&slot) => slot,
                None => {
                    let slot = push_instance(&mut state, resource.identity_row(&identity));
                    state.proxies.insert(key, slot);
                    slot
                }
            }
        } else {
            push_instance(&mut state, resource.identity_row(&identity))
        };

        let id = push_entry(&mut state, EntryKind::Reference, resource, Some(identity), instance);
        Ok(ResourceRef {
            state: Arc::clone(&self.state),
            entry: id,
            instance,
        })
    }

    /// Register an in-memory instance whose fields may be stale.
    ///
    /// A value without identity fields is kept but fails resolution.
    pub fn register_value(&self, resource: &ResourceType, fields: Row) -> Result<ResourceRef> {
        self.ensure_valid()?;
        let identity = resource.identity_of(&fields);
        let mut state = lock(&self.state);
        let instance = push_instance(&mut state, fields);
        let id = push_entry(&mut state, EntryKind::Value, resource, identity, instance);
        Ok(ResourceRef {
            state: Arc::clone(&self.state),
            entry: id,
            instance,
        })
    }

    /// Snapshot of every entry, in registration order.
    pub fn entries(&self) -> Vec<BulkEntry> {
        lock(&self.state).entries.clone()
    }

    pub fn entry(&self, id: EntryId) -> Option<BulkEntry> {
        lock(&self.state).entries.get(id.0).cloned()
    }

    /// Handle to the instance behind an entry.
    pub fn get(&self, id: EntryId) -> Option<ResourceRef> {
        let state = lock(&self.state);
        state.entries.get(id.0).map(|entry| ResourceRef {
            state: Arc::clone(&self.state),
            entry: id,
            instance: entry.instance,
        })
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_count(&self) -> usize {
        self.count(EntryStatus::Pending)
    }

    pub fn resolved_count(&self) -> usize {
        self.count(EntryStatus::Resolved)
    }

    fn count(&self, status: EntryStatus) -> usize {
        lock(&self.state)
            .entries
            .iter()
            .filter(|e| e.status == status)
            .count()
    }

    /// Entries left failed by earlier resolutions.
    pub fn failed(&self) -> Vec<BulkEntry> {
        lock(&self.state)
            .entries
            .iter()
            .filter(|e| e.status == EntryStatus::Failed)
            .cloned()
            .collect()
    }

    /// Distinct arena slots in use.
    pub fn instance_count(&self) -> usize {
        lock(&self.state).instances.len()
    }

    /// A resolver over the pending entries selected by `options`.
    pub fn resolver(&self, options: ResolveOptions) -> Result<Resolver> {
        self.ensure_valid()?;
        Ok(Resolver::new(Arc::clone(&self.state), options))
    }
}

fn push_instance(state: &mut BulkState, fields: Row) -> usize {
    state.instances.push(Instance {
        fields,
        state: InstanceState::Transient,
    });
    state.instances.len() - 1
}

fn push_entry(
    state: &mut BulkState,
    kind: EntryKind,
    resource: &ResourceType,
    identity: Option<Identity>,
    instance: usize,
) -> EntryId {
    let id = EntryId(state.entries.len());
    state.entries.push(BulkEntry {
        id,
        kind,
        resource: resource.clone(),
        identity,
        status: EntryStatus::Pending,
        error: None,
        instance,
    });
    id
}

impl fmt::Debug for BulkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("BulkRegistry")
            .field("session", &self.session_id)
            .field("entries", &state.entries.len())
            .field("instances", &state.instances.len())
            .field("proxy_reference", &self.proxy_reference)
            .finish()
    }
}

// ============================================================================
// References
// ============================================================================

/// Handle to a registered entry and the instance it points at.
#[derive(Clone)]
pub struct ResourceRef {
    state: SharedState,
    entry: EntryId,
    instance: usize,
}

impl ResourceRef {
    pub fn entry_id(&self) -> EntryId {
        self.entry
    }

    /// Current fields of the instance.
    pub fn fields(&self) -> Row {
        lock(&self.state).instances[self.instance].fields.clone()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        lock(&self.state).instances[self.instance]
            .fields
            .get(name)
            .cloned()
    }

    /// Change a field; every proxy of the instance observes it.
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        lock(&self.state).instances[self.instance]
            .fields
            .set(name, value);
    }

    pub fn state(&self) -> InstanceState {
        lock(&self.state).instances[self.instance].state
    }

    pub fn status(&self) -> EntryStatus {
        lock(&self.state).entries[self.entry.0].status
    }

    pub fn kind(&self) -> EntryKind {
        lock(&self.state).entries[self.entry.0].kind
    }

    pub fn identity(&self) -> Option<Identity> {
        lock(&self.state).entries[self.entry.0].identity.clone()
    }

    pub fn resource(&self) -> ResourceType {
        lock(&self.state).entries[self.entry.0].resource.clone()
    }

    /// Whether both handles observe the same instance.
    pub fn same_instance(&self, other: &ResourceRef) -> bool {
        Arc::ptr_eq(&self.state, &other.state) && self.instance == other.instance
    }
}

impl fmt::Debug for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRef")
            .field("entry", &self.entry)
            .field("instance", &self.instance)
            .field("fields", &self.fields())
            .finish()
    }
}

// ============================================================================
// Session-bound Registries
// ============================================================================

/// A registry bound to a blocking session.
#[derive(Clone)]
pub struct SessionBulk {
    registry: BulkRegistry,
    session: Session,
}

impl SessionBulk {
    pub(crate) fn new(session: Session, proxy_reference: bool) -> Self {
        Self {
            registry: BulkRegistry::new(session.id(), session.liveness(), proxy_reference),
            session,
        }
    }

    pub fn registry(&self) -> &BulkRegistry {
        &self.registry
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Resolve the pending entries, one query per resource type.
    #[tracing::instrument(level = "debug", skip(self), fields(session = self.session.id()))]
    pub fn resolve(&self, options: ResolveOptions) -> Result<ResolveReport> {
        let mut resolver = self.registry.resolver(options)?;
        let mut step = resolver.start()?;
        loop {
            match step {
                ResolverStep::Query(query) => {
                    let rows = self.session.execute(&query.statement)?;
                    step = resolver.feed(rows)?;
                }
                ResolverStep::Done(report) => return Ok(report),
            }
        }
    }
}

impl Deref for SessionBulk {
    type Target = BulkRegistry;

    fn deref(&self) -> &BulkRegistry {
        &self.registry
    }
}

/// A registry bound to a cooperative session.
#[derive(Clone)]
pub struct AsyncSessionBulk {
    registry: BulkRegistry,
    session: CooperativeSession,
}

impl AsyncSessionBulk {
    pub(crate) fn new(session: CooperativeSession, proxy_reference: bool) -> Self {
        let sync = session.sync_session();
        Self {
            registry: BulkRegistry::new(sync.id(), sync.liveness(), proxy_reference),
            session,
        }
    }

    pub fn registry(&self) -> &BulkRegistry {
        &self.registry
    }

    pub fn session(&self) -> &CooperativeSession {
        &self.session
    }

    /// Resolve the pending entries, suspending at each query.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = self.session.id()))]
    pub async fn resolve(&self, cx: &Cx, options: ResolveOptions) -> Outcome<ResolveReport, Error> {
        let mut resolver = try_result!(self.registry.resolver(options));
        let mut step = try_result!(resolver.start());
        loop {
            match step {
                ResolverStep::Query(query) => {
                    let rows = try_outcome!(self.session.execute(cx, &query.statement).await);
                    step = try_result!(resolver.feed(rows));
                }
                ResolverStep::Done(report) => return Outcome::Ok(report),
            }
        }
    }
}

impl Deref for AsyncSessionBulk {
    type Target = BulkRegistry;

    fn deref(&self) -> &BulkRegistry {
        &self.registry
    }
}

// ============================================================================
// Scope
// ============================================================================

/// A registry published as the ambient bulk until dropped.
#[must_use = "the registry is detached from the context as soon as the scope drops"]
pub struct BulkScope<'c, B> {
    bulk: B,
    _guard: ContextGuard<'c>,
}

impl<'c, B> BulkScope<'c, B> {
    pub(crate) fn new(bulk: B, guard: ContextGuard<'c>) -> Self {
        Self {
            bulk,
            _guard: guard,
        }
    }

    /// Detach from the context, keeping the registry.
    pub fn into_inner(self) -> B {
        self.bulk
    }
}

impl<B> Deref for BulkScope<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.bulk
    }
}
