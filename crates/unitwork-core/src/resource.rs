//! Resource types and identities.
//!
//! A [`ResourceType`] is the mapping-layer view of a resource: its name, the
//! storage table it lives in, and the ordered fields forming its identity.
//! Routing is keyed by the name; identity batching reads the identity fields.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::row::Row;
use crate::value::Value;

#[derive(Debug)]
struct ResourceMeta {
    name: String,
    table: String,
    identity: Vec<String>,
}

/// Descriptor of a resource type. Cheap to clone.
#[derive(Clone)]
pub struct ResourceType {
    meta: Arc<ResourceMeta>,
}

impl ResourceType {
    /// Create a resource type with a single `id` identity field.
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self::with_identity(name, table, ["id"])
    }

    /// Create a resource type with explicit identity fields.
    pub fn with_identity<I, S>(name: impl Into<String>, table: impl Into<String>, identity: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            meta: Arc::new(ResourceMeta {
                name: name.into(),
                table: table.into(),
                identity: identity.into_iter().map(Into::into).collect(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Storage table (or collection) name.
    pub fn table(&self) -> &str {
        &self.meta.table
    }

    /// Ordered identity field names.
    pub fn identity_fields(&self) -> &[String] {
        &self.meta.identity
    }

    /// Extract the identity of a row. Returns `None` when any identity field is
    /// missing or null.
    pub fn identity_of(&self, row: &Row) -> Option<Identity> {
        let mut values = Vec::with_capacity(self.meta.identity.len());
        for field in &self.meta.identity {
            match row.get(field) {
                Some(v) if !v.is_null() => values.push(v.clone()),
                _ => return None,
            }
        }
        Some(Identity(values))
    }

    /// Build a row holding only the identity fields.
    pub fn identity_row(&self, identity: &Identity) -> Row {
        self.meta
            .identity
            .iter()
            .cloned()
            .zip(identity.values().iter().cloned())
            .collect()
    }
}

impl PartialEq for ResourceType {
    fn eq(&self, other: &Self) -> bool {
        self.meta.name == other.meta.name
    }
}

impl Eq for ResourceType {}

impl Hash for ResourceType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.meta.name.hash(state);
    }
}

impl fmt::Debug for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceType")
            .field("name", &self.meta.name)
            .field("table", &self.meta.table)
            .field("identity", &self.meta.identity)
            .finish()
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.meta.name)
    }
}

/// Ordered identity values of one resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(Vec<Value>);

impl Identity {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl From<Value> for Identity {
    fn from(value: Value) -> Self {
        Identity(vec![value])
    }
}

impl From<i32> for Identity {
    fn from(value: i32) -> Self {
        Identity(vec![Value::from(value)])
    }
}

impl From<i64> for Identity {
    fn from(value: i64) -> Self {
        Identity(vec![Value::BigInt(value)])
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Identity(vec![Value::from(value)])
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str(")")
    }
}

/// Unique key for a resource instance: resource name plus identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    resource: String,
    identity: Identity,
}

impl ObjectKey {
    pub fn new(resource: &ResourceType, identity: Identity) -> Self {
        Self {
            resource: resource.name().to_string(),
            identity,
        }
    }

    /// Key of a row, when the row carries its identity.
    pub fn from_row(resource: &ResourceType, row: &Row) -> Option<Self> {
        resource
            .identity_of(row)
            .map(|identity| Self::new(resource, identity))
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_of_row() {
        let order = ResourceType::new("Order", "orders");
        let row = Row::new().with("id", 42).with("total", 10);
        assert_eq!(order.identity_of(&row), Some(Identity::from(42)));
        assert_eq!(order.identity_of(&Row::new().with("total", 1)), None);
        assert_eq!(order.identity_of(&Row::new().with("id", Value::Null)), None);
    }

    #[test]
    fn test_composite_identity() {
        let line = ResourceType::with_identity("Line", "lines", ["order_id", "pos"]);
        let row = Row::new().with("order_id", 1).with("pos", 2).with("sku", "x");
        let identity = line.identity_of(&row).expect("identity present");
        assert_eq!(identity.values(), &[Value::BigInt(1), Value::BigInt(2)]);
        assert_eq!(line.identity_row(&identity), row.project(&["order_id", "pos"]));
    }

    #[test]
    fn test_resource_equality_by_name() {
        let a = ResourceType::new("Order", "orders");
        let b = ResourceType::new("Order", "orders_v2");
        assert_eq!(a, b);
        assert_ne!(a, ResourceType::new("Customer", "customers"));
    }

    #[test]
    fn test_object_key() {
        let order = ResourceType::new("Order", "orders");
        let key = ObjectKey::from_row(&order, &Row::new().with("id", 7)).expect("key");
        assert_eq!(key, ObjectKey::new(&order, Identity::from(7)));
        assert_eq!(key.resource(), "Order");
        assert_eq!(key.identity().to_string(), "(7)");
    }
}
