//! Rows of named field values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A set of named field values, as stored by an engine or carried by a
/// resource instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    fields: BTreeMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Set a field, returning the previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy of this row restricted to the given fields. Fields absent from the
    /// row are skipped.
    #[must_use]
    pub fn project<S: AsRef<str>>(&self, fields: &[S]) -> Row {
        let mut out = Row::new();
        for name in fields {
            if let Some(value) = self.fields.get(name.as_ref()) {
                out.fields.insert(name.as_ref().to_string(), value.clone());
            }
        }
        out
    }

    /// Overwrite fields with the values from `other`.
    pub fn merge(&mut self, other: &Row) {
        for (name, value) in &other.fields {
            self.fields.insert(name.clone(), value.clone());
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Row {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_keeps_requested_fields_only() {
        let row = Row::new().with("id", 1).with("name", "a").with("qty", 3);
        let projected = row.project(&["id", "missing"]);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected.get("id"), Some(&Value::BigInt(1)));
    }

    #[test]
    fn test_merge_overwrites() {
        let mut row = Row::new().with("id", 1).with("name", "stale");
        row.merge(&Row::new().with("name", "fresh").with("qty", 2));
        assert_eq!(row.get("name").and_then(Value::as_str), Some("fresh"));
        assert_eq!(row.len(), 3);
    }

    #[test]
    fn test_serde_is_a_plain_object() {
        let row = Row::new().with("id", 1).with("name", "a");
        let json = serde_json::to_string(&row).expect("serialize row");
        assert_eq!(json, r#"{"id":1,"name":"a"}"#);
        let back: Row = serde_json::from_str(&json).expect("deserialize row");
        assert_eq!(back, row);
    }
}
