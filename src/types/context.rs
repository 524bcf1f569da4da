use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::value::Value;

pub const TARGETING_KEY: &str = "targeting_key";

/// Attributes a flag is evaluated against.
///
/// Keys are kept sorted, so two contexts holding the same pairs produce the
/// same [`canonical_key`](Context::canonical_key) regardless of insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    entries: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_targeting_key(targeting_key: impl Into<String>) -> Self {
        Self::new().with(TARGETING_KEY, targeting_key.into())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn targeting_key(&self) -> Option<&str> {
        self.get(TARGETING_KEY).and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).filter(|v| !v.is_undefined())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Value::is_undefined)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter().filter(|(_, v)| !v.is_undefined())
    }

    /// Child entries win; a child entry set to `Undefined` removes the key.
    pub fn merge(&self, child: &Context) -> Context {
        let mut entries = self.entries.clone();
        for (key, value) in &child.entries {
            if value.is_undefined() {
                entries.remove(key);
            } else {
                entries.insert(key.clone(), value.clone());
            }
        }
        Context { entries }
    }

    pub fn to_value(&self) -> Value {
        Value::Struct(
            self.iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Sorted-key JSON without undefined entries.
    pub fn canonical_key(&self) -> String {
        // serde_json's Map is a BTreeMap without the preserve_order feature
        self.to_value().to_json().to_string()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_key() == other.canonical_key()
    }
}

impl Eq for Context {}

impl From<BTreeMap<String, Value>> for Context {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self { entries }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targeting_key() {
        let context = Context::with_targeting_key("user-1");
        assert_eq!(context.targeting_key(), Some("user-1"));
    }

    #[test]
    fn test_undefined_entries_are_invisible() {
        let context = Context::new().with("a", 1).with("b", Value::Undefined);
        assert!(context.get("b").is_none());
        assert_eq!(context.canonical_key(), r#"{"a":1}"#);
    }
}
