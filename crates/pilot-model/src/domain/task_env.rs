use serde::{Deserialize, Serialize};

use crate::{KeyValue, ModelError};

/// Environment variables handed to a task's process or container.
///
/// Stored as an ordered list of pairs; lookups scan from the end so later entries win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskEnv(Vec<KeyValue>);

impl TaskEnv {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyValue> {
        self.0.iter()
    }

    /// Value of the last entry named `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|kv| kv.key() == key)
            .map(|kv| kv.value())
    }

    pub fn push<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.0.push(KeyValue::new(key, value));
    }

    pub fn with<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.push(key, value);
        self
    }

    /// Concatenate `other` after `self`; entries of `other` shadow same-named entries of `self`.
    pub fn merged(&self, other: &TaskEnv) -> TaskEnv {
        let mut out = self.0.clone();
        out.extend(other.0.iter().cloned());
        TaskEnv(out)
    }

    /// Resolved view: one entry per key, last value wins, first-seen key order kept.
    pub fn resolved(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = Vec::with_capacity(self.0.len());
        for kv in &self.0 {
            match out.iter_mut().find(|(k, _)| *k == kv.key()) {
                Some(slot) => slot.1 = kv.value(),
                None => out.push((kv.key(), kv.value())),
            }
        }
        out
    }

    /// Parse a JSON object of string or integer values, e.g. `{"FOO": "bar", "N": 3}`.
    ///
    /// An empty string or `{}` yields an empty environment.
    pub fn from_json(raw: &str) -> Result<Self, ModelError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::new());
        }
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ModelError::InvalidEnv(e.to_string()))?;
        let obj = value.as_object().ok_or_else(|| {
            ModelError::InvalidEnv("expected a JSON object of strings or integers".into())
        })?;

        let mut env = Self::new();
        for (key, val) in obj {
            match val {
                serde_json::Value::String(s) => env.push(key.as_str(), s.as_str()),
                serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => {
                    env.push(key.as_str(), n.to_string())
                }
                other => {
                    return Err(ModelError::InvalidEnv(format!(
                        "value for '{key}' must be a string or integer, got {other}"
                    )));
                }
            }
        }
        Ok(env)
    }
}
