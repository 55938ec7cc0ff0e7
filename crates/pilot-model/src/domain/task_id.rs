use std::fmt;

use serde::{Deserialize, Serialize};

/// Broker-assigned identifier of an incoming message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one task.
///
/// Derived from the source message id, so two tasks never share working files.
/// Characters outside `[A-Za-z0-9._-]` are replaced to keep the id usable as a path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&MessageId> for TaskId {
    fn from(id: &MessageId) -> Self {
        Self::from(id.as_str())
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        let cleaned: String = s
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        match cleaned.as_str() {
            "" | "." | ".." => Self(format!("task{cleaned}")),
            _ => Self(cleaned),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_follows_message_id() {
        let msg = MessageId::new("0f1e2d3c-aaaa-bbbb");
        assert_eq!(TaskId::from(&msg).as_str(), "0f1e2d3c-aaaa-bbbb");
    }

    #[test]
    fn task_id_is_path_safe() {
        assert_eq!(TaskId::from("a/b c").as_str(), "a_b_c");
        assert_eq!(TaskId::from("..").as_str(), "task..");
        assert_eq!(TaskId::from("").as_str(), "task");
    }
}
