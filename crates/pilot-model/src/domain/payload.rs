use serde::{Deserialize, Serialize};

/// Body of a message travelling through the broker.
///
/// The pilot never inspects the variant to make decisions; file codecs do, based on the configured [`crate::FileType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Payload {
    /// Short symbolic name of the variant, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text",
            Payload::Json(_) => "json",
            Payload::Bytes(_) => "bytes",
        }
    }

    /// Approximate size in bytes, for logs.
    pub fn size_hint(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Json(v) => v.to_string().len(),
            Payload::Bytes(b) => b.len(),
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Payload::Json(v)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_wire_format() {
        let json = serde_json::to_string(&Payload::from("foo")).unwrap();
        assert_eq!(json, r#"{"type":"text","data":"foo"}"#);

        let back: Payload = serde_json::from_str(r#"{"type":"json","data":{"a":1}}"#).unwrap();
        assert_eq!(back, Payload::Json(serde_json::json!({"a": 1})));
    }

    #[test]
    fn kind_and_size() {
        assert_eq!(Payload::from(vec![1u8, 2, 3]).kind(), "bytes");
        assert_eq!(Payload::from(vec![1u8, 2, 3]).size_hint(), 3);
        assert_eq!(Payload::from("abcd").size_hint(), 4);
    }
}
