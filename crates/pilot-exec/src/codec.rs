//! Payload <-> file contents, selected by the configured [`FileType`].

use pilot_model::{FileType, Payload};

use crate::error::{ExecError, ExecResult};

/// Serialize a payload for a task's input file.
pub fn encode(file_type: FileType, payload: &Payload) -> ExecResult<Vec<u8>> {
    match file_type {
        FileType::Text => match payload {
            Payload::Text(s) => Ok(s.clone().into_bytes()),
            Payload::Json(serde_json::Value::String(s)) => Ok(s.clone().into_bytes()),
            Payload::Json(v) => Ok(v.to_string().into_bytes()),
            Payload::Bytes(b) => String::from_utf8(b.clone())
                .map(String::into_bytes)
                .map_err(|e| ExecError::Codec(format!("binary payload is not utf-8 text: {e}"))),
        },
        FileType::Json => {
            let value = match payload {
                Payload::Text(s) => serde_json::Value::String(s.clone()),
                Payload::Json(v) => v.clone(),
                Payload::Bytes(_) => {
                    return Err(ExecError::Codec(
                        "binary payload cannot be written as json".into(),
                    ));
                }
            };
            serde_json::to_vec(&value).map_err(|e| ExecError::Codec(e.to_string()))
        }
        FileType::Binary => match payload {
            Payload::Bytes(b) => Ok(b.clone()),
            Payload::Text(s) => Ok(s.clone().into_bytes()),
            Payload::Json(v) => serde_json::to_vec(v).map_err(|e| ExecError::Codec(e.to_string())),
        },
    }
}

/// Deserialize a task's output file.
pub fn decode(file_type: FileType, bytes: Vec<u8>) -> ExecResult<Payload> {
    match file_type {
        FileType::Text => String::from_utf8(bytes)
            .map(Payload::Text)
            .map_err(|e| ExecError::Codec(format!("output is not utf-8 text: {e}"))),
        FileType::Json => serde_json::from_slice(&bytes)
            .map(Payload::Json)
            .map_err(|e| ExecError::Codec(format!("output is not valid json: {e}"))),
        FileType::Binary => Ok(Payload::Bytes(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_is_written_verbatim() {
        assert_eq!(encode(FileType::Text, &Payload::from("foo")).unwrap(), b"foo");
        assert_eq!(
            encode(FileType::Text, &Payload::Json(json!("bar"))).unwrap(),
            b"bar"
        );
        assert_eq!(
            decode(FileType::Text, b"foofoo\n".to_vec()).unwrap(),
            Payload::from("foofoo\n")
        );
    }

    #[test]
    fn json_wraps_text_as_string() {
        assert_eq!(encode(FileType::Json, &Payload::from("foo")).unwrap(), br#""foo""#);
        assert_eq!(
            decode(FileType::Json, br#"{"n": 2}"#.to_vec()).unwrap(),
            Payload::Json(json!({"n": 2}))
        );
    }

    #[test]
    fn rejects_mismatched_payloads() {
        assert!(matches!(
            encode(FileType::Json, &Payload::Bytes(vec![0xff])),
            Err(ExecError::Codec(_))
        ));
        assert!(matches!(
            encode(FileType::Text, &Payload::Bytes(vec![0xff, 0xfe])),
            Err(ExecError::Codec(_))
        ));
        assert!(matches!(
            decode(FileType::Json, b"not json".to_vec()),
            Err(ExecError::Codec(_))
        ));
    }

    #[test]
    fn binary_is_opaque() {
        let raw = vec![0u8, 1, 2, 255];
        assert_eq!(encode(FileType::Binary, &Payload::Bytes(raw.clone())).unwrap(), raw);
        assert_eq!(decode(FileType::Binary, raw.clone()).unwrap(), Payload::Bytes(raw));
    }
}
