use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::ModelError;

/// On-disk representation used to hand payloads to and from a task.
///
/// Selected once by configuration; the encoder/decoder is picked from this tag, never from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileType {
    /// UTF-8 text, written verbatim.
    Text,
    /// A JSON document.
    Json,
    /// Opaque bytes, written verbatim.
    Binary,
}

impl FileType {
    /// File extension without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            FileType::Text => "txt",
            FileType::Json => "json",
            FileType::Binary => "bin",
        }
    }
}

impl FromStr for FileType {
    type Err = ModelError;

    /// Accepts the extension with or without the leading dot, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().trim_start_matches('.').to_ascii_lowercase();
        match norm.as_str() {
            "txt" | "text" => Ok(FileType::Text),
            "json" => Ok(FileType::Json),
            "bin" | "binary" => Ok(FileType::Binary),
            _ => Err(ModelError::UnsupportedFileType(s.to_string())),
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}
