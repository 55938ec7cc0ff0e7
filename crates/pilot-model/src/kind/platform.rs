use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Runtime backend a [`crate::RunSpec`] is executed with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Platform {
    /// Run the argument template directly on the host through `sh -c`.
    #[default]
    Process,
    /// `docker run` the image.
    Docker,
    /// `apptainer run` the image, converted to a sandbox directory first.
    Apptainer,
}

impl Platform {
    pub fn kind(&self) -> &'static str {
        match self {
            Platform::Process => "process",
            Platform::Docker => "docker",
            Platform::Apptainer => "apptainer",
        }
    }

    /// Whether task paths differ between the pilot and the task (bind mounts).
    pub fn is_container(&self) -> bool {
        !matches!(self, Platform::Process)
    }
}

impl FromStr for Platform {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" | "proc" | "subprocess" => Ok(Platform::Process),
            "docker" => Ok(Platform::Docker),
            "apptainer" | "singularity" => Ok(Platform::Apptainer),
            _ => Err(ModelError::UnsupportedPlatform(s.to_string())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}
