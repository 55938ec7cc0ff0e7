use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{TaskEnv, TimeoutMs};

/// A host directory made visible inside the task's environment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
    #[serde(default)]
    pub readonly: bool,
}

impl BindMount {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            readonly: false,
        }
    }

    /// Mount at the same path inside the task, read-only.
    pub fn readonly_same_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            source: path.clone(),
            target: path,
            readonly: true,
        }
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }
}

/// How to execute one task (or the init step).
///
/// `args` is a template: `{{INFILE}}`, `{{OUTFILE}}` and `{{DATA_HUB}}` (plus their `{{IN_FILE}}`,
/// `{{OUT_FILE}}`, `{{DATAHUB}}` spellings) are substituted per invocation.
/// For [`crate::Platform::Process`] the `image` is ignored and `args` is the whole command line.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    pub image: String,
    pub args: String,
    /// `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<TimeoutMs>,
    #[serde(default, skip_serializing_if = "TaskEnv::is_empty")]
    pub env: TaskEnv,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<BindMount>,
}

impl RunSpec {
    pub fn new(image: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            args: args.into(),
            ..Default::default()
        }
    }

    /// A host command line, for [`crate::Platform::Process`].
    pub fn command(args: impl Into<String>) -> Self {
        Self::new(String::new(), args)
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_ms = timeout.map(|t| t.as_millis() as TimeoutMs);
        self
    }

    pub fn with_env(mut self, env: TaskEnv) -> Self {
        self.env = env;
        self
    }

    pub fn with_mount(mut self, mount: BindMount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// `true` when there is nothing to run.
    pub fn is_empty(&self) -> bool {
        self.image.trim().is_empty() && self.args.trim().is_empty()
    }
}
