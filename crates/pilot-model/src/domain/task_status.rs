use serde::{Deserialize, Serialize};

/// Lifecycle state of a task unit.
///
/// Derived from whether the execution has finished and whether a terminal error was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    /// Execution still running.
    Pending,
    /// Execution finished and no error was recorded.
    Succeeded,
    /// A terminal error was recorded.
    Failed,
}

impl TaskStatus {
    pub fn derive(finished: bool, failed: bool) -> Self {
        match (finished, failed) {
            (_, true) => TaskStatus::Failed,
            (true, false) => TaskStatus::Succeeded,
            (false, false) => TaskStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}
