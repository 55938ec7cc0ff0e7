use serde::{Deserialize, Serialize};

/// Progress signal emitted by the pilot for external monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ProgressEvent {
    /// The pilot started (before the init step).
    Started,
    /// The first message of the run was received.
    Tasking,
    /// Running total of messages received.
    Received { total: u64 },
    /// Running totals of reconciled tasks.
    Done { succeeded: u64, failed: u64 },
    /// The pilot stopped; `error` is set when the run failed.
    Finished { error: Option<String> },
    /// A failed run is sitting out its quarantine; repeated until it is over.
    Quarantined { remaining_secs: u64 },
}

impl ProgressEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::Started => "started",
            ProgressEvent::Tasking => "tasking",
            ProgressEvent::Received { .. } => "received",
            ProgressEvent::Done { .. } => "done",
            ProgressEvent::Finished { .. } => "finished",
            ProgressEvent::Quarantined { .. } => "quarantined",
        }
    }
}
