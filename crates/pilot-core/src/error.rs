use std::{fmt, time::Duration};

use thiserror::Error;

/// Terminal error of a single task.
///
/// Captured on the task unit and only surfaced at the end of the run through [`AggregateError`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The runtime environment could not be prepared (image pull/build, mounts, working directory).
    #[error("{0}")]
    Setup(String),
    /// The process or container exited unsuccessfully.
    #[error("{diagnostic}")]
    Execution {
        code: Option<i32>,
        diagnostic: String,
    },
    /// The bounded wait expired and the process was terminated.
    #[error("task timed out after {}s", .elapsed.as_secs_f64())]
    Timeout { elapsed: Duration },
    /// The result could not be published on the outgoing channel.
    #[error("{0}")]
    Publish(String),
    /// The pilot shut down before the task finished.
    #[error("task cancelled during shutdown")]
    Cancelled,
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("io error: {0}")]
    Io(String),
}

impl TaskError {
    /// Stable error-type name used in the aggregate message.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::Setup(_) => "SetupError",
            TaskError::Execution { .. } => "ExecutionError",
            TaskError::Timeout { .. } => "TimeoutError",
            TaskError::Publish(_) => "PublishError",
            TaskError::Cancelled => "CancelledError",
            TaskError::Panicked(_) => "PanicError",
            TaskError::Io(_) => "IoError",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout { .. })
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::Io(e.to_string())
    }
}

/// Every per-task failure of a run, in completion order.
///
/// Raised once when the engine terminates; identical failures are all listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateError(Vec<TaskError>);

impl AggregateError {
    pub fn new(errors: Vec<TaskError>) -> Self {
        Self(errors)
    }

    pub fn errors(&self) -> &[TaskError] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<TaskError> {
        self.0
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) failed: ", self.0.len())?;
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "[{}: {}]", e.kind(), e)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Failures reported by the message-queue collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// No message arrived within the subscribe timeout. Not a failure of the broker.
    #[error("no message within timeout")]
    NoMessage,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("ack failed: {0}")]
    Ack(String),
    #[error("nack failed: {0}")]
    Nack(String),
    #[error("channel closed")]
    Closed,
}

/// Invalid configuration; detected before any I/O.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("prefetch must be at least 1")]
    ZeroPrefetch,
    #[error("{name} ({}s) must not be shorter than {floor_name} ({}s)", .value.as_secs_f64(), .floor.as_secs_f64())]
    TimeoutTooShort {
        name: &'static str,
        value: Duration,
        floor_name: &'static str,
        floor: Duration,
    },
    #[error("{0} queue name is empty")]
    EmptyQueue(&'static str),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Run-level error returned by [`crate::Pilot::run`].
#[derive(Debug, Error)]
pub enum PilotError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("setup failed: {0}")]
    Setup(TaskError),
    #[error("init step failed: [{kind}: {0}]", kind = .0.kind())]
    Init(TaskError),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl PilotError {
    /// The aggregate failure list, if the run ended because tasks failed.
    pub fn aggregate(&self) -> Option<&AggregateError> {
        match self {
            PilotError::Aggregate(a) => Some(a),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_lists_every_failure() {
        let agg = AggregateError::new(vec![
            TaskError::Execution {
                code: Some(1),
                diagnostic: "ValueError: boom".into(),
            },
            TaskError::Timeout {
                elapsed: Duration::from_secs(2),
            },
            TaskError::Execution {
                code: Some(1),
                diagnostic: "ValueError: boom".into(),
            },
        ]);

        assert_eq!(
            agg.to_string(),
            "3 task(s) failed: [ExecutionError: ValueError: boom], \
             [TimeoutError: task timed out after 2s], \
             [ExecutionError: ValueError: boom]"
        );
    }

    #[test]
    fn init_error_names_kind() {
        let e = PilotError::Init(TaskError::Setup("image not found".into()));
        assert_eq!(e.to_string(), "init step failed: [SetupError: image not found]");
    }

    #[test]
    fn run_errors_convert_with_question_mark() {
        fn fails() -> Result<(), PilotError> {
            Err::<(), _>(BrokerError::Closed)?;
            Ok(())
        }
        let e = fails().unwrap_err();
        assert!(matches!(e, PilotError::Broker(BrokerError::Closed)));
        assert_eq!(e.to_string(), "broker error: channel closed");
        assert!(e.aggregate().is_none());
    }

    #[test]
    fn config_error_message() {
        let e = ConfigError::TimeoutTooShort {
            name: "timeout_incoming",
            value: Duration::from_millis(500),
            floor_name: "poll_interval",
            floor: Duration::from_secs(1),
        };
        assert_eq!(
            e.to_string(),
            "timeout_incoming (0.5s) must not be shorter than poll_interval (1s)"
        );
    }
}
