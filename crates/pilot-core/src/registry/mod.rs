use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, SystemTime},
};

use pilot_model::{TaskId, TaskStatus};

use crate::{broker::Message, error::TaskError};

/// Identifier of one asynchronous execution; never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecHandle(u64);

impl ExecHandle {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExecHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec-{}", self.0)
    }
}

/// One message taken off the incoming queue and its execution.
#[derive(Debug, Clone)]
pub struct TaskUnit {
    handle: ExecHandle,
    task_id: TaskId,
    message: Message,
    start_time: SystemTime,
    end_time: Option<SystemTime>,
    terminal_error: Option<TaskError>,
}

impl TaskUnit {
    pub fn handle(&self) -> ExecHandle {
        self.handle
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    pub fn end_time(&self) -> Option<SystemTime> {
        self.end_time
    }

    pub fn terminal_error(&self) -> Option<&TaskError> {
        self.terminal_error.as_ref()
    }

    /// Derived from whether the execution finished and whether an error was recorded.
    pub fn status(&self) -> TaskStatus {
        TaskStatus::derive(self.end_time.is_some(), self.terminal_error.is_some())
    }

    /// Wall-clock runtime, once finished.
    pub fn runtime(&self) -> Option<Duration> {
        self.end_time
            .map(|end| end.duration_since(self.start_time).unwrap_or_default())
    }

    /// Record completion of the execution. Later calls are ignored.
    pub fn mark_finished(&mut self, at: SystemTime) {
        if self.end_time.is_none() {
            self.end_time = Some(at);
        }
    }

    /// Record the terminal error. The first error sticks.
    pub fn fail(&mut self, err: TaskError) {
        if self.end_time.is_none() {
            self.end_time = Some(SystemTime::now());
        }
        if self.terminal_error.is_none() {
            self.terminal_error = Some(err);
        }
    }
}

/// In-flight and just-completed task units, in intake order.
///
/// Only the engine's control loop mutates membership, so no lock is involved.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    next: u64,
    units: BTreeMap<ExecHandle, TaskUnit>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly received message and allocate its execution handle.
    pub fn insert(&mut self, message: Message) -> ExecHandle {
        self.next += 1;
        let handle = ExecHandle(self.next);
        let unit = TaskUnit {
            handle,
            task_id: TaskId::from(&message.id),
            message,
            start_time: SystemTime::now(),
            end_time: None,
            terminal_error: None,
        };
        self.units.insert(handle, unit);
        handle
    }

    pub fn get(&self, handle: ExecHandle) -> Option<&TaskUnit> {
        self.units.get(&handle)
    }

    pub fn get_mut(&mut self, handle: ExecHandle) -> Option<&mut TaskUnit> {
        self.units.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: ExecHandle) -> Option<TaskUnit> {
        self.units.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.count(TaskStatus::Pending)
    }

    pub fn failed_count(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    /// Handles of units whose execution has not finished yet.
    pub fn pending_handles(&self) -> Vec<ExecHandle> {
        self.units
            .values()
            .filter(|u| u.status() == TaskStatus::Pending)
            .map(|u| u.handle)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskUnit> {
        self.units.values()
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.units.values().filter(|u| u.status() == status).count()
    }
}
