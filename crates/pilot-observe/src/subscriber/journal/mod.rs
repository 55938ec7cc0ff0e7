use pilot_core::ProgressSink;
use pilot_model::ProgressEvent;

use crate::subscriber::view::log_event;

/// Progress sink that writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct Journal;

impl Journal {
    pub fn new() -> Self {
        Self
    }
}

impl ProgressSink for Journal {
    fn emit(&self, event: &ProgressEvent) {
        log_event(event);
    }
}
