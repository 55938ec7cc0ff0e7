use std::{sync::Arc, time::Duration};

use pilot_model::ProgressEvent;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::broker::{PubResource, SubResource};

/// Receives progress events for external monitoring. Best-effort: must not block.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Low-priority maintenance interleaved with the engine loop: broker keep-alives and progress events.
///
/// Nothing here can fail the run; errors are logged and dropped.
pub struct Housekeeper {
    sinks: Vec<Arc<dyn ProgressSink>>,
    keepalive_interval: Duration,
    last_keepalive: Option<Instant>,
    received: u64,
    succeeded: u64,
    failed: u64,
}

impl Housekeeper {
    pub fn new(keepalive_interval: Duration) -> Self {
        Self {
            sinks: Vec::new(),
            keepalive_interval,
            last_keepalive: None,
            received: 0,
            succeeded: 0,
            failed: 0,
        }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn ProgressSink>) {
        self.sinks.push(sink);
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// One maintenance pass. Yields to the scheduler first so the loop never starves other tasks.
    pub async fn tick(&mut self, sub: &dyn SubResource, publisher: &dyn PubResource) {
        tokio::task::yield_now().await;

        let now = Instant::now();
        let due = self
            .last_keepalive
            .is_none_or(|last| now.duration_since(last) >= self.keepalive_interval);
        if !due {
            return;
        }
        self.last_keepalive = Some(now);

        if sub.needs_keepalive() {
            match sub.keepalive().await {
                Ok(()) => trace!(target: "pilot.core.housekeeping", "subscribe keep-alive sent"),
                Err(e) => warn!(target: "pilot.core.housekeeping", error = %e, "subscribe keep-alive failed"),
            }
        }
        if publisher.needs_keepalive() {
            match publisher.keepalive().await {
                Ok(()) => trace!(target: "pilot.core.housekeeping", "publish keep-alive sent"),
                Err(e) => warn!(target: "pilot.core.housekeeping", error = %e, "publish keep-alive failed"),
            }
        }
    }

    pub fn started(&mut self) {
        self.emit(ProgressEvent::Started);
    }

    /// Count one intake; the first one of the run also signals that tasking began.
    pub fn message_received(&mut self) {
        self.received += 1;
        if self.received == 1 {
            self.emit(ProgressEvent::Tasking);
        }
        self.emit(ProgressEvent::Received {
            total: self.received,
        });
    }

    /// Publish new done totals; silent when nothing changed.
    pub fn tasks_done(&mut self, succeeded: u64, failed: u64) {
        if succeeded == self.succeeded && failed == self.failed {
            return;
        }
        self.succeeded = succeeded;
        self.failed = failed;
        self.emit(ProgressEvent::Done { succeeded, failed });
    }

    pub fn finished(&mut self, error: Option<String>) {
        self.emit(ProgressEvent::Finished { error });
    }

    /// Sit out `total`, signalling the time left once per keep-alive interval and a final zero.
    pub async fn quarantine(&mut self, total: Duration) {
        let deadline = Instant::now() + total;
        let every = self.keepalive_interval.max(Duration::from_millis(100));
        debug!(target: "pilot.core.housekeeping", secs = total.as_secs_f64(), "quarantine started");
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.emit(ProgressEvent::Quarantined {
                remaining_secs: remaining.as_secs_f64().ceil() as u64,
            });
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(every.min(remaining)).await;
        }
        debug!(target: "pilot.core.housekeeping", "quarantine over");
    }

    fn emit(&self, event: ProgressEvent) {
        trace!(target: "pilot.core.housekeeping", event = event.kind(), "progress");
        for sink in &self.sinks {
            sink.emit(&event);
        }
    }
}
