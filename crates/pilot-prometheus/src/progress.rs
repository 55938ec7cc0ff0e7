use std::sync::Mutex;

use pilot_core::ProgressSink;
use pilot_model::ProgressEvent;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
    proto::MetricFamily,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Last totals seen; progress events carry running totals, counters need deltas.
#[derive(Default)]
struct Seen {
    received: u64,
    succeeded: u64,
    failed: u64,
}

/// Progress sink backed by a prometheus [`Registry`].
pub struct PrometheusProgress {
    registry: Registry,
    received: IntCounter,
    succeeded: IntCounter,
    failed: IntCounter,
    running: IntGauge,
    finished: IntCounterVec,
    quarantine: IntGauge,
    seen: Mutex<Seen>,
}

impl PrometheusProgress {
    /// Metrics in a private registry.
    pub fn new() -> Result<Self, MetricsError> {
        Self::with_registry(Registry::new())
    }

    /// Register the metrics into an existing registry.
    pub fn with_registry(registry: Registry) -> Result<Self, MetricsError> {
        let received = IntCounter::new(
            "pilot_messages_received_total",
            "Messages received from the incoming queue",
        )?;
        let succeeded = IntCounter::new(
            "pilot_tasks_succeeded_total",
            "Tasks whose result was published and acked",
        )?;
        let failed = IntCounter::new("pilot_tasks_failed_total", "Tasks that were nacked")?;
        let running = IntGauge::new("pilot_running", "1 while a pilot run is in progress")?;
        let finished = IntCounterVec::new(
            Opts::new("pilot_runs_finished_total", "Finished pilot runs by outcome"),
            &["outcome"],
        )?;
        let quarantine = IntGauge::new(
            "pilot_quarantine_remaining_seconds",
            "Seconds left before a quarantined pilot exits",
        )?;

        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(succeeded.clone()))?;
        registry.register(Box::new(failed.clone()))?;
        registry.register(Box::new(running.clone()))?;
        registry.register(Box::new(finished.clone()))?;
        registry.register(Box::new(quarantine.clone()))?;

        Ok(Self {
            registry,
            received,
            succeeded,
            failed,
            running,
            finished,
            quarantine,
            seen: Mutex::new(Seen::default()),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.gather(), &mut buf)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

fn advance(counter: &IntCounter, last: &mut u64, total: u64) {
    if total > *last {
        counter.inc_by(total - *last);
        *last = total;
    }
}

impl ProgressSink for PrometheusProgress {
    fn emit(&self, event: &ProgressEvent) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        match event {
            ProgressEvent::Started => {
                *seen = Seen::default();
                self.running.set(1);
                self.quarantine.set(0);
            }
            ProgressEvent::Tasking => {}
            ProgressEvent::Received { total } => {
                advance(&self.received, &mut seen.received, *total);
            }
            ProgressEvent::Done { succeeded, failed } => {
                advance(&self.succeeded, &mut seen.succeeded, *succeeded);
                advance(&self.failed, &mut seen.failed, *failed);
            }
            ProgressEvent::Finished { error } => {
                self.running.set(0);
                let outcome = if error.is_some() { "error" } else { "ok" };
                self.finished.with_label_values(&[outcome]).inc();
            }
            ProgressEvent::Quarantined { remaining_secs } => {
                self.quarantine
                    .set(i64::try_from(*remaining_secs).unwrap_or(i64::MAX));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_follow_running_totals() {
        let m = PrometheusProgress::new().unwrap();
        m.emit(&ProgressEvent::Started);
        m.emit(&ProgressEvent::Tasking);
        m.emit(&ProgressEvent::Received { total: 1 });
        m.emit(&ProgressEvent::Received { total: 3 });
        m.emit(&ProgressEvent::Done {
            succeeded: 2,
            failed: 0,
        });
        m.emit(&ProgressEvent::Done {
            succeeded: 2,
            failed: 1,
        });
        assert_eq!(m.running.get(), 1);

        m.emit(&ProgressEvent::Finished {
            error: Some("1 task(s) failed".into()),
        });

        assert_eq!(m.received.get(), 3);
        assert_eq!(m.succeeded.get(), 2);
        assert_eq!(m.failed.get(), 1);
        assert_eq!(m.running.get(), 0);
        assert_eq!(m.finished.with_label_values(&["error"]).get(), 1);
    }

    #[test]
    fn a_new_run_keeps_accumulating() {
        let m = PrometheusProgress::new().unwrap();
        for _ in 0..2 {
            m.emit(&ProgressEvent::Started);
            m.emit(&ProgressEvent::Received { total: 2 });
            m.emit(&ProgressEvent::Finished { error: None });
        }
        assert_eq!(m.received.get(), 4);
        assert_eq!(m.finished.with_label_values(&["ok"]).get(), 2);
    }

    #[test]
    fn quarantine_gauge_counts_down() {
        let m = PrometheusProgress::new().unwrap();
        m.emit(&ProgressEvent::Quarantined { remaining_secs: 20 });
        assert_eq!(m.quarantine.get(), 20);
        m.emit(&ProgressEvent::Quarantined { remaining_secs: 0 });
        assert_eq!(m.quarantine.get(), 0);
    }

    #[test]
    fn text_exposition() {
        let m = PrometheusProgress::new().unwrap();
        m.emit(&ProgressEvent::Received { total: 5 });
        let text = m.encode_text().unwrap();
        assert!(text.contains("pilot_messages_received_total 5"), "{text}");
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let registry = Registry::new();
        PrometheusProgress::with_registry(registry.clone()).unwrap();
        assert!(matches!(
            PrometheusProgress::with_registry(registry),
            Err(MetricsError::Registration(_))
        ));
    }
}
