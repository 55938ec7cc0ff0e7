//! Prometheus export of pilot progress.
//!
//! [`PrometheusProgress`] is a [`pilot_core::ProgressSink`]: attach it with `Pilot::with_sink` and expose
//! [`PrometheusProgress::gather`] (or [`PrometheusProgress::encode_text`]) from whatever HTTP surface the
//! deployment already has. No server is provided here.
//!
//! ## Metrics
//! - `pilot_messages_received_total` - Counter
//! - `pilot_tasks_succeeded_total` - Counter
//! - `pilot_tasks_failed_total` - Counter
//! - `pilot_running` - Gauge, 1 between `Started` and `Finished`
//! - `pilot_runs_finished_total{outcome}` - Counter, `ok` or `error`
//! - `pilot_quarantine_remaining_seconds` - Gauge

mod progress;
pub use progress::{MetricsError, PrometheusProgress};

pub use prometheus::{Encoder, Registry, TextEncoder};
