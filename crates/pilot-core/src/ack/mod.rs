use std::time::{Duration, SystemTime};

use pilot_model::{Payload, TaskStatus};
use tracing::{debug, error, warn};

use crate::{
    broker::{PubResource, SubResource},
    error::{BrokerError, TaskError},
    registry::{ExecHandle, TaskRegistry},
};

/// Outcome of reconciling one completed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Succeeded,
    Failed,
    /// The handle was not (or no longer) registered.
    Unknown,
}

/// Counts and timing of a finished run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub mean_runtime: Option<Duration>,
    pub median_runtime: Option<Duration>,
}

/// Reconciles completed executions against the broker.
///
/// Success publishes the output then acks the source message; any failure nacks it and keeps the error.
pub struct AckCoordinator {
    timeout_outgoing: Duration,
    succeeded: u64,
    failures: Vec<TaskError>,
    runtimes: Vec<Duration>,
}

impl AckCoordinator {
    pub fn new(timeout_outgoing: Duration) -> Self {
        Self {
            timeout_outgoing,
            succeeded: 0,
            failures: Vec::new(),
            runtimes: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded
    }

    pub fn failed(&self) -> u64 {
        self.failures.len() as u64
    }

    /// Collected terminal errors, in completion order.
    pub fn failures(&self) -> &[TaskError] {
        &self.failures
    }

    pub fn take_failures(&mut self) -> Vec<TaskError> {
        std::mem::take(&mut self.failures)
    }

    /// Reconcile a batch of completions independently of each other.
    pub async fn reconcile_all(
        &mut self,
        registry: &mut TaskRegistry,
        completions: Vec<(ExecHandle, Result<Payload, TaskError>, SystemTime)>,
        sub: &dyn SubResource,
        publisher: &dyn PubResource,
    ) -> Vec<Reconciled> {
        let mut out = Vec::with_capacity(completions.len());
        for (handle, result, finished_at) in completions {
            out.push(
                self.reconcile(registry, handle, result, finished_at, sub, publisher)
                    .await,
            );
        }
        out
    }

    /// Publish/ack or nack one completed execution and remove it from the registry.
    pub async fn reconcile(
        &mut self,
        registry: &mut TaskRegistry,
        handle: ExecHandle,
        result: Result<Payload, TaskError>,
        finished_at: SystemTime,
        sub: &dyn SubResource,
        publisher: &dyn PubResource,
    ) -> Reconciled {
        let Some(unit) = registry.get_mut(handle) else {
            warn!(target: "pilot.core.ack", %handle, "completion for unknown execution handle");
            return Reconciled::Unknown;
        };
        unit.mark_finished(finished_at);

        match result {
            Ok(output) => {
                if let Err(e) = self.publish(&output, publisher).await {
                    unit.fail(TaskError::Publish(e.to_string()));
                }
            }
            Err(e) => unit.fail(e),
        }

        let task = unit.task_id().clone();
        let message = unit.message().clone();
        let runtime = unit.runtime();
        let status = unit.status();

        let outcome = if status == TaskStatus::Failed {
            let err = unit
                .terminal_error()
                .cloned()
                .unwrap_or(TaskError::Cancelled);
            error!(target: "pilot.core.ack", %task, kind = err.kind(), error = %err, "task failed");
            if let Err(e) = sub.nack(&message).await {
                warn!(target: "pilot.core.ack", %task, error = %e, "nack failed; task error kept");
            }
            self.failures.push(err);
            Reconciled::Failed
        } else {
            match sub.ack(&message).await {
                Ok(()) => debug!(target: "pilot.core.ack", %task, "acked"),
                // The result is already published; a redelivery may duplicate it downstream.
                Err(e) => warn!(
                    target: "pilot.core.ack",
                    %task,
                    error = %e,
                    "ack after publish failed; message may be redelivered"
                ),
            }
            self.succeeded += 1;
            Reconciled::Succeeded
        };

        if let Some(rt) = runtime {
            self.runtimes.push(rt);
        }
        registry.remove(handle);
        outcome
    }

    async fn publish(
        &self,
        output: &Payload,
        publisher: &dyn PubResource,
    ) -> Result<(), BrokerError> {
        match tokio::time::timeout(self.timeout_outgoing, publisher.send(output)).await {
            Ok(res) => res,
            Err(_) => Err(BrokerError::Publish(format!(
                "no confirmation within {}s",
                self.timeout_outgoing.as_secs_f64()
            ))),
        }
    }

    /// Counts and runtime statistics so far.
    pub fn summary(&self, received: u64) -> RunSummary {
        let (mean, median) = runtime_stats(&self.runtimes);
        RunSummary {
            received,
            succeeded: self.succeeded,
            failed: self.failed(),
            mean_runtime: mean,
            median_runtime: median,
        }
    }
}

fn runtime_stats(samples: &[Duration]) -> (Option<Duration>, Option<Duration>) {
    if samples.is_empty() {
        return (None, None);
    }
    let total: Duration = samples.iter().sum();
    let mean = total / samples.len() as u32;

    let mut sorted = samples.to_vec();
    sorted.sort();
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2
    } else {
        sorted[mid]
    };
    (Some(mean), Some(median))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};

    async fn setup(
        broker: &MemoryBroker,
        n: usize,
    ) -> (
        TaskRegistry,
        Vec<ExecHandle>,
        Box<dyn SubResource>,
        Box<dyn PubResource>,
    ) {
        for i in 0..n {
            broker.enqueue("in", format!("m{i}"));
        }
        let mut sub = broker.open_sub("in", 100).await.unwrap();
        let publisher = broker.open_pub("out").await.unwrap();
        let mut reg = TaskRegistry::new();
        let mut handles = Vec::new();
        for _ in 0..n {
            let msg = sub.next_message().await.unwrap();
            handles.push(reg.insert(msg));
        }
        (reg, handles, sub, publisher)
    }

    #[tokio::test]
    async fn success_publishes_then_acks() {
        let broker = MemoryBroker::new();
        let (mut reg, hs, sub, publisher) = setup(&broker, 1).await;
        let mut ack = AckCoordinator::new(Duration::from_secs(5));

        let r = ack
            .reconcile(&mut reg, hs[0], Ok(Payload::from("done")), SystemTime::now(), &*sub, &*publisher)
            .await;

        assert_eq!(r, Reconciled::Succeeded);
        assert_eq!(broker.payloads("out"), vec![Payload::from("done")]);
        assert_eq!(broker.acked().len(), 1);
        assert!(broker.nacked().is_empty());
        assert!(reg.is_empty());
        assert_eq!(ack.succeeded(), 1);
    }

    #[tokio::test]
    async fn execution_failure_nacks_and_records() {
        let broker = MemoryBroker::new();
        let (mut reg, hs, sub, publisher) = setup(&broker, 1).await;
        let mut ack = AckCoordinator::new(Duration::from_secs(5));

        let err = TaskError::Execution {
            code: Some(1),
            diagnostic: "boom".into(),
        };
        let r = ack
            .reconcile(&mut reg, hs[0], Err(err.clone()), SystemTime::now(), &*sub, &*publisher)
            .await;

        assert_eq!(r, Reconciled::Failed);
        assert_eq!(broker.queue_len("out"), 0);
        assert_eq!(broker.nacked().len(), 1);
        assert_eq!(ack.failures(), &[err]);
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn publish_failure_is_task_failure() {
        let broker = MemoryBroker::new();
        let (mut reg, hs, sub, publisher) = setup(&broker, 1).await;
        broker.fail_publishes(true);
        let mut ack = AckCoordinator::new(Duration::from_secs(5));

        let r = ack
            .reconcile(&mut reg, hs[0], Ok(Payload::from("x")), SystemTime::now(), &*sub, &*publisher)
            .await;

        assert_eq!(r, Reconciled::Failed);
        assert_eq!(broker.nacked().len(), 1);
        assert_eq!(ack.failures()[0].kind(), "PublishError");
    }

    #[tokio::test]
    async fn ack_failure_after_publish_is_not_fatal() {
        let broker = MemoryBroker::new();
        let (mut reg, hs, sub, publisher) = setup(&broker, 1).await;
        broker.fail_acks(true);
        let mut ack = AckCoordinator::new(Duration::from_secs(5));

        let r = ack
            .reconcile(&mut reg, hs[0], Ok(Payload::from("x")), SystemTime::now(), &*sub, &*publisher)
            .await;

        assert_eq!(r, Reconciled::Succeeded);
        assert_eq!(broker.queue_len("out"), 1);
        assert!(ack.failures().is_empty());
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn nack_failure_keeps_task_error() {
        let broker = MemoryBroker::new();
        let (mut reg, hs, sub, publisher) = setup(&broker, 1).await;
        broker.fail_nacks(true);
        let mut ack = AckCoordinator::new(Duration::from_secs(5));

        ack.reconcile(&mut reg, hs[0], Err(TaskError::Cancelled), SystemTime::now(), &*sub, &*publisher)
            .await;

        assert_eq!(ack.failures(), &[TaskError::Cancelled]);
    }

    #[tokio::test]
    async fn batch_is_processed_independently_in_completion_order() {
        let broker = MemoryBroker::new();
        let (mut reg, hs, sub, publisher) = setup(&broker, 3).await;
        let mut ack = AckCoordinator::new(Duration::from_secs(5));
        let now = SystemTime::now();

        let out = ack
            .reconcile_all(
                &mut reg,
                vec![
                    (hs[2], Err(TaskError::Io("late".into())), now),
                    (hs[0], Ok(Payload::from("ok")), now),
                    (hs[1], Err(TaskError::Io("early".into())), now),
                ],
                &*sub,
                &*publisher,
            )
            .await;

        assert_eq!(out, vec![Reconciled::Failed, Reconciled::Succeeded, Reconciled::Failed]);
        assert_eq!(
            ack.failures(),
            &[TaskError::Io("late".into()), TaskError::Io("early".into())]
        );
        assert_eq!(ack.summary(3).succeeded, 1);
        assert_eq!(ack.summary(3).failed, 2);
    }

    #[tokio::test]
    async fn unknown_handle_is_reported() {
        let broker = MemoryBroker::new();
        let (mut reg, hs, sub, publisher) = setup(&broker, 1).await;
        let mut ack = AckCoordinator::new(Duration::from_secs(5));
        reg.remove(hs[0]);

        let r = ack
            .reconcile(&mut reg, hs[0], Ok(Payload::from("x")), SystemTime::now(), &*sub, &*publisher)
            .await;
        assert_eq!(r, Reconciled::Unknown);
        assert_eq!(broker.queue_len("out"), 0);
    }

    #[test]
    fn stats_mean_and_median() {
        let s = |ms: u64| Duration::from_millis(ms);
        assert_eq!(runtime_stats(&[]), (None, None));
        assert_eq!(runtime_stats(&[s(30), s(10), s(20)]), (Some(s(20)), Some(s(20))));
        assert_eq!(runtime_stats(&[s(40), s(10), s(20), s(10)]), (Some(s(20)), Some(s(15))));
    }
}
