//! The consume-reply control loop.
//!
//! One logical thread of control owns the registry. Executions run as independently scheduled tokio tasks
//! in a [`JoinSet`] and report back into the loop, which is the only place that reconciles them.

use std::{
    any::Any,
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures::FutureExt;
use pilot_model::{Payload, TaskId};
use tokio::{
    task::{Id, JoinError, JoinSet},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    ack::{AckCoordinator, RunSummary},
    broker::{Broker, Message, PubResource, SubResource},
    config::PilotConfig,
    error::{AggregateError, BrokerError, PilotError, TaskError},
    housekeeping::Housekeeper,
    registry::{ExecHandle, TaskRegistry},
    runner::Runner,
};

/// Loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Taking new messages while under the concurrency bound.
    Listening,
    /// No more intake; waiting for in-flight executions.
    Draining,
    Terminated,
}

type Completion = (ExecHandle, Result<Payload, TaskError>, SystemTime);

pub struct ConsumeReplyEngine<'a> {
    cfg: &'a PilotConfig,
    runner: Arc<dyn Runner>,
    cancel: CancellationToken,
    registry: TaskRegistry,
    ack: AckCoordinator,
    executions: JoinSet<Completion>,
    in_flight: HashMap<Id, ExecHandle>,
    state: EngineState,
    received: u64,
    idle: Duration,
    peak_pending: usize,
}

impl<'a> ConsumeReplyEngine<'a> {
    pub fn new(cfg: &'a PilotConfig, runner: Arc<dyn Runner>, cancel: CancellationToken) -> Self {
        Self {
            cfg,
            runner,
            cancel,
            registry: TaskRegistry::new(),
            ack: AckCoordinator::new(cfg.timeout_outgoing),
            executions: JoinSet::new(),
            in_flight: HashMap::new(),
            state: EngineState::Listening,
            received: 0,
            idle: Duration::ZERO,
            peak_pending: 0,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Highest number of simultaneously pending tasks seen so far.
    pub fn peak_pending(&self) -> usize {
        self.peak_pending
    }

    /// Open the broker resources, run the loop until it terminates and release them.
    pub async fn run(
        &mut self,
        broker: &dyn Broker,
        house: &mut Housekeeper,
    ) -> Result<RunSummary, PilotError> {
        let mut sub = broker
            .open_sub(&self.cfg.incoming_queue, self.cfg.prefetch)
            .await?;
        let mut publisher = match broker.open_pub(&self.cfg.outgoing_queue).await {
            Ok(p) => p,
            Err(e) => {
                let _ = sub.close().await;
                return Err(e.into());
            }
        };

        let outcome = self.drive(&mut *sub, &*publisher, house).await;

        if let Err(e) = sub.close().await {
            warn!(target: "pilot.core.engine", error = %e, "closing subscribe channel failed");
        }
        if let Err(e) = publisher.close().await {
            warn!(target: "pilot.core.engine", error = %e, "closing publish channel failed");
        }
        outcome
    }

    async fn drive(
        &mut self,
        sub: &mut dyn SubResource,
        publisher: &dyn PubResource,
        house: &mut Housekeeper,
    ) -> Result<RunSummary, PilotError> {
        let cfg = self.cfg;
        let mut budget = cfg.first_message_budget();
        let mut fatal: Option<BrokerError> = None;
        let mut drain_deadline: Option<Instant> = None;

        info!(
            target: "pilot.core.engine",
            queue = %cfg.incoming_queue,
            max_concurrency = cfg.max_concurrency,
            listen_secs = budget.as_secs_f64(),
            "listening"
        );

        loop {
            house.tick(&*sub, publisher).await;

            if self.state == EngineState::Listening {
                if self.cancel.is_cancelled() {
                    info!(target: "pilot.core.engine", pending = self.registry.pending_count(), "shutdown requested; draining");
                    self.state = EngineState::Draining;
                } else if cfg.stop_on_first_error && self.ack.failed() > 0 {
                    info!(target: "pilot.core.engine", "task failure observed; intake stopped");
                    self.state = EngineState::Draining;
                } else if self.idle >= budget {
                    info!(
                        target: "pilot.core.engine",
                        idle_secs = self.idle.as_secs_f64(),
                        "no message within listen timeout; intake stopped"
                    );
                    self.state = EngineState::Draining;
                }
            }
            if drain_deadline.is_none() && self.cancel.is_cancelled() {
                drain_deadline = Some(Instant::now() + cfg.shutdown_grace);
            }

            let state = self.state;
            let bound = cfg.intake_bound();
            let wait = match state {
                EngineState::Listening if self.registry.pending_count() < bound => {
                    let slice = budget.saturating_sub(self.idle).min(cfg.poll_interval);
                    sub.set_timeout(slice);
                    let asked = Instant::now();
                    let next = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => None,
                        r = sub.next_message() => Some(r),
                    };
                    match next {
                        None => continue,
                        Some(Ok(msg)) => {
                            self.idle = Duration::ZERO;
                            budget = cfg.timeout_incoming;
                            self.dispatch(msg, house);
                            if self.registry.pending_count() < bound {
                                None
                            } else {
                                Some(cfg.poll_interval)
                            }
                        }
                        Some(Err(BrokerError::NoMessage)) => {
                            self.idle += asked.elapsed();
                            None
                        }
                        Some(Err(e)) => {
                            error!(target: "pilot.core.engine", error = %e, "broker failure; draining");
                            fatal = Some(e);
                            self.state = EngineState::Draining;
                            None
                        }
                    }
                }
                EngineState::Listening => Some(cfg.poll_interval),
                EngineState::Draining => {
                    if self.registry.pending_count() == 0 {
                        break;
                    }
                    match drain_deadline {
                        Some(deadline) if Instant::now() >= deadline => {
                            self.abort_in_flight(sub, publisher).await;
                            break;
                        }
                        Some(deadline) => Some(cfg.poll_interval.min(deadline - Instant::now())),
                        None => Some(cfg.poll_interval),
                    }
                }
                EngineState::Terminated => break,
            };

            let done = self.collect(wait).await;
            if !done.is_empty() {
                self.ack
                    .reconcile_all(&mut self.registry, done, &*sub, publisher)
                    .await;
                house.tasks_done(self.ack.succeeded(), self.ack.failed());
            }
        }

        self.state = EngineState::Terminated;

        // Every unit must leave the registry through ack or nack.
        for handle in self.registry.pending_handles() {
            warn!(target: "pilot.core.engine", %handle, "unit left pending at termination; nacking");
            self.ack
                .reconcile(
                    &mut self.registry,
                    handle,
                    Err(TaskError::Cancelled),
                    SystemTime::now(),
                    &*sub,
                    publisher,
                )
                .await;
        }
        house.tasks_done(self.ack.succeeded(), self.ack.failed());

        let summary = self.ack.summary(self.received);
        if self.received == 0 {
            warn!(target: "pilot.core.engine", "no messages were received during this run");
        }
        info!(
            target: "pilot.core.engine",
            received = summary.received,
            succeeded = summary.succeeded,
            failed = summary.failed,
            mean_runtime_secs = summary.mean_runtime.map(|d| d.as_secs_f64()),
            median_runtime_secs = summary.median_runtime.map(|d| d.as_secs_f64()),
            "run finished"
        );

        if let Some(e) = fatal {
            return Err(PilotError::Broker(e));
        }
        if self.ack.failed() > 0 {
            return Err(AggregateError::new(self.ack.take_failures()).into());
        }
        Ok(summary)
    }

    fn dispatch(&mut self, msg: Message, house: &mut Housekeeper) {
        self.received += 1;
        house.message_received();

        let task_id = TaskId::from(&msg.id);
        let payload = msg.payload.clone();
        let redelivered = msg.redelivered;
        let handle = self.registry.insert(msg);
        debug!(target: "pilot.core.engine", task = %task_id, %handle, redelivered, "task dispatched");

        let runner = Arc::clone(&self.runner);
        let abort = self.executions.spawn(async move {
            let result = AssertUnwindSafe(runner.run(&task_id, payload))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(panic.as_ref()))));
            (handle, result, SystemTime::now())
        });
        self.in_flight.insert(abort.id(), handle);

        let pending = self.registry.pending_count();
        debug_assert!(pending <= self.cfg.max_concurrency);
        self.peak_pending = self.peak_pending.max(pending);
    }

    /// Completed executions: waits up to `wait` for the first one, then takes whatever else is ready.
    async fn collect(&mut self, wait: Option<Duration>) -> Vec<Completion> {
        let mut out = Vec::new();
        if self.executions.is_empty() {
            return out;
        }
        if let Some(wait) = wait {
            if let Ok(Some(joined)) =
                tokio::time::timeout(wait, self.executions.join_next_with_id()).await
            {
                self.push_joined(joined, &mut out);
            }
        }
        while let Some(joined) = self.executions.try_join_next_with_id() {
            self.push_joined(joined, &mut out);
        }
        out
    }

    fn push_joined(
        &mut self,
        joined: Result<(Id, Completion), JoinError>,
        out: &mut Vec<Completion>,
    ) {
        match joined {
            Ok((id, completion)) => {
                self.in_flight.remove(&id);
                out.push(completion);
            }
            Err(e) => {
                let Some(handle) = self.in_flight.remove(&e.id()) else {
                    warn!(target: "pilot.core.engine", error = %e, "untracked execution ended");
                    return;
                };
                let err = if e.is_cancelled() {
                    TaskError::Cancelled
                } else {
                    TaskError::Panicked(e.to_string())
                };
                out.push((handle, Err(err), SystemTime::now()));
            }
        }
    }

    async fn abort_in_flight(&mut self, sub: &dyn SubResource, publisher: &dyn PubResource) {
        warn!(
            target: "pilot.core.engine",
            pending = self.registry.pending_count(),
            "shutdown grace expired; aborting in-flight tasks"
        );
        self.executions.abort_all();
        let mut done = Vec::new();
        while let Some(joined) = self.executions.join_next_with_id().await {
            self.push_joined(joined, &mut done);
        }
        self.ack
            .reconcile_all(&mut self.registry, done, sub, publisher)
            .await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
