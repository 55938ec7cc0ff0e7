use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::{
    ack::RunSummary,
    broker::Broker,
    config::PilotConfig,
    engine::ConsumeReplyEngine,
    error::{PilotError, TaskError},
    housekeeping::{Housekeeper, ProgressSink},
    runner::Runner,
};

/// One pilot run: prepare the runtime, run the init step, consume until done, quarantine on failure.
pub struct Pilot {
    cfg: PilotConfig,
    runner: Arc<dyn Runner>,
    house: Housekeeper,
    cancel: CancellationToken,
}

impl Pilot {
    /// Validates the configuration; nothing touches the broker or the runtime yet.
    pub fn new(cfg: PilotConfig, runner: Arc<dyn Runner>) -> Result<Self, PilotError> {
        cfg.validate()?;
        if usize::from(cfg.prefetch) < cfg.max_concurrency {
            warn!(
                target: "pilot.core",
                prefetch = cfg.prefetch,
                max_concurrency = cfg.max_concurrency,
                "prefetch below max_concurrency; at most `prefetch` tasks run at once"
            );
        }
        let house = Housekeeper::new(cfg.keepalive_interval);
        Ok(Self {
            cfg,
            runner,
            house,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.house.add_sink(sink);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that requests a graceful shutdown when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PilotConfig {
        &self.cfg
    }

    #[instrument(level = "info", skip_all)]
    pub async fn run(mut self, broker: &dyn Broker) -> Result<RunSummary, PilotError> {
        info!(
            target: "pilot.core",
            runner = self.runner.name(),
            incoming = %self.cfg.incoming_queue,
            outgoing = %self.cfg.outgoing_queue,
            "pilot starting"
        );
        self.house.started();

        let res = self.run_phases(broker).await;
        self.runner.finish(res.is_err()).await;
        self.house
            .finished(res.as_ref().err().map(ToString::to_string));

        if let Err(e) = &res {
            error!(target: "pilot.core", error = %e, "pilot run failed");
            if !self.cfg.quarantine.is_zero() {
                warn!(
                    target: "pilot.core",
                    secs = self.cfg.quarantine.as_secs_f64(),
                    "quarantine before exit"
                );
                self.house.quarantine(self.cfg.quarantine).await;
            }
        }
        res
    }

    async fn run_phases(&mut self, broker: &dyn Broker) -> Result<RunSummary, PilotError> {
        self.runner.prepare().await.map_err(PilotError::Setup)?;
        info!(target: "pilot.core", "runtime prepared");

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PilotError::Init(TaskError::Cancelled)),
            res = self.runner.init() => res.map_err(PilotError::Init)?,
        }
        info!(target: "pilot.core", "init step done");

        let mut engine =
            ConsumeReplyEngine::new(&self.cfg, Arc::clone(&self.runner), self.cancel.clone());
        engine.run(broker, &mut self.house).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::MemoryBroker, error::ConfigError};
    use async_trait::async_trait;
    use pilot_model::{Payload, ProgressEvent, TaskId};
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };
    use tokio::time::Instant;

    #[derive(Default)]
    struct Scripted {
        init_error: Option<TaskError>,
        fail_tasks: bool,
        init_ran: AtomicBool,
        runs: AtomicUsize,
        finished_failed: Mutex<Option<bool>>,
    }

    #[async_trait]
    impl Runner for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn init(&self) -> Result<(), TaskError> {
            self.init_ran.store(true, Ordering::SeqCst);
            match &self.init_error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        async fn run(&self, _id: &TaskId, input: Payload) -> Result<Payload, TaskError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_tasks {
                return Err(TaskError::Execution {
                    code: Some(1),
                    diagnostic: "nope".into(),
                });
            }
            Ok(input)
        }

        async fn finish(&self, failed: bool) {
            *self.finished_failed.lock().unwrap() = Some(failed);
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressEvent>>);

    impl ProgressSink for Recorder {
        fn emit(&self, event: &ProgressEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn cfg() -> PilotConfig {
        PilotConfig::new("in", "out").with_timeout_incoming(Duration::from_secs(2))
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let runner = Arc::new(Scripted::default());
        let err = Pilot::new(cfg().with_max_concurrency(0), runner).err().unwrap();
        assert!(matches!(err, PilotError::Config(ConfigError::ZeroConcurrency)));
    }

    #[tokio::test(start_paused = true)]
    async fn init_failure_is_fatal_and_skips_intake() {
        let broker = MemoryBroker::new();
        broker.enqueue("in", "a");
        let runner = Arc::new(Scripted {
            init_error: Some(TaskError::Timeout {
                elapsed: Duration::from_secs(3),
            }),
            ..Default::default()
        });

        let err = Pilot::new(cfg(), runner.clone())
            .unwrap()
            .run(&broker)
            .await
            .unwrap_err();

        assert!(matches!(err, PilotError::Init(TaskError::Timeout { .. })));
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
        assert_eq!(broker.queue_len("in"), 1);
        assert_eq!(*runner.finished_failed.lock().unwrap(), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn quarantine_delays_failure() {
        let broker = MemoryBroker::new();
        broker.enqueue("in", "a");
        let runner = Arc::new(Scripted {
            fail_tasks: true,
            ..Default::default()
        });

        let rec = Arc::new(Recorder::default());

        let started = Instant::now();
        let err = Pilot::new(cfg().with_quarantine(Duration::from_secs(20)), runner)
            .unwrap()
            .with_sink(rec.clone())
            .run(&broker)
            .await
            .unwrap_err();

        assert_eq!(err.aggregate().unwrap().len(), 1);
        assert!(started.elapsed() >= Duration::from_secs(20));

        // The failure is signalled first; quarantine heartbeats follow until exit.
        let events = rec.0.lock().unwrap().clone();
        assert!(events.iter().any(|e| matches!(e, ProgressEvent::Finished { error: Some(_) })));
        assert_eq!(
            events.last(),
            Some(&ProgressEvent::Quarantined { remaining_secs: 0 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn success_skips_quarantine_and_reports_progress() {
        let broker = MemoryBroker::new();
        broker.enqueue("in", "a");
        let runner = Arc::new(Scripted::default());
        let rec = Arc::new(Recorder::default());

        let started = Instant::now();
        let summary = Pilot::new(cfg().with_quarantine(Duration::from_secs(20)), runner.clone())
            .unwrap()
            .with_sink(rec.clone())
            .run(&broker)
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert!(started.elapsed() < Duration::from_secs(20));
        assert!(runner.init_ran.load(Ordering::SeqCst));
        assert_eq!(*runner.finished_failed.lock().unwrap(), Some(false));

        let events = rec.0.lock().unwrap().clone();
        assert_eq!(events.first(), Some(&ProgressEvent::Started));
        assert!(events.contains(&ProgressEvent::Tasking));
        assert!(events.contains(&ProgressEvent::Done { succeeded: 1, failed: 0 }));
        assert_eq!(events.last(), Some(&ProgressEvent::Finished { error: None }));
    }
}
