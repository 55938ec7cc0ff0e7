use std::time::Duration;

use crate::error::ConfigError;

/// Resolved configuration of one pilot run.
///
/// Built once at startup and passed by reference; nothing in the engine reads process state afterwards.
#[derive(Clone, Debug)]
pub struct PilotConfig {
    pub incoming_queue: String,
    pub outgoing_queue: String,
    /// Unacknowledged messages the broker may deliver ahead of processing.
    pub prefetch: u16,
    /// Upper bound of concurrently pending tasks.
    pub max_concurrency: usize,
    /// Idle budget while waiting for the first message; `None` uses `timeout_incoming`.
    pub timeout_first_message: Option<Duration>,
    /// Idle budget once at least one message was received.
    pub timeout_incoming: Duration,
    /// Bound on publishing one result.
    pub timeout_outgoing: Duration,
    /// Delay before a failed run returns its error.
    pub quarantine: Duration,
    /// Stop intake once any task failed.
    pub stop_on_first_error: bool,
    /// Bound on a single wait for a message or a completion.
    pub poll_interval: Duration,
    /// Spacing of broker keep-alive probes.
    pub keepalive_interval: Duration,
    /// How long in-flight tasks may run on after a shutdown request.
    pub shutdown_grace: Duration,
}

impl PilotConfig {
    pub fn new(incoming_queue: impl Into<String>, outgoing_queue: impl Into<String>) -> Self {
        Self {
            incoming_queue: incoming_queue.into(),
            outgoing_queue: outgoing_queue.into(),
            prefetch: 1,
            max_concurrency: 1,
            timeout_first_message: None,
            timeout_incoming: Duration::from_secs(60),
            timeout_outgoing: Duration::from_secs(30 * 60),
            quarantine: Duration::ZERO,
            stop_on_first_error: true,
            poll_interval: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn with_timeout_first_message(mut self, t: Option<Duration>) -> Self {
        self.timeout_first_message = t;
        self
    }

    pub fn with_timeout_incoming(mut self, t: Duration) -> Self {
        self.timeout_incoming = t;
        self
    }

    pub fn with_timeout_outgoing(mut self, t: Duration) -> Self {
        self.timeout_outgoing = t;
        self
    }

    pub fn with_quarantine(mut self, t: Duration) -> Self {
        self.quarantine = t;
        self
    }

    pub fn with_stop_on_first_error(mut self, on: bool) -> Self {
        self.stop_on_first_error = on;
        self
    }

    pub fn with_poll_interval(mut self, t: Duration) -> Self {
        self.poll_interval = t;
        self
    }

    pub fn with_keepalive_interval(mut self, t: Duration) -> Self {
        self.keepalive_interval = t;
        self
    }

    pub fn with_shutdown_grace(mut self, t: Duration) -> Self {
        self.shutdown_grace = t;
        self
    }

    /// Idle budget that applies before the first message arrives.
    pub fn first_message_budget(&self) -> Duration {
        self.timeout_first_message.unwrap_or(self.timeout_incoming)
    }

    /// Tasks the engine keeps pending at once: the concurrency bound, capped by what the broker
    /// delivers before acks come back.
    pub fn intake_bound(&self) -> usize {
        self.max_concurrency.min(usize::from(self.prefetch))
    }

    /// Reject inconsistent values. Called before any broker or runtime I/O.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.incoming_queue.trim().is_empty() {
            return Err(ConfigError::EmptyQueue("incoming"));
        }
        if self.outgoing_queue.trim().is_empty() {
            return Err(ConfigError::EmptyQueue("outgoing"));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.prefetch == 0 {
            return Err(ConfigError::ZeroPrefetch);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "poll_interval",
                reason: "must be positive".into(),
            });
        }
        if self.timeout_incoming < self.poll_interval {
            return Err(ConfigError::TimeoutTooShort {
                name: "timeout_incoming",
                value: self.timeout_incoming,
                floor_name: "poll_interval",
                floor: self.poll_interval,
            });
        }
        if let Some(first) = self.timeout_first_message {
            if first < self.poll_interval {
                return Err(ConfigError::TimeoutTooShort {
                    name: "timeout_first_message",
                    value: first,
                    floor_name: "poll_interval",
                    floor: self.poll_interval,
                });
            }
            if first < self.timeout_incoming {
                return Err(ConfigError::TimeoutTooShort {
                    name: "timeout_first_message",
                    value: first,
                    floor_name: "timeout_incoming",
                    floor: self.timeout_incoming,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> PilotConfig {
        PilotConfig::new("in", "out")
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = base();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.timeout_incoming, Duration::from_secs(60));
        assert_eq!(cfg.timeout_outgoing, Duration::from_secs(1800));
        assert_eq!(cfg.first_message_budget(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_zero_concurrency_and_prefetch() {
        assert_eq!(
            base().with_max_concurrency(0).validate(),
            Err(ConfigError::ZeroConcurrency)
        );
        assert_eq!(base().with_prefetch(0).validate(), Err(ConfigError::ZeroPrefetch));
    }

    #[test]
    fn prefetch_caps_the_intake_bound() {
        assert_eq!(base().with_max_concurrency(4).with_prefetch(1).intake_bound(), 1);
        assert_eq!(base().with_max_concurrency(2).with_prefetch(8).intake_bound(), 2);
    }

    #[test]
    fn rejects_listen_timeouts_below_poll_interval() {
        let err = base()
            .with_timeout_incoming(Duration::from_millis(200))
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::TimeoutTooShort { name: "timeout_incoming", .. }
        ));

        let err = base()
            .with_timeout_incoming(Duration::from_secs(1))
            .with_timeout_first_message(Some(Duration::from_millis(500)))
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::TimeoutTooShort {
                name: "timeout_first_message",
                floor_name: "poll_interval",
                ..
            }
        ));
    }

    #[test]
    fn first_message_timeout_must_cover_steady_state() {
        let err = base()
            .with_timeout_incoming(Duration::from_secs(30))
            .with_timeout_first_message(Some(Duration::from_secs(10)))
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::TimeoutTooShort {
                floor_name: "timeout_incoming",
                ..
            }
        ));

        let cfg = base()
            .with_timeout_incoming(Duration::from_secs(30))
            .with_timeout_first_message(Some(Duration::from_secs(300)));
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.first_message_budget(), Duration::from_secs(300));
    }

    #[test]
    fn rejects_empty_queue_names() {
        assert_eq!(
            PilotConfig::new(" ", "out").validate(),
            Err(ConfigError::EmptyQueue("incoming"))
        );
    }
}
