//! Consume-execute-acknowledge engine of the pilot.
//!
//! The [`Pilot`] runs an optional init step, then drives the [`ConsumeReplyEngine`]: messages are pulled
//! from a [`broker::SubResource`], executed through a [`Runner`] with bounded concurrency, and reconciled
//! against the broker by the [`AckCoordinator`].

pub mod ack;
pub use ack::{AckCoordinator, Reconciled, RunSummary};

pub mod broker;
pub use broker::{Broker, MemoryBroker, Message, PubResource, SubResource};

pub mod config;
pub use config::PilotConfig;

pub mod engine;
pub use engine::{ConsumeReplyEngine, EngineState};

pub mod error;
pub use error::{AggregateError, BrokerError, ConfigError, PilotError, TaskError};

pub mod housekeeping;
pub use housekeeping::{Housekeeper, ProgressSink};

pub mod pilot;
pub use pilot::Pilot;

pub mod registry;
pub use registry::{ExecHandle, TaskRegistry, TaskUnit};

pub mod runner;
pub use runner::Runner;
