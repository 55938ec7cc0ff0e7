use async_trait::async_trait;
use pilot_model::{Payload, TaskId};

use crate::error::TaskError;

/// Executes tasks on behalf of the engine.
///
/// One runner serves a whole run: [`Runner::prepare`] and [`Runner::init`] are called once, in that order,
/// before the first [`Runner::run`]; [`Runner::finish`] is called once after the engine stopped.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Make the runtime ready (pull or build images, create directories). Idempotent.
    async fn prepare(&self) -> Result<(), TaskError> {
        Ok(())
    }

    /// Run the one-time init step, if any. Any error aborts the run.
    async fn init(&self) -> Result<(), TaskError> {
        Ok(())
    }

    /// Execute one task and return its output payload.
    ///
    /// Dropping the returned future must stop the underlying process.
    async fn run(&self, id: &TaskId, input: Payload) -> Result<Payload, TaskError>;

    /// Release run-wide resources. `failed` tells whether the run ended with an error.
    async fn finish(&self, _failed: bool) {}
}
