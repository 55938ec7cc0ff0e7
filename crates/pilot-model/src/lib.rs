//! Shared data types for the pilot: identifiers, payloads, file types, run specifications and progress events.

mod domain;
pub use domain::*;

mod kind;
pub use kind::*;

mod error;
pub use error::ModelError;
