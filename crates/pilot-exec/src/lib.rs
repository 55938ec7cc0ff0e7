//! Process and container execution for the pilot.
//!
//! [`ProcRunner`] implements [`pilot_core::Runner`]: it stages the input payload in a per-task directory,
//! runs the command (on the host or through docker/apptainer) with timeout enforcement, and decodes the output.

mod error;
pub use error::{ExecError, ExecResult};

pub mod codec;
pub mod container;
pub mod dirs;
pub use dirs::DirectoryCatalog;

pub mod logparse;
pub use logparse::extract_error;

pub mod proc;
pub use proc::{DumpStream, ExecConfig, ProcRunner};

mod util;

pub mod prelude {
    pub use crate::error::{ExecError, ExecResult};
    pub use crate::proc::{ExecConfig, ProcRunner};
}
