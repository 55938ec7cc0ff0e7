mod platform;
pub use platform::Platform;

mod run_spec;
pub use run_spec::{BindMount, RunSpec};
