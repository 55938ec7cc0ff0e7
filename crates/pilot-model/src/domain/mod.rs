mod kv;
pub use kv::KeyValue;

mod task_env;
pub use task_env::TaskEnv;

mod task_id;
pub use task_id::{MessageId, TaskId};

mod task_status;
pub use task_status::TaskStatus;

mod file_type;
pub use file_type::FileType;

mod payload;
pub use payload::Payload;

mod progress;
pub use progress::ProgressEvent;

/// Timeout value in milliseconds.
///
/// Used in run specifications where an explicit time limit is optional.
pub type TimeoutMs = u64;
