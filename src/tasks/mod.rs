pub mod engine;
pub mod progress;
pub mod registry;

pub use engine::{mark_stale_running_tasks, MatchEngine, StartTaskOptions};
pub use progress::{ProgressReport, TaskCounters, TaskMode, TaskState, TaskStatus};
pub use registry::{TaskHandle, TaskRegistry};
