//! flowlord的领域模型：任务事件、工作流phase、模板与统计。

pub mod files;
pub mod phase;
pub mod ports;
pub mod stats;
pub mod task;
pub mod tmpl;

pub use files::FileStat;
pub use phase::{normalize_cron, parse_cron, Phase, Workflow, WorkflowFile};
pub use ports::{Consumer, Producer, TaskStore, WorkflowStore};
pub use stats::{DurationStats, Stats, TaskCounts, TaskStats};
pub use task::{Meta, Task, TaskJob, TaskResult, DATE_HOUR};
