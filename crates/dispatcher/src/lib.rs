//! 调度与编排：工作流注册表、cron调度、批量展开、
//! 完成/失败事件编排以及文件规则匹配。

pub mod batch;
pub mod delay;
pub mod engine;
pub mod files;
pub mod registry;
pub mod scheduler;

pub use batch::Batch;
pub use delay::RetryScheduler;
pub use engine::{is_ready, jitter_percent, OrchestrationEngine};
pub use files::{FileMatcher, FileRule};
pub use registry::{RefreshOutcome, WorkflowRegistry};
pub use scheduler::{
    build_schedule, job_from_phase, CronEntry, CronRunner, DispatchJob, PeriodicJob, TaskSender,
};
