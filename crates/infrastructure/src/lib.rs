//! 基础设施：内存消息总线、SQLite任务状态缓存与Slack告警通知。

pub mod memory_bus;
pub mod notifier;
pub mod sqlite;

pub use memory_bus::{MemoryBus, MemoryConsumer};
pub use notifier::{format_summary, Level, Notifier, SlackClient};
pub use sqlite::{
    build_compact_summary, AlertRecord, FileMessage, SqliteCache, SummaryLine, TaskFilter,
    WorkflowFileRecord,
};
