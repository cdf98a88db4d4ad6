use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowlord_core::{ErrorList, FlowlordResult};
use flowlord_dispatcher::registry::RefreshOutcome;
use flowlord_dispatcher::scheduler::{build_schedule, CronEntry, CronRunner, TaskSender};
use flowlord_dispatcher::{FileMatcher, WorkflowRegistry};
use flowlord_domain::Producer;
use flowlord_infrastructure::{Notifier, SqliteCache};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// 当前生效的调度实例。
/// 热更新时先启动新runner再停旧runner，不留调度空窗。
pub struct ScheduleHandle {
    pub sender: Arc<TaskSender>,
    producer: Arc<dyn Producer>,
    workflow_path: String,
    runner: RwLock<Arc<CronRunner>>,
    matcher: RwLock<Arc<FileMatcher>>,
}

impl ScheduleHandle {
    /// 以空调度启动，首次rebuild后才有活动条目
    pub fn new(sender: Arc<TaskSender>, producer: Arc<dyn Producer>, workflow_path: String) -> Self {
        let runner = Arc::new(CronRunner::start(Vec::new(), Arc::clone(&sender)));
        let matcher = Arc::new(FileMatcher::new(Vec::new(), Arc::clone(&producer)));
        Self {
            sender,
            producer,
            workflow_path,
            runner: RwLock::new(runner),
            matcher: RwLock::new(matcher),
        }
    }

    /// 按注册表当前快照重建调度与文件规则
    pub async fn rebuild(&self, registry: &WorkflowRegistry) -> FlowlordResult<ErrorList> {
        let (jobs, rules, errors) = build_schedule(&registry.snapshot(), &self.workflow_path)?;
        for e in errors.iter() {
            warn!(error = %e, "调度规则被跳过");
        }

        let new_runner = Arc::new(CronRunner::start(jobs, Arc::clone(&self.sender)));
        let old = {
            let mut current = self.runner.write().await;
            std::mem::replace(&mut *current, new_runner)
        };
        old.stop();

        *self.matcher.write().await = Arc::new(FileMatcher::new(rules, Arc::clone(&self.producer)));
        Ok(errors)
    }

    /// 重载工作流，有文件变化时重建调度
    pub async fn refresh(&self, registry: &WorkflowRegistry) -> FlowlordResult<RefreshOutcome> {
        let outcome = registry.refresh().await;
        if !outcome.changed.is_empty() {
            info!(changed = ?outcome.changed, "工作流有变化，重建调度");
            self.rebuild(registry).await?;
        }
        Ok(outcome)
    }

    pub async fn entries(&self) -> Vec<Arc<CronEntry>> {
        self.runner.read().await.entries().to_vec()
    }

    pub async fn matcher(&self) -> Arc<FileMatcher> {
        Arc::clone(&*self.matcher.read().await)
    }

    pub async fn stop(&self) {
        self.runner.read().await.stop();
    }
}

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<SqliteCache>,
    pub registry: Arc<WorkflowRegistry>,
    pub schedule: Arc<ScheduleHandle>,
    pub notifier: Arc<Notifier>,
    pub started_at: DateTime<Utc>,
    pub version: String,
}
