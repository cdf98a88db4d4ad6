use std::sync::Arc;

use flowlord_core::{parse_duration, print_duration, FlowlordError, FlowlordResult};
use flowlord_domain::{tmpl, Meta, Task, TaskResult};
use rand::Rng;
use tracing::{debug, warn};

use crate::delay::RetryScheduler;
use crate::registry::WorkflowRegistry;
use crate::scheduler::TaskSender;

/// 完成/失败事件的编排引擎。
/// 每条事件先落库，再按结果分支：错误走重试/死信，完成派发下游。
pub struct OrchestrationEngine {
    registry: Arc<WorkflowRegistry>,
    sender: Arc<TaskSender>,
    retry: Arc<RetryScheduler>,
    failed_topic: String,
}

impl OrchestrationEngine {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        sender: Arc<TaskSender>,
        retry: Arc<RetryScheduler>,
        failed_topic: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            sender,
            retry,
            failed_topic: failed_topic.into(),
        }
    }

    pub async fn process(&self, task: Task) -> FlowlordResult<()> {
        if let Err(e) = self.sender.cache.add(&task).await {
            warn!(id = %task.id, error = %e, "任务状态写入失败");
        }
        match task.result {
            TaskResult::Warn => Ok(()),
            TaskResult::Alert => {
                self.sender.alert(task).await;
                Ok(())
            }
            TaskResult::Error => self.handle_error(task).await,
            TaskResult::Complete => self.handle_complete(task).await,
            TaskResult::Running => Err(FlowlordError::UnknownResult(format!(
                "{}:{} 上报了空result",
                task.task_type, task.job
            ))),
        }
    }

    /// 错误分支：在phase允许的次数内安排延迟重试，超限后送死信并告警
    async fn handle_error(&self, mut task: Task) -> FlowlordResult<()> {
        let mut meta = task.parsed_meta();
        let Some((_, phase)) = self.registry.get(&task) else {
            return Err(FlowlordError::PhaseNotFound {
                workflow: meta.get("workflow").to_string(),
                topic: task.task_type.clone(),
                job: task.job.clone(),
            });
        };
        let rules = phase.rule_meta();
        let count: u32 = meta.get("retry").parse().unwrap_or(0);

        if phase.retry > count {
            let mut delay = chrono::Duration::seconds(1);
            let retry_delay = rules.get("retry_delay");
            if !retry_delay.is_empty() {
                let d = parse_duration(retry_delay)?;
                delay = d + jitter_percent(d, 40);
                meta.set("delayed", print_duration(delay));
            }
            let mut retry = Task::new(task.task_type.clone(), task.info.clone());
            retry.id = task.id.clone();
            retry.job = phase.job();
            meta.set("retry", (count + 1).to_string());
            retry.meta = meta.encode();
            self.retry.schedule(retry, delay.to_std().unwrap_or_default());
            return Ok(());
        }

        meta.set("retry", "failed");
        meta.set("retried", phase.retry.to_string());
        task.meta = meta.encode();
        if !self.failed_topic.is_empty() && self.failed_topic != "-" {
            if let Err(e) = self.sender.cache.add(&task).await {
                warn!(id = %task.id, error = %e, "死信任务写入失败");
            }
            self.sender.producer.send(&self.failed_topic, &task).await?;
        }
        if rules.get("no_alert").is_empty() {
            self.sender.alert(task).await;
        }
        Ok(())
    }

    /// 完成分支：按DAG派发require条件满足的下游任务，ID随父任务传递
    async fn handle_complete(&self, task: Task) -> FlowlordResult<()> {
        let meta = task.parsed_meta();
        let task_time = tmpl::task_time(&task);
        let children = self.registry.children(&task);
        if children.is_empty() {
            debug!(key = %task.key(), "没有下游phase");
            return Ok(());
        }
        for phase in children {
            if !is_ready(&phase.rule, &meta) {
                continue;
            }
            let info = tmpl::render(&phase.template, task_time);
            let (info, _) = tmpl::meta_substitute(&info, &meta);

            let mut child = Task::new(phase.topic().to_string(), info);
            child.id = task.id.clone();
            child.job = phase.job();

            let mut child_meta = Meta::new();
            child_meta.set("workflow", meta.get("workflow").to_string());
            if !meta.get("cron").is_empty() {
                child_meta.set("cron", meta.get("cron").to_string());
            }
            if !child.job.is_empty() {
                child_meta.set("job", child.job.clone());
            }
            child.meta = child_meta.encode();

            self.sender.send(&child).await?;
        }
        Ok(())
    }
}

/// require={meta:K},... 中引用的每个键在父meta中都非空时才派发
pub fn is_ready(rule: &str, meta: &Meta) -> bool {
    let require: Vec<String> = url::form_urlencoded::parse(rule.as_bytes())
        .filter(|(k, _)| k == "require")
        .map(|(_, v)| v.into_owned())
        .collect();
    let joined = require.join(",");

    let mut rest = joined.as_str();
    while let Some(start) = rest.find("{meta:") {
        let key_start = start + "{meta:".len();
        let Some(close) = rest[key_start..].find('}') else {
            break;
        };
        let key = &rest[key_start..key_start + close];
        if meta.get(key).is_empty() {
            return false;
        }
        rest = &rest[key_start + close + 1..];
    }
    true
}

/// 重试抖动：返回 [0, wait×p/100) 内的随机时长。
/// 失败往往源于同时跑的任务过多，错峰重试避免再次集中打爆。
pub fn jitter_percent(wait: chrono::Duration, p: i64) -> chrono::Duration {
    let max = wait.num_milliseconds() * p / 100;
    if max <= 0 {
        return chrono::Duration::zero();
    }
    chrono::Duration::milliseconds(rand::rng().random_range(0..max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowlord_domain::{Producer, TaskStore};
    use std::io::Write as _;
    use tokio::sync::{mpsc, Mutex};

    struct NullStore;
    #[async_trait]
    impl TaskStore for NullStore {
        async fn add(&self, _task: &Task) -> FlowlordResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct VecProducer(Mutex<Vec<(String, Task)>>);
    #[async_trait]
    impl Producer for VecProducer {
        async fn send(&self, topic: &str, task: &Task) -> FlowlordResult<()> {
            self.0.lock().await.push((topic.to_string(), task.clone()));
            Ok(())
        }
    }

    const WORKFLOW: &str = r#"
[[phase]]
task = "task1"
rule = "cron=0 * * * *&retry_delay=10ms"
retry = 3
template = "?date={yyyy}-{mm}-{dd}"

[[phase]]
task = "task2"
dependsOn = "task1"
template = "?time={yyyy}-{mm}-{dd}"

[[phase]]
task = "task3"
dependsOn = "task1"
rule = "require={meta:file}"
template = "?f={meta:file}"

[[phase]]
task = "quiet"
rule = "cron=0 * * * *&no_alert=true"
retry = 0
template = ""
"#;

    struct Fixture {
        engine: OrchestrationEngine,
        producer: Arc<VecProducer>,
        retry: Arc<RetryScheduler>,
        alerts: mpsc::Receiver<Task>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(failed_topic: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("f1.toml")).unwrap();
        f.write_all(WORKFLOW.as_bytes()).unwrap();
        let registry = Arc::new(WorkflowRegistry::new(dir.path(), None));
        let outcome = registry.refresh().await;
        assert!(outcome.errors.is_empty());

        let producer = Arc::new(VecProducer::default());
        let (alert_tx, alerts) = mpsc::channel(8);
        let sender = Arc::new(TaskSender {
            cache: Arc::new(NullStore),
            producer: Arc::clone(&producer) as Arc<dyn Producer>,
            alerts: alert_tx,
        });
        let retry = Arc::new(RetryScheduler::new());
        Fixture {
            engine: OrchestrationEngine::new(
                registry,
                sender,
                Arc::clone(&retry),
                failed_topic,
            ),
            producer,
            retry,
            alerts,
            _dir: dir,
        }
    }

    fn errored(meta: &str) -> Task {
        Task {
            id: "x1".to_string(),
            task_type: "task1".to_string(),
            info: "?date=2020-05-26".to_string(),
            meta: meta.to_string(),
            result: TaskResult::Error,
            created: "2020-05-26T10:00:00Z".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_error_schedules_retry_with_incremented_counter() {
        let fx = fixture("failed-topic").await;
        fx.engine.process(errored("workflow=f1.toml")).await.unwrap();
        assert_eq!(fx.retry.pending(), 1);
        assert!(fx.producer.0.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_error_past_retry_limit_dead_letters() {
        let mut fx = fixture("failed-topic").await;
        fx.engine
            .process(errored("retry=3&workflow=f1.toml"))
            .await
            .unwrap();
        assert_eq!(fx.retry.pending(), 0);

        let sent = fx.producer.0.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "failed-topic");
        let meta = sent[0].1.parsed_meta();
        assert_eq!(meta.get("retry"), "failed");
        assert_eq!(meta.get("retried"), "3");
        drop(sent);

        let alert = fx.alerts.recv().await.unwrap();
        assert_eq!(alert.id, "x1");
    }

    #[tokio::test]
    async fn test_dead_letter_skipped_for_dash_topic() {
        let fx = fixture("-").await;
        fx.engine
            .process(errored("retry=3&workflow=f1.toml"))
            .await
            .unwrap();
        assert!(fx.producer.0.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_no_alert_rule_suppresses_alert() {
        let mut fx = fixture("failed-topic").await;
        let t = Task {
            id: "q1".to_string(),
            task_type: "quiet".to_string(),
            meta: "workflow=f1.toml".to_string(),
            result: TaskResult::Error,
            ..Default::default()
        };
        fx.engine.process(t).await.unwrap();
        assert!(fx.alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_error_without_phase_fails() {
        let fx = fixture("failed-topic").await;
        let t = Task {
            task_type: "nowhere".to_string(),
            meta: "workflow=f1.toml".to_string(),
            result: TaskResult::Error,
            ..Default::default()
        };
        assert!(fx.engine.process(t).await.is_err());
    }

    #[tokio::test]
    async fn test_complete_dispatches_ready_children_only() {
        let fx = fixture("failed-topic").await;
        let t = Task {
            id: "X".to_string(),
            task_type: "task1".to_string(),
            info: "?day=2020-05-26".to_string(),
            meta: "workflow=f1.toml".to_string(),
            result: TaskResult::Complete,
            ..Default::default()
        };
        fx.engine.process(t).await.unwrap();

        // task2无require直接派发，task3要求meta:file未满足被跳过
        let sent = fx.producer.0.lock().await;
        assert_eq!(sent.len(), 1);
        let child = &sent[0].1;
        assert_eq!(child.task_type, "task2");
        assert_eq!(child.id, "X");
        assert_eq!(child.info, "?time=2020-05-26");
        assert_eq!(child.meta, "workflow=f1.toml");
    }

    #[tokio::test]
    async fn test_complete_with_required_meta_dispatches_gated_child() {
        let fx = fixture("failed-topic").await;
        let t = Task {
            id: "X".to_string(),
            task_type: "task1".to_string(),
            info: "?day=2020-05-26".to_string(),
            meta: "file=s3://b/f.json&workflow=f1.toml".to_string(),
            result: TaskResult::Complete,
            ..Default::default()
        };
        fx.engine.process(t).await.unwrap();

        let sent = fx.producer.0.lock().await;
        let types: Vec<&str> = sent.iter().map(|(_, t)| t.task_type.as_str()).collect();
        assert!(types.contains(&"task3"));
        let task3 = sent.iter().find(|(_, t)| t.task_type == "task3").unwrap();
        assert_eq!(task3.1.info, "?f=s3://b/f.json");
    }

    #[tokio::test]
    async fn test_warn_and_alert_results() {
        let mut fx = fixture("failed-topic").await;
        let mut t = errored("workflow=f1.toml");
        t.result = TaskResult::Warn;
        fx.engine.process(t.clone()).await.unwrap();
        assert!(fx.alerts.try_recv().is_err());

        t.result = TaskResult::Alert;
        fx.engine.process(t).await.unwrap();
        assert!(fx.alerts.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_running_result_is_rejected() {
        let fx = fixture("failed-topic").await;
        let mut t = errored("workflow=f1.toml");
        t.result = TaskResult::Running;
        assert!(fx.engine.process(t).await.is_err());
    }

    #[test]
    fn test_jitter_bound() {
        let wait = chrono::Duration::milliseconds(500);
        for _ in 0..200 {
            let j = jitter_percent(wait, 40);
            assert!(j >= chrono::Duration::zero());
            assert!(j < chrono::Duration::milliseconds(200));
        }
        assert_eq!(jitter_percent(chrono::Duration::zero(), 40), chrono::Duration::zero());
    }

    #[test]
    fn test_is_ready() {
        let mut meta = Meta::new();
        assert!(is_ready("", &meta));
        assert!(!is_ready("require={meta:file}", &meta));
        meta.set("file", "a.json");
        assert!(is_ready("require={meta:file}", &meta));
        assert!(!is_ready("require={meta:file},{meta:count}", &meta));
    }
}
