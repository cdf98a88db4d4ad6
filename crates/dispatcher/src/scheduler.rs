use std::sync::{Arc, RwLock};

use chrono::{DateTime, DurationRound, Utc};
use flowlord_core::{parse_duration, ErrorList, FlowlordError, FlowlordResult};
use flowlord_domain::{
    normalize_cron, parse_cron, tmpl, Meta, Phase, Producer, Task, TaskResult, TaskStore, Workflow,
    DATE_HOUR,
};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::batch::Batch;
use crate::files::FileRule;

/// 定时触发的单任务派发
#[derive(Debug, Clone)]
pub struct PeriodicJob {
    /// job名，可为空
    pub name: String,
    pub workflow: String,
    pub topic: String,
    /// 规范化后的表达式原文，状态接口展示用
    pub cron: String,
    pub schedule: cron::Schedule,
    pub offset: chrono::Duration,
    pub template: String,
}

impl PeriodicJob {
    pub fn make_task(&self, now: DateTime<Utc>) -> Task {
        let tm = now + self.offset;
        let info = tmpl::render(&self.template, Some(tm));
        let mut task = Task::new(self.topic.clone(), info);
        let mut meta = Meta::new();
        meta.set("workflow", self.workflow.clone());
        meta.set("cron", tm.format(DATE_HOUR).to_string());
        if !self.name.is_empty() {
            task.job = self.name.clone();
            meta.set("job", self.name.clone());
        }
        task.meta = meta.encode();
        task
    }
}

/// 调度条目的两种形态，构建时一次确定，运行期不再判别规则
#[derive(Debug, Clone)]
pub enum DispatchJob {
    Periodic(PeriodicJob),
    Batch {
        base: PeriodicJob,
        window: chrono::Duration,
        batch: Batch,
    },
}

impl DispatchJob {
    pub fn base(&self) -> &PeriodicJob {
        match self {
            Self::Periodic(p) => p,
            Self::Batch { base, .. } => base,
        }
    }

    /// 本次触发应派发的任务集
    pub fn make_tasks(&self, now: DateTime<Utc>) -> FlowlordResult<Vec<Task>> {
        match self {
            Self::Periodic(p) => Ok(vec![p.make_task(now)]),
            Self::Batch { base, window, batch } => {
                let start = (now + base.offset)
                    .duration_trunc(chrono::Duration::hours(1))
                    .unwrap_or(now);
                batch.for_window(start, *window)
            }
        }
    }
}

/// 从phase的规则构建调度条目。
/// 带 for/meta/meta-file 参数的归为批量作业，否则为普通定时作业。
pub fn job_from_phase(phase: &Phase, workflow: &str) -> FlowlordResult<DispatchJob> {
    let rule = phase.rule_meta();
    let schedule = parse_cron(rule.get("cron")).map_err(|e| FlowlordError::InvalidCron {
        expr: rule.get("cron").to_string(),
        message: e.to_string(),
    })?;
    let offset = match rule.get("offset") {
        "" => chrono::Duration::zero(),
        s => parse_duration(s)?,
    };

    let base = PeriodicJob {
        name: phase.job(),
        workflow: workflow.to_string(),
        topic: phase.topic().to_string(),
        cron: normalize_cron(rule.get("cron")),
        schedule,
        offset,
        template: phase.template.clone(),
    };

    let window = match rule.get("for") {
        "" => chrono::Duration::zero(),
        s => parse_duration(s)?,
    };
    let metafile = rule.get("meta-file").to_string();
    let meta: Vec<(String, String)> = phase
        .rule_pairs()
        .into_iter()
        .filter(|(k, _)| k == "meta")
        .filter_map(|(_, v)| v.split_once(':').map(|(k, vs)| (k.to_string(), vs.to_string())))
        .collect();

    if window.is_zero() && metafile.is_empty() && meta.is_empty() {
        return Ok(DispatchJob::Periodic(base));
    }
    if !metafile.is_empty() && !meta.is_empty() {
        return Err(FlowlordError::Scheduling(
            "meta-file 与 meta 不能同时使用".to_string(),
        ));
    }

    let batch = Batch {
        template: base.template.clone(),
        task: base.topic.clone(),
        job: base.name.clone(),
        workflow: base.workflow.clone(),
        by: rule.get("by").to_string(),
        meta,
        metafile,
    };
    Ok(DispatchJob::Batch { base, window, batch })
}

/// 派发出口：任务先落库再上总线，失败转为告警而不是中断调度
pub struct TaskSender {
    pub cache: Arc<dyn TaskStore>,
    pub producer: Arc<dyn Producer>,
    pub alerts: mpsc::Sender<Task>,
}

impl TaskSender {
    pub async fn send(&self, task: &Task) -> FlowlordResult<()> {
        if let Err(e) = self.cache.add(task).await {
            warn!(task_type = %task.task_type, error = %e, "任务状态写入失败");
        }
        self.producer.send(task.topic(), task).await
    }

    pub async fn send_or_alert(&self, mut task: Task) {
        if let Err(e) = self.send(&task).await {
            error!(task_type = %task.task_type, error = %e, "任务派发失败");
            task.result = TaskResult::Error;
            task.msg = e.to_string();
            let _ = self.alerts.send(task).await;
        }
    }

    pub async fn alert(&self, task: Task) {
        let _ = self.alerts.send(task).await;
    }
}

/// 一条活动的调度记录，/info接口读取next/prev
pub struct CronEntry {
    pub job: DispatchJob,
    pub next: RwLock<Option<DateTime<Utc>>>,
    pub prev: RwLock<Option<DateTime<Utc>>>,
}

impl CronEntry {
    fn new(job: DispatchJob) -> Arc<Self> {
        Arc::new(Self {
            job,
            next: RwLock::new(None),
            prev: RwLock::new(None),
        })
    }
}

/// 按工作流快照构建全部调度条目与文件规则。
/// 单个phase的错误收集后继续，零工作流直接失败。
pub fn build_schedule(
    workflows: &std::collections::BTreeMap<String, Workflow>,
    workflow_path: &str,
) -> FlowlordResult<(Vec<DispatchJob>, Vec<FileRule>, ErrorList)> {
    if workflows.is_empty() {
        return Err(FlowlordError::Scheduling(format!(
            "没有可用的工作流，请检查路径 {workflow_path}"
        )));
    }
    let mut jobs = Vec::new();
    let mut file_rules = Vec::new();
    let mut errors = ErrorList::new();

    for (name, wf) in workflows {
        for phase in &wf.phases {
            let rule = phase.rule_meta();
            if !rule.get("files").is_empty() {
                match FileRule::new(phase, name) {
                    Ok(r) => file_rules.push(r),
                    Err(e) => errors.push(FlowlordError::Scheduling(format!(
                        "{name} {} 文件规则无效: {e}",
                        phase.task
                    ))),
                }
            }
            if rule.get("cron").is_empty() {
                continue;
            }
            match job_from_phase(phase, name) {
                Ok(j) => jobs.push(j),
                Err(e) => errors.push(FlowlordError::Scheduling(format!(
                    "{name} {} 规则无效: {e}",
                    phase.task
                ))),
            }
        }
    }
    Ok((jobs, file_rules, errors))
}

/// cron执行器。每个条目一个tokio任务，按schedule睡到下次触发点。
/// 热更新时先启动新实例再停旧实例，避免出现无调度窗口。
pub struct CronRunner {
    entries: Vec<Arc<CronEntry>>,
    stop: watch::Sender<bool>,
}

impl CronRunner {
    pub fn start(jobs: Vec<DispatchJob>, sender: Arc<TaskSender>) -> Self {
        let (stop, _) = watch::channel(false);
        let entries: Vec<Arc<CronEntry>> = jobs.into_iter().map(CronEntry::new).collect();

        for entry in &entries {
            let entry = Arc::clone(entry);
            let sender = Arc::clone(&sender);
            let mut stop_rx = stop.subscribe();
            tokio::spawn(async move {
                loop {
                    let next = match entry.job.base().schedule.upcoming(Utc).next() {
                        Some(n) => n,
                        None => break,
                    };
                    *entry.next.write().unwrap_or_else(|e| e.into_inner()) = Some(next);
                    let wait = (next - Utc::now()).to_std().unwrap_or_default();
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = stop_rx.changed() => break,
                    }
                    *entry.prev.write().unwrap_or_else(|e| e.into_inner()) = Some(next);
                    fire(&entry.job, &sender).await;
                }
            });
        }
        info!(entries = entries.len(), "cron调度已启动");
        Self { entries, stop }
    }

    pub fn entries(&self) -> &[Arc<CronEntry>] {
        &self.entries
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

impl Drop for CronRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn fire(job: &DispatchJob, sender: &TaskSender) {
    let base = job.base();
    match job.make_tasks(Utc::now()) {
        Ok(tasks) => {
            for task in tasks {
                sender.send_or_alert(task).await;
            }
        }
        Err(e) => {
            // 批量展开失败以错误任务形式进入告警通道
            let mut task = Task::new(base.topic.clone(), base.template.clone());
            task.job = base.name.clone();
            task.result = TaskResult::Error;
            task.msg = e.to_string();
            sender.alert(task).await;
        }
    }
}

/// 下一次触发时间快照，/info接口使用
pub fn upcoming(schedule: &cron::Schedule, n: usize) -> Vec<DateTime<Utc>> {
    schedule.upcoming(Utc).take(n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct NullStore;
    #[async_trait]
    impl TaskStore for NullStore {
        async fn add(&self, _task: &Task) -> FlowlordResult<()> {
            Ok(())
        }
    }

    struct VecProducer(tokio::sync::Mutex<Vec<(String, Task)>>);
    #[async_trait]
    impl Producer for VecProducer {
        async fn send(&self, topic: &str, task: &Task) -> FlowlordResult<()> {
            self.0.lock().await.push((topic.to_string(), task.clone()));
            Ok(())
        }
    }

    fn phase(rule: &str) -> Phase {
        Phase {
            task: "task1".to_string(),
            rule: rule.to_string(),
            retry: 3,
            template: "?date={yyyy}-{mm}-{dd}T{hh}".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_periodic_task_carries_schedule_meta() {
        let job = job_from_phase(
            &phase("cron=0 * * * *&offset=-4h&job=t2&retry_delay=10ms"),
            "f1.toml",
        )
        .unwrap();
        let DispatchJob::Periodic(p) = &job else {
            panic!("expected periodic job");
        };
        let now = Utc.with_ymd_and_hms(2020, 1, 2, 3, 0, 0).unwrap();
        let t = p.make_task(now);
        assert_eq!(t.task_type, "task1");
        assert_eq!(t.job, "t2");
        assert_eq!(t.info, "?date=2020-01-01T23");
        assert_eq!(t.meta, "cron=2020-01-01T23&job=t2&workflow=f1.toml");
        assert!(!t.id.is_empty());
    }

    #[test]
    fn test_batch_params_select_batch_job() {
        let job = job_from_phase(&phase("cron=0 0 * * *&for=-48h&by=day"), "f1.toml").unwrap();
        match job {
            DispatchJob::Batch { window, batch, .. } => {
                assert_eq!(window, chrono::Duration::hours(-48));
                assert_eq!(batch.by, "day");
            }
            DispatchJob::Periodic(_) => panic!("expected batch job"),
        }
    }

    #[test]
    fn test_inline_meta_selects_batch_job() {
        let job = job_from_phase(&phase("cron=0 0 * * *&meta=table:a|b"), "f1.toml").unwrap();
        let DispatchJob::Batch { batch, .. } = job else {
            panic!("expected batch job");
        };
        assert_eq!(batch.meta, vec![("table".to_string(), "a|b".to_string())]);
    }

    #[test]
    fn test_meta_and_metafile_rejected() {
        let err = job_from_phase(
            &phase("cron=0 0 * * *&meta=a:1&meta-file=/tmp/m.json"),
            "f1.toml",
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_bad_cron_rejected() {
        assert!(job_from_phase(&phase("cron=bad"), "f1.toml").is_err());
    }

    #[test]
    fn test_build_schedule_requires_workflows() {
        let empty = std::collections::BTreeMap::new();
        assert!(build_schedule(&empty, "/workflows").is_err());
    }

    #[test]
    fn test_build_schedule_collects_errors() {
        let mut wfs = std::collections::BTreeMap::new();
        wfs.insert(
            "f1.toml".to_string(),
            Workflow {
                checksum: "abc".to_string(),
                phases: vec![phase("cron=0 * * * *"), phase("cron=nope")],
            },
        );
        let (jobs, files, errors) = build_schedule(&wfs, "/workflows").unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(files.is_empty());
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_sender_routes_failures_to_alerts() {
        struct FailProducer;
        #[async_trait]
        impl Producer for FailProducer {
            async fn send(&self, _topic: &str, _task: &Task) -> FlowlordResult<()> {
                Err(FlowlordError::bus("bus closed"))
            }
        }
        let (tx, mut rx) = mpsc::channel(4);
        let sender = TaskSender {
            cache: Arc::new(NullStore),
            producer: Arc::new(FailProducer),
            alerts: tx,
        };
        sender.send_or_alert(Task::new("task1", "info")).await;
        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.result, TaskResult::Error);
        assert!(!alert.msg.is_empty());
    }

    #[tokio::test]
    async fn test_sender_send_reaches_producer() {
        let producer = Arc::new(VecProducer(tokio::sync::Mutex::new(Vec::new())));
        let (tx, _rx) = mpsc::channel(4);
        let sender = TaskSender {
            cache: Arc::new(NullStore),
            producer: Arc::clone(&producer) as Arc<dyn Producer>,
            alerts: tx,
        };
        sender.send(&Task::new("task1", "info")).await.unwrap();
        let sent = producer.0.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "task1");
    }
}
