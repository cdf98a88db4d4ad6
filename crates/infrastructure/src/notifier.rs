use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use flowlord_core::config::NotifierConfig;
use flowlord_core::{parse_duration, print_duration, FlowlordError, FlowlordResult};
use flowlord_domain::{Task, TaskResult};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::sqlite::{build_compact_summary, AlertRecord, SqliteCache};

/// 通知级别，决定Slack附件的颜色条
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Critical,
    Warning,
    Ok,
    Other,
}

impl Level {
    fn color(&self) -> &'static str {
        match self {
            Self::Critical => "#FF0000",
            Self::Warning => "#FFFF00",
            Self::Ok => "#00FF00",
            Self::Other => "#2210FF",
        }
    }
}

/// Slack webhook客户端。url为空时降级为仅写日志
pub struct SlackClient {
    url: String,
    channel: String,
    prefix: String,
    title: String,
    client: reqwest::Client,
}

impl SlackClient {
    pub fn new(cfg: &NotifierConfig) -> FlowlordResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| FlowlordError::Notification(format!("HTTP客户端构建失败: {e}")))?;
        Ok(Self {
            url: cfg.slack_url.clone(),
            channel: cfg.channel.clone(),
            prefix: cfg.prefix.clone(),
            title: cfg.title.clone(),
            client,
        })
    }

    pub async fn notify(&self, message: &str, level: Level) -> FlowlordResult<()> {
        let text = if self.prefix.is_empty() {
            message.to_string()
        } else {
            format!("[{}] {}", self.prefix, message)
        };
        if self.url.is_empty() {
            info!(level = ?level, "通知（未配置webhook）:\n{text}");
            return Ok(());
        }

        // webhook限速，每条间隔1秒
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        let payload = json!({
            "channel": self.channel,
            "attachments": [{
                "title": self.title,
                "text": text,
                "color": level.color(),
                "pretext": "flowlord",
            }],
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| FlowlordError::Notification(format!("slack请求失败: {e}")))?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "slack返回非成功状态");
        }
        Ok(())
    }
}

/// 告警通知器。
/// 紧急告警（result=alert）立即单发；其余入库，由汇总循环批量发送。
/// 汇总间隔随连续告警指数增长（上限max），无告警时回落到min。
pub struct Notifier {
    cache: Arc<SqliteCache>,
    slack: SlackClient,
    min: Duration,
    max: Duration,
    current_ms: AtomicI64,
    report_addr: String,
}

impl Notifier {
    pub fn new(
        cfg: &NotifierConfig,
        cache: Arc<SqliteCache>,
        report_addr: String,
    ) -> FlowlordResult<Self> {
        let mut min = parse_duration(&cfg.min_frequency)?;
        if min <= Duration::zero() {
            min = Duration::minutes(5);
        }
        let mut max = if cfg.max_frequency.is_empty() {
            min * 16
        } else {
            parse_duration(&cfg.max_frequency)?
        };
        if max <= min {
            max = min * 16;
        }
        Ok(Self {
            cache,
            slack: SlackClient::new(cfg)?,
            min,
            max,
            current_ms: AtomicI64::new(min.num_milliseconds()),
            report_addr,
        })
    }

    /// 汇总循环的当前等待间隔
    pub fn current_frequency(&self) -> Duration {
        Duration::milliseconds(self.current_ms.load(Ordering::Relaxed))
    }

    pub fn frequency_bounds(&self) -> (Duration, Duration) {
        (self.min, self.max)
    }

    /// 测试通知，校验webhook配置是否可用
    pub async fn send_test(&self) -> FlowlordResult<()> {
        self.slack.notify("notification test", Level::Ok).await
    }

    /// 告警通道消费循环
    pub fn start_alert_loop(self: &Arc<Self>, mut rx: mpsc::Receiver<Task>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                if task.result == TaskResult::Alert {
                    let body = serde_json::to_string_pretty(&task)
                        .unwrap_or_else(|_| task.msg.clone());
                    if let Err(e) = this.slack.notify(&body, Level::Critical).await {
                        error!(error = %e, "紧急告警发送失败");
                    }
                } else if let Err(e) = this.cache.add_alert(&task, &task.msg).await {
                    warn!(task_id = %task.id, error = %e, "告警入库失败");
                }
            }
            info!("告警通道关闭，消费循环退出");
        })
    }

    /// 批量汇总循环。每次醒来先升级超时未完成的任务，再汇总新增告警
    pub fn start_summary_loop(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_alert_time = Utc::now()
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|t| t.and_utc())
                .unwrap_or_else(Utc::now);
            loop {
                let wait = this
                    .current_frequency()
                    .to_std()
                    .unwrap_or(std::time::Duration::from_secs(300));
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = stop.changed() => break,
                }

                match this.cache.check_incomplete_tasks().await {
                    Ok(n) if n > 0 => info!(count = n, "检测到超时未完成任务"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "超时任务检查失败"),
                }

                let alerts = match this.cache.get_alerts_after_time(last_alert_time).await {
                    Ok(alerts) => alerts,
                    Err(e) => {
                        warn!(error = %e, "告警查询失败");
                        continue;
                    }
                };
                if alerts.is_empty() {
                    this.current_ms
                        .store(this.min.num_milliseconds(), Ordering::Relaxed);
                    continue;
                }

                if let Err(e) = this.send_summary(&alerts).await {
                    error!(error = %e, "告警汇总发送失败");
                }
                last_alert_time = Utc::now();
                let doubled = std::cmp::min(this.current_frequency() * 2, this.max);
                this.current_ms
                    .store(doubled.num_milliseconds(), Ordering::Relaxed);
                info!(
                    count = alerts.len(),
                    next_in = %print_duration(doubled),
                    "告警汇总已发送"
                );
            }
            info!("告警汇总循环退出");
        })
    }

    async fn send_summary(&self, alerts: &[AlertRecord]) -> FlowlordResult<()> {
        self.slack
            .notify(&format_summary(alerts, &self.report_addr), Level::Warning)
            .await
    }
}

/// 汇总文本：报表链接 + 每个type:job一行（次数与时间范围）
pub fn format_summary(alerts: &[AlertRecord], report_addr: &str) -> String {
    let date = Utc::now().format("%Y-%m-%d");
    let mut msg = format!("see report at {report_addr}/web/alert?date={date}\n");
    for line in build_compact_summary(alerts) {
        msg.push_str(&format!(
            "{:<35}{:>5}  {}\n",
            format!("{}:", line.key),
            line.count,
            line.time_range
        ));
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::test_support::open_temp;

    fn config() -> NotifierConfig {
        NotifierConfig::default()
    }

    #[tokio::test]
    async fn test_frequency_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(open_temp(&dir).await);
        let n = Notifier::new(&config(), cache, "localhost:8080".to_string()).unwrap();
        assert_eq!(n.current_frequency(), Duration::minutes(5));
        assert_eq!(n.frequency_bounds(), (Duration::minutes(5), Duration::minutes(80)));
    }

    #[tokio::test]
    async fn test_max_must_exceed_min() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(open_temp(&dir).await);
        let cfg = NotifierConfig {
            min_frequency: "10m".to_string(),
            max_frequency: "1m".to_string(),
            ..config()
        };
        let n = Notifier::new(&cfg, cache, String::new()).unwrap();
        assert_eq!(n.frequency_bounds().1, Duration::minutes(160));
    }

    #[tokio::test]
    async fn test_alert_loop_routes_by_result() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(open_temp(&dir).await);
        let n = Arc::new(
            Notifier::new(&config(), Arc::clone(&cache), String::new()).unwrap(),
        );
        let (tx, rx) = mpsc::channel(8);
        let handle = n.start_alert_loop(rx);

        // 紧急告警直发（这里仅写日志），不入库
        let mut critical = Task::new("task1", "");
        critical.result = TaskResult::Alert;
        tx.send(critical).await.unwrap();

        let mut failed = Task::new("task1", "?day=2020-05-26");
        failed.result = TaskResult::Error;
        failed.msg = "failed after 3 retries".to_string();
        tx.send(failed).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let alerts = cache
            .get_alerts_by_date(Utc::now().date_naive())
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].msg, "failed after 3 retries");
    }

    #[test]
    fn test_summary_format() {
        let alerts = vec![AlertRecord {
            id: 1,
            task_id: "x".to_string(),
            task_time: "2020-05-26T10:00:00Z".to_string(),
            task_type: "task1".to_string(),
            job: "t2".to_string(),
            msg: String::new(),
            created_at: String::new(),
        }];
        let msg = format_summary(&alerts, "localhost:8080");
        assert!(msg.starts_with("see report at localhost:8080/web/alert?date="));
        assert!(msg.contains("task1:t2:"));
        assert!(msg.contains("    1  2020/05/26T10\n"));
    }

    #[test]
    fn test_level_colors() {
        assert_eq!(Level::Critical.color(), "#FF0000");
        assert_eq!(Level::Ok.color(), "#00FF00");
    }

    #[tokio::test]
    async fn test_notify_without_webhook_is_noop() {
        let slack = SlackClient::new(&config()).unwrap();
        slack.notify("hello", Level::Ok).await.unwrap();
    }
}
