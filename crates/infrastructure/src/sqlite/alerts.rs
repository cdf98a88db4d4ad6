use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use flowlord_core::FlowlordResult;
use flowlord_domain::{tmpl, Task};
use serde::Serialize;

use super::SqliteCache;

/// 告警日志行。created_at是SQLite的 "YYYY-MM-DD HH:MM:SS" 格式
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AlertRecord {
    pub id: i64,
    pub task_id: String,
    pub task_time: String,
    pub task_type: String,
    pub job: String,
    pub msg: String,
    pub created_at: String,
}

impl AlertRecord {
    pub fn key(&self) -> String {
        if self.job.is_empty() {
            self.task_type.clone()
        } else {
            format!("{}:{}", self.task_type, self.job)
        }
    }
}

/// 告警汇总行：key + 次数 + 任务时间范围
#[derive(Debug, Clone, Serialize)]
pub struct SummaryLine {
    pub key: String,
    pub count: usize,
    pub time_range: String,
}

/// 按 type:job 归并告警，次数多的在前，同次数按key排序
pub fn build_compact_summary(alerts: &[AlertRecord]) -> Vec<SummaryLine> {
    let mut groups: BTreeMap<String, Vec<DateTime<Utc>>> = BTreeMap::new();
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for a in alerts {
        let key = a.key();
        *counts.entry(key.clone()).or_default() += 1;
        if let Ok(t) = DateTime::parse_from_rfc3339(&a.task_time) {
            groups.entry(key).or_default().push(t.with_timezone(&Utc));
        }
    }

    let mut lines: Vec<SummaryLine> = counts
        .into_iter()
        .map(|(key, count)| {
            let times = groups.remove(&key).unwrap_or_default();
            SummaryLine {
                time_range: tmpl::print_dates(&times),
                key,
                count,
            }
        })
        .collect();
    lines.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    lines
}

impl SqliteCache {
    pub(crate) async fn insert_alert(&self, task: &Task, msg: &str) -> FlowlordResult<()> {
        let task_id = if task.id.is_empty() { "unknown" } else { &task.id };
        sqlx::query(
            "INSERT INTO alert_records (task_id, task_time, task_type, job, msg) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(Self::task_time_string(task))
        .bind(&task.task_type)
        .bind(task.job_name())
        .bind(msg)
        .execute(self.pool())
        .await?;

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        self.update_date_index(&now, "alerts").await;
        Ok(())
    }

    /// 非紧急告警入库，等待批量汇总发送
    pub async fn add_alert(&self, task: &Task, msg: &str) -> FlowlordResult<()> {
        self.insert_alert(task, msg).await
    }

    pub async fn get_alerts_by_date(&self, date: NaiveDate) -> FlowlordResult<Vec<AlertRecord>> {
        let records = sqlx::query_as(
            "SELECT id, task_id, task_time, task_type, job, msg, created_at \
             FROM alert_records WHERE DATE(created_at) = ? ORDER BY created_at DESC",
        )
        .bind(date.format("%Y-%m-%d").to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(records)
    }

    /// after之后写入的告警，旧的在前
    pub async fn get_alerts_after_time(
        &self,
        after: DateTime<Utc>,
    ) -> FlowlordResult<Vec<AlertRecord>> {
        let records = sqlx::query_as(
            "SELECT id, task_id, task_time, task_type, job, msg, created_at \
             FROM alert_records WHERE created_at > ? ORDER BY created_at ASC",
        )
        .bind(after.format("%Y-%m-%d %H:%M:%S").to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(records)
    }
}
