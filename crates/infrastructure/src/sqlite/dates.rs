use chrono::NaiveDateTime;
use flowlord_core::{FlowlordError, FlowlordResult};
use tracing::warn;

use super::SqliteCache;

fn flag_column(kind: &str) -> FlowlordResult<&'static str> {
    match kind {
        "tasks" => Ok("has_tasks"),
        "alerts" => Ok("has_alerts"),
        "files" => Ok("has_files"),
        other => Err(FlowlordError::Internal(format!("未知的日期索引类型: {other}"))),
    }
}

fn date_of(timestamp: &str) -> Option<String> {
    if let Ok(t) = chrono::DateTime::parse_from_rfc3339(timestamp) {
        return Some(t.format("%Y-%m-%d").to_string());
    }
    NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|t| t.format("%Y-%m-%d").to_string())
}

impl SqliteCache {
    /// 标记某日期存在该类数据。索引失败不阻塞主写入，仅告警。
    pub(crate) async fn update_date_index(&self, timestamp: &str, kind: &str) {
        if let Err(e) = self.try_update_date_index(timestamp, kind).await {
            warn!(timestamp = %timestamp, kind = %kind, error = %e, "日期索引更新失败");
        }
    }

    async fn try_update_date_index(&self, timestamp: &str, kind: &str) -> FlowlordResult<()> {
        let column = flag_column(kind)?;
        let Some(date) = date_of(timestamp) else {
            warn!(timestamp = %timestamp, "无法解析时间戳，跳过日期索引");
            return Ok(());
        };
        sqlx::query("INSERT OR IGNORE INTO date_index (date) VALUES (?)")
            .bind(&date)
            .execute(self.pool())
            .await?;
        sqlx::query(&format!("UPDATE date_index SET {column} = 1 WHERE date = ?"))
            .bind(&date)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// 存在某类数据的日期列表，新日期在前
    pub async fn dates_by_type(&self, kind: &str) -> FlowlordResult<Vec<String>> {
        let column = flag_column(kind)?;
        let dates = sqlx::query_scalar(&format!(
            "SELECT date FROM date_index WHERE {column} = 1 ORDER BY date DESC"
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(dates)
    }

    /// 从三张数据表全量重建日期索引
    pub async fn rebuild_date_index(&self) -> FlowlordResult<()> {
        sqlx::query("DELETE FROM date_index")
            .execute(self.pool())
            .await?;
        for (table, column, flag) in [
            ("task_records", "created", "has_tasks"),
            ("alert_records", "created_at", "has_alerts"),
            ("file_messages", "received_at", "has_files"),
        ] {
            sqlx::query(&format!(
                "INSERT OR IGNORE INTO date_index (date) \
                 SELECT DISTINCT DATE({column}) FROM {table} WHERE {column} != ''"
            ))
            .execute(self.pool())
            .await?;
            sqlx::query(&format!(
                "UPDATE date_index SET {flag} = 1 \
                 WHERE date IN (SELECT DISTINCT DATE({column}) FROM {table})"
            ))
            .execute(self.pool())
            .await?;
        }
        Ok(())
    }
}
