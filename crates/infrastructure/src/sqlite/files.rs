use chrono::{NaiveDate, SecondsFormat, Utc};
use flowlord_core::FlowlordResult;
use flowlord_domain::{tmpl, FileStat};
use serde::Serialize;
use sqlx::Row;

use super::SqliteCache;

/// 落地文件事件与其触发的任务
#[derive(Debug, Clone, Serialize)]
pub struct FileMessage {
    pub id: i64,
    pub path: String,
    pub size: i64,
    pub last_modified: String,
    pub received_at: String,
    pub task_time: String,
    pub task_ids: Vec<String>,
    pub task_names: Vec<String>,
}

fn json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

impl SqliteCache {
    /// 文件事件入库。task_time从文件路径推断
    pub async fn add_file_message(
        &self,
        file: &FileStat,
        task_ids: &[String],
        task_names: &[String],
    ) -> FlowlordResult<()> {
        let task_time = tmpl::path_time(&file.path)
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        sqlx::query(
            "INSERT INTO file_messages (path, size, last_modified, task_time, task_ids, task_names) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&file.path)
        .bind(file.size)
        .bind(&file.created)
        .bind(&task_time)
        .bind(serde_json::to_string(task_ids).unwrap_or_default())
        .bind(serde_json::to_string(task_names).unwrap_or_default())
        .execute(self.pool())
        .await?;

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        self.update_date_index(&now, "files").await;
        Ok(())
    }

    pub async fn get_file_messages_by_date(
        &self,
        date: NaiveDate,
    ) -> FlowlordResult<Vec<FileMessage>> {
        let rows = sqlx::query(
            "SELECT id, path, size, last_modified, received_at, task_time, task_ids, task_names \
             FROM file_messages WHERE DATE(received_at) = ? ORDER BY received_at DESC",
        )
        .bind(date.format("%Y-%m-%d").to_string())
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| FileMessage {
                id: row.get("id"),
                path: row.get("path"),
                size: row.get("size"),
                last_modified: row.get("last_modified"),
                received_at: row.get("received_at"),
                task_time: row.get("task_time"),
                task_ids: json_list(row.get("task_ids")),
                task_names: json_list(row.get("task_names")),
            })
            .collect())
    }
}
