use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use flowlord_core::FlowlordResult;
use flowlord_domain::{tmpl, Task, TaskJob, TaskResult, TaskStats, TaskStore};
use sqlx::Row;
use tracing::warn;

use super::SqliteCache;

const DEFAULT_PAGE_SIZE: i64 = 100;

/// 任务查询过滤。ID指定时忽略其余过滤条件。
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub id: String,
    pub task_type: String,
    pub job: String,
    /// complete/error/alert/warn，"running"表示空result
    pub result: String,
    pub page: i64,
    pub limit: i64,
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Task {
    Task {
        id: row.get("id"),
        task_type: row.get("type"),
        job: row.get("job"),
        info: row.get("info"),
        meta: row.get("meta"),
        result: TaskResult::parse(row.get::<String, _>("result").as_str())
            .unwrap_or(TaskResult::Running),
        msg: row.get("msg"),
        created: row.get("created"),
        started: row.get("started"),
        ended: row.get("ended"),
    }
}

const TASK_COLUMNS: &str = "id, type, job, info, result, meta, msg, created, started, ended";

impl SqliteCache {
    /// 任务事件写入。同一 (type, job, id, created)
    /// 的后续事件原地更新result/meta/msg/started/ended。
    pub async fn add_task(&self, t: &Task) -> FlowlordResult<()> {
        if t.id.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO task_records (id, type, job, info, result, meta, msg, created, started, ended)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (type, job, id, created)
            DO UPDATE SET
                result = excluded.result,
                meta = excluded.meta,
                msg = excluded.msg,
                started = excluded.started,
                ended = excluded.ended
            "#,
        )
        .bind(&t.id)
        .bind(&t.task_type)
        .bind(&t.job)
        .bind(&t.info)
        .bind(t.result.as_str())
        .bind(&t.meta)
        .bind(&t.msg)
        .bind(&t.created)
        .bind(&t.started)
        .bind(&t.ended)
        .execute(self.pool())
        .await?;

        if !t.created.is_empty() {
            self.update_date_index(&t.created, "tasks").await;
        }
        Ok(())
    }

    /// 同一ID的全部事件聚合
    pub async fn get_task(&self, id: &str) -> FlowlordResult<TaskJob> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM task_records WHERE id = ? ORDER BY created"
        ))
        .bind(id)
        .fetch_all(self.pool())
        .await?;

        let mut job = TaskJob::default();
        for row in &rows {
            let t = row_to_task(row);
            let stamp = if t.result.is_running() {
                t.created_time()
            } else {
                job.completed = true;
                DateTime::parse_from_rfc3339(&t.ended)
                    .ok()
                    .map(|d| d.with_timezone(&Utc))
            };
            if let Some(stamp) = stamp {
                if job.last_update.is_none() || Some(stamp) > job.last_update {
                    job.last_update = Some(stamp);
                }
            }
            job.events.push(t);
        }
        Ok(job)
    }

    /// 清除早于cutoff所在日期的任务、告警、文件消息与日期索引，返回删除总数
    pub async fn recycle(&self, cutoff: DateTime<Utc>) -> FlowlordResult<u64> {
        let day = cutoff.format("%Y-%m-%d").to_string();
        let mut total = 0;
        for (table, column) in [
            ("task_records", "created"),
            ("alert_records", "created_at"),
            ("file_messages", "received_at"),
            ("date_index", "date"),
        ] {
            let result = sqlx::query(&format!("DELETE FROM {table} WHERE {column} < ?"))
                .bind(&day)
                .execute(self.pool())
                .await?;
            total += result.rows_affected();
        }
        Ok(total)
    }

    /// 超过TaskTTL仍未上报结果的任务，每个恰好产生一条INCOMPLETE告警。
    /// LEFT JOIN过滤掉已告警的记录，重复扫描不会重复告警。
    pub async fn check_incomplete_tasks(&self) -> FlowlordResult<u64> {
        let cutoff = (Utc::now() - self.task_ttl).to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let rows = sqlx::query(
            r#"
            SELECT tr.id, tr.type, tr.job, tr.info, tr.result, tr.meta, tr.msg,
                   tr.created, tr.started, tr.ended
            FROM task_records tr
            LEFT JOIN alert_records ar ON (
                tr.id = ar.task_id AND
                tr.type = ar.task_type AND
                tr.job = ar.job AND
                ar.msg LIKE 'INCOMPLETE:%'
            )
            WHERE tr.created < ?
              AND tr.result = ''
              AND ar.id IS NULL
            "#,
        )
        .bind(&cutoff)
        .fetch_all(self.pool())
        .await?;

        let mut count = 0;
        for row in &rows {
            let t = row_to_task(row);
            count += 1;
            if let Err(e) = self
                .insert_alert(&t, "INCOMPLETE: unfinished task detected")
                .await
            {
                warn!(id = %t.id, error = %e, "INCOMPLETE告警写入失败");
            }
        }
        Ok(count)
    }

    /// 按日聚合 (type, job) 维度的任务统计
    pub async fn recap(&self, day: NaiveDate) -> FlowlordResult<TaskStats> {
        let start = day.format("%Y-%m-%d").to_string();
        let end = (day + chrono::Duration::days(1)).format("%Y-%m-%d").to_string();
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM task_records WHERE created >= ? AND created < ? ORDER BY created"
        ))
        .bind(&start)
        .bind(&end)
        .fetch_all(self.pool())
        .await?;

        let mut stats = TaskStats::default();
        for row in &rows {
            stats.add(&row_to_task(row));
        }
        Ok(stats)
    }

    /// 按日期分页查询任务事件，返回 (本页记录, 过滤后总数)
    pub async fn get_tasks_by_date(
        &self,
        date: NaiveDate,
        filter: &TaskFilter,
    ) -> FlowlordResult<(Vec<Task>, i64)> {
        let limit = if filter.limit > 0 { filter.limit } else { DEFAULT_PAGE_SIZE };
        let page = if filter.page > 0 { filter.page } else { 1 };

        let mut clauses = vec!["DATE(created) = ?".to_string()];
        let mut binds: Vec<String> = vec![date.format("%Y-%m-%d").to_string()];
        if !filter.id.is_empty() {
            clauses.push("id = ?".to_string());
            binds.push(filter.id.clone());
        } else {
            if !filter.task_type.is_empty() {
                clauses.push("type = ?".to_string());
                binds.push(filter.task_type.clone());
            }
            if !filter.job.is_empty() {
                clauses.push("job = ?".to_string());
                binds.push(filter.job.clone());
            }
            if !filter.result.is_empty() {
                clauses.push("result = ?".to_string());
                let result = if filter.result == "running" { "" } else { &filter.result };
                binds.push(result.to_string());
            }
        }
        let where_clause = clauses.join(" AND ");

        let count_sql = format!("SELECT COUNT(*) FROM task_records WHERE {where_clause}");
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for b in &binds {
            count_query = count_query.bind(b);
        }
        let total = count_query.fetch_one(self.pool()).await?;

        let select_sql = format!(
            "SELECT {TASK_COLUMNS} FROM task_records WHERE {where_clause} ORDER BY created DESC LIMIT ? OFFSET ?"
        );
        let mut query = sqlx::query(&select_sql);
        for b in &binds {
            query = query.bind(b);
        }
        let rows = query
            .bind(limit)
            .bind((page - 1) * limit)
            .fetch_all(self.pool())
            .await?;

        Ok((rows.iter().map(row_to_task).collect(), total))
    }

    pub(crate) fn task_time_string(t: &Task) -> String {
        tmpl::task_time(t)
            .map(|d| d.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
            .unwrap_or_default()
    }
}

#[async_trait]
impl TaskStore for SqliteCache {
    async fn add(&self, task: &Task) -> FlowlordResult<()> {
        self.add_task(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::open_temp;
    use super::*;
    use chrono::TimeZone;

    fn task(id: &str, created: &str, result: TaskResult) -> Task {
        Task {
            id: id.to_string(),
            task_type: "task1".to_string(),
            job: "t2".to_string(),
            info: "?day=2020-05-26".to_string(),
            result,
            created: created.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_updates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_temp(&dir).await;

        let mut t = task("a1", "2020-05-26T10:00:00Z", TaskResult::Running);
        cache.add_task(&t).await.unwrap();
        t.result = TaskResult::Complete;
        t.started = "2020-05-26T10:00:01Z".to_string();
        t.ended = "2020-05-26T10:00:05Z".to_string();
        cache.add_task(&t).await.unwrap();

        let job = cache.get_task("a1").await.unwrap();
        assert_eq!(job.events.len(), 1);
        assert!(job.completed);
        assert_eq!(job.events[0].result, TaskResult::Complete);
        assert_eq!(
            job.last_update.unwrap().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "2020-05-26T10:00:05Z"
        );
    }

    #[tokio::test]
    async fn test_empty_id_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_temp(&dir).await;
        let t = task("", "2020-05-26T10:00:00Z", TaskResult::Running);
        cache.add_task(&t).await.unwrap();
        let (tasks, total) = cache
            .get_tasks_by_date(
                NaiveDate::from_ymd_opt(2020, 5, 26).unwrap(),
                &TaskFilter::default(),
            )
            .await
            .unwrap();
        assert!(tasks.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_recycle_deletes_old_rows() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_temp(&dir).await;
        cache
            .add_task(&task("old", "2020-01-01T00:00:00Z", TaskResult::Complete))
            .await
            .unwrap();
        cache
            .add_task(&task("new", "2020-03-01T00:00:00Z", TaskResult::Complete))
            .await
            .unwrap();

        let deleted = cache
            .recycle(Utc.with_ymd_and_hms(2020, 2, 1, 0, 0, 0).unwrap())
            .await
            .unwrap();
        // 旧任务 + 旧date_index条目
        assert_eq!(deleted, 2);
        assert!(cache.get_task("old").await.unwrap().events.is_empty());
        assert_eq!(cache.get_task("new").await.unwrap().events.len(), 1);
    }

    #[tokio::test]
    async fn test_incomplete_task_alerts_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_temp(&dir).await;
        // TTL为1小时，远旧的running任务算作未完成
        cache
            .add_task(&task("stuck", "2020-05-26T10:00:00Z", TaskResult::Running))
            .await
            .unwrap();
        cache
            .add_task(&task("done", "2020-05-26T10:00:00Z", TaskResult::Complete))
            .await
            .unwrap();

        assert_eq!(cache.check_incomplete_tasks().await.unwrap(), 1);
        // 再次扫描不重复告警
        assert_eq!(cache.check_incomplete_tasks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recap_groups_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_temp(&dir).await;
        let mut ok = task("a", "2020-05-26T10:00:00Z", TaskResult::Complete);
        ok.started = "2020-05-26T10:00:00Z".to_string();
        ok.ended = "2020-05-26T10:00:02Z".to_string();
        cache.add_task(&ok).await.unwrap();
        cache
            .add_task(&task("b", "2020-05-26T11:00:00Z", TaskResult::Error))
            .await
            .unwrap();
        cache
            .add_task(&task("c", "2020-05-27T00:00:00Z", TaskResult::Complete))
            .await
            .unwrap();

        let stats = cache
            .recap(NaiveDate::from_ymd_opt(2020, 5, 26).unwrap())
            .await
            .unwrap();
        let s = stats.0.get("task1:t2").unwrap();
        assert_eq!(s.completed_count, 1);
        assert_eq!(s.error_count, 1);
        let counts = stats.total_counts();
        assert_eq!(counts.total, 2);
    }

    #[tokio::test]
    async fn test_filter_by_result_and_pagination() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_temp(&dir).await;
        for i in 0..5 {
            let result = if i % 2 == 0 { TaskResult::Complete } else { TaskResult::Error };
            cache
                .add_task(&task(&format!("t{i}"), "2020-05-26T10:00:00Z", result))
                .await
                .unwrap();
        }

        let date = NaiveDate::from_ymd_opt(2020, 5, 26).unwrap();
        let filter = TaskFilter {
            result: "error".to_string(),
            ..Default::default()
        };
        let (tasks, total) = cache.get_tasks_by_date(date, &filter).await.unwrap();
        assert_eq!(total, 2);
        assert!(tasks.iter().all(|t| t.result == TaskResult::Error));

        let filter = TaskFilter {
            limit: 2,
            page: 2,
            ..Default::default()
        };
        let (tasks, total) = cache.get_tasks_by_date(date, &filter).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(tasks.len(), 2);
    }
}
