use std::path::PathBuf;

use flowlord_core::config::CacheConfig;
use flowlord_core::{parse_duration, FlowlordError, FlowlordResult};
use sqlx::sqlite::{SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, warn};

mod alerts;
mod dates;
mod files;
mod tasks;
mod workflow;

pub use alerts::{build_compact_summary, AlertRecord, SummaryLine};
pub use files::FileMessage;
pub use tasks::TaskFilter;
pub use workflow::WorkflowFileRecord;

/// 当前schema版本。
/// v1: 初始表结构；v2: 增加date_index加速按日期检索
const CURRENT_SCHEMA_VERSION: i64 = 2;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS task_records (
    id      TEXT NOT NULL,
    type    TEXT NOT NULL,
    job     TEXT NOT NULL DEFAULT '',
    info    TEXT NOT NULL DEFAULT '',
    result  TEXT NOT NULL DEFAULT '',
    meta    TEXT NOT NULL DEFAULT '',
    msg     TEXT NOT NULL DEFAULT '',
    created TEXT NOT NULL,
    started TEXT NOT NULL DEFAULT '',
    ended   TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (type, job, id, created)
);
CREATE INDEX IF NOT EXISTS idx_task_records_created ON task_records (created);
CREATE INDEX IF NOT EXISTS idx_task_records_id ON task_records (id);

CREATE TABLE IF NOT EXISTS alert_records (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id    TEXT NOT NULL,
    task_time  TEXT NOT NULL DEFAULT '',
    task_type  TEXT NOT NULL,
    job        TEXT NOT NULL DEFAULT '',
    msg        TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_alert_records_created_at ON alert_records (created_at);

CREATE TABLE IF NOT EXISTS file_messages (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    path          TEXT NOT NULL,
    size          INTEGER NOT NULL DEFAULT 0,
    last_modified TEXT NOT NULL DEFAULT '',
    received_at   TEXT NOT NULL DEFAULT (datetime('now')),
    task_time     TEXT NOT NULL DEFAULT '',
    task_ids      TEXT,
    task_names    TEXT
);

CREATE TABLE IF NOT EXISTS workflow_files (
    file_path     TEXT PRIMARY KEY,
    file_hash     TEXT NOT NULL,
    loaded_at     TEXT NOT NULL DEFAULT (datetime('now')),
    last_modified TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS workflow_phases (
    file_path  TEXT NOT NULL,
    task       TEXT NOT NULL,
    depends_on TEXT NOT NULL DEFAULT '',
    rule       TEXT NOT NULL DEFAULT '',
    template   TEXT NOT NULL DEFAULT '',
    retry      INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

const SCHEMA_V2: &str = r#"
CREATE TABLE IF NOT EXISTS date_index (
    date       TEXT PRIMARY KEY,
    has_tasks  INTEGER NOT NULL DEFAULT 0,
    has_alerts INTEGER NOT NULL DEFAULT 0,
    has_files  INTEGER NOT NULL DEFAULT 0
);
"#;

/// SQLite任务状态缓存：任务事件日志、告警日志、文件消息与日期索引。
/// 带本地/备份双路径：打开时本地为空则从备份恢复，正常关闭时回写备份。
pub struct SqliteCache {
    pool: SqlitePool,
    local_path: PathBuf,
    backup_path: Option<PathBuf>,
    pub task_ttl: chrono::Duration,
    pub retention: chrono::Duration,
}

impl SqliteCache {
    pub async fn open(cfg: &CacheConfig) -> FlowlordResult<Self> {
        let mut task_ttl = parse_duration(&cfg.task_ttl)?;
        if task_ttl < chrono::Duration::hours(1) {
            task_ttl = chrono::Duration::hours(1);
        }
        let retention = parse_duration(&cfg.retention)?;

        let local_path = PathBuf::from(&cfg.db_path);
        let backup_path = if cfg.backup_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&cfg.backup_path))
        };

        if let Some(backup) = &backup_path {
            let local_size = std::fs::metadata(&local_path).map(|m| m.len()).unwrap_or(0);
            let backup_size = std::fs::metadata(backup).map(|m| m.len()).unwrap_or(0);
            if local_size == 0 && backup_size > 0 {
                info!(backup = %backup.display(), "本地库为空，从备份恢复");
                if let Err(e) = std::fs::copy(backup, &local_path) {
                    warn!(error = %e, "备份恢复失败");
                }
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&local_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(30))
            .page_size(4096)
            .auto_vacuum(SqliteAutoVacuum::Incremental);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let cache = Self {
            pool,
            local_path,
            backup_path,
            task_ttl,
            retention,
        };
        cache.migrate_if_needed().await?;
        Ok(cache)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn schema_version(&self) -> i64 {
        sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_one(&self.pool)
            .await
            .unwrap_or(0)
    }

    /// 增量迁移：只追加，从存量版本逐级升到当前版本
    async fn migrate_if_needed(&self) -> FlowlordResult<()> {
        let version = self.schema_version().await;
        if version >= CURRENT_SCHEMA_VERSION {
            return Ok(());
        }
        info!(from = version, to = CURRENT_SCHEMA_VERSION, "开始schema迁移");

        if version < 1 {
            sqlx::raw_sql(SCHEMA_V1).execute(&self.pool).await?;
        }
        if version < 2 {
            sqlx::raw_sql(SCHEMA_V2).execute(&self.pool).await?;
            self.rebuild_date_index().await?;
        }

        sqlx::query("DELETE FROM schema_version")
            .execute(&self.pool)
            .await?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(CURRENT_SCHEMA_VERSION)
            .execute(&self.pool)
            .await?;
        info!("schema迁移完成");
        Ok(())
    }

    /// 关闭连接池并回写备份
    pub async fn close(&self) -> FlowlordResult<()> {
        self.pool.close().await;
        if let Some(backup) = &self.backup_path {
            info!(backup = %backup.display(), "回写数据库备份");
            std::fs::copy(&self.local_path, backup)
                .map_err(|e| FlowlordError::Internal(format!("备份写入失败: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub async fn open_temp(dir: &tempfile::TempDir) -> SqliteCache {
        let cfg = CacheConfig {
            db_path: dir.path().join("cache.db").to_string_lossy().to_string(),
            backup_path: String::new(),
            task_ttl: "1h".to_string(),
            retention: "2160h".to_string(),
        };
        SqliteCache::open(&cfg).await.unwrap()
    }
}
