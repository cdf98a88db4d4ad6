use async_trait::async_trait;
use flowlord_core::FlowlordResult;
use flowlord_domain::{Workflow, WorkflowStore};
use serde::Serialize;

use super::SqliteCache;

/// 已加载工作流文件的登记行
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WorkflowFileRecord {
    pub file_path: String,
    pub file_hash: String,
    pub loaded_at: String,
    pub last_modified: String,
}

impl SqliteCache {
    pub async fn workflow_files(&self) -> FlowlordResult<Vec<WorkflowFileRecord>> {
        let rows = sqlx::query_as(
            "SELECT file_path, file_hash, loaded_at, last_modified \
             FROM workflow_files ORDER BY file_path",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl WorkflowStore for SqliteCache {
    /// 整文件落库：登记哈希，phase全量替换
    async fn save_workflow(&self, name: &str, workflow: &Workflow) -> FlowlordResult<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO workflow_files (file_path, file_hash) VALUES (?, ?) \
             ON CONFLICT (file_path) DO UPDATE SET \
                 file_hash = excluded.file_hash, \
                 loaded_at = datetime('now'), \
                 last_modified = datetime('now')",
        )
        .bind(name)
        .bind(&workflow.checksum)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM workflow_phases WHERE file_path = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        for phase in &workflow.phases {
            sqlx::query(
                "INSERT INTO workflow_phases (file_path, task, depends_on, rule, template, retry) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(name)
            .bind(phase.key())
            .bind(&phase.depends_on)
            .bind(&phase.rule)
            .bind(&phase.template)
            .bind(phase.retry as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove_workflow(&self, name: &str) -> FlowlordResult<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM workflow_files WHERE file_path = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM workflow_phases WHERE file_path = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
