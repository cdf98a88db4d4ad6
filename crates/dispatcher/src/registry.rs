use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use flowlord_core::{ErrorList, FlowlordError};
use flowlord_domain::{Phase, Task, Workflow, WorkflowFile, WorkflowStore};
use tracing::{debug, warn};

/// 工作流注册表。负责从本地路径（单文件或目录树）加载TOML工作流，
/// 以内容校验和检测变更，并回答DAG查询（Get/Children）。
pub struct WorkflowRegistry {
    path: PathBuf,
    workflows: RwLock<BTreeMap<String, Workflow>>,
    /// 可选的DB镜像，刷新时同步
    store: Option<Arc<dyn WorkflowStore>>,
}

/// 一次刷新的结果：变更文件名（删除以"-"前缀标记）与收集到的错误
#[derive(Debug, Default)]
pub struct RefreshOutcome {
    pub changed: Vec<String>,
    pub errors: ErrorList,
}

impl WorkflowRegistry {
    pub fn new(path: impl Into<PathBuf>, store: Option<Arc<dyn WorkflowStore>>) -> Self {
        Self {
            path: path.into(),
            workflows: RwLock::new(BTreeMap::new()),
            store,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 重新加载工作流文件。未变更的文件跳过，单个文件的解析错误
    /// 不阻塞其余文件加载，消失的文件被清除。
    pub async fn refresh(&self) -> RefreshOutcome {
        let mut outcome = RefreshOutcome::default();

        let found = match self.list_files() {
            Ok(f) => f,
            Err(e) => {
                outcome.errors.push(e);
                return outcome;
            }
        };
        if found.is_empty() {
            outcome.errors.push(FlowlordError::WorkflowLoad(format!(
                "工作流路径 {} 下没有找到任何文件",
                self.path.display()
            )));
            return outcome;
        }

        let mut updated: Vec<(String, Workflow)> = Vec::new();
        for (name, full_path) in &found {
            let bytes = match std::fs::read(full_path) {
                Ok(b) => b,
                Err(e) => {
                    outcome.errors.push(FlowlordError::WorkflowLoad(format!(
                        "读取 {name} 失败: {e}"
                    )));
                    continue;
                }
            };
            let checksum = blake3::hash(&bytes).to_hex().to_string();
            {
                let current = self.workflows.read().unwrap_or_else(|e| e.into_inner());
                if current.get(name).map(|w| w.checksum.as_str()) == Some(checksum.as_str()) {
                    continue;
                }
            }
            let file: WorkflowFile = match toml::from_str(&String::from_utf8_lossy(&bytes)) {
                Ok(f) => f,
                Err(e) => {
                    outcome.errors.push(FlowlordError::WorkflowLoad(format!(
                        "解析 {name} 失败: {e}"
                    )));
                    continue;
                }
            };
            debug!(workflow = %name, "workflow file changed");
            updated.push((
                name.clone(),
                Workflow {
                    checksum,
                    phases: file.phase,
                },
            ));
        }

        let removed: Vec<String> = {
            let current = self.workflows.read().unwrap_or_else(|e| e.into_inner());
            current
                .keys()
                .filter(|k| !found.iter().any(|(name, _)| name == *k))
                .cloned()
                .collect()
        };

        {
            let mut current = self.workflows.write().unwrap_or_else(|e| e.into_inner());
            for (name, wf) in &updated {
                current.insert(name.clone(), wf.clone());
            }
            for name in &removed {
                current.remove(name);
            }
        }

        if let Some(store) = &self.store {
            for (name, wf) in &updated {
                if let Err(e) = store.save_workflow(name, wf).await {
                    warn!(workflow = %name, error = %e, "工作流镜像写入失败");
                }
            }
            for name in &removed {
                if let Err(e) = store.remove_workflow(name).await {
                    warn!(workflow = %name, error = %e, "工作流镜像删除失败");
                }
            }
        }

        for (name, _) in updated {
            outcome.changed.push(name);
        }
        for name in removed {
            outcome.changed.push(format!("-{name}"));
        }
        outcome
    }

    /// 列出路径下的全部工作流文件，键为相对路径
    fn list_files(&self) -> Result<Vec<(String, PathBuf)>, FlowlordError> {
        let meta = std::fs::metadata(&self.path).map_err(|e| {
            FlowlordError::WorkflowLoad(format!(
                "工作流路径 {} 不可用: {e}",
                self.path.display()
            ))
        })?;
        if meta.is_file() {
            let name = self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            return Ok(vec![(name, self.path.clone())]);
        }

        let mut files = Vec::new();
        let mut stack = vec![self.path.clone()];
        while let Some(dir) = stack.pop() {
            let entries = std::fs::read_dir(&dir).map_err(|e| {
                FlowlordError::WorkflowLoad(format!("读取目录 {} 失败: {e}", dir.display()))
            })?;
            for entry in entries.flatten() {
                let p = entry.path();
                if p.is_dir() {
                    stack.push(p);
                } else if p.extension().is_some_and(|e| e == "toml") {
                    let name = p
                        .strip_prefix(&self.path)
                        .unwrap_or(&p)
                        .to_string_lossy()
                        .replace('\\', "/");
                    files.push((name, p));
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// 查找任务对应的phase。meta中指定workflow时只在该文件内找，
    /// "*"或缺省时按文件名、phase顺序取首个匹配。
    pub fn get(&self, task: &Task) -> Option<(String, Phase)> {
        let key = task.key();
        let mut workflow = task.parsed_meta().get("workflow").to_string();
        if workflow == "*" {
            workflow.clear();
        }
        let current = self.workflows.read().unwrap_or_else(|e| e.into_inner());
        if !workflow.is_empty() {
            let wf = current.get(&workflow)?;
            return wf
                .phases
                .iter()
                .find(|p| p.key() == key)
                .map(|p| (workflow.clone(), p.clone()));
        }
        for (name, wf) in current.iter() {
            if let Some(p) = wf.phases.iter().find(|p| p.key() == key) {
                return Some((name.clone(), p.clone()));
            }
        }
        None
    }

    /// 依赖当前任务的下游phase。dependsOn精确匹配 "type:job"，
    /// 或在依赖不区分job时匹配裸type。
    pub fn children(&self, task: &Task) -> Vec<Phase> {
        let key = task.key();
        let bare = task.topic();
        let workflow = task.parsed_meta().get("workflow").to_string();
        let current = self.workflows.read().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        for (name, wf) in current.iter() {
            if !workflow.is_empty() && workflow != "*" && *name != workflow {
                continue;
            }
            for p in &wf.phases {
                if p.depends_on == key || p.depends_on == bare {
                    out.push(p.clone());
                }
            }
        }
        out
    }

    /// 按 topic(+可选job) 查找phase，backload接口用
    pub fn search(&self, topic: &str, job: &str) -> Option<(String, Phase)> {
        let current = self.workflows.read().unwrap_or_else(|e| e.into_inner());
        for (name, wf) in current.iter() {
            for p in &wf.phases {
                if p.topic() == topic && (job.is_empty() || p.job() == job) {
                    return Some((name.clone(), p.clone()));
                }
            }
        }
        None
    }

    /// 当前所有工作流的快照
    pub fn snapshot(&self) -> BTreeMap<String, Workflow> {
        self.workflows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    const WORKFLOW: &str = r#"
[[phase]]
task = "task1"
rule = "cron=0 * * * *&job=t2"
retry = 3
template = "?date={yyyy}-{mm}-{dd}"

[[phase]]
task = "task2"
dependsOn = "task1:t2"
template = "?time={yyyy}-{mm}-{dd}"

[[phase]]
task = "task3"
dependsOn = "task1"
template = "?time={yyyy}-{mm}-{dd}"
"#;

    fn write_file(dir: &Path, name: &str, content: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_refresh_detects_changes_once() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "f1.toml", WORKFLOW);

        let reg = WorkflowRegistry::new(dir.path(), None);
        let first = reg.refresh().await;
        assert_eq!(first.changed, vec!["f1.toml".to_string()]);
        assert!(first.errors.is_empty());

        // 无变更的第二次刷新不报告任何文件
        let second = reg.refresh().await;
        assert!(second.changed.is_empty());

        write_file(dir.path(), "f1.toml", WORKFLOW.replace("retry = 3", "retry = 5").as_str());
        let third = reg.refresh().await;
        assert_eq!(third.changed, vec!["f1.toml".to_string()]);
    }

    #[tokio::test]
    async fn test_refresh_reports_removed_files() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "f1.toml", WORKFLOW);
        write_file(dir.path(), "f2.toml", WORKFLOW);

        let reg = WorkflowRegistry::new(dir.path(), None);
        reg.refresh().await;

        std::fs::remove_file(dir.path().join("f2.toml")).unwrap();
        let outcome = reg.refresh().await;
        assert_eq!(outcome.changed, vec!["-f2.toml".to_string()]);
        assert_eq!(reg.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_parse_error_does_not_block_other_files() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "bad.toml", "not [ valid toml");
        write_file(dir.path(), "good.toml", WORKFLOW);

        let reg = WorkflowRegistry::new(dir.path(), None);
        let outcome = reg.refresh().await;
        assert_eq!(outcome.changed, vec!["good.toml".to_string()]);
        assert_eq!(outcome.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_get_and_children() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "f1.toml", WORKFLOW);
        let reg = WorkflowRegistry::new(dir.path(), None);
        reg.refresh().await;

        let t = Task {
            task_type: "task1".to_string(),
            job: "t2".to_string(),
            meta: "workflow=f1.toml".to_string(),
            ..Default::default()
        };
        let (wf, phase) = reg.get(&t).unwrap();
        assert_eq!(wf, "f1.toml");
        assert_eq!(phase.retry, 3);

        // task2 依赖 task1:t2 精确键，task3 依赖裸type
        let children = reg.children(&t);
        let names: Vec<&str> = children.iter().map(|p| p.task.as_str()).collect();
        assert_eq!(names, vec!["task2", "task3"]);

        let bare = Task {
            task_type: "task1".to_string(),
            meta: "workflow=f1.toml".to_string(),
            ..Default::default()
        };
        let names: Vec<String> = reg.children(&bare).iter().map(|p| p.task.clone()).collect();
        assert_eq!(names, vec!["task3".to_string()]);
    }

    #[tokio::test]
    async fn test_get_with_wildcard_workflow_searches_all() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "f1.toml", WORKFLOW);
        let reg = WorkflowRegistry::new(dir.path(), None);
        reg.refresh().await;

        let t = Task {
            task_type: "task1".to_string(),
            job: "t2".to_string(),
            meta: "workflow=*".to_string(),
            ..Default::default()
        };
        let (wf, _) = reg.get(&t).unwrap();
        assert_eq!(wf, "f1.toml");
        assert!(!reg.children(&t).is_empty());
    }

    #[tokio::test]
    async fn test_get_unknown_workflow_is_none() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "f1.toml", WORKFLOW);
        let reg = WorkflowRegistry::new(dir.path(), None);
        reg.refresh().await;

        let t = Task {
            task_type: "task1".to_string(),
            job: "t2".to_string(),
            meta: "workflow=missing.toml".to_string(),
            ..Default::default()
        };
        assert!(reg.get(&t).is_none());
    }
}
