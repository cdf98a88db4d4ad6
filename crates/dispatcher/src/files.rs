use std::sync::Arc;

use flowlord_core::{FlowlordError, FlowlordResult};
use flowlord_domain::{tmpl, FileStat, Meta, Phase, Producer, Task};
use globset::{Glob, GlobMatcher};
use tracing::debug;

/// 一条 files= 规则：glob模式 + 所属工作流 + 派发phase
pub struct FileRule {
    pub pattern: GlobMatcher,
    pub workflow: String,
    pub phase: Phase,
}

impl FileRule {
    pub fn new(phase: &Phase, workflow: &str) -> FlowlordResult<Self> {
        let src = phase.rule_meta().get("files").to_string();
        let pattern = Glob::new(&src)
            .map_err(|e| FlowlordError::InvalidRule(format!("glob {src}: {e}")))?
            .compile_matcher();
        Ok(Self {
            pattern,
            workflow: workflow.to_string(),
            phase: phase.clone(),
        })
    }
}

/// 文件匹配器：文件事件逐条对照全部规则，一个文件可以触发多条任务
pub struct FileMatcher {
    rules: Vec<FileRule>,
    producer: Arc<dyn Producer>,
}

impl FileMatcher {
    pub fn new(rules: Vec<FileRule>, producer: Arc<dyn Producer>) -> Self {
        Self { rules, producer }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// 匹配并派发，返回已派发的任务。
    /// 时间取自路径，meta合并规则参数与file/filename/workflow。
    /// 没有任何规则命中按错误处理。
    pub async fn match_file(&self, stat: &FileStat) -> FlowlordResult<Vec<Task>> {
        let mut dispatched = Vec::new();
        for rule in &self.rules {
            if !rule.pattern.is_match(&stat.path) {
                continue;
            }

            let t = tmpl::path_time(&stat.path);
            let mut meta = Meta::parse(&rule.phase.rule);
            meta.set("file", stat.path.clone());
            meta.set("filename", stat.file_name().to_string());
            meta.set("workflow", rule.workflow.clone());

            let info = tmpl::render(&rule.phase.template, t);
            let (info, _) = tmpl::meta_substitute(&info, &meta);

            let mut task = Task::new(rule.phase.topic().to_string(), info);
            task.meta = meta.encode();
            debug!(path = %stat.path, topic = %task.task_type, "文件规则命中");
            self.producer.send(task.topic(), &task).await?;
            dispatched.push(task);
        }
        if dispatched.is_empty() {
            return Err(FlowlordError::NoRuleMatch(stat.path.clone()));
        }
        Ok(dispatched)
    }
}
