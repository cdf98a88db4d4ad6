use std::collections::{HashSet, VecDeque};

use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use flowlord_core::print_duration;
use flowlord_dispatcher::WorkflowRegistry;
use flowlord_domain::Task;
use serde::Serialize;
use serde_json::json;

use crate::error::ApiResult;
use crate::response::success;
use crate::state::AppState;

/// 一条活动调度的展示行
#[derive(Debug, Serialize)]
pub struct EntryInfo {
    pub workflow: String,
    pub topic: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub job: String,
    pub cron: String,
    pub offset: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub template: String,
    pub next: Option<String>,
    pub prev: Option<String>,
    /// 完成后会级联触发的下游任务键
    pub children: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub version: String,
    pub uptime: String,
    pub workflows: Vec<String>,
    pub warnings: Vec<String>,
    pub entries: Vec<EntryInfo>,
}

/// 调度与DAG快照
pub async fn get_info(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let snapshot = state.registry.snapshot();
    let mut warnings = Vec::new();
    for (name, wf) in &snapshot {
        for phase in &wf.phases {
            if let Some(w) = phase.validate() {
                warnings.push(format!("{name} {}: {w}", phase.task));
            }
        }
    }

    let mut entries = Vec::new();
    for entry in state.schedule.entries().await {
        let base = entry.job.base();
        let next = *entry.next.read().unwrap_or_else(|e| e.into_inner());
        let prev = *entry.prev.read().unwrap_or_else(|e| e.into_inner());
        entries.push(EntryInfo {
            workflow: base.workflow.clone(),
            topic: base.topic.clone(),
            job: base.name.clone(),
            cron: base.cron.clone(),
            offset: print_duration(base.offset),
            template: base.template.clone(),
            next: next.map(|t| t.to_rfc3339()),
            prev: prev.map(|t| t.to_rfc3339()),
            children: child_chain(&state.registry, &base.workflow, &base.topic, &base.name),
        });
    }

    Ok(success(InfoResponse {
        version: state.version.clone(),
        uptime: print_duration(Utc::now() - state.started_at),
        workflows: snapshot.keys().cloned().collect(),
        warnings,
        entries,
    }))
}

/// 从某个起点沿dependsOn边展开全部下游，环路以访问去重截断
fn child_chain(registry: &WorkflowRegistry, workflow: &str, topic: &str, job: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back((topic.to_string(), job.to_string()));

    while let Some((topic, job)) = queue.pop_front() {
        let probe = Task {
            task_type: topic,
            job,
            meta: format!("workflow={workflow}"),
            ..Default::default()
        };
        for child in registry.children(&probe) {
            let key = child.key();
            if seen.insert(key.clone()) {
                queue.push_back((child.topic().to_string(), child.job()));
                chain.push(key);
            }
        }
    }
    chain
}

/// 强制重载工作流文件
pub async fn refresh(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let outcome = state.schedule.refresh(&state.registry).await?;
    Ok(success(json!({
        "changed": outcome.changed,
        "errors": outcome.errors.messages(),
        "refreshed_at": Utc::now().to_rfc3339(),
    })))
}
