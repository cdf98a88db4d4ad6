use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, DurationRound, NaiveDate, Utc};
use flowlord_dispatcher::Batch;
use flowlord_domain::tmpl;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::response::success;
use crate::state::AppState;

/// 历史任务补发请求。
/// execute=false时只返回将要派发的任务，不真正发送。
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BackloadRequest {
    pub task: String,
    pub job: String,
    /// 为空时从注册表中按task/job检索phase的模板
    pub template: String,
    /// 单点补发，与from/to互斥
    pub at: String,
    pub from: String,
    pub to: String,
    /// hour/day/week/month，缺省day
    pub by: String,
    /// 批量展开参数，"key:v1|v2" 以&分隔
    pub meta: String,
    pub execute: bool,
}

/// "%Y-%m-%d"、"%Y-%m-%dT%H" 或RFC3339
fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
    }
    if let Some(t) = tmpl::parse_date_hour(s) {
        return Some(t);
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn required_time(s: &str, field: &str) -> Result<DateTime<Utc>, ApiError> {
    parse_time(s).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "无法解析{field}时间: {s}，支持 YYYY-MM-DD、YYYY-MM-DDTHH 或RFC3339"
        ))
    })
}

pub async fn backload(
    State(state): State<AppState>,
    Json(req): Json<BackloadRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.task.is_empty() {
        return Err(ApiError::BadRequest("task 不能为空".to_string()));
    }

    let found = state.registry.search(&req.task, &req.job);
    let template = if req.template.is_empty() {
        match &found {
            Some((_, phase)) => phase.template.clone(),
            None => {
                return Err(ApiError::BadRequest(format!(
                    "未在工作流中找到 {}:{}，请显式提供template",
                    req.task, req.job
                )))
            }
        }
    } else {
        req.template.clone()
    };

    let (start, end) = if !req.at.is_empty() {
        let at = required_time(&req.at, "at")?;
        (at, at)
    } else if !req.from.is_empty() {
        let from = required_time(&req.from, "from")?;
        let to = if req.to.is_empty() { from } else { required_time(&req.to, "to")? };
        (from, to)
    } else {
        let now = Utc::now()
            .duration_trunc(chrono::Duration::hours(1))
            .unwrap_or_else(|_| Utc::now());
        (now, now)
    };

    let meta: Vec<(String, String)> = req
        .meta
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.split_once(':').map(|(k, v)| (k.to_string(), v.to_string())))
        .collect();

    let batch = Batch {
        template,
        task: req.task.clone(),
        job: req.job.clone(),
        workflow: found.map(|(name, _)| name).unwrap_or_default(),
        by: req.by.clone(),
        meta,
        metafile: String::new(),
    };
    let tasks = batch.range(start, end)?;

    if req.execute {
        info!(task = %req.task, count = tasks.len(), "开始补发历史任务");
        for task in &tasks {
            state.schedule.sender.send_or_alert(task.clone()).await;
        }
    }

    Ok(success(json!({
        "count": tasks.len(),
        "executed": req.execute,
        "tasks": tasks,
    })))
}
