use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use chrono::{NaiveDate, Utc};
use flowlord_infrastructure::TaskFilter;
use serde::Deserialize;
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::response::success;
use crate::state::AppState;

/// 单个任务ID下的全部事件
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let job = state.cache.get_task(&id).await?;
    if job.events.is_empty() {
        return Err(ApiError::NotFound);
    }
    Ok(success(job))
}

/// "YYYY-MM-DD"，缺省为今天（UTC）
pub(crate) fn parse_day(day: &Option<String>) -> ApiResult<NaiveDate> {
    match day {
        Some(d) => NaiveDate::parse_from_str(d, "%Y-%m-%d")
            .map_err(|_| ApiError::BadRequest(format!("无法解析日期: {d}，期望 YYYY-MM-DD"))),
        None => Ok(Utc::now().date_naive()),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub day: Option<String>,
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub job: Option<String>,
    pub result: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

/// 按日分页列出任务事件，支持 id/type/job/result 过滤
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<impl IntoResponse> {
    let day = parse_day(&params.day)?;
    let filter = TaskFilter {
        id: params.id.unwrap_or_default(),
        task_type: params.task_type.unwrap_or_default(),
        job: params.job.unwrap_or_default(),
        result: params.result.unwrap_or_default(),
        page: params.page.unwrap_or(0),
        limit: params.limit.unwrap_or(0),
    };
    let (tasks, total) = state.cache.get_tasks_by_date(day, &filter).await?;
    Ok(success(json!({
        "day": day.format("%Y-%m-%d").to_string(),
        "total": total,
        "tasks": tasks,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct RecapParams {
    pub day: Option<String>,
}

/// 按日的任务统计汇总，缺省为今天
pub async fn get_recap(
    State(state): State<AppState>,
    Query(params): Query<RecapParams>,
) -> ApiResult<impl IntoResponse> {
    let day = parse_day(&params.day)?;
    let stats = state.cache.recap(day).await?;
    Ok(success(json!({
        "day": day.format("%Y-%m-%d").to_string(),
        "counts": stats.total_counts(),
        "stats": stats,
    })))
}
