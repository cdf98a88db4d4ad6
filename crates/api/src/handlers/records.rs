use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::handlers::tasks::parse_day;
use crate::response::success;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct DayParams {
    pub day: Option<String>,
}

/// 按日列出告警记录
pub async fn list_alerts(
    State(state): State<AppState>,
    Query(params): Query<DayParams>,
) -> ApiResult<impl IntoResponse> {
    let day = parse_day(&params.day)?;
    let alerts = state.cache.get_alerts_by_date(day).await?;
    Ok(success(json!({
        "day": day.format("%Y-%m-%d").to_string(),
        "count": alerts.len(),
        "alerts": alerts,
    })))
}

/// 按日列出已接收的文件消息
pub async fn list_files(
    State(state): State<AppState>,
    Query(params): Query<DayParams>,
) -> ApiResult<impl IntoResponse> {
    let day = parse_day(&params.day)?;
    let files = state.cache.get_file_messages_by_date(day).await?;
    Ok(success(json!({
        "day": day.format("%Y-%m-%d").to_string(),
        "count": files.len(),
        "files": files,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct DatesParams {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// 某类记录存在数据的日期列表，kind取 tasks|alerts|files
pub async fn list_dates(
    State(state): State<AppState>,
    Query(params): Query<DatesParams>,
) -> ApiResult<impl IntoResponse> {
    let kind = params.kind.unwrap_or_else(|| "tasks".to_string());
    if !matches!(kind.as_str(), "tasks" | "alerts" | "files") {
        return Err(ApiError::BadRequest(format!("未知的记录类型: {kind}")));
    }
    let dates = state.cache.dates_by_type(&kind).await?;
    Ok(success(json!({
        "type": kind,
        "dates": dates,
    })))
}
