use axum::extract::State;
use axum::response::IntoResponse;
use flowlord_core::print_duration;
use serde_json::json;

use crate::error::ApiResult;
use crate::response::success;
use crate::state::AppState;

pub async fn status() -> &'static str {
    "ok"
}

/// 发送测试通知并返回批量告警循环的当前状态
pub async fn notify(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    state.notifier.send_test().await?;
    let (min, max) = state.notifier.frequency_bounds();
    Ok(success(json!({
        "sent": true,
        "frequency": print_duration(state.notifier.current_frequency()),
        "min": print_duration(min),
        "max": print_duration(max),
    })))
}
