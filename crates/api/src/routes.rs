use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers::{
    backload::backload,
    info::{get_info, refresh},
    records::{list_alerts, list_dates, list_files},
    system::{notify, status},
    tasks::{get_recap, get_task, list_tasks},
    workflow::{get_workflow_file, list_workflows},
};
use crate::state::AppState;

/// 管理接口路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/info", get(get_info))
        .route("/refresh", get(refresh))
        .route("/backload", post(backload))
        .route("/task/{id}", get(get_task))
        .route("/tasks", get(list_tasks))
        .route("/alerts", get(list_alerts))
        .route("/files", get(list_files))
        .route("/dates", get(list_dates))
        .route("/workflow", get(list_workflows))
        .route("/workflow/{*path}", get(get_workflow_file))
        .route("/recap", get(get_recap))
        .route("/notify", get(notify))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
