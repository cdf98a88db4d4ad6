use std::path::{Component, Path as FsPath};

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// 已加载的工作流文件清单，纯文本一行一个相对路径
pub async fn list_workflows(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = String::new();
    for name in state.registry.snapshot().keys() {
        body.push_str(name);
        body.push('\n');
    }
    ([(header::CONTENT_TYPE, "text/plain")], body)
}

/// 工作流文件原文。路径为目录时按相对路径取文件，
/// 路径为单文件时直接返回该文件。
pub async fn get_workflow_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let rel = FsPath::new(&name);
    if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(ApiError::BadRequest(format!("非法的文件路径: {name}")));
    }

    let base = state.registry.path();
    let full = if base.is_file() {
        base.to_path_buf()
    } else {
        base.join(rel)
    };
    let bytes = tokio::fs::read(&full).await.map_err(|_| ApiError::NotFound)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/toml")],
        bytes,
    )
        .into_response())
}
