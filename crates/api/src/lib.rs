//! HTTP管理接口：调度快照、强制重载、历史补发与状态查询。

pub mod error;
pub mod handlers;
pub mod response;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use response::ApiResponse;
pub use routes::create_routes;
pub use state::{AppState, ScheduleHandle};
