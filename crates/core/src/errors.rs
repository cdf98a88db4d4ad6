use thiserror::Error;

/// 协调器错误类型定义
#[derive(Debug, Error)]
pub enum FlowlordError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("工作流加载错误: {0}")]
    WorkflowLoad(String),

    #[error("工作流 {workflow} 中未找到 {topic}:{job} 对应的phase")]
    PhaseNotFound {
        workflow: String,
        topic: String,
        job: String,
    },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("无效的规则: {0}")]
    InvalidRule(String),

    #[error("调度错误: {0}")]
    Scheduling(String),

    #[error("消息总线错误: {0}")]
    Bus(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("通知发送错误: {0}")]
    Notification(String),

    #[error("未知的任务结果: {0:?}")]
    UnknownResult(String),

    #[error("文件 {0} 未匹配任何规则")]
    NoRuleMatch(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl FlowlordError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn bus<S: Into<String>>(msg: S) -> Self {
        Self::Bus(msg.into())
    }

    pub fn scheduling<S: Into<String>>(msg: S) -> Self {
        Self::Scheduling(msg.into())
    }

    /// 启动阶段的致命错误，运行期间的错误都按可恢复处理
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::WorkflowLoad(_))
    }
}

/// 统一的Result类型
pub type FlowlordResult<T> = std::result::Result<T, FlowlordError>;

/// 多错误聚合：按文件/phase收集错误而不中断整体流程
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<String>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<E: std::fmt::Display>(&mut self, err: E) {
        self.errors.push(err.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.errors.iter()
    }

    pub fn messages(&self) -> &[String] {
        &self.errors
    }

    /// 无错误时返回Ok，否则聚合为一个WorkflowLoad错误
    pub fn into_result(self) -> FlowlordResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(FlowlordError::WorkflowLoad(self.errors.join("; ")))
        }
    }
}

impl std::fmt::Display for ErrorList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.errors.join("; "))
    }
}
