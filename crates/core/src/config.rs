use serde::{Deserialize, Serialize};

use crate::errors::{FlowlordError, FlowlordResult};

/// 协调器配置，从TOML文件加载，字段均有合理默认值
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub workflow: WorkflowConfig,
    pub bus: BusConfig,
    pub cache: CacheConfig,
    pub api: ApiConfig,
    pub notifier: NotifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// 工作流定义路径，单个文件或目录
    pub path: String,
    /// 周期性重载间隔，如 "15m"
    pub refresh: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// 任务完成/失败事件的消费主题
    pub done_topic: String,
    /// 文件到达事件的消费主题，空字符串表示禁用
    pub files_topic: String,
    /// 死信主题，"-" 或空字符串表示禁用
    pub failed_topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 本地SQLite数据库路径
    pub db_path: String,
    /// 备份路径，为空时不做备份/恢复
    pub backup_path: String,
    /// 任务预期完成时间，超过该时间仍未完成的任务升级为告警，最小1小时
    pub task_ttl: String,
    /// 记录保留时长，超期记录在每日回收时删除
    pub retention: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// HTTP管理端口，0表示禁用
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Slack webhook地址，为空时通知仅写日志
    pub slack_url: String,
    pub channel: String,
    pub prefix: String,
    pub title: String,
    /// 批量告警的起始间隔
    pub min_frequency: String,
    /// 批量告警的最大间隔，默认为min_frequency的16倍
    pub max_frequency: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workflow: WorkflowConfig::default(),
            bus: BusConfig::default(),
            cache: CacheConfig::default(),
            api: ApiConfig::default(),
            notifier: NotifierConfig::default(),
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            path: "workflows".to_string(),
            refresh: "15m".to_string(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            done_topic: "done".to_string(),
            files_topic: String::new(),
            failed_topic: String::new(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_path: "flowlord.db".to_string(),
            backup_path: String::new(),
            task_ttl: "1h".to_string(),
            retention: "2160h".to_string(), // 90天
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            slack_url: String::new(),
            channel: String::new(),
            prefix: String::new(),
            title: "flowlord".to_string(),
            min_frequency: "5m".to_string(),
            max_frequency: String::new(),
        }
    }
}

impl AppConfig {
    /// 从TOML文件加载配置；path为None时使用全部默认值
    pub fn load(path: Option<&str>) -> FlowlordResult<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    FlowlordError::config(format!("读取配置文件 {p} 失败: {e}"))
                })?;
                Self::from_toml(&content)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(content: &str) -> FlowlordResult<Self> {
        let config: AppConfig = toml::from_str(content)
            .map_err(|e| FlowlordError::config(format!("解析配置失败: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> FlowlordResult<()> {
        if self.workflow.path.is_empty() {
            return Err(FlowlordError::config("workflow.path 不能为空"));
        }
        if self.bus.done_topic.is_empty() {
            return Err(FlowlordError::config("bus.done_topic 不能为空"));
        }
        Ok(())
    }
}
