use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use flowlord_core::{FlowlordError, FlowlordResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// meta与cron时间戳使用的小时精度格式
pub const DATE_HOUR: &str = "%Y-%m-%dT%H";

/// 任务事件结果，线上格式为字符串，空串表示运行中
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TaskResult {
    #[serde(rename = "")]
    #[default]
    Running,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "alert")]
    Alert,
}

impl TaskResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Alert => "alert",
        }
    }

    pub fn parse(s: &str) -> FlowlordResult<Self> {
        match s {
            "" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "alert" => Ok(Self::Alert),
            other => Err(FlowlordError::UnknownResult(other.to_string())),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务事件，总线上的JSON载荷。
/// ID在重试和子任务派发之间保持不变，用于跨事件关联。
/// 时间字段为RFC3339字符串，空串表示尚未发生。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job: String,
    #[serde(default)]
    pub info: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub meta: String,
    #[serde(default, skip_serializing_if = "TaskResult::is_running")]
    pub result: TaskResult,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,
    #[serde(default)]
    pub created: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub started: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ended: String,
}

impl Task {
    pub fn new(task_type: impl Into<String>, info: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            info: info.into(),
            created: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            ..Default::default()
        }
    }

    /// topic即任务类型，派发与消费都以它为主题
    pub fn topic(&self) -> &str {
        &self.task_type
    }

    /// job名：优先取字段本身，回退到meta中的job键
    pub fn job_name(&self) -> String {
        if !self.job.is_empty() {
            return self.job.clone();
        }
        self.parsed_meta().get("job").to_string()
    }

    /// "type:job" 形式的标识，job为空时只有type
    pub fn key(&self) -> String {
        let job = self.job_name();
        if job.is_empty() {
            self.task_type.clone()
        } else {
            format!("{}:{}", self.task_type, job)
        }
    }

    pub fn parsed_meta(&self) -> Meta {
        Meta::parse(&self.meta)
    }

    pub fn created_time(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn json_bytes(&self) -> FlowlordResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| FlowlordError::Serialization(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> FlowlordResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| FlowlordError::Serialization(e.to_string()))
    }
}

/// URL查询串编码的任务附属信息（workflow、cron时间戳、重试计数等）。
/// 编码时按键排序，保证同样内容产生相同字符串。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta(BTreeMap<String, String>);

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(s: &str) -> Self {
        let mut map = BTreeMap::new();
        for (k, v) in url::form_urlencoded::parse(s.as_bytes()) {
            map.entry(k.into_owned()).or_insert_with(|| v.into_owned());
        }
        Self(map)
    }

    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// 键排序、不做百分号转义的查询串（meta在线上以明文展示）
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.0 {
            if !out.is_empty() {
                out.push('&');
            }
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// 同一ID下的事件聚合视图
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskJob {
    pub last_update: Option<DateTime<Utc>>,
    pub completed: bool,
    pub events: Vec<Task>,
}
