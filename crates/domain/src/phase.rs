use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::task::Meta;

/// 工作流文件中的一个DAG节点。
/// 触发方式三选一：cron规则、files规则或dependsOn依赖边。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    /// "type" 或 "type:job" 形式的任务标识
    #[serde(default)]
    pub task: String,
    /// 查询串规则: cron=&offset=&job=&retry_delay=&files=&require=&no_alert...
    #[serde(default)]
    pub rule: String,
    #[serde(default, rename = "dependsOn")]
    pub depends_on: String,
    /// 失败后的自动重试次数
    #[serde(default)]
    pub retry: u32,
    /// 派发时渲染的info模板
    #[serde(default)]
    pub template: String,
}

impl Phase {
    /// task冒号前的部分，即派发主题
    pub fn topic(&self) -> &str {
        match self.task.split_once(':') {
            Some((topic, _)) => topic,
            None => &self.task,
        }
    }

    /// task冒号后的部分，缺省时回退到规则中的job参数
    pub fn job(&self) -> String {
        if let Some((_, job)) = self.task.split_once(':') {
            if !job.is_empty() {
                return job.to_string();
            }
        }
        self.rule_meta().get("job").to_string()
    }

    /// "topic:job"，无job时只有topic
    pub fn key(&self) -> String {
        let job = self.job();
        if job.is_empty() {
            self.topic().to_string()
        } else {
            format!("{}:{}", self.topic(), job)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.task.is_empty()
    }

    /// 规则按查询串解析，重复键保留首个值
    pub fn rule_meta(&self) -> Meta {
        Meta::parse(&self.rule)
    }

    /// 规则的全部键值对，含重复键（meta=行需要多值）
    pub fn rule_pairs(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(self.rule.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    /// 校验phase可被调度。返回None表示正常，否则为告警文本
    pub fn validate(&self) -> Option<String> {
        let rule = self.rule_meta();
        let cron = rule.get("cron");
        if self.depends_on.is_empty() && cron.is_empty() && rule.get("files").is_empty() {
            return Some("non-scheduled phase: use depends_on, cron or files".to_string());
        }
        if !cron.is_empty() {
            if let Err(e) = parse_cron(cron) {
                return Some(format!("invalid cron: {e}"));
            }
        }
        None
    }
}

/// 解析cron表达式，5字段写法自动补秒位
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, cron::error::Error> {
    let normalized = normalize_cron(expr);
    cron::Schedule::from_str(&normalized)
}

/// 5字段（分 时 日 月 周）前面补 "0 "，6/7字段原样返回
pub fn normalize_cron(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// 一个工作流文件的解析结果与内容校验和
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workflow {
    pub checksum: String,
    pub phases: Vec<Phase>,
}

/// TOML文件的反序列化外壳: [[phase]] 表数组
#[derive(Debug, Default, Deserialize)]
pub struct WorkflowFile {
    #[serde(default)]
    pub phase: Vec<Phase>,
}
