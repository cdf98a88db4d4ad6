use flowlord_core::{FlowlordError, FlowlordResult};
use serde::{Deserialize, Serialize};

/// 文件到达事件的线上载荷
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileStat {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
    #[serde(default)]
    pub created: String,
}

impl FileStat {
    pub fn from_json(bytes: &[u8]) -> FlowlordResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| FlowlordError::Serialization(e.to_string()))
    }

    /// 路径最后一段
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_with_defaults() {
        let s = FileStat::from_json(br#"{"path":"gs://b/2020/01/02/f.json","size":42}"#).unwrap();
        assert_eq!(s.path, "gs://b/2020/01/02/f.json");
        assert_eq!(s.size, 42);
        assert_eq!(s.file_name(), "f.json");
        assert!(s.created.is_empty());
    }
}
