//! 统一配置管理
//!
//! 提供各组件共用的配置 Trait 和配置错误类型。

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// 统一配置 Trait
///
/// # 示例
///
/// ```rust,ignore
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct MyConfig {
///     pub threshold: u32,
/// }
///
/// impl Config for MyConfig {
///     fn validate(&self) -> Result<(), ConfigError> {
///         if self.threshold > 1000 {
///             return Err(ConfigError::Invalid("threshold must be <= 1000".into()));
///         }
///         Ok(())
///     }
///
///     fn defaults() -> Self {
///         Self { threshold: 100 }
///     }
///
///     fn merge(&self, other: &Self) -> Result<Self, ConfigError> {
///         Ok(other.clone())
///     }
/// }
/// ```
pub trait Config: Serialize + DeserializeOwned {
    /// 验证配置
    ///
    /// # 错误
    ///
    /// 配置无效时返回 `ConfigError::Invalid` 或 `ConfigError::Validation`
    fn validate(&self) -> Result<(), ConfigError>;

    /// 默认配置
    fn defaults() -> Self;

    /// 合并两个配置，`other` 的优先级更高
    fn merge(&self, other: &Self) -> Result<Self, ConfigError>
    where
        Self: Sized;

    /// 从 TOML 字符串加载
    fn from_toml(toml: &str) -> Result<Self, ConfigError>
    where
        Self: Sized,
    {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(format!("TOML parse error: {}", e)))
    }

    /// 从 JSON 字符串加载
    fn from_json(json: &str) -> Result<Self, ConfigError>
    where
        Self: Sized,
    {
        serde_json::from_str(json)
            .map_err(|e| ConfigError::Parse(format!("JSON parse error: {}", e)))
    }

    /// 序列化为 TOML
    fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(format!("TOML serialize error: {}", e)))
    }

    /// 序列化为 JSON
    fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(format!("JSON serialize error: {}", e)))
    }

    /// 从文件加载并验证，按扩展名选择格式（`.json` 为 JSON，其余按 TOML 解析）
    fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError>
    where
        Self: Sized,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text)?,
            _ => Self::from_toml(&text)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// 比较两个配置的顶层字段
    fn diff(&self, other: &Self) -> BTreeMap<String, ConfigDiff>
    where
        Self: Sized,
    {
        let old = serde_json::to_value(self).unwrap_or_default();
        let new = serde_json::to_value(other).unwrap_or_default();
        let mut diffs = BTreeMap::new();

        match (old, new) {
            (serde_json::Value::Object(old), serde_json::Value::Object(new)) => {
                for (key, old_value) in &old {
                    match new.get(key) {
                        Some(new_value) if new_value == old_value => {}
                        Some(new_value) => {
                            diffs.insert(
                                key.clone(),
                                ConfigDiff::Changed {
                                    old: old_value.to_string(),
                                    new: new_value.to_string(),
                                },
                            );
                        }
                        None => {
                            diffs.insert(
                                key.clone(),
                                ConfigDiff::Removed {
                                    value: old_value.to_string(),
                                },
                            );
                        }
                    }
                }
                for (key, new_value) in new {
                    if !old.contains_key(&key) {
                        diffs.insert(
                            key,
                            ConfigDiff::Added {
                                value: new_value.to_string(),
                            },
                        );
                    }
                }
            }
            (old, new) if old != new => {
                diffs.insert(
                    "root".to_string(),
                    ConfigDiff::Changed {
                        old: old.to_string(),
                        new: new.to_string(),
                    },
                );
            }
            _ => {}
        }

        diffs
    }
}

/// 配置差异
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigDiff {
    Added { value: String },
    Removed { value: String },
    Changed { old: String, new: String },
}

/// 配置错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// 配置值无效
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// 合并冲突
    #[error("Configuration merge conflict: {0}")]
    MergeConflict(String),

    /// 解析错误
    #[error("Configuration parse error: {0}")]
    Parse(String),

    /// 序列化错误
    #[error("Configuration serialize error: {0}")]
    Serialize(String),

    /// IO 错误
    #[error("Configuration IO error: {0}")]
    Io(String),

    /// 不支持的操作
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// 字段校验失败
    #[error("Validation error for field '{field}': {message}")]
    Validation { field: String, message: String },
}
