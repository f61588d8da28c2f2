//! 客户端配置段

use crate::error::ClientError;
use serde::Deserialize;
use std::path::PathBuf;

/// 服务端地址（toml 的 `[server]` 段，`transport` 字段区分变体）
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum ServerAddress {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
    AbstractUnix { name: String },
}

/// 客户端配置
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub server: ServerAddress,
}

impl ClientConfig {
    /// 从 toml 文本解析
    pub fn from_toml(text: &str) -> Result<Self, ClientError> {
        toml::from_str(text).map_err(|e| ClientError::Config(e.to_string()))
    }
}
