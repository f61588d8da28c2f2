//! 客户端错误类型定义

use thiserror::Error;
use vrlink_protocol::ProtocolError;

/// 客户端错误类型
#[derive(Error, Debug)]
pub enum ClientError {
    /// 协议编解码 / 版本错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 套接字 IO 错误
    #[error("Socket IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 连接已标记死亡；除析构外所有调用都将失败
    #[error("Connection is dead")]
    ConnectionDead,

    /// 流模式下不允许阻塞 RPC
    #[error("Blocking request not allowed while streaming")]
    StreamingActive,

    /// 未激活；先调用 `activate()`
    #[error("Client not activated")]
    NotActive,

    /// 共享内存快速路径不可用（非同机连接或服务端未启用）
    #[error("Shared memory fast path unavailable")]
    ShmUnavailable,

    /// 配置解析失败
    #[error("Invalid client config: {0}")]
    Config(String),
}
