//! 服务端错误类型定义

use thiserror::Error;
use vrlink_dispatch::DispatchError;
use vrlink_protocol::ProtocolError;

/// 服务端错误类型
#[derive(Error, Debug)]
pub enum ServerError {
    /// 协议编解码错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 派发器错误
    #[error("Dispatcher error: {0}")]
    Dispatch(#[from] DispatchError),

    /// 监听套接字创建 / 绑定失败
    #[error("Socket setup failed: {0}")]
    SocketSetup(std::io::Error),

    /// 未注册的模块类型
    #[error("Unknown device module type: {0}")]
    UnknownModuleType(String),

    /// 模块配置无效
    #[error("Invalid module config for {module}: {reason}")]
    InvalidModuleConfig { module: String, reason: String },

    /// 共享内存已启用，不能重复启用
    #[error("Shared memory already enabled")]
    ShmAlreadyEnabled,

    /// 模块已启动后不允许的操作
    #[error("Operation not allowed after modules started")]
    ModulesStarted,

    /// 能力索引越界
    #[error("Feature index {0} out of range")]
    FeatureOutOfRange(usize),

    /// 模块线程启动失败
    #[error("Module thread spawn failed: {0}")]
    ThreadSpawn(std::io::Error),
}
