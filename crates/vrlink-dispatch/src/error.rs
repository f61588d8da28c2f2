//! 派发器错误类型定义

use thiserror::Error;

/// 派发器错误类型
#[derive(Error, Debug)]
pub enum DispatchError {
    /// self-pipe 创建失败
    #[error("Failed to create self-pipe: {0}")]
    PipeSetup(nix::Error),

    /// 平台等待原语失败（EINTR 除外，EINTR 按提前返回处理）
    #[error("poll() failed: {0}")]
    Poll(nix::Error),
}
