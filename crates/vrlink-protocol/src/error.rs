//! 协议层错误类型定义

use thiserror::Error;

/// 协议层错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// 消息长度不足（分帧层或载荷解码时发现）
    #[error("Message too short: need {need} bytes, have {have}")]
    TooShort { need: usize, have: usize },

    /// 未知的 opcode
    #[error("Invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),

    /// 帧长度字段超出上限（防御恶意或损坏的对端）
    #[error("Frame too large: {0} bytes")]
    Oversized(u32),

    /// 帧长度字段小于最小帧头
    #[error("Invalid frame length: {0}")]
    InvalidLength(u32),

    /// 载荷内容非法（枚举值越界、字符串非 UTF-8 等）
    #[error("Invalid payload: {0}")]
    InvalidPayload(&'static str),

    /// 收到与当前协议状态不符的消息（如握手前的 PACKET）
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    /// 版本协商失败：对端版本高于本端最大支持版本
    #[error("Unsupported protocol version {server} (max supported: {supported})")]
    VersionMismatch { server: u32, supported: u32 },

    /// 共享内存段读取在重试预算内始终被写端撕裂
    #[error("Shared memory blob torn after {0} read attempts")]
    ShmTorn(u32),

    /// 共享内存段尺寸与握手宣告不一致
    #[error("Shared memory segment size mismatch: expected {expected}, got {actual}")]
    ShmSizeMismatch { expected: usize, actual: usize },

    /// 共享内存段创建或映射失败
    #[error("Shared memory setup failed: {0}")]
    ShmSetup(String),

    /// 状态 blob 与设备布局不一致
    #[error("Packet does not match device layout: {0}")]
    LayoutMismatch(&'static str),
}
