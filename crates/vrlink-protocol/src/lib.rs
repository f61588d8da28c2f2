//! VRLink 协议层
//!
//! 本模块定义服务端与客户端之间共享的三样东西：
//! - 设备状态模型（tracker / button / valuator 聚合与辅助元数据）
//! - 版本协商的有线协议（opcode 分帧的消息流，TCP / UDS 通用）
//! - 共享内存段布局（双缓冲 + 计数器，本机快速路径）
//!
//! # 使用场景
//!
//! 服务端（[`vrlink-server`]）用它序列化状态并发布；客户端
//! （[`vrlink-client`]）用它解码镜像。两侧必须链接同一版本，
//! 协议版本号在 CONNECT 握手中协商。
//!
//! [`vrlink-server`]: https://docs.rs/vrlink-server
//! [`vrlink-client`]: https://docs.rs/vrlink-client

mod error;
pub mod shm;
pub mod state;
pub mod wire;

pub use error::ProtocolError;
pub use shm::{ShmReader, ShmWriter, blob_offset, segment_len};
pub use state::{
    BaseStation, BatteryState, DeviceLayout, DeviceState, EnvironmentDefinition, Feature,
    HmdConfiguration, Pose, ReportMask, TrackType, TrackerState, VirtualDeviceDescriptor,
};
pub use wire::{
    CAP_SHARED_MEMORY, CAP_TIMESTAMPS, CAP_VALID_FLAGS, ConnectReply, FrameDecoder, Message,
    Opcode, PROTOCOL_VERSION, decode_packet, decode_packet_into, encode_message, encode_packet,
    packet_len,
};
