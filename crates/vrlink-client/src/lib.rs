//! VRLink 跟踪状态客户端
//!
//! 连接守护进程并以三种方式获取聚合设备状态：
//!
//! - 一次性请求（[`VrClient::get_packet`]，非流模式）；
//! - 推送流（[`VrClient::start_stream`]，套接字挂上调用方的
//!   事件派发器，整包到达即回调）；
//! - 共享内存快速路径（[`VrClient::update_device_states`]，
//!   仅同机 Unix 套接字连接可用）。
//!
//! # 快速上手
//!
//! ```no_run
//! use vrlink_client::VrClient;
//! use vrlink_dispatch::EventDispatcher;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut dispatcher = EventDispatcher::new()?;
//! let client = VrClient::connect_tcp("127.0.0.1", 8555, &dispatcher.handle())?;
//! client.activate();
//! client.start_stream(|state| {
//!     println!("tracker 0 at {:?}", state.trackers[0].pose.position);
//! })?;
//! dispatcher.run()?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;

pub use client::{
    BatteryCallback, EnvironmentCallback, ErrorCallback, HmdCallback, PacketCallback, VrClient,
};
pub use config::{ClientConfig, ServerAddress};
pub use error::ClientError;
