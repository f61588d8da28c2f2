//! VRLink 服务端
//!
//! 三块拼成守护进程的核心：
//!
//! - [`DeviceManager`]：把各设备驱动线程的更新合并进单个规范状态
//!   对象，维护上报掩码 / frame-complete 语义，可选地把每次更新
//!   重发布到共享内存段；
//! - 模块层（[`ModuleRegistry`] / [`DeviceModule`] / [`DeviceAllocator`]）：
//!   驱动的创建、索引空间划分和能力登记；
//! - [`Hub`]：挂在派发器上的有线协议服务端，负责握手、一次性
//!   PACKET、流订阅扇出和各 RPC。

mod error;
mod hub;
mod manager;
mod module;

pub use error::ServerError;
pub use hub::{Hub, HubConfig};
pub use manager::{DeviceManager, Streamer};
pub use module::{DeviceAllocator, DeviceModule, ModuleConfig, ModuleFactory, ModuleRegistry, SimModule};
