//! VRLink SDK：统一入口
//!
//! 把协议、派发器、服务端与客户端四个 crate 收拢到一个依赖下，
//! 并提供日志初始化辅助。典型用法：
//!
//! - 嵌入守护进程的一侧用 [`server`]（[`DeviceManager`] + [`Hub`]）；
//! - 应用一侧用 [`client`]（[`VrClient`]），自己跑一个
//!   [`EventDispatcher`] 或复用已有的。
//!
//! 可运行示例见 `demos/`。

pub use vrlink_client as client;
pub use vrlink_dispatch as dispatch;
pub use vrlink_protocol as protocol;
pub use vrlink_server as server;

pub use vrlink_client::{ClientConfig, ClientError, ServerAddress, VrClient};
pub use vrlink_dispatch::{DispatcherHandle, EventDispatcher, Interest, TimerSpec};
pub use vrlink_protocol::{
    DeviceLayout, DeviceState, Pose, TrackerState, PROTOCOL_VERSION,
};
pub use vrlink_server::{
    DeviceAllocator, DeviceManager, DeviceModule, Hub, HubConfig, ModuleConfig, ModuleRegistry,
};

/// 初始化 fmt 订阅器：`RUST_LOG` 优先，缺省走给定指令
///
/// 重复调用安全（后续调用为空操作），方便测试与库内嵌场景。
pub fn init_logging(default_directive: &str) {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    match default_directive.parse() {
        Ok(directive) => filter = filter.add_directive(directive),
        Err(e) => tracing::warn!(default_directive, "invalid log directive: {e}"),
    }
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
