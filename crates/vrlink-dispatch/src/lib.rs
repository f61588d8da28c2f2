//! VRLink 事件多路复用器
//!
//! 严格单线程、协作式的事件循环，服务端和客户端共用。不持有任何
//! 工作线程，四类监听器在一个 `poll` 循环里派发：
//!
//! - **IO**：文件描述符 + 兴趣掩码（读 / 写 / 异常）
//! - **Timer**：绝对触发时间 + 可选重复间隔，循环被阻塞超过一个
//!   间隔时上报 missed-event 计数
//! - **Process**：每个派发周期末尾调用一次，用于收尾记账
//! - **Signal**：显式触发，任意线程可安全 raise
//!
//! # 跨线程控制
//!
//! 唯一的跨线程通道是 self-pipe：其他线程通过 [`DispatcherHandle`]
//! 提交增删监听器 / raise / interrupt / stop，请求经
//! `crossbeam-channel` 排队并向管道写一个字节唤醒循环，在每次阻塞
//! 等待之前被排空。热路径本身无锁。
//!
//! # 派发顺序
//!
//! 单个周期内：就绪 IO → 到期 Timer → 全部 Process 监听器。
//! 回调中对自身监听器的修改（换兴趣掩码、换回调、移除、挂起、
//! 重排定时）通过收到的事件对象提交，回调返回后才生效，绝不使
//! 进行中的迭代失效。

mod dispatcher;
mod error;
mod event;
mod interest;
mod timer;

pub use dispatcher::{DispatcherHandle, EventDispatcher, ListenerKey};
pub use error::DispatchError;
pub use event::{IoEvent, ProcessEvent, SignalEvent, TimerEvent};
pub use interest::Interest;
pub use timer::TimerSpec;

/// IO 监听器回调
pub type IoCallback = Box<dyn FnMut(&mut IoEvent) + Send>;
/// 定时器回调
pub type TimerCallback = Box<dyn FnMut(&mut TimerEvent) + Send>;
/// 周期末尾回调
pub type ProcessCallback = Box<dyn FnMut(&mut ProcessEvent) + Send>;
/// 信号回调
pub type SignalCallback = Box<dyn FnMut(&mut SignalEvent) + Send>;
