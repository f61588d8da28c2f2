//! 回调收到的事件对象
//!
//! 回调对自身监听器的修改通过这些对象提交，回调返回后由派发器
//! 统一应用，绝不在迭代进行中生效。

use crate::interest::Interest;
use crate::{IoCallback, TimerCallback};
use std::time::{Duration, Instant};

/// IO 回调的事件对象
pub struct IoEvent {
    /// 本次就绪的条件
    pub ready: Interest,
    pub(crate) new_interest: Option<Interest>,
    pub(crate) replacement: Option<IoCallback>,
    pub(crate) remove: bool,
    pub(crate) suspend: bool,
}

impl IoEvent {
    pub(crate) fn new(ready: Interest) -> Self {
        Self {
            ready,
            new_interest: None,
            replacement: None,
            remove: false,
            suspend: false,
        }
    }

    /// 回调返回后改用新的兴趣掩码
    pub fn set_interest(&mut self, interest: Interest) {
        self.new_interest = Some(interest);
    }

    /// 回调返回后换成新的回调
    pub fn replace_callback(&mut self, cb: IoCallback) {
        self.replacement = Some(cb);
    }

    /// 回调返回后立即移除本监听器
    pub fn remove_listener(&mut self) {
        self.remove = true;
    }

    /// 回调返回后挂起本监听器（保留注册，不再进入兴趣集）
    pub fn suspend_listener(&mut self) {
        self.suspend = true;
    }
}

/// 定时器回调的事件对象
pub struct TimerEvent {
    /// 循环被阻塞期间整段错过的触发次数
    /// （`floor((now - scheduled) / interval)`，准点触发为 0）
    pub missed_events: u64,
    pub(crate) reschedule: Option<(Instant, Option<Duration>)>,
    pub(crate) replacement: Option<TimerCallback>,
    pub(crate) remove: bool,
    pub(crate) suspend: bool,
}

impl TimerEvent {
    pub(crate) fn new(missed_events: u64) -> Self {
        Self {
            missed_events,
            reschedule: None,
            replacement: None,
            remove: false,
            suspend: false,
        }
    }

    /// 重排定时：新的首次触发时间与重复间隔
    pub fn reschedule(&mut self, first: Instant, interval: Option<Duration>) {
        self.reschedule = Some((first, interval));
    }

    /// 回调返回后换成新的回调
    pub fn replace_callback(&mut self, cb: TimerCallback) {
        self.replacement = Some(cb);
    }

    /// 回调返回后移除本定时器
    pub fn remove_listener(&mut self) {
        self.remove = true;
    }

    /// 回调返回后挂起本定时器
    pub fn suspend_listener(&mut self) {
        self.suspend = true;
    }
}

/// Process 回调的事件对象
pub struct ProcessEvent {
    pub(crate) remove: bool,
}

impl ProcessEvent {
    pub(crate) fn new() -> Self {
        Self { remove: false }
    }

    pub fn remove_listener(&mut self) {
        self.remove = true;
    }
}

/// Signal 回调的事件对象
pub struct SignalEvent {
    pub(crate) remove: bool,
}

impl SignalEvent {
    pub(crate) fn new() -> Self {
        Self { remove: false }
    }

    pub fn remove_listener(&mut self) {
        self.remove = true;
    }
}
