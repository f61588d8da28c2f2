//! 定时器描述

use std::time::{Duration, Instant};

/// 定时器注册参数
///
/// `first` 是绝对首次触发时间，同时也是重复定时器的相位基准：
/// 挂起后恢复时，下一次触发落在 `first + k * interval`（k 为使该
/// 时刻不早于恢复时刻的最小整数）。
#[derive(Debug, Clone, Copy)]
pub struct TimerSpec {
    /// 首次触发的绝对时间
    pub first: Instant,
    /// 重复间隔；None 表示一次性定时器
    pub interval: Option<Duration>,
    /// 创建即挂起；挂起的定时器在被 resume 之前绝不触发
    pub start_suspended: bool,
}

impl TimerSpec {
    /// 一次性定时器
    pub fn once_at(first: Instant) -> Self {
        Self {
            first,
            interval: None,
            start_suspended: false,
        }
    }

    /// 重复定时器
    pub fn repeating(first: Instant, interval: Duration) -> Self {
        Self {
            first,
            interval: Some(interval),
            start_suspended: false,
        }
    }

    /// 创建即挂起
    pub fn suspended(mut self) -> Self {
        self.start_suspended = true;
        self
    }
}

/// `base + k * interval` 中不早于 `at` 的最小时刻
///
/// 恢复挂起定时器时用它重新对齐相位。
pub(crate) fn next_phase(base: Instant, interval: Duration, at: Instant) -> Instant {
    if at <= base {
        return base;
    }
    let elapsed = at.duration_since(base).as_nanos();
    let step = interval.as_nanos().max(1);
    let k = elapsed.div_ceil(step);
    base + Duration::from_nanos((step * k) as u64)
}
