//! IO 兴趣掩码

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// IO 监听器的兴趣掩码
///
/// 读 / 写 / 异常三位的组合；`Interest::READ_WRITE` 等价于
/// `Interest::READ | Interest::WRITE`。
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(0b001);
    pub const WRITE: Interest = Interest(0b010);
    pub const READ_WRITE: Interest = Interest(0b011);
    pub const EXCEPTION: Interest = Interest(0b100);

    pub fn readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    pub fn exception(self) -> bool {
        self.0 & Self::EXCEPTION.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.readable() {
            parts.push("READ");
        }
        if self.writable() {
            parts.push("WRITE");
        }
        if self.exception() {
            parts.push("EXCEPTION");
        }
        if parts.is_empty() {
            parts.push("NONE");
        }
        write!(f, "Interest({})", parts.join("|"))
    }
}
