//! 共享内存段：本机快速路径
//!
//! 段布局：`[counter: usize][blob A][blob B]`，blob 尺寸在创建时固定。
//!
//! 发布协议（写端，见 [`ShmWriter::publish`]）：总是写入计数器奇偶性
//! **未**指示的那一半，写完后以 Release 语义递增计数器。写端永不阻塞，
//! 也不阻塞并发的驱动线程。
//!
//! 读取协议（读端，见 [`ShmReader::read_blob`]）：读计数器（Acquire），
//! 拷贝其指示的那一半，再读一次计数器；两次不一致则整个序列重试。
//! 这保证读端绝不观测到写了一半的 blob。

use crate::error::ProtocolError;
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering, fence};
use tracing::{debug, warn};

/// 读端重试预算；超出即判定写端异常
const MAX_READ_RETRIES: u32 = 64;

/// 计数器槽位大小（按 8 字节对齐，blob 区从这里开始）
const COUNTER_SLOT: usize = 8;

fn align8(n: usize) -> usize {
    n.div_ceil(8) * 8
}

/// blob 半区在段内的偏移（`half` 为 0 或 1）
pub fn blob_offset(half: usize, blob_size: usize) -> usize {
    COUNTER_SLOT + half * align8(blob_size)
}

/// 给定 blob 尺寸的段总长
pub fn segment_len(blob_size: usize) -> usize {
    COUNTER_SLOT + 2 * align8(blob_size)
}

fn map_segment(
    fd: BorrowedFd<'_>,
    len: usize,
    prot: ProtFlags,
) -> Result<NonNull<libc::c_void>, ProtocolError> {
    let len_nz = NonZeroUsize::new(len)
        .ok_or_else(|| ProtocolError::ShmSetup("zero-length segment".into()))?;
    unsafe { mmap(None, len_nz, prot, MapFlags::MAP_SHARED, fd, 0) }
        .map_err(|e| ProtocolError::ShmSetup(format!("mmap failed: {e}")))
}

/// 段内计数器
///
/// 映射基址按页对齐，偏移 0 处直接作为 `AtomicUsize` 访问。
unsafe fn counter_at<'a>(map: NonNull<libc::c_void>) -> &'a AtomicUsize {
    unsafe { &*(map.as_ptr() as *const AtomicUsize) }
}

// ============================================================================
// Writer
// ============================================================================

/// 共享内存写端（服务端持有，随 Manager 创建与销毁）
pub struct ShmWriter {
    name: String,
    fd: OwnedFd,
    map: NonNull<libc::c_void>,
    len: usize,
    blob_size: usize,
}

// 映射指针只在持有者线程使用；段本身的并发协议由计数器保证
unsafe impl Send for ShmWriter {}

impl ShmWriter {
    /// 创建并映射段；`name` 为 `shm_open` 名称（形如 `/vrlink-1234`）
    pub fn create(name: &str, blob_size: usize) -> Result<Self, ProtocolError> {
        // 上次异常退出可能留下同名段，先清掉
        let _ = shm_unlink(name);
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
        )
        .map_err(|e| ProtocolError::ShmSetup(format!("shm_open({name}) failed: {e}")))?;

        let len = segment_len(blob_size);
        nix::unistd::ftruncate(&fd, len as i64)
            .map_err(|e| ProtocolError::ShmSetup(format!("ftruncate failed: {e}")))?;

        let map = map_segment(
            fd.as_fd(),
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        )?;
        // ftruncate 已将段清零；counter == 0 表示尚未发布任何状态
        debug!(name, blob_size, len, "shared memory segment created");
        Ok(Self {
            name: name.to_owned(),
            fd,
            map,
            len,
            blob_size,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn blob_size(&self) -> usize {
        self.blob_size
    }

    /// 段的文件描述符（发布启用调用的返回句柄）
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// 当前已发布的计数器值
    pub fn published(&self) -> usize {
        unsafe { counter_at(self.map) }.load(Ordering::Relaxed)
    }

    /// 发布一份完整序列化状态
    ///
    /// 写入计数器奇偶性未指示的半区，然后 Release 递增计数器。
    /// 要求 `blob.len() == blob_size`：对固定布局，blob 恒为定长。
    pub fn publish(&mut self, blob: &[u8]) -> Result<(), ProtocolError> {
        if blob.len() != self.blob_size {
            return Err(ProtocolError::ShmSizeMismatch {
                expected: self.blob_size,
                actual: blob.len(),
            });
        }
        let counter = unsafe { counter_at(self.map) };
        let next = counter.load(Ordering::Relaxed) + 1;
        let half = next & 1;
        let dst = unsafe {
            (self.map.as_ptr() as *mut u8).add(blob_offset(half, self.blob_size))
        };
        unsafe {
            std::ptr::copy_nonoverlapping(blob.as_ptr(), dst, blob.len());
        }
        counter.store(next, Ordering::Release);
        Ok(())
    }
}

impl Drop for ShmWriter {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = munmap(self.map, self.len) {
                warn!(name = %self.name, "munmap failed: {e}");
            }
        }
        if let Err(e) = shm_unlink(self.name.as_str()) {
            warn!(name = %self.name, "shm_unlink failed: {e}");
        }
    }
}

// ============================================================================
// Reader
// ============================================================================

/// 共享内存读端（同机客户端持有，只读映射）
pub struct ShmReader {
    name: String,
    map: NonNull<libc::c_void>,
    len: usize,
    blob_size: usize,
}

unsafe impl Send for ShmReader {}

impl ShmReader {
    /// 按名称附着到已有段；`blob_size` 来自 CONNECT 回复，用于校验段长
    pub fn open(name: &str, blob_size: usize) -> Result<Self, ProtocolError> {
        let fd = shm_open(name, OFlag::O_RDONLY, Mode::empty())
            .map_err(|e| ProtocolError::ShmSetup(format!("shm_open({name}) failed: {e}")))?;

        let expected = segment_len(blob_size);
        let stat = nix::sys::stat::fstat(&fd)
            .map_err(|e| ProtocolError::ShmSetup(format!("fstat failed: {e}")))?;
        if (stat.st_size as usize) < expected {
            return Err(ProtocolError::ShmSizeMismatch {
                expected,
                actual: stat.st_size as usize,
            });
        }

        let map = map_segment(fd.as_fd(), expected, ProtFlags::PROT_READ)?;
        // fd 在映射建立后即可关闭（OwnedFd 离开作用域）
        debug!(name, blob_size, "attached to shared memory segment");
        Ok(Self {
            name: name.to_owned(),
            map,
            len: expected,
            blob_size,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn blob_size(&self) -> usize {
        self.blob_size
    }

    /// 按重试协议读取最新 blob
    ///
    /// 返回观测到的计数器值；`0` 表示写端尚未发布任何状态（`out`
    /// 未被写入）。两次计数器读取不一致时重试整个序列；预算耗尽
    /// 返回 [`ProtocolError::ShmTorn`]。
    pub fn read_blob(&self, out: &mut [u8]) -> Result<usize, ProtocolError> {
        if out.len() != self.blob_size {
            return Err(ProtocolError::ShmSizeMismatch {
                expected: self.blob_size,
                actual: out.len(),
            });
        }
        let counter = unsafe { counter_at(self.map) };
        for _ in 0..MAX_READ_RETRIES {
            let before = counter.load(Ordering::Acquire);
            if before == 0 {
                return Ok(0);
            }
            let half = before & 1;
            let src = unsafe {
                (self.map.as_ptr() as *const u8).add(blob_offset(half, self.blob_size))
            };
            unsafe {
                std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
            }
            // blob 拷贝必须先于第二次计数器读取生效
            fence(Ordering::Acquire);
            let after = counter.load(Ordering::Relaxed);
            if before == after {
                return Ok(before);
            }
        }
        Err(ProtocolError::ShmTorn(MAX_READ_RETRIES))
    }
}

impl Drop for ShmReader {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = munmap(self.map, self.len) {
                warn!(name = %self.name, "munmap failed: {e}");
            }
        }
    }
}
