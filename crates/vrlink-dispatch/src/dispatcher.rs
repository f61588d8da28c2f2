//! 派发器核心：poll 循环 + self-pipe 控制通道

use crate::error::DispatchError;
use crate::event::{IoEvent, ProcessEvent, SignalEvent, TimerEvent};
use crate::interest::Interest;
use crate::timer::{TimerSpec, next_phase};
use crate::{IoCallback, ProcessCallback, SignalCallback, TimerCallback};
use crossbeam_channel::{Receiver, Sender, unbounded};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// 监听器键；四类监听器共用一个键空间
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerKey(u64);

/// 跨线程控制请求
///
/// 经 self-pipe 唤醒，在每次阻塞等待之前排空。这是其他线程增删
/// 监听器 / raise / interrupt / stop 的唯一安全通道。
enum Command {
    AddIo {
        key: ListenerKey,
        fd: RawFd,
        interest: Interest,
        cb: IoCallback,
    },
    RemoveIo(ListenerKey),
    SuspendIo(ListenerKey),
    ResumeIo(ListenerKey),
    SetIoInterest(ListenerKey, Interest),
    AddTimer {
        key: ListenerKey,
        spec: TimerSpec,
        cb: TimerCallback,
    },
    RemoveTimer(ListenerKey),
    SuspendTimer(ListenerKey),
    ResumeTimer(ListenerKey),
    AddProcess {
        key: ListenerKey,
        cb: ProcessCallback,
    },
    RemoveProcess(ListenerKey),
    AddSignal {
        key: ListenerKey,
        cb: SignalCallback,
    },
    RemoveSignal(ListenerKey),
    Raise(ListenerKey),
    Interrupt,
    Stop,
}

struct IoListener {
    fd: RawFd,
    interest: Interest,
    suspended: bool,
    cb: Option<IoCallback>,
}

struct Timer {
    /// 相位基准（注册时的 `first`）
    base: Instant,
    interval: Option<Duration>,
    suspended: bool,
    /// 代号；堆中条目的代号不匹配即视为过期
    r#gen: u64,
    cb: Option<TimerCallback>,
}

type HeapEntry = Reverse<(Instant, ListenerKey, u64)>;

/// 跨线程控制句柄
///
/// `Clone + Send`；所有方法把请求写入命令队列并向 self-pipe 写一个
/// 字节唤醒循环，在派发线程的下一次阻塞等待之前生效。
#[derive(Clone)]
pub struct DispatcherHandle {
    cmd_tx: Sender<Command>,
    wake_w: Arc<OwnedFd>,
    next_key: Arc<AtomicU64>,
}

impl DispatcherHandle {
    fn alloc_key(&self) -> ListenerKey {
        ListenerKey(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    fn submit(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).is_err() {
            trace!("dispatcher gone, control request dropped");
            return;
        }
        self.wake();
    }

    /// 向 self-pipe 写一个字节；管道已满说明唤醒早已挂起，可忽略
    fn wake(&self) {
        let _ = nix::unistd::write(self.wake_w.as_fd(), &[1u8]);
    }

    pub fn add_io_listener(&self, fd: RawFd, interest: Interest, cb: IoCallback) -> ListenerKey {
        let key = self.alloc_key();
        self.submit(Command::AddIo {
            key,
            fd,
            interest,
            cb,
        });
        key
    }

    pub fn remove_io_listener(&self, key: ListenerKey) {
        self.submit(Command::RemoveIo(key));
    }

    pub fn suspend_io_listener(&self, key: ListenerKey) {
        self.submit(Command::SuspendIo(key));
    }

    pub fn resume_io_listener(&self, key: ListenerKey) {
        self.submit(Command::ResumeIo(key));
    }

    /// 从回调外部改写某个 IO 监听器的兴趣掩码
    pub fn set_io_interest(&self, key: ListenerKey, interest: Interest) {
        self.submit(Command::SetIoInterest(key, interest));
    }

    pub fn add_timer_listener(&self, spec: TimerSpec, cb: TimerCallback) -> ListenerKey {
        let key = self.alloc_key();
        self.submit(Command::AddTimer { key, spec, cb });
        key
    }

    pub fn remove_timer_listener(&self, key: ListenerKey) {
        self.submit(Command::RemoveTimer(key));
    }

    pub fn suspend_timer(&self, key: ListenerKey) {
        self.submit(Command::SuspendTimer(key));
    }

    pub fn resume_timer(&self, key: ListenerKey) {
        self.submit(Command::ResumeTimer(key));
    }

    pub fn add_process_listener(&self, cb: ProcessCallback) -> ListenerKey {
        let key = self.alloc_key();
        self.submit(Command::AddProcess { key, cb });
        key
    }

    pub fn remove_process_listener(&self, key: ListenerKey) {
        self.submit(Command::RemoveProcess(key));
    }

    pub fn add_signal_listener(&self, cb: SignalCallback) -> ListenerKey {
        let key = self.alloc_key();
        self.submit(Command::AddSignal { key, cb });
        key
    }

    pub fn remove_signal_listener(&self, key: ListenerKey) {
        self.submit(Command::RemoveSignal(key));
    }

    /// 触发一个信号监听器；任意线程可调用
    pub fn raise(&self, key: ListenerKey) {
        self.submit(Command::Raise(key));
    }

    /// 强制派发循环提前、非破坏性地返回一次
    pub fn interrupt(&self) {
        self.submit(Command::Interrupt);
    }

    /// 终止派发循环：`dispatch_next_event` 从此只返回 `false`
    pub fn stop(&self) {
        self.submit(Command::Stop);
    }
}

/// 单线程协作式事件派发器
///
/// 热路径（poll + 回调派发）严格单线程无锁；跨线程控制一律经
/// [`DispatcherHandle`] 走 self-pipe。
pub struct EventDispatcher {
    io: HashMap<ListenerKey, IoListener>,
    timers: HashMap<ListenerKey, Timer>,
    timer_heap: BinaryHeap<HeapEntry>,
    process: Vec<(ListenerKey, Option<ProcessCallback>)>,
    signals: HashMap<ListenerKey, Option<SignalCallback>>,
    pending_signals: VecDeque<ListenerKey>,
    cmd_rx: Receiver<Command>,
    handle: DispatcherHandle,
    wake_r: OwnedFd,
    stop_requested: bool,
    interrupt_requested: bool,
}

impl EventDispatcher {
    pub fn new() -> Result<Self, DispatchError> {
        let (wake_r, wake_w) =
            nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(DispatchError::PipeSetup)?;
        let (cmd_tx, cmd_rx) = unbounded();
        let handle = DispatcherHandle {
            cmd_tx,
            wake_w: Arc::new(wake_w),
            next_key: Arc::new(AtomicU64::new(1)),
        };
        Ok(Self {
            io: HashMap::new(),
            timers: HashMap::new(),
            timer_heap: BinaryHeap::new(),
            process: Vec::new(),
            signals: HashMap::new(),
            pending_signals: VecDeque::new(),
            cmd_rx,
            handle,
            wake_r,
            stop_requested: false,
            interrupt_requested: false,
        })
    }

    /// 跨线程控制句柄
    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    // ------------------------------------------------------------------
    // 同线程注册接口（循环外使用；回调内请走 handle 或事件对象）
    // ------------------------------------------------------------------

    pub fn add_io_listener(&mut self, fd: RawFd, interest: Interest, cb: IoCallback) -> ListenerKey {
        let key = self.handle.alloc_key();
        self.insert_io(key, fd, interest, cb);
        key
    }

    pub fn remove_io_listener(&mut self, key: ListenerKey) {
        self.io.remove(&key);
    }

    pub fn add_timer_listener(&mut self, spec: TimerSpec, cb: TimerCallback) -> ListenerKey {
        let key = self.handle.alloc_key();
        self.insert_timer(key, spec, cb);
        key
    }

    pub fn remove_timer_listener(&mut self, key: ListenerKey) {
        self.timers.remove(&key);
    }

    pub fn suspend_timer(&mut self, key: ListenerKey) {
        if let Some(t) = self.timers.get_mut(&key) {
            t.suspended = true;
        }
    }

    /// 恢复挂起的定时器：下一次触发对齐到相位基准的整数倍
    pub fn resume_timer(&mut self, key: ListenerKey) {
        self.resume_timer_inner(key);
    }

    pub fn add_process_listener(&mut self, cb: ProcessCallback) -> ListenerKey {
        let key = self.handle.alloc_key();
        self.process.push((key, Some(cb)));
        key
    }

    pub fn remove_process_listener(&mut self, key: ListenerKey) {
        self.process.retain(|(k, _)| *k != key);
    }

    pub fn add_signal_listener(&mut self, cb: SignalCallback) -> ListenerKey {
        let key = self.handle.alloc_key();
        self.signals.insert(key, Some(cb));
        key
    }

    pub fn remove_signal_listener(&mut self, key: ListenerKey) {
        self.signals.remove(&key);
    }

    /// 同线程 raise；信号在下一个派发周期开头交付
    pub fn raise(&mut self, key: ListenerKey) {
        self.pending_signals.push_back(key);
    }

    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// 当前注册的 IO 监听器数量（含挂起的）
    pub fn io_listener_count(&self) -> usize {
        self.io.len()
    }

    /// 当前注册的定时器数量（含挂起的）
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    // ------------------------------------------------------------------
    // 控制通道
    // ------------------------------------------------------------------

    fn insert_io(&mut self, key: ListenerKey, fd: RawFd, interest: Interest, cb: IoCallback) {
        self.io.insert(
            key,
            IoListener {
                fd,
                interest,
                suspended: false,
                cb: Some(cb),
            },
        );
    }

    fn insert_timer(&mut self, key: ListenerKey, spec: TimerSpec, cb: TimerCallback) {
        let timer = Timer {
            base: spec.first,
            interval: spec.interval,
            suspended: spec.start_suspended,
            r#gen: 0,
            cb: Some(cb),
        };
        if !timer.suspended {
            self.timer_heap.push(Reverse((spec.first, key, 0)));
        }
        self.timers.insert(key, timer);
    }

    fn resume_timer_inner(&mut self, key: ListenerKey) {
        let Some(t) = self.timers.get_mut(&key) else {
            return;
        };
        if !t.suspended {
            return;
        }
        t.suspended = false;
        t.r#gen += 1;
        let now = Instant::now();
        let next = match t.interval {
            Some(interval) => next_phase(t.base, interval, now),
            None => t.base.max(now),
        };
        self.timer_heap.push(Reverse((next, key, t.r#gen)));
    }

    fn apply_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddIo {
                key,
                fd,
                interest,
                cb,
            } => self.insert_io(key, fd, interest, cb),
            Command::RemoveIo(key) => {
                self.io.remove(&key);
            },
            Command::SuspendIo(key) => {
                if let Some(l) = self.io.get_mut(&key) {
                    l.suspended = true;
                }
            },
            Command::ResumeIo(key) => {
                if let Some(l) = self.io.get_mut(&key) {
                    l.suspended = false;
                }
            },
            Command::SetIoInterest(key, interest) => {
                if let Some(l) = self.io.get_mut(&key) {
                    l.interest = interest;
                }
            },
            Command::AddTimer { key, spec, cb } => self.insert_timer(key, spec, cb),
            Command::RemoveTimer(key) => {
                self.timers.remove(&key);
            },
            Command::SuspendTimer(key) => self.suspend_timer(key),
            Command::ResumeTimer(key) => self.resume_timer_inner(key),
            Command::AddProcess { key, cb } => self.process.push((key, Some(cb))),
            Command::RemoveProcess(key) => self.process.retain(|(k, _)| *k != key),
            Command::AddSignal { key, cb } => {
                self.signals.insert(key, Some(cb));
            },
            Command::RemoveSignal(key) => {
                self.signals.remove(&key);
            },
            Command::Raise(key) => self.pending_signals.push_back(key),
            Command::Interrupt => self.interrupt_requested = true,
            Command::Stop => self.stop_requested = true,
        }
    }

    fn drain_control(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            self.apply_command(cmd);
        }
    }

    fn drain_wake_pipe(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match nix::unistd::read(self.wake_r.as_fd(), &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("self-pipe read failed: {e}");
                    break;
                },
            }
        }
    }

    // ------------------------------------------------------------------
    // 派发
    // ------------------------------------------------------------------

    /// 派发下一批事件
    ///
    /// `wait == false` 时只做一次非阻塞轮询。单个周期内的交付顺序：
    /// 就绪 IO → 到期定时器（重复定时器重排，超期折算 missed 计数）
    /// → 全部 process 监听器。仅在 `stop()` 之后返回 `Ok(false)`；
    /// `interrupt()` 使本次调用提前返回 `Ok(true)`，不再推进定时器。
    pub fn dispatch_next_event(&mut self, wait: bool) -> Result<bool, DispatchError> {
        self.interrupt_requested = false;
        self.drain_control();
        if self.stop_requested {
            return Ok(false);
        }
        self.deliver_signals();
        if self.interrupt_requested {
            return Ok(true);
        }

        // 等待截止：最近的定时器；无定时器且 wait 时无限等待
        let timeout = if wait {
            self.next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()))
        } else {
            Some(Duration::ZERO)
        };

        // 兴趣集：self-pipe 读端永远在第 0 位
        let mut fds: Vec<PollFd<'_>> = Vec::with_capacity(self.io.len() + 1);
        let mut keys: Vec<ListenerKey> = Vec::with_capacity(self.io.len());
        fds.push(PollFd::new(self.wake_r.as_fd(), PollFlags::POLLIN));
        for (&key, listener) in &self.io {
            if listener.suspended || listener.interest.is_empty() {
                continue;
            }
            let mut flags = PollFlags::empty();
            if listener.interest.readable() {
                flags |= PollFlags::POLLIN;
            }
            if listener.interest.writable() {
                flags |= PollFlags::POLLOUT;
            }
            if listener.interest.exception() {
                flags |= PollFlags::POLLPRI;
            }
            // SAFETY: fd 的生命周期由监听器注册方保证；坏描述符由
            // POLLNVAL 分支剪除
            fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(listener.fd) },
                flags,
            ));
            keys.push(key);
        }

        let poll_timeout = match timeout {
            None => PollTimeout::NONE,
            Some(d) => {
                let ms = ceil_millis(d);
                PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
            },
        };
        match poll(&mut fds, poll_timeout) {
            Ok(_) => {},
            Err(Errno::EINTR) => return Ok(true),
            Err(e) => return Err(DispatchError::Poll(e)),
        }

        let wake_ready = fds[0]
            .revents()
            .unwrap_or(PollFlags::empty())
            .contains(PollFlags::POLLIN);
        let ready: Vec<(ListenerKey, PollFlags)> = keys
            .iter()
            .zip(fds[1..].iter())
            .filter_map(|(&key, pfd)| {
                let revents = pfd.revents().unwrap_or(PollFlags::empty());
                (!revents.is_empty()).then_some((key, revents))
            })
            .collect();
        drop(fds);

        if wake_ready {
            self.drain_wake_pipe();
            self.drain_control();
            if self.stop_requested {
                return Ok(false);
            }
            self.deliver_signals();
            if self.interrupt_requested {
                return Ok(true);
            }
        }

        self.dispatch_io(ready);
        self.dispatch_timers();
        self.dispatch_process();
        Ok(true)
    }

    /// 循环直到 `stop()`
    pub fn run(&mut self) -> Result<(), DispatchError> {
        while self.dispatch_next_event(true)? {}
        Ok(())
    }

    /// 堆顶最近的有效截止时间；顺带清掉过期条目
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse((deadline, key, r#gen))) = self.timer_heap.peek() {
            match self.timers.get(&key) {
                Some(t) if t.r#gen == r#gen && !t.suspended => return Some(deadline),
                _ => {
                    self.timer_heap.pop();
                },
            }
        }
        None
    }

    fn deliver_signals(&mut self) {
        while let Some(key) = self.pending_signals.pop_front() {
            let Some(slot) = self.signals.get_mut(&key) else {
                trace!(?key, "signal raised for unknown listener");
                continue;
            };
            let Some(mut cb) = slot.take() else {
                continue;
            };
            let mut ev = SignalEvent::new();
            cb(&mut ev);
            if ev.remove {
                self.signals.remove(&key);
            } else if let Some(slot) = self.signals.get_mut(&key) {
                *slot = Some(cb);
            }
        }
    }

    fn dispatch_io(&mut self, ready: Vec<(ListenerKey, PollFlags)>) {
        for (key, revents) in ready {
            if revents.contains(PollFlags::POLLNVAL) {
                // 等待调用发现坏描述符：剪除而不是中断循环
                warn!(?key, "bad file descriptor, pruning IO listener");
                self.io.remove(&key);
                continue;
            }
            let Some(listener) = self.io.get_mut(&key) else {
                continue;
            };
            let mut ready_mask = Interest::NONE;
            if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)
                && listener.interest.readable()
            {
                ready_mask |= Interest::READ;
            }
            if revents.contains(PollFlags::POLLOUT) && listener.interest.writable() {
                ready_mask |= Interest::WRITE;
            }
            if revents.intersects(PollFlags::POLLPRI | PollFlags::POLLERR) {
                ready_mask |= Interest::EXCEPTION;
            }
            if ready_mask.is_empty() {
                continue;
            }
            let Some(mut cb) = listener.cb.take() else {
                continue;
            };
            let mut ev = IoEvent::new(ready_mask);
            cb(&mut ev);
            if ev.remove {
                self.io.remove(&key);
                continue;
            }
            if let Some(listener) = self.io.get_mut(&key) {
                listener.cb = Some(ev.replacement.unwrap_or(cb));
                if let Some(interest) = ev.new_interest {
                    listener.interest = interest;
                }
                if ev.suspend {
                    listener.suspended = true;
                }
            }
        }
    }

    fn dispatch_timers(&mut self) {
        let now = Instant::now();
        while let Some(&Reverse((deadline, key, r#gen))) = self.timer_heap.peek() {
            if deadline > now {
                break;
            }
            self.timer_heap.pop();
            let Some(timer) = self.timers.get_mut(&key) else {
                continue;
            };
            if timer.r#gen != r#gen || timer.suspended {
                continue;
            }
            let missed = match timer.interval {
                Some(interval) if now > deadline => {
                    (now.duration_since(deadline).as_nanos() / interval.as_nanos().max(1)) as u64
                },
                _ => 0,
            };
            let Some(mut cb) = timer.cb.take() else {
                continue;
            };
            let mut ev = TimerEvent::new(missed);
            cb(&mut ev);
            if ev.remove {
                self.timers.remove(&key);
                continue;
            }
            let Some(timer) = self.timers.get_mut(&key) else {
                continue;
            };
            timer.cb = Some(ev.replacement.unwrap_or(cb));
            if let Some((first, interval)) = ev.reschedule {
                timer.base = first;
                timer.interval = interval;
                timer.r#gen += 1;
                timer.suspended = ev.suspend;
                if !timer.suspended {
                    self.timer_heap.push(Reverse((first, key, timer.r#gen)));
                }
                continue;
            }
            if ev.suspend {
                timer.suspended = true;
                continue;
            }
            match timer.interval {
                Some(interval) => {
                    // 下一次触发：跳过整段错过的间隔，保持相位
                    let steps = (missed + 1) as u128;
                    let next =
                        deadline + Duration::from_nanos((interval.as_nanos() * steps) as u64);
                    self.timer_heap.push(Reverse((next, key, timer.r#gen)));
                },
                None => {
                    // 一次性定时器触发即注销
                    self.timers.remove(&key);
                },
            }
        }
    }

    fn dispatch_process(&mut self) {
        let mut i = 0;
        while i < self.process.len() {
            let Some(mut cb) = self.process[i].1.take() else {
                i += 1;
                continue;
            };
            let mut ev = ProcessEvent::new();
            cb(&mut ev);
            if ev.remove {
                self.process.remove(i);
            } else {
                self.process[i].1 = Some(cb);
                i += 1;
            }
        }
    }
}

fn ceil_millis(d: Duration) -> i32 {
    let nanos = d.as_nanos();
    let ms = nanos.div_ceil(1_000_000);
    ms.min(i32::MAX as u128) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn drain_cycles(d: &mut EventDispatcher, n: usize) {
        for _ in 0..n {
            d.dispatch_next_event(false).unwrap();
        }
    }

    #[test]
    fn test_order_io_before_timer_before_process() {
        let mut d = EventDispatcher::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        // 自制一对管道，写端先灌一个字节让读端就绪
        let (r, w) = nix::unistd::pipe().unwrap();
        nix::unistd::write(&w, &[7u8]).unwrap();

        let o = order.clone();
        let raw_r = {
            use std::os::fd::AsRawFd;
            r.as_raw_fd()
        };
        d.add_io_listener(
            raw_r,
            Interest::READ,
            Box::new(move |ev| {
                o.lock().unwrap().push("io");
                ev.remove_listener();
            }),
        );
        let o = order.clone();
        d.add_timer_listener(
            TimerSpec::once_at(Instant::now()),
            Box::new(move |_| {
                o.lock().unwrap().push("timer");
            }),
        );
        let o = order.clone();
        d.add_process_listener(Box::new(move |ev| {
            o.lock().unwrap().push("process");
            ev.remove_listener();
        }));

        assert!(d.dispatch_next_event(true).unwrap());
        assert_eq!(*order.lock().unwrap(), vec!["io", "timer", "process"]);
        drop(r);
        drop(w);
    }

    #[test]
    fn test_stop_makes_dispatch_return_false() {
        let mut d = EventDispatcher::new().unwrap();
        d.stop();
        assert!(!d.dispatch_next_event(false).unwrap());
        // stop 之后保持 false
        assert!(!d.dispatch_next_event(true).unwrap());
    }

    #[test]
    fn test_one_shot_timer_fires_once_and_unregisters() {
        let mut d = EventDispatcher::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        d.add_timer_listener(
            TimerSpec::once_at(Instant::now()),
            Box::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(d.dispatch_next_event(true).unwrap());
        drain_cycles(&mut d, 3);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(d.timer_count(), 0);
    }

    #[test]
    fn test_repeating_timer_reports_missed_events() {
        let mut d = EventDispatcher::new().unwrap();
        let missed = Arc::new(AtomicU64::new(u64::MAX));
        let m = missed.clone();
        let interval = Duration::from_millis(10);
        d.add_timer_listener(
            TimerSpec::repeating(Instant::now(), interval),
            Box::new(move |ev| {
                m.store(ev.missed_events, Ordering::SeqCst);
            }),
        );
        // 阻塞超过 3 个间隔再派发：首次触发即已整段超期
        std::thread::sleep(Duration::from_millis(35));
        assert!(d.dispatch_next_event(false).unwrap());
        let observed = missed.load(Ordering::SeqCst);
        assert!(observed >= 2, "expected >= 2 missed events, got {observed}");
        assert_eq!(d.timer_count(), 1);
    }

    #[test]
    fn test_suspended_timer_never_fires_until_resumed() {
        let mut d = EventDispatcher::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let key = d.add_timer_listener(
            TimerSpec::repeating(Instant::now(), Duration::from_millis(1)).suspended(),
            Box::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        std::thread::sleep(Duration::from_millis(5));
        drain_cycles(&mut d, 5);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        d.resume_timer(key);
        std::thread::sleep(Duration::from_millis(3));
        assert!(d.dispatch_next_event(true).unwrap());
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_timer_remove_via_event_object() {
        let mut d = EventDispatcher::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        d.add_timer_listener(
            TimerSpec::repeating(Instant::now(), Duration::from_millis(1)),
            Box::new(move |ev| {
                f.fetch_add(1, Ordering::SeqCst);
                ev.remove_listener();
            }),
        );
        assert!(d.dispatch_next_event(true).unwrap());
        std::thread::sleep(Duration::from_millis(3));
        drain_cycles(&mut d, 3);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(d.timer_count(), 0);
    }

    #[test]
    fn test_io_interest_change_via_event_object() {
        let mut d = EventDispatcher::new().unwrap();
        let (r, w) = nix::unistd::pipe().unwrap();
        nix::unistd::write(&w, &[1u8]).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let raw_r = {
            use std::os::fd::AsRawFd;
            r.as_raw_fd()
        };
        d.add_io_listener(
            raw_r,
            Interest::READ,
            Box::new(move |ev| {
                f.fetch_add(1, Ordering::SeqCst);
                // 不消费管道字节，但把兴趣改为 NONE：之后不得再触发
                ev.set_interest(Interest::NONE);
            }),
        );
        assert!(d.dispatch_next_event(true).unwrap());
        drain_cycles(&mut d, 3);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(r);
        drop(w);
    }

    #[test]
    fn test_bad_fd_is_pruned_not_fatal() {
        let mut d = EventDispatcher::new().unwrap();
        let (r, _w) = nix::unistd::pipe().unwrap();
        let raw = {
            use std::os::fd::AsRawFd;
            r.as_raw_fd()
        };
        drop(r); // 立刻关闭，留下坏描述符
        d.add_io_listener(raw, Interest::READ, Box::new(|_| panic!("must not fire")));
        assert_eq!(d.io_listener_count(), 1);
        assert!(d.dispatch_next_event(false).unwrap());
        assert_eq!(d.io_listener_count(), 0);
    }

    #[test]
    fn test_signal_delivery_and_removal() {
        let mut d = EventDispatcher::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let key = d.add_signal_listener(Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        d.raise(key);
        d.raise(key);
        assert!(d.dispatch_next_event(false).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        d.remove_signal_listener(key);
        d.raise(key);
        assert!(d.dispatch_next_event(false).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_process_listener_runs_every_cycle() {
        let mut d = EventDispatcher::new().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        d.add_process_listener(Box::new(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        drain_cycles(&mut d, 4);
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }
}
