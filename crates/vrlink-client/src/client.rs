//! VrClient：跟踪状态客户端
//!
//! 三种工作模式，可随时切换（但互斥约束见各方法）：
//!
//! - **一次性**：`get_packet()` 发出 PACKET 请求并阻塞到完整一包
//!   解进影子状态；
//! - **流模式**：`activate()` + `start_stream()` 之后套接字挂到
//!   调用方提供的派发器上，每条完整消息先在影子互斥锁下更新影子，
//!   再在锁外跑通知回调；
//! - **共享内存快速路径**：同机连接且服务端启用时，
//!   `update_device_states()` 按计数器重试协议直接从段里解码，
//!   不产生任何网络往返。
//!
//! 非同机连接的 tracker 时间戳在解码时叠加握手阶段测得的时钟偏移
//! （中点 RTT 校正）。连接一旦死亡（对端关闭 / 协议错误）即永久
//! 失效，所有后续调用返回 [`ClientError::ConnectionDead`]；不做
//! 自动重连。

use crate::config::{ClientConfig, ServerAddress};
use crate::error::ClientError;
use bytes::BytesMut;
use nix::errno::Errno;
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, UnixAddr};
use parking_lot::{Condvar, Mutex};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};
use vrlink_dispatch::{DispatcherHandle, Interest, ListenerKey};
use vrlink_protocol::{
    BaseStation, BatteryState, CAP_TIMESTAMPS, ConnectReply, DeviceLayout, DeviceState,
    EnvironmentDefinition, FrameDecoder, HmdConfiguration, Message, PROTOCOL_VERSION,
    ProtocolError, ShmReader, VirtualDeviceDescriptor, decode_packet_into, encode_message,
};

/// 流模式的整包通知回调
pub type PacketCallback = Box<dyn FnMut(&DeviceState) + Send>;
/// 电池更新回调
pub type BatteryCallback = Box<dyn FnMut(usize, &BatteryState) + Send>;
/// HMD 配置更新回调
pub type HmdCallback = Box<dyn FnMut(usize, &HmdConfiguration) + Send>;
/// 环境定义推送回调
pub type EnvironmentCallback = Box<dyn FnMut(&EnvironmentDefinition) + Send>;
/// 流模式错误回调；触发即意味着连接已标记死亡
pub type ErrorCallback = Box<dyn FnMut(&ClientError) + Send>;

#[derive(Default)]
struct Callbacks {
    packet: Option<PacketCallback>,
    battery: Option<BatteryCallback>,
    hmd: Option<HmdCallback>,
    environment: Option<EnvironmentCallback>,
    error: Option<ErrorCallback>,
}

/// 影子状态 + 收包序号（条件变量配套）
struct Shadow {
    state: DeviceState,
    serial: u64,
}

struct ShmFastPath {
    reader: ShmReader,
    scratch: Vec<u8>,
}

struct ClientInner {
    socket: OwnedFd,
    /// 发送序列化暂存；同时充当写序列化锁
    write_buf: Mutex<BytesMut>,
    decoder: Mutex<FrameDecoder>,
    shadow: Mutex<Shadow>,
    packet_cv: Condvar,
    callbacks: Mutex<Callbacks>,
    handle: DispatcherHandle,
    listener: Mutex<Option<ListenerKey>>,
    streaming: AtomicBool,
    active: AtomicBool,
    dead: AtomicBool,
    shm: Mutex<Option<ShmFastPath>>,
    /// 握手快照（版本、能力、清单）
    reply: ConnectReply,
    /// 服务端时钟减本端时钟（微秒）；同机连接为 0
    clock_offset_us: i64,
    local: bool,
}

impl ClientInner {
    fn mark_dead(&self) {
        if !self.dead.swap(true, Ordering::AcqRel) {
            debug!("connection marked dead");
            self.wake_packet_waiters();
        }
    }

    /// 流模式错误路径：标记死亡并走错误回调
    fn fail(&self, err: ClientError) {
        let first = !self.dead.swap(true, Ordering::AcqRel);
        self.wake_packet_waiters();
        if first {
            warn!("streaming connection failed: {err}");
            if let Some(cb) = self.callbacks.lock().error.as_mut() {
                cb(&err);
            }
        }
    }

    /// 唤醒前过一次影子锁：等待者要么在谓词里看到 dead，
    /// 要么已进入 wait 能收到通知，二者必居其一
    fn wake_packet_waiters(&self) {
        drop(self.shadow.lock());
        self.packet_cv.notify_all();
    }

    fn send(&self, msg: &Message) -> Result<(), ClientError> {
        if self.dead.load(Ordering::Acquire) {
            return Err(ClientError::ConnectionDead);
        }
        let mut buf = self.write_buf.lock();
        buf.clear();
        encode_message(msg, &mut buf);
        write_all_fd(&self.socket, &buf).inspect_err(|_| self.mark_dead())
    }

    /// 同步读下一条消息（非流模式专用；流模式下套接字归派发器管）
    fn read_message(&self) -> Result<Message, ClientError> {
        let mut decoder = self.decoder.lock();
        read_message_fd(&self.socket, &mut decoder).inspect_err(|_| self.mark_dead())
    }

    fn correct_timestamps(&self, state: &mut DeviceState) {
        if self.local || self.reply.flags & CAP_TIMESTAMPS == 0 {
            return;
        }
        for t in &mut state.trackers {
            t.timestamp_us = (t.timestamp_us as i64 - self.clock_offset_us).max(0) as u64;
        }
    }

    /// 整包落进影子状态；返回校正后的拷贝
    fn ingest_packet(&self, mut state: DeviceState, notify_callback: bool) -> DeviceState {
        self.correct_timestamps(&mut state);
        let cloned = {
            let mut shadow = self.shadow.lock();
            shadow.state = state;
            shadow.serial += 1;
            shadow.state.clone()
        };
        self.packet_cv.notify_all();
        if notify_callback {
            if let Some(cb) = self.callbacks.lock().packet.as_mut() {
                cb(&cloned);
            }
        }
        cloned
    }

    /// 服务端主动推送的元数据；返回 false 表示消息不属于这一类
    fn dispatch_metadata(&self, msg: Message) -> bool {
        match msg {
            Message::BatteryUpdate { device, state } => {
                if let Some(cb) = self.callbacks.lock().battery.as_mut() {
                    cb(device as usize, &state);
                }
                true
            },
            Message::HmdConfigUpdate { index, config } => {
                if let Some(cb) = self.callbacks.lock().hmd.as_mut() {
                    cb(index as usize, &config);
                }
                true
            },
            Message::EnvironmentPush(env) => {
                if let Some(cb) = self.callbacks.lock().environment.as_mut() {
                    cb(&env);
                }
                true
            },
            _ => false,
        }
    }

    /// 流模式读回调（派发器线程）
    ///
    /// 套接字保持阻塞模式，每次就绪只读一次——水平触发的 poll 会在
    /// 还有剩余数据时再次唤醒，绝不让派发循环挂在 read 上。
    fn on_readable(&self) -> bool {
        let mut chunk = [0u8; 16384];
        let msgs = {
            let mut decoder = self.decoder.lock();
            match nix::unistd::read(self.socket.as_fd(), &mut chunk) {
                Ok(0) => {
                    self.fail(ClientError::ConnectionDead);
                    return false;
                },
                Ok(n) => decoder.extend(&chunk[..n]),
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => return true,
                Err(e) => {
                    self.fail(ClientError::Io(std::io::Error::from(e)));
                    return false;
                },
            }
            let mut msgs = Vec::new();
            loop {
                match decoder.next() {
                    Ok(Some(msg)) => msgs.push(msg),
                    Ok(None) => break,
                    Err(e) => {
                        self.fail(ClientError::Protocol(e));
                        return false;
                    },
                }
            }
            msgs
        };
        for msg in msgs {
            match msg {
                Message::Packet(state) => {
                    self.ingest_packet(state, true);
                },
                other => {
                    if !self.dispatch_metadata(other) {
                        self.fail(ClientError::Protocol(ProtocolError::UnexpectedMessage(
                            "server push",
                        )));
                        return false;
                    }
                },
            }
        }
        true
    }

    /// 阻塞 RPC 骨架：流模式下拒绝，等待期间顺带消化元数据推送
    fn rpc<T>(
        &self,
        request: &Message,
        extract: fn(Message) -> Result<T, Message>,
    ) -> Result<T, ClientError> {
        if self.streaming.load(Ordering::Acquire) {
            return Err(ClientError::StreamingActive);
        }
        self.send(request)?;
        loop {
            let msg = self.read_message()?;
            match extract(msg) {
                Ok(v) => return Ok(v),
                Err(other) => {
                    if !self.dispatch_metadata(other) {
                        self.mark_dead();
                        return Err(ClientError::Protocol(ProtocolError::UnexpectedMessage(
                            "RPC reply",
                        )));
                    }
                },
            }
        }
    }
}

/// 跟踪状态客户端
pub struct VrClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for VrClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VrClient").finish_non_exhaustive()
    }
}

impl VrClient {
    /// TCP 连接（非同机：走时钟校正，无共享内存）
    pub fn connect_tcp(
        host: &str,
        port: u16,
        handle: &DispatcherHandle,
    ) -> Result<Self, ClientError> {
        let stream = std::net::TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        info!(host, port, "connected via TCP");
        Self::finish_connect(stream.into(), false, handle.clone())
    }

    /// Unix 域套接字连接（同机：可用共享内存快速路径）
    ///
    /// `abstract_ns` 为 true 时 `path` 是抽象命名空间名（不含前导
    /// NUL），不会在文件系统上留下痕迹。
    pub fn connect_unix(
        path: &Path,
        abstract_ns: bool,
        handle: &DispatcherHandle,
    ) -> Result<Self, ClientError> {
        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(nix_io)?;
        let addr = if abstract_ns {
            UnixAddr::new_abstract(path.as_os_str().as_bytes())
        } else {
            UnixAddr::new(path)
        }
        .map_err(nix_io)?;
        socket::connect(fd.as_raw_fd(), &addr).map_err(nix_io)?;
        info!(path = %path.display(), abstract_ns, "connected via Unix socket");
        Self::finish_connect(fd, true, handle.clone())
    }

    /// 按配置段连接
    pub fn from_config(
        config: &ClientConfig,
        handle: &DispatcherHandle,
    ) -> Result<Self, ClientError> {
        match &config.server {
            ServerAddress::Tcp { host, port } => Self::connect_tcp(host, *port, handle),
            ServerAddress::Unix { path } => Self::connect_unix(path, false, handle),
            ServerAddress::AbstractUnix { name } => {
                Self::connect_unix(Path::new(name), true, handle)
            },
        }
    }

    /// 同步握手；失败即构造失败，不留任何流状态
    fn finish_connect(
        socket: OwnedFd,
        local: bool,
        handle: DispatcherHandle,
    ) -> Result<Self, ClientError> {
        let epoch = Instant::now();
        let mut decoder = FrameDecoder::new();

        let mut buf = BytesMut::new();
        encode_message(
            &Message::Connect {
                version: PROTOCOL_VERSION,
            },
            &mut buf,
        );
        let t0 = epoch.elapsed().as_micros() as u64;
        write_all_fd(&socket, &buf)?;
        let reply = match read_message_fd(&socket, &mut decoder)? {
            Message::ConnectReply(reply) => reply,
            other => {
                warn!(opcode = ?other.opcode(), "handshake reply was not ConnectReply");
                return Err(ClientError::Protocol(ProtocolError::UnexpectedMessage(
                    "CONNECT reply",
                )));
            },
        };
        let t1 = epoch.elapsed().as_micros() as u64;

        // 协商失败由客户端判定：服务端报的版本超出本端上限即放弃
        if reply.version > PROTOCOL_VERSION {
            return Err(ClientError::Protocol(ProtocolError::VersionMismatch {
                server: reply.version,
                supported: PROTOCOL_VERSION,
            }));
        }

        // 中点 RTT 校正：服务端时间戳对应请求与回复的中点
        let clock_offset_us = if local {
            0
        } else {
            reply.server_time_us as i64 - ((t0 + t1) / 2) as i64
        };
        debug!(
            version = reply.version,
            flags = reply.flags,
            clock_offset_us,
            "handshake complete"
        );

        let shm = if local {
            reply.shm.as_ref().and_then(|(name, blob_size)| {
                let blob = *blob_size as usize;
                match ShmReader::open(name, blob) {
                    Ok(reader) => Some(ShmFastPath {
                        reader,
                        scratch: vec![0u8; blob],
                    }),
                    Err(e) => {
                        // 段打不开不致命，退回套接字路径
                        warn!(name = %name, "shared memory attach failed: {e}");
                        None
                    },
                }
            })
        } else {
            None
        };

        let shadow = Shadow {
            state: DeviceState::new(reply.layout),
            serial: 0,
        };
        Ok(Self {
            inner: Arc::new(ClientInner {
                socket,
                write_buf: Mutex::new(BytesMut::new()),
                decoder: Mutex::new(decoder),
                shadow: Mutex::new(shadow),
                packet_cv: Condvar::new(),
                callbacks: Mutex::new(Callbacks::default()),
                handle,
                listener: Mutex::new(None),
                streaming: AtomicBool::new(false),
                active: AtomicBool::new(false),
                dead: AtomicBool::new(false),
                shm: Mutex::new(shm),
                reply,
                clock_offset_us,
                local,
            }),
        })
    }

    // ------------------------------------------------------------------
    // 清单 / 状态访问
    // ------------------------------------------------------------------

    pub fn protocol_version(&self) -> u32 {
        self.inner.reply.version
    }

    pub fn capability_flags(&self) -> u32 {
        self.inner.reply.flags
    }

    pub fn layout(&self) -> DeviceLayout {
        self.inner.reply.layout
    }

    pub fn virtual_devices(&self) -> &[VirtualDeviceDescriptor] {
        &self.inner.reply.virtual_devices
    }

    pub fn hmd_count(&self) -> u32 {
        self.inner.reply.hmd_count
    }

    pub fn power_feature_count(&self) -> u32 {
        self.inner.reply.power_features
    }

    pub fn haptic_feature_count(&self) -> u32 {
        self.inner.reply.haptic_features
    }

    /// 握手测得的时钟偏移（服务端减本端，微秒）
    pub fn clock_offset_us(&self) -> i64 {
        self.inner.clock_offset_us
    }

    pub fn is_local(&self) -> bool {
        self.inner.local
    }

    /// 共享内存快速路径是否可用
    pub fn has_shared_memory(&self) -> bool {
        self.inner.shm.lock().is_some()
    }

    pub fn is_dead(&self) -> bool {
        self.inner.dead.load(Ordering::Acquire)
    }

    /// 影子状态的当前拷贝（不触发任何网络交互）
    pub fn device_state(&self) -> DeviceState {
        self.inner.shadow.lock().state.clone()
    }

    // ------------------------------------------------------------------
    // 回调安装
    // ------------------------------------------------------------------
    //
    // 回调在派发器线程（流模式）或 RPC 调用方线程上执行，期间持有
    // 回调表锁：回调体内不得再安装回调。

    pub fn on_battery_update(&self, cb: impl FnMut(usize, &BatteryState) + Send + 'static) {
        self.inner.callbacks.lock().battery = Some(Box::new(cb));
    }

    pub fn on_hmd_configuration(&self, cb: impl FnMut(usize, &HmdConfiguration) + Send + 'static) {
        self.inner.callbacks.lock().hmd = Some(Box::new(cb));
    }

    pub fn on_environment(&self, cb: impl FnMut(&EnvironmentDefinition) + Send + 'static) {
        self.inner.callbacks.lock().environment = Some(Box::new(cb));
    }

    pub fn on_error(&self, cb: impl FnMut(&ClientError) + Send + 'static) {
        self.inner.callbacks.lock().error = Some(Box::new(cb));
    }

    // ------------------------------------------------------------------
    // 激活与流
    // ------------------------------------------------------------------

    /// 本地激活门：不产生任何网络交互
    pub fn activate(&self) {
        self.inner.active.store(true, Ordering::Release);
    }

    pub fn deactivate(&self) -> Result<(), ClientError> {
        if self.inner.streaming.load(Ordering::Acquire) {
            return Err(ClientError::StreamingActive);
        }
        self.inner.active.store(false, Ordering::Release);
        Ok(())
    }

    /// 订阅流并把套接字挂上派发器
    pub fn start_stream(
        &self,
        cb: impl FnMut(&DeviceState) + Send + 'static,
    ) -> Result<(), ClientError> {
        let inner = &self.inner;
        if inner.dead.load(Ordering::Acquire) {
            return Err(ClientError::ConnectionDead);
        }
        if !inner.active.load(Ordering::Acquire) {
            return Err(ClientError::NotActive);
        }
        if inner.streaming.swap(true, Ordering::AcqRel) {
            return Err(ClientError::StreamingActive);
        }
        inner.callbacks.lock().packet = Some(Box::new(cb));
        if let Err(e) = inner.send(&Message::StartStream) {
            inner.streaming.store(false, Ordering::Release);
            return Err(e);
        }

        let weak: Weak<ClientInner> = Arc::downgrade(inner);
        let key = inner.handle.add_io_listener(
            inner.socket.as_raw_fd(),
            Interest::READ,
            Box::new(move |ev| match weak.upgrade() {
                Some(inner) => {
                    if !inner.on_readable() {
                        ev.remove_listener();
                    }
                },
                None => ev.remove_listener(),
            }),
        );
        *inner.listener.lock() = Some(key);
        debug!("streaming started");
        Ok(())
    }

    /// 退订流并把套接字收回来；未在流模式时为空操作
    pub fn stop_stream(&self) -> Result<(), ClientError> {
        let inner = &self.inner;
        if !inner.streaming.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(key) = inner.listener.lock().take() {
            inner.handle.remove_io_listener(key);
        }
        if !inner.dead.load(Ordering::Acquire) {
            inner.send(&Message::StopStream)?;
        }
        debug!("streaming stopped");
        Ok(())
    }

    // ------------------------------------------------------------------
    // 取包
    // ------------------------------------------------------------------

    /// 阻塞到恰好一包完整状态进入影子并返回其拷贝
    ///
    /// 非流模式发出一次 PACKET 请求；流模式等待派发器线程收下一包。
    pub fn get_packet(&self) -> Result<DeviceState, ClientError> {
        let inner = &self.inner;
        if inner.dead.load(Ordering::Acquire) {
            return Err(ClientError::ConnectionDead);
        }
        if inner.streaming.load(Ordering::Acquire) {
            let mut shadow = inner.shadow.lock();
            let start = shadow.serial;
            while shadow.serial == start {
                if inner.dead.load(Ordering::Acquire) {
                    return Err(ClientError::ConnectionDead);
                }
                inner.packet_cv.wait(&mut shadow);
            }
            return Ok(shadow.state.clone());
        }
        let state = inner.rpc(&Message::PacketRequest, |msg| match msg {
            Message::Packet(state) => Ok(state),
            other => Err(other),
        })?;
        Ok(inner.ingest_packet(state, false))
    }

    /// 共享内存快速路径：从段里直接把最新状态解进影子
    ///
    /// 返回 `Ok(false)` 表示写端尚未发布过任何状态。
    pub fn update_device_states(&self) -> Result<bool, ClientError> {
        let inner = &self.inner;
        if inner.dead.load(Ordering::Acquire) {
            return Err(ClientError::ConnectionDead);
        }
        let mut guard = inner.shm.lock();
        let Some(fast) = guard.as_mut() else {
            return Err(ClientError::ShmUnavailable);
        };
        if fast.reader.read_blob(&mut fast.scratch)? == 0 {
            return Ok(false);
        }
        {
            let mut shadow = inner.shadow.lock();
            decode_packet_into(&fast.scratch, &mut shadow.state)?;
            shadow.serial += 1;
        }
        inner.packet_cv.notify_all();
        Ok(true)
    }

    // ------------------------------------------------------------------
    // 能力请求（fire-and-forget）与阻塞 RPC
    // ------------------------------------------------------------------

    pub fn power_off(&self, feature: usize) -> Result<(), ClientError> {
        self.inner.send(&Message::PowerOff {
            feature: feature as u32,
        })
    }

    pub fn haptic_tick(&self, feature: usize, duration_ms: u32) -> Result<(), ClientError> {
        self.inner.send(&Message::HapticTick {
            feature: feature as u32,
            duration_ms,
        })
    }

    pub fn get_base_stations(&self) -> Result<Vec<BaseStation>, ClientError> {
        self.inner
            .rpc(&Message::BaseStationsRequest, |msg| match msg {
                Message::BaseStationsReply(stations) => Ok(stations),
                other => Err(other),
            })
    }

    pub fn get_environment(&self) -> Result<EnvironmentDefinition, ClientError> {
        self.inner.rpc(&Message::EnvironmentRequest, |msg| match msg {
            Message::EnvironmentReply(env) => Ok(env),
            other => Err(other),
        })
    }

    pub fn update_environment(&self, env: EnvironmentDefinition) -> Result<(), ClientError> {
        self.inner
            .rpc(&Message::EnvironmentUpdateRequest(env), |msg| match msg {
                Message::EnvironmentUpdateReply => Ok(()),
                other => Err(other),
            })
    }
}

impl Drop for VrClient {
    fn drop(&mut self) {
        let _ = self.stop_stream();
    }
}

fn nix_io(e: nix::Error) -> ClientError {
    ClientError::Io(std::io::Error::from(e))
}

fn write_all_fd(fd: &OwnedFd, mut bytes: &[u8]) -> Result<(), ClientError> {
    while !bytes.is_empty() {
        match nix::unistd::write(fd.as_fd(), bytes) {
            Ok(0) => return Err(ClientError::ConnectionDead),
            Ok(n) => bytes = &bytes[n..],
            Err(Errno::EINTR) => continue,
            Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => {
                return Err(ClientError::ConnectionDead);
            },
            Err(e) => return Err(ClientError::Io(std::io::Error::from(e))),
        }
    }
    Ok(())
}

fn read_message_fd(fd: &OwnedFd, decoder: &mut FrameDecoder) -> Result<Message, ClientError> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(msg) = decoder.next()? {
            return Ok(msg);
        }
        match nix::unistd::read(fd.as_fd(), &mut chunk) {
            Ok(0) => return Err(ClientError::ConnectionDead),
            Ok(n) => decoder.extend(&chunk[..n]),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(ClientError::Io(std::io::Error::from(e))),
        }
    }
}
