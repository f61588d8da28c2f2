//! 流分发枢纽：有线协议的服务端
//!
//! 枢纽在派发器线程上运行：监听套接字和每条连接都注册为 IO
//! 监听器。驱动线程一侧通过 [`Streamer`] 回调进来——frame-complete
//! 等推送事件经 crossbeam 通道移交，配合一次 signal raise 唤醒
//! 派发器线程做真正的多路分发。共享可变状态集中在一把
//! `parking_lot::Mutex` 里，只在派发器线程和 Streamer 回调两处短暂
//! 持有。
//!
//! 每条连接是一个小状态机：第一条消息必须是 CONNECT，否则断开；
//! 之后服务一次性 PACKET 请求、流订阅和各 RPC。部分写入通过
//! per-connection 输出缓冲加写兴趣切换吸收。

use crate::error::ServerError;
use crate::manager::{DeviceManager, Streamer};
use bytes::{Buf, BytesMut};
use crossbeam_channel::{Receiver, Sender};
use nix::errno::Errno;
use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::TcpListener;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use vrlink_dispatch::{DispatcherHandle, EventDispatcher, Interest, IoEvent, ListenerKey};
use vrlink_protocol::{
    BatteryState, CAP_SHARED_MEMORY, CAP_TIMESTAMPS, CAP_VALID_FLAGS, ConnectReply, DeviceState,
    EnvironmentDefinition, FrameDecoder, HmdConfiguration, Message, PROTOCOL_VERSION,
    encode_message,
};

/// 枢纽监听配置
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    /// TCP 监听地址（host, port）；port 0 表示临时端口
    pub tcp: Option<(String, u16)>,
    /// 路径型 Unix 套接字
    pub unix_path: Option<PathBuf>,
    /// 抽象命名空间 Unix 套接字（不含前导 NUL）
    pub unix_abstract: Option<String>,
}

/// 驱动线程 → 派发器线程的推送事件
enum PushEvent {
    Frame(DeviceState),
    Battery { device: usize, state: BatteryState },
    Hmd { index: usize, config: HmdConfiguration },
    Environment(EnvironmentDefinition),
}

/// Manager streamer 槽位的枢纽实现
///
/// 在驱动线程上、状态锁持有期间被调用，因此只做通道投递加一次
/// signal raise，绝不碰枢纽锁。
struct HubStreamer {
    tx: Sender<PushEvent>,
    handle: DispatcherHandle,
    signal: ListenerKey,
}

impl HubStreamer {
    fn push(&self, event: PushEvent) {
        if self.tx.send(event).is_ok() {
            self.handle.raise(self.signal);
        }
    }
}

impl Streamer for HubStreamer {
    fn frame_complete(&mut self, state: &DeviceState) {
        self.push(PushEvent::Frame(state.clone()));
    }

    fn battery_updated(&mut self, device: usize, state: &BatteryState) {
        self.push(PushEvent::Battery {
            device,
            state: *state,
        });
    }

    fn hmd_configuration_updated(&mut self, index: usize, config: &HmdConfiguration) {
        self.push(PushEvent::Hmd {
            index,
            config: *config,
        });
    }

    fn environment_updated(&mut self, env: &EnvironmentDefinition) {
        self.push(PushEvent::Environment(env.clone()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// 握手未完成；只接受 CONNECT
    AwaitConnect,
    Ready,
}

struct Connection {
    socket: OwnedFd,
    key: ListenerKey,
    decoder: FrameDecoder,
    outbuf: BytesMut,
    state: ConnState,
    streaming: bool,
    /// Unix 传输 = 同机；决定是否下发共享内存段名
    local: bool,
}

struct HubShared {
    manager: Arc<DeviceManager>,
    handle: DispatcherHandle,
    connections: HashMap<u64, Connection>,
    next_conn: u64,
    push_rx: Receiver<PushEvent>,
    self_weak: Weak<Mutex<HubShared>>,
}

impl HubShared {
    fn register_connection(&mut self, socket: OwnedFd, local: bool) {
        let id = self.next_conn;
        self.next_conn += 1;
        let raw = socket.as_raw_fd();
        let weak = self.self_weak.clone();
        let key = self.handle.add_io_listener(
            raw,
            Interest::READ,
            Box::new(move |ev| match weak.upgrade() {
                Some(shared) => shared.lock().on_io(id, ev),
                None => ev.remove_listener(),
            }),
        );
        self.connections.insert(
            id,
            Connection {
                socket,
                key,
                decoder: FrameDecoder::new(),
                outbuf: BytesMut::new(),
                state: ConnState::AwaitConnect,
                streaming: false,
                local,
            },
        );
        debug!(id, local, "client connected");
    }

    /// 连接 IO 回调主体（派发器线程）
    fn on_io(&mut self, id: u64, ev: &mut IoEvent) {
        if ev.ready.exception() {
            self.drop_connection(id);
            ev.remove_listener();
            return;
        }
        if ev.ready.readable() && !self.handle_readable(id) {
            self.drop_connection(id);
            ev.remove_listener();
            return;
        }
        if ev.ready.writable() && !self.flush(id) {
            self.drop_connection(id);
            ev.remove_listener();
            return;
        }
        match self.connections.get(&id) {
            Some(c) if c.outbuf.is_empty() => ev.set_interest(Interest::READ),
            Some(_) => ev.set_interest(Interest::READ_WRITE),
            None => ev.remove_listener(),
        }
    }

    /// 读尽套接字并处理凑齐的消息；false 表示连接应当关闭
    fn handle_readable(&mut self, id: u64) -> bool {
        let msgs = {
            let Some(conn) = self.connections.get_mut(&id) else {
                return false;
            };
            let mut chunk = [0u8; 4096];
            loop {
                match nix::unistd::read(conn.socket.as_fd(), &mut chunk) {
                    Ok(0) => {
                        debug!(id, "peer closed connection");
                        return false;
                    },
                    Ok(n) => conn.decoder.extend(&chunk[..n]),
                    Err(Errno::EAGAIN) => break,
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        warn!(id, "socket read failed: {e}");
                        return false;
                    },
                }
            }
            let mut msgs = Vec::new();
            loop {
                match conn.decoder.next() {
                    Ok(Some(msg)) => msgs.push(msg),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(id, "protocol error from client: {e}");
                        return false;
                    },
                }
            }
            msgs
        };
        for msg in msgs {
            if !self.handle_message(id, msg) {
                return false;
            }
        }
        self.flush(id)
    }

    fn handle_message(&mut self, id: u64, msg: Message) -> bool {
        let Some(conn) = self.connections.get_mut(&id) else {
            return false;
        };
        let state = conn.state;
        let local = conn.local;
        match state {
            ConnState::AwaitConnect => match msg {
                Message::Connect { version } => {
                    // 服务端只回报自己能提供的最好版本；取舍由客户端做
                    let negotiated = version.min(PROTOCOL_VERSION);
                    debug!(id, client = version, negotiated, "handshake");
                    conn.state = ConnState::Ready;
                    let reply = self.build_connect_reply(negotiated, local);
                    self.queue(id, &Message::ConnectReply(reply));
                    true
                },
                other => {
                    warn!(id, opcode = ?other.opcode(), "first message must be CONNECT");
                    false
                },
            },
            ConnState::Ready => match msg {
                Message::StartStream => {
                    debug!(id, "stream started");
                    conn.streaming = true;
                    true
                },
                Message::StopStream => {
                    debug!(id, "stream stopped");
                    conn.streaming = false;
                    true
                },
                Message::PacketRequest => {
                    let snapshot = self.manager.state_snapshot();
                    self.queue(id, &Message::Packet(snapshot));
                    true
                },
                Message::PowerOff { feature } => {
                    if let Err(e) = self.manager.power_off(feature as usize) {
                        warn!(id, feature, "power-off rejected: {e}");
                    }
                    true
                },
                Message::HapticTick {
                    feature,
                    duration_ms,
                } => {
                    if let Err(e) = self.manager.haptic_tick(feature as usize, duration_ms) {
                        warn!(id, feature, "haptic tick rejected: {e}");
                    }
                    true
                },
                Message::BaseStationsRequest => {
                    let stations = self.manager.base_stations();
                    self.queue(id, &Message::BaseStationsReply(stations));
                    true
                },
                Message::EnvironmentRequest => {
                    let env = self.manager.environment();
                    self.queue(id, &Message::EnvironmentReply(env));
                    true
                },
                Message::EnvironmentUpdateRequest(env) => {
                    self.manager.update_environment(env);
                    self.queue(id, &Message::EnvironmentUpdateReply);
                    true
                },
                other => {
                    warn!(id, opcode = ?other.opcode(), "unexpected message from client");
                    false
                },
            },
        }
    }

    fn build_connect_reply(&self, version: u32, local: bool) -> ConnectReply {
        let shm = if local { self.manager.shm_info() } else { None };
        let mut flags = CAP_TIMESTAMPS | CAP_VALID_FLAGS;
        if shm.is_some() {
            flags |= CAP_SHARED_MEMORY;
        }
        ConnectReply {
            version,
            flags,
            layout: self.manager.layout(),
            virtual_devices: self.manager.virtual_devices().to_vec(),
            hmd_count: self.manager.hmd_count() as u32,
            power_features: self.manager.power_feature_count() as u32,
            haptic_features: self.manager.haptic_feature_count() as u32,
            shm,
            server_time_us: self.manager.now_us(),
        }
    }

    fn queue(&mut self, id: u64, msg: &Message) {
        if let Some(conn) = self.connections.get_mut(&id) {
            encode_message(msg, &mut conn.outbuf);
        }
    }

    /// 把输出缓冲尽量写出；false 表示连接应当关闭
    fn flush(&mut self, id: u64) -> bool {
        let Some(conn) = self.connections.get_mut(&id) else {
            return false;
        };
        while !conn.outbuf.is_empty() {
            match nix::unistd::write(conn.socket.as_fd(), &conn.outbuf) {
                Ok(0) => return false,
                Ok(n) => conn.outbuf.advance(n),
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => {
                    debug!(id, "peer went away during write");
                    return false;
                },
                Err(e) => {
                    warn!(id, "socket write failed: {e}");
                    return false;
                },
            }
        }
        true
    }

    fn drop_connection(&mut self, id: u64) {
        if self.connections.remove(&id).is_some() {
            debug!(id, "connection closed");
        }
    }

    /// 推送信号回调：排空通道，扇出到所有流订阅连接
    fn pump_pushes(&mut self) {
        let mut scratch = BytesMut::new();
        while let Ok(event) = self.push_rx.try_recv() {
            scratch.clear();
            let msg = match event {
                PushEvent::Frame(state) => Message::Packet(state),
                PushEvent::Battery { device, state } => Message::BatteryUpdate {
                    device: device as u32,
                    state,
                },
                PushEvent::Hmd { index, config } => Message::HmdConfigUpdate {
                    index: index as u32,
                    config,
                },
                PushEvent::Environment(env) => Message::EnvironmentPush(env),
            };
            encode_message(&msg, &mut scratch);
            for conn in self.connections.values_mut() {
                if conn.streaming {
                    conn.outbuf.extend_from_slice(&scratch);
                }
            }
        }

        // 推送发生在连接自己的 IO 回调之外，兴趣切换和关闭走控制句柄
        let pending: Vec<u64> = self
            .connections
            .iter()
            .filter(|(_, c)| !c.outbuf.is_empty())
            .map(|(&id, _)| id)
            .collect();
        for id in pending {
            if !self.flush(id) {
                if let Some(conn) = self.connections.remove(&id) {
                    self.handle.remove_io_listener(conn.key);
                    debug!(id, "connection closed");
                }
                continue;
            }
            if let Some(conn) = self.connections.get(&id) {
                let interest = if conn.outbuf.is_empty() {
                    Interest::READ
                } else {
                    Interest::READ_WRITE
                };
                self.handle.set_io_interest(conn.key, interest);
            }
        }
    }
}

/// 流分发枢纽句柄
pub struct Hub {
    shared: Arc<Mutex<HubShared>>,
    tcp_port: Option<u16>,
}

impl Hub {
    /// 绑定监听器并把自己装进 Manager 的 streamer 槽位
    ///
    /// 必须在派发循环启动之前、同一线程上调用。
    pub fn bind(
        manager: Arc<DeviceManager>,
        dispatcher: &mut EventDispatcher,
        config: &HubConfig,
    ) -> Result<Self, ServerError> {
        let handle = dispatcher.handle();
        let (push_tx, push_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Mutex::new(HubShared {
            manager: manager.clone(),
            handle: handle.clone(),
            connections: HashMap::new(),
            next_conn: 1,
            push_rx,
            self_weak: Weak::new(),
        }));
        shared.lock().self_weak = Arc::downgrade(&shared);

        let signal_weak = Arc::downgrade(&shared);
        let signal_key = dispatcher.add_signal_listener(Box::new(move |_| {
            if let Some(shared) = signal_weak.upgrade() {
                shared.lock().pump_pushes();
            }
        }));
        manager.set_streamer(Box::new(HubStreamer {
            tx: push_tx,
            handle,
            signal: signal_key,
        }));

        let mut tcp_port = None;
        if let Some((host, port)) = &config.tcp {
            let listener =
                TcpListener::bind((host.as_str(), *port)).map_err(ServerError::SocketSetup)?;
            listener
                .set_nonblocking(true)
                .map_err(ServerError::SocketSetup)?;
            let bound = listener
                .local_addr()
                .map_err(ServerError::SocketSetup)?
                .port();
            info!(host = %host, port = bound, "TCP listener bound");
            tcp_port = Some(bound);
            Self::register_acceptor(dispatcher, &shared, listener.into(), false);
        }
        if let Some(path) = &config.unix_path {
            // 上次异常退出可能留下陈旧的套接字文件
            let _ = std::fs::remove_file(path);
            let fd = unix_listener_fd()?;
            let addr = UnixAddr::new(path.as_path()).map_err(sock_err)?;
            socket::bind(fd.as_raw_fd(), &addr).map_err(sock_err)?;
            socket::listen(&fd, Backlog::MAXCONN).map_err(sock_err)?;
            info!(path = %path.display(), "Unix listener bound");
            Self::register_acceptor(dispatcher, &shared, fd, true);
        }
        if let Some(name) = &config.unix_abstract {
            let fd = unix_listener_fd()?;
            let addr = UnixAddr::new_abstract(name.as_bytes()).map_err(sock_err)?;
            socket::bind(fd.as_raw_fd(), &addr).map_err(sock_err)?;
            socket::listen(&fd, Backlog::MAXCONN).map_err(sock_err)?;
            info!(name = %name, "abstract Unix listener bound");
            Self::register_acceptor(dispatcher, &shared, fd, true);
        }

        Ok(Self { shared, tcp_port })
    }

    /// 实际绑定的 TCP 端口（请求临时端口时从这里取回）
    pub fn tcp_port(&self) -> Option<u16> {
        self.tcp_port
    }

    pub fn connection_count(&self) -> usize {
        self.shared.lock().connections.len()
    }

    fn register_acceptor(
        dispatcher: &mut EventDispatcher,
        shared: &Arc<Mutex<HubShared>>,
        listener: OwnedFd,
        local: bool,
    ) {
        let weak = Arc::downgrade(shared);
        let raw = listener.as_raw_fd();
        dispatcher.add_io_listener(
            raw,
            Interest::READ,
            Box::new(move |ev| {
                // 监听器 fd 的所有权在闭包里，随监听器一起存活
                let _keep = &listener;
                let Some(shared) = weak.upgrade() else {
                    ev.remove_listener();
                    return;
                };
                loop {
                    match socket::accept4(raw, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
                        Ok(fd) => {
                            let socket = unsafe { OwnedFd::from_raw_fd(fd) };
                            shared.lock().register_connection(socket, local);
                        },
                        Err(Errno::EAGAIN) => break,
                        Err(Errno::EINTR) => continue,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            break;
                        },
                    }
                }
            }),
        );
    }
}

fn unix_listener_fd() -> Result<OwnedFd, ServerError> {
    socket::socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(sock_err)
}

fn sock_err(e: nix::Error) -> ServerError {
    ServerError::SocketSetup(std::io::Error::from(e))
}
