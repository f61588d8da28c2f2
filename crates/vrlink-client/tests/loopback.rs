//! 客户端 ↔ 枢纽环回集成测试
//!
//! 每个用例起一个真实的服务端（后台线程上跑派发循环），客户端
//! 从本进程连接，覆盖握手、一次性取包、流模式、RPC 互斥与共享
//! 内存快速路径。

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use serial_test::serial;
use vrlink_client::{ClientError, VrClient};
use vrlink_dispatch::{DispatcherHandle, EventDispatcher};
use vrlink_protocol::{
    encode_message, BaseStation, BatteryState, ConnectReply, DeviceLayout, EnvironmentDefinition,
    Message, Pose, ProtocolError, TrackerState, VirtualDeviceDescriptor, CAP_SHARED_MEMORY,
    CAP_TIMESTAMPS, PROTOCOL_VERSION,
};
use vrlink_server::{DeviceAllocator, DeviceManager, Hub, HubConfig};

/// 后台线程上的完整服务端；Drop 时停派发循环并回收线程
struct TestServer {
    manager: Arc<DeviceManager>,
    handle: DispatcherHandle,
    tcp_port: Option<u16>,
    unix_path: Option<PathBuf>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn spawn(layout: DeviceLayout, unix_path: Option<PathBuf>, shm: bool) -> Self {
        let (tx, rx) = mpsc::channel();
        let config = HubConfig {
            tcp: Some(("127.0.0.1".into(), 0)),
            unix_path: unix_path.clone(),
            unix_abstract: None,
        };
        let thread = thread::Builder::new()
            .name("hub".into())
            .spawn(move || {
                let mut dispatcher = EventDispatcher::new().unwrap();
                let mut alloc = DeviceAllocator::new();
                let trackers = alloc.allocate_trackers(layout.trackers);
                alloc.allocate_buttons(layout.buttons);
                alloc.allocate_valuators(layout.valuators);
                alloc.add_virtual_device(VirtualDeviceDescriptor {
                    name: "loopback-device".into(),
                    tracker_index: trackers.clone().next(),
                    has_battery: true,
                    ..Default::default()
                });
                let manager = Arc::new(alloc.into_manager(Vec::new()));
                if shm {
                    manager.enable_shared_memory().unwrap();
                }
                let hub = Hub::bind(manager.clone(), &mut dispatcher, &config).unwrap();
                tx.send((manager, dispatcher.handle(), hub.tcp_port()))
                    .unwrap();
                dispatcher.run().unwrap();
            })
            .unwrap();
        let (manager, handle, tcp_port) = rx.recv().unwrap();
        Self {
            manager,
            handle,
            tcp_port,
            unix_path,
            thread: Some(thread),
        }
    }

    fn port(&self) -> u16 {
        self.tcp_port.unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        if let Some(path) = &self.unix_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// 不打算跑起来的派发器：非流模式的客户端只需要一个句柄
fn idle_handle() -> (EventDispatcher, DispatcherHandle) {
    let dispatcher = EventDispatcher::new().unwrap();
    let handle = dispatcher.handle();
    (dispatcher, handle)
}

fn small_layout() -> DeviceLayout {
    DeviceLayout {
        trackers: 2,
        buttons: 2,
        valuators: 1,
    }
}

#[test]
fn test_handshake_and_one_shot_packet() {
    let server = TestServer::spawn(small_layout(), None, false);
    server.manager.set_tracker_state(0, TrackerState {
        pose: Pose {
            position: [1.0, 2.0, 3.0],
            orientation: [0.0, 0.0, 0.0, 1.0],
        },
        timestamp_us: 1_000_000,
        valid: true,
    });
    server.manager.set_button_state(1, true);
    server.manager.set_valuator_state(0, 0.25);

    let (_dispatcher, handle) = idle_handle();
    let client = VrClient::connect_tcp("127.0.0.1", server.port(), &handle).unwrap();
    assert_eq!(client.protocol_version(), PROTOCOL_VERSION);
    assert_eq!(client.layout(), small_layout());
    assert_ne!(client.capability_flags() & CAP_TIMESTAMPS, 0);
    assert!(!client.is_local());
    assert!(!client.has_shared_memory());

    let state = client.get_packet().unwrap();
    assert_eq!(state.trackers[0].pose.position, [1.0, 2.0, 3.0]);
    assert!(state.trackers[0].valid);
    assert!(!state.trackers[1].valid);
    assert_eq!(state.buttons, vec![false, true]);
    assert_eq!(state.valuators, vec![0.25]);

    // 影子状态与返回值一致
    assert_eq!(client.device_state(), state);
}

#[test]
fn test_client_rejects_newer_server_version() {
    // 假服务端：握手报一个比客户端上限还高的版本号
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let fake = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut buf = [0u8; 64];
        let _ = sock.read(&mut buf).unwrap();
        let mut out = BytesMut::new();
        encode_message(
            &Message::ConnectReply(ConnectReply {
                version: PROTOCOL_VERSION + 1,
                ..Default::default()
            }),
            &mut out,
        );
        sock.write_all(&out).unwrap();
        let _ = sock.read(&mut buf);
    });

    let (_dispatcher, handle) = idle_handle();
    let err = VrClient::connect_tcp("127.0.0.1", port, &handle).unwrap_err();
    match err {
        ClientError::Protocol(ProtocolError::VersionMismatch { server, supported }) => {
            assert_eq!(server, PROTOCOL_VERSION + 1);
            assert_eq!(supported, PROTOCOL_VERSION);
        },
        other => panic!("expected version mismatch, got {other}"),
    }
    fake.join().unwrap();
}

#[test]
fn test_streaming_packets_and_battery_push() {
    let server = TestServer::spawn(
        DeviceLayout {
            trackers: 1,
            buttons: 0,
            valuators: 0,
        },
        None,
        false,
    );

    // 客户端派发器在后台线程上跑，测试线程只做阻塞调用
    let mut dispatcher = EventDispatcher::new().unwrap();
    let handle = dispatcher.handle();
    let disp_thread = thread::spawn(move || dispatcher.run().unwrap());

    let client = VrClient::connect_tcp("127.0.0.1", server.port(), &handle).unwrap();

    // 未激活时拒绝开流
    assert!(matches!(
        client.start_stream(|_| {}),
        Err(ClientError::NotActive)
    ));

    let packets = Arc::new(AtomicUsize::new(0));
    let (battery_tx, battery_rx) = mpsc::channel();
    client.on_battery_update(move |device, state| {
        battery_tx.send((device, state.percent)).unwrap();
    });
    client.activate();
    let counter = packets.clone();
    client
        .start_stream(move |state| {
            assert!(state.trackers[0].valid);
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

    // 驱动线程按完整帧节奏推状态
    let stop = Arc::new(AtomicBool::new(false));
    let driver = {
        let manager = server.manager.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut ts = 1u64;
            while !stop.load(Ordering::Relaxed) {
                manager.set_tracker_state(0, TrackerState {
                    timestamp_us: ts,
                    valid: true,
                    ..Default::default()
                });
                ts += 1;
                thread::sleep(Duration::from_millis(2));
            }
        })
    };

    // 流模式下 get_packet 等派发器线程收下一包
    let first = client.get_packet().unwrap();
    assert!(first.trackers[0].valid);

    let deadline = Instant::now() + Duration::from_secs(5);
    while packets.load(Ordering::Relaxed) < 5 {
        assert!(Instant::now() < deadline, "streamed packets never arrived");
        thread::sleep(Duration::from_millis(5));
    }

    // 流模式下拒绝阻塞 RPC
    assert!(matches!(
        client.get_base_stations(),
        Err(ClientError::StreamingActive)
    ));
    assert!(matches!(
        client.deactivate(),
        Err(ClientError::StreamingActive)
    ));

    // 元数据推送走独立回调
    server.manager.set_battery_state(0, BatteryState {
        percent: 42,
        charging: true,
    });
    let (device, percent) = battery_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("battery push never arrived");
    assert_eq!(device, 0);
    assert_eq!(percent, 42);

    stop.store(true, Ordering::Relaxed);
    driver.join().unwrap();
    client.stop_stream().unwrap();
    client.deactivate().unwrap();

    handle.stop();
    disp_thread.join().unwrap();
}

#[test]
fn test_environment_and_base_station_rpcs() {
    let server = TestServer::spawn(small_layout(), None, false);
    server.manager.set_base_stations(vec![BaseStation {
        serial: "LHB-TEST01".into(),
        tracking_radius_m: 6.0,
        pose_valid: true,
        ..Default::default()
    }]);

    let (_dispatcher, handle) = idle_handle();
    let client = VrClient::connect_tcp("127.0.0.1", server.port(), &handle).unwrap();

    let stations = client.get_base_stations().unwrap();
    assert_eq!(stations.len(), 1);
    assert_eq!(stations[0].serial, "LHB-TEST01");

    let env = EnvironmentDefinition {
        unit_scale_m: 0.0254,
        radius: 3.0,
        center: [0.5, 0.0, -0.5],
        ..Default::default()
    };
    client.update_environment(env.clone()).unwrap();
    assert_eq!(client.get_environment().unwrap(), env);
    assert_eq!(server.manager.environment(), env);
}

#[test]
#[serial]
fn test_unix_shm_fast_path() {
    let sock_path =
        std::env::temp_dir().join(format!("vrlink-loopback-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&sock_path);
    let server = TestServer::spawn(small_layout(), Some(sock_path.clone()), true);

    let (_dispatcher, handle) = idle_handle();
    let client = VrClient::connect_unix(&sock_path, false, &handle).unwrap();
    assert!(client.is_local());
    assert_ne!(client.capability_flags() & CAP_SHARED_MEMORY, 0);
    assert!(client.has_shared_memory());
    // 同机连接不做时钟校正
    assert_eq!(client.clock_offset_us(), 0);

    // 写端尚未发布
    assert!(!client.update_device_states().unwrap());

    server.manager.set_tracker_state(1, TrackerState {
        pose: Pose {
            position: [0.0, 1.8, 0.0],
            orientation: [0.0, 0.0, 0.0, 1.0],
        },
        timestamp_us: 777,
        valid: true,
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if client.update_device_states().unwrap() {
            break;
        }
        assert!(Instant::now() < deadline, "publish never became visible");
        thread::sleep(Duration::from_millis(1));
    }
    let state = client.device_state();
    assert_eq!(state.trackers[1].pose.position, [0.0, 1.8, 0.0]);
    assert_eq!(state.trackers[1].timestamp_us, 777);
    assert!(state.trackers[1].valid);
}

#[test]
fn test_streaming_failure_fires_error_callback_once() {
    let server = TestServer::spawn(small_layout(), None, false);

    let mut dispatcher = EventDispatcher::new().unwrap();
    let handle = dispatcher.handle();
    let disp_thread = thread::spawn(move || dispatcher.run().unwrap());

    let client = Arc::new(VrClient::connect_tcp("127.0.0.1", server.port(), &handle).unwrap());
    let errors = Arc::new(AtomicUsize::new(0));
    let (err_tx, err_rx) = mpsc::channel();
    {
        let errors = errors.clone();
        client.on_error(move |_| {
            errors.fetch_add(1, Ordering::Relaxed);
            err_tx.send(()).unwrap();
        });
    }
    client.activate();
    client.start_stream(|_| {}).unwrap();

    // 一个等待者先挂在流模式 get_packet 上；服务端不推任何包
    let (wait_tx, wait_rx) = mpsc::channel();
    let waiter = {
        let client = client.clone();
        thread::spawn(move || {
            wait_tx.send(client.get_packet()).unwrap();
        })
    };
    thread::sleep(Duration::from_millis(50));

    // 服务端整体下线：派发器线程读到 EOF，错误回调触发
    drop(server);
    err_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("error callback never fired");
    assert!(client.is_dead());

    // 判死必须唤醒阻塞中的等待者
    let blocked = wait_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("blocked get_packet never woke up");
    assert!(matches!(blocked, Err(ClientError::ConnectionDead)));
    waiter.join().unwrap();

    // 后续调用即时报死，回调不再触发
    assert!(matches!(
        client.get_packet(),
        Err(ClientError::ConnectionDead)
    ));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(errors.load(Ordering::Relaxed), 1);

    handle.stop();
    disp_thread.join().unwrap();
}

#[test]
fn test_dead_connection_makes_calls_inert() {
    let server = TestServer::spawn(small_layout(), None, false);
    let (_dispatcher, handle) = idle_handle();
    let client = VrClient::connect_tcp("127.0.0.1", server.port(), &handle).unwrap();

    // 服务端整体下线后，下一次阻塞请求判死
    drop(server);
    let err = client.get_packet().unwrap_err();
    assert!(matches!(
        err,
        ClientError::ConnectionDead | ClientError::Io(_)
    ));
    assert!(client.is_dead());
    assert!(matches!(
        client.get_environment(),
        Err(ClientError::ConnectionDead)
    ));
    assert!(matches!(
        client.power_off(0),
        Err(ClientError::ConnectionDead)
    ));
}
