//! vrlinkd：跟踪状态守护进程
//!
//! 启动流程：解析配置 → 构建设备模块与聚合状态 → 绑定监听器 →
//! 启动驱动线程 → 进入派发循环。Ctrl+C 停循环后统一收尾。
//!
//! ```bash
//! vrlinkd --config /etc/vrlink/daemon.toml
//! vrlinkd --tcp 0.0.0.0:8555 --unix /run/vrlink.sock --shm
//! ```

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};
use vrlink_dispatch::EventDispatcher;
use vrlink_server::{DeviceAllocator, DeviceManager, Hub, HubConfig, ModuleConfig, ModuleRegistry};

/// VRLink 跟踪状态守护进程
#[derive(Parser, Debug)]
#[command(name = "vrlinkd")]
#[command(about = "VRLink tracking state daemon", long_about = None)]
#[command(version)]
struct Args {
    /// 配置文件路径（toml）
    #[arg(long)]
    config: Option<PathBuf>,

    /// TCP 监听地址（覆盖配置文件）
    ///
    /// 格式: IP:PORT (例如: 127.0.0.1:8555)
    #[arg(long)]
    tcp: Option<String>,

    /// Unix 域套接字路径（覆盖配置文件）
    #[arg(long)]
    unix: Option<PathBuf>,

    /// 抽象命名空间套接字名（覆盖配置文件）
    #[arg(long = "abstract")]
    abstract_name: Option<String>,

    /// 启用共享内存快速路径
    #[arg(long)]
    shm: bool,

    /// 缺省日志指令（RUST_LOG 优先）
    #[arg(long, default_value = "vrlinkd=info,vrlink_server=info")]
    log: String,
}

/// 配置文件结构
#[derive(Debug, Default, Deserialize)]
struct DaemonConfig {
    #[serde(default)]
    listen: ListenConfig,
    /// `[[module]]` 段，每段一个设备模块实例
    #[serde(default, rename = "module")]
    modules: Vec<ModuleConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct ListenConfig {
    /// "IP:PORT"
    tcp: Option<String>,
    unix_path: Option<PathBuf>,
    unix_abstract: Option<String>,
    #[serde(default)]
    shared_memory: bool,
}

fn parse_tcp(addr: &str) -> Result<(String, u16), Box<dyn std::error::Error>> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| format!("invalid TCP address {addr:?}, expected IP:PORT"))?;
    Ok((host.to_string(), port.parse()?))
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in args.log.split(',') {
        filter = filter.add_directive(directive.parse()?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => toml::from_str::<DaemonConfig>(&std::fs::read_to_string(path)?)?,
        None => DaemonConfig::default(),
    };
    if let Some(tcp) = &args.tcp {
        config.listen.tcp = Some(tcp.clone());
    }
    if let Some(path) = &args.unix {
        config.listen.unix_path = Some(path.clone());
    }
    if let Some(name) = &args.abstract_name {
        config.listen.unix_abstract = Some(name.clone());
    }
    if args.shm {
        config.listen.shared_memory = true;
    }
    if config.listen.tcp.is_none()
        && config.listen.unix_path.is_none()
        && config.listen.unix_abstract.is_none()
    {
        config.listen.tcp = Some("127.0.0.1:8555".into());
    }
    // 无模块配置时起一个模拟模块，方便不接硬件调试客户端
    if config.modules.is_empty() {
        info!("no [[module]] sections configured, starting a single sim module");
        config.modules.push(ModuleConfig {
            kind: "sim".into(),
            ..Default::default()
        });
    }

    let registry = ModuleRegistry::with_builtins();
    let mut alloc = DeviceAllocator::new();
    let modules = registry.build(&config.modules, &mut alloc)?;
    let manager = Arc::new(alloc.into_manager(modules));
    info!(
        layout = ?manager.layout(),
        devices = manager.virtual_devices().len(),
        "device state assembled"
    );

    if config.listen.shared_memory {
        let (name, _fd) = manager.enable_shared_memory()?;
        info!(segment = %name, "shared memory fast path enabled");
    }

    let hub_config = HubConfig {
        tcp: match &config.listen.tcp {
            Some(addr) => Some(parse_tcp(addr)?),
            None => None,
        },
        unix_path: config.listen.unix_path.clone(),
        unix_abstract: config.listen.unix_abstract.clone(),
    };
    let mut dispatcher = EventDispatcher::new()?;
    let hub = Hub::bind(manager.clone(), &mut dispatcher, &hub_config)?;
    if let Some(port) = hub.tcp_port() {
        info!(port, "listening on TCP");
    }

    DeviceManager::start_modules(&manager)?;

    let handle = dispatcher.handle();
    ctrlc::set_handler(move || {
        info!("interrupt received, shutting down");
        handle.stop();
    })?;

    dispatcher.run()?;

    manager.shutdown();
    if let Some(path) = &config.listen.unix_path {
        let _ = std::fs::remove_file(path);
    }
    info!("daemon exited cleanly");
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        error!("daemon failed: {e}");
        eprintln!("vrlinkd: {e}");
        process::exit(1);
    }
}
