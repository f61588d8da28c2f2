//! 设备聚合管理器
//!
//! 各设备驱动线程是进程里仅有的真并发，它们只通过本模块的 setter
//! 触碰规范状态。锁规则：
//!
//! - tracker / button / valuator 聚合数组、上报掩码、streamer 槽位和
//!   共享内存写端都在**单一状态互斥锁**下；
//! - 电池、HMD 配置、基站、环境定义各有独立互斥锁；
//! - 五把锁互不嵌套（辅助 setter 先释放自己的锁，再取状态锁触发
//!   streamer 回调）。
//!
//! 每次 setter 在持锁期间完成：改写单个槽位 → 置上报掩码位 →
//! 重新发布共享内存 → 细粒度 streamer 回调 → 掩码恰好集满（或
//! tracker 数为零）时触发 frame-complete 并清零掩码。

use crate::error::ServerError;
use crate::module::DeviceModule;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};
use vrlink_protocol::{
    BaseStation, BatteryState, DeviceLayout, DeviceState, EnvironmentDefinition, Feature,
    HmdConfiguration, ReportMask, ShmWriter, TrackerState, VirtualDeviceDescriptor, encode_packet,
    packet_len,
};

/// 状态消费者回调集
///
/// Manager 只有一个 streamer 槽位（`Option<Box<dyn Streamer>>`，不是
/// 列表）；多路分发由持有槽位的一方（streaming hub）自行负责。
/// 所有回调都在**状态互斥锁持有期间**、在调用 setter 的驱动线程上
/// 执行，必须保持短小且不得回调 Manager 的 setter。
pub trait Streamer: Send {
    fn tracker_updated(&mut self, _index: usize, _state: &TrackerState) {}
    fn button_updated(&mut self, _index: usize, _pressed: bool) {}
    fn valuator_updated(&mut self, _index: usize, _value: f64) {}
    /// 完整一帧就绪（上报掩码恰好集满，清零之前）
    fn frame_complete(&mut self, _state: &DeviceState) {}
    fn battery_updated(&mut self, _device: usize, _state: &BatteryState) {}
    fn hmd_configuration_updated(&mut self, _index: usize, _config: &HmdConfiguration) {}
    fn environment_updated(&mut self, _env: &EnvironmentDefinition) {}
}

/// 状态互斥锁保护的聚合体
struct TrackingState {
    device: DeviceState,
    mask: ReportMask,
    streamer: Option<Box<dyn Streamer>>,
    shm: Option<ShmWriter>,
    /// 共享内存发布的序列化暂存（避免每次 setter 重新分配）
    scratch: BytesMut,
}

/// 设备聚合管理器
///
/// **生命周期注意**：模块线程持有 `Arc<DeviceManager>`，因此 Drop
/// 永远不会替你停线程——关停必须显式调用 [`DeviceManager::shutdown`]。
pub struct DeviceManager {
    layout: DeviceLayout,
    /// 单调时钟基准；所有 tracker 时间戳都是相对它的微秒数
    epoch: Instant,
    tracking: Mutex<TrackingState>,
    battery: Mutex<Vec<BatteryState>>,
    hmd: Mutex<Vec<HmdConfiguration>>,
    base_stations: Mutex<Vec<BaseStation>>,
    environment: Mutex<EnvironmentDefinition>,
    devices: Vec<VirtualDeviceDescriptor>,
    power_features: Vec<Feature>,
    haptic_features: Vec<Feature>,
    modules: Mutex<Vec<Box<dyn DeviceModule>>>,
    started: AtomicBool,
}

impl DeviceManager {
    /// 由分配结果和模块表组装 Manager；索引空间从此固定
    pub(crate) fn assemble(
        layout: DeviceLayout,
        devices: Vec<VirtualDeviceDescriptor>,
        hmd_count: usize,
        power_features: Vec<Feature>,
        haptic_features: Vec<Feature>,
        modules: Vec<Box<dyn DeviceModule>>,
    ) -> Self {
        info!(
            trackers = layout.trackers,
            buttons = layout.buttons,
            valuators = layout.valuators,
            devices = devices.len(),
            modules = modules.len(),
            "device manager assembled"
        );
        Self {
            layout,
            epoch: Instant::now(),
            tracking: Mutex::new(TrackingState {
                device: DeviceState::new(layout),
                mask: ReportMask::new(layout.trackers),
                streamer: None,
                shm: None,
                scratch: BytesMut::with_capacity(packet_len(layout)),
            }),
            battery: Mutex::new(vec![BatteryState::default(); devices.len()]),
            hmd: Mutex::new(vec![HmdConfiguration::default(); hmd_count]),
            base_stations: Mutex::new(Vec::new()),
            environment: Mutex::new(EnvironmentDefinition::default()),
            devices,
            power_features,
            haptic_features,
            modules: Mutex::new(modules),
            started: AtomicBool::new(false),
        }
    }

    pub fn layout(&self) -> DeviceLayout {
        self.layout
    }

    pub fn virtual_devices(&self) -> &[VirtualDeviceDescriptor] {
        &self.devices
    }

    pub fn hmd_count(&self) -> usize {
        self.hmd.lock().len()
    }

    pub fn power_feature_count(&self) -> usize {
        self.power_features.len()
    }

    pub fn haptic_feature_count(&self) -> usize {
        self.haptic_features.len()
    }

    /// 服务端单调时钟（微秒）；模块线程用它为采样打时间戳
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    // ------------------------------------------------------------------
    // 驱动线程 setter 入口
    // ------------------------------------------------------------------

    pub fn set_tracker_state(&self, index: usize, state: TrackerState) {
        let mut guard = self.tracking.lock();
        let t = &mut *guard;
        if index >= t.device.trackers.len() {
            warn!(index, "tracker index out of range, update dropped");
            return;
        }
        t.device.trackers[index] = state;
        t.mask.set(index);
        if let Some(s) = t.streamer.as_mut() {
            s.tracker_updated(index, &state);
        }
        Self::after_mutation(t);
    }

    /// 驱动断流时把 tracker 标记为无效
    ///
    /// 无效也算"已上报"：一个掉线的 tracker 不能阻塞 frame-complete。
    pub fn disable_tracker(&self, index: usize) {
        let mut guard = self.tracking.lock();
        let t = &mut *guard;
        if index >= t.device.trackers.len() {
            warn!(index, "tracker index out of range, disable dropped");
            return;
        }
        t.device.trackers[index].valid = false;
        t.mask.set(index);
        let state = t.device.trackers[index];
        if let Some(s) = t.streamer.as_mut() {
            s.tracker_updated(index, &state);
        }
        Self::after_mutation(t);
    }

    pub fn set_button_state(&self, index: usize, pressed: bool) {
        let mut guard = self.tracking.lock();
        let t = &mut *guard;
        if index >= t.device.buttons.len() {
            warn!(index, "button index out of range, update dropped");
            return;
        }
        t.device.buttons[index] = pressed;
        if let Some(s) = t.streamer.as_mut() {
            s.button_updated(index, pressed);
        }
        Self::after_mutation(t);
    }

    pub fn set_valuator_state(&self, index: usize, value: f64) {
        let mut guard = self.tracking.lock();
        let t = &mut *guard;
        if index >= t.device.valuators.len() {
            warn!(index, "valuator index out of range, update dropped");
            return;
        }
        t.device.valuators[index] = value;
        if let Some(s) = t.streamer.as_mut() {
            s.valuator_updated(index, value);
        }
        Self::after_mutation(t);
    }

    /// setter 尾段：共享内存重发布 + frame-complete 判定
    fn after_mutation(t: &mut TrackingState) {
        if let Some(shm) = t.shm.as_mut() {
            t.scratch.clear();
            encode_packet(&t.device, &mut t.scratch);
            if let Err(e) = shm.publish(&t.scratch) {
                warn!("shared memory publish failed: {e}");
            }
        }
        // tracker 数为零时掩码恒集满：每次更新都是完整一帧
        if t.mask.is_complete() {
            if let Some(s) = t.streamer.as_mut() {
                s.frame_complete(&t.device);
            }
            t.mask.clear();
        }
    }

    // ------------------------------------------------------------------
    // 辅助元数据（独立互斥锁，幂等更新抑制通知）
    // ------------------------------------------------------------------

    pub fn set_battery_state(&self, device: usize, state: BatteryState) {
        {
            let mut battery = self.battery.lock();
            match battery.get_mut(device) {
                Some(slot) if *slot == state => return,
                Some(slot) => *slot = state,
                None => {
                    warn!(device, "battery update for unknown virtual device");
                    return;
                },
            }
        }
        if let Some(s) = self.tracking.lock().streamer.as_mut() {
            s.battery_updated(device, &state);
        }
    }

    pub fn battery_state(&self, device: usize) -> Option<BatteryState> {
        self.battery.lock().get(device).copied()
    }

    pub fn set_hmd_configuration(&self, index: usize, config: HmdConfiguration) {
        {
            let mut hmd = self.hmd.lock();
            match hmd.get_mut(index) {
                Some(slot) if *slot == config => return,
                Some(slot) => *slot = config,
                None => {
                    warn!(index, "HMD configuration update for unknown unit");
                    return;
                },
            }
        }
        if let Some(s) = self.tracking.lock().streamer.as_mut() {
            s.hmd_configuration_updated(index, &config);
        }
    }

    pub fn hmd_configuration(&self, index: usize) -> Option<HmdConfiguration> {
        self.hmd.lock().get(index).copied()
    }

    pub fn set_base_stations(&self, stations: Vec<BaseStation>) {
        *self.base_stations.lock() = stations;
    }

    pub fn base_stations(&self) -> Vec<BaseStation> {
        self.base_stations.lock().clone()
    }

    pub fn environment(&self) -> EnvironmentDefinition {
        self.environment.lock().clone()
    }

    pub fn update_environment(&self, env: EnvironmentDefinition) {
        {
            let mut current = self.environment.lock();
            if *current == env {
                return;
            }
            *current = env.clone();
        }
        if let Some(s) = self.tracking.lock().streamer.as_mut() {
            s.environment_updated(&env);
        }
    }

    // ------------------------------------------------------------------
    // Streamer / 快照 / 共享内存
    // ------------------------------------------------------------------

    pub fn set_streamer(&self, streamer: Box<dyn Streamer>) {
        self.tracking.lock().streamer = Some(streamer);
    }

    pub fn clear_streamer(&self) {
        self.tracking.lock().streamer = None;
    }

    /// 当前聚合状态的完整拷贝
    pub fn state_snapshot(&self) -> DeviceState {
        self.tracking.lock().device.clone()
    }

    /// 把当前状态按 blob 编码写入 `buf`（PACKET 一次性请求用）
    pub fn encode_state(&self, buf: &mut BytesMut) {
        encode_packet(&self.tracking.lock().device, buf);
    }

    /// 启用共享内存快速路径；必须在模块启动之前调用一次
    ///
    /// 返回段名称（随 CONNECT 回复下发给同机客户端）和段文件描述符
    /// 的副本。段随 Manager 一起 `shm_unlink`。
    pub fn enable_shared_memory(&self) -> Result<(String, OwnedFd), ServerError> {
        if self.started.load(Ordering::Acquire) {
            return Err(ServerError::ModulesStarted);
        }
        let mut t = self.tracking.lock();
        if t.shm.is_some() {
            return Err(ServerError::ShmAlreadyEnabled);
        }
        let name = format!("/vrlink-{}", std::process::id());
        let writer = ShmWriter::create(&name, packet_len(self.layout))?;
        let fd = nix::unistd::dup(writer.fd()).map_err(|e| {
            ServerError::Protocol(vrlink_protocol::ProtocolError::ShmSetup(format!(
                "dup failed: {e}"
            )))
        })?;
        t.shm = Some(writer);
        Ok((name, fd))
    }

    /// 共享内存段的名称与 blob 尺寸（未启用时为 None）
    pub fn shm_info(&self) -> Option<(String, u32)> {
        self.tracking
            .lock()
            .shm
            .as_ref()
            .map(|w| (w.name().to_owned(), w.blob_size() as u32))
    }

    // ------------------------------------------------------------------
    // 能力转发
    // ------------------------------------------------------------------

    /// 按能力间接寻址转发关机请求给所属模块
    pub fn power_off(&self, feature: usize) -> Result<(), ServerError> {
        let f = *self
            .power_features
            .get(feature)
            .ok_or(ServerError::FeatureOutOfRange(feature))?;
        let mut modules = self.modules.lock();
        match modules.get_mut(f.module) {
            Some(m) => {
                debug!(feature, module = m.name(), "forwarding power-off");
                m.power_off(f.index);
                Ok(())
            },
            None => Err(ServerError::FeatureOutOfRange(feature)),
        }
    }

    /// 按能力间接寻址转发触觉脉冲给所属模块
    pub fn haptic_tick(&self, feature: usize, duration_ms: u32) -> Result<(), ServerError> {
        let f = *self
            .haptic_features
            .get(feature)
            .ok_or(ServerError::FeatureOutOfRange(feature))?;
        let mut modules = self.modules.lock();
        match modules.get_mut(f.module) {
            Some(m) => {
                m.haptic_tick(f.index, duration_ms);
                Ok(())
            },
            None => Err(ServerError::FeatureOutOfRange(feature)),
        }
    }

    // ------------------------------------------------------------------
    // 模块生命周期
    // ------------------------------------------------------------------

    /// 启动全部设备模块（各自拉起驱动线程）
    pub fn start_modules(manager: &Arc<Self>) -> Result<(), ServerError> {
        if manager.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::ModulesStarted);
        }
        let mut modules = manager.modules.lock();
        for m in modules.iter_mut() {
            info!(module = m.name(), "starting device module");
            m.start(Arc::clone(manager))?;
        }
        Ok(())
    }

    /// 停止全部模块并等待驱动线程退出
    pub fn shutdown(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut modules = self.modules.lock();
        for m in modules.iter_mut() {
            info!(module = m.name(), "stopping device module");
            m.stop();
        }
    }
}
