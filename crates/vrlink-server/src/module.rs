//! 设备模块：注册表、索引分配与内建 sim 模块
//!
//! 模块是 Manager 对具体硬件驱动的唯一抽象。配置阶段每个模块通过
//! [`DeviceAllocator`] 认领 tracker / button / valuator 区间并登记
//! 虚拟设备与能力；启动后模块拉起自己的驱动线程，只通过 Manager
//! 的 setter 回写状态。Manager 从不触碰模块内部结构。

use crate::error::ServerError;
use crate::manager::DeviceManager;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::f64::consts::TAU;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use vrlink_protocol::{
    BatteryState, DeviceLayout, Feature, Pose, TrackType, TrackerState, VirtualDeviceDescriptor,
};

/// 设备模块
///
/// `start` 拉起驱动线程并移交 `Arc<DeviceManager>`；`stop` 停线程并
/// join。`power_off` / `haptic_tick` 按模块内本地能力索引转发，实现
/// 必须立即返回（典型做法是投递给驱动线程）。
pub trait DeviceModule: Send {
    fn name(&self) -> &str;

    fn start(&mut self, manager: Arc<DeviceManager>) -> Result<(), ServerError>;

    fn stop(&mut self);

    fn power_off(&mut self, _feature: usize) {}

    fn haptic_tick(&mut self, _feature: usize, _duration_ms: u32) {}
}

// ============================================================================
// Allocator
// ============================================================================

/// 启动期索引空间分配器
///
/// 聚合数组的索引在配置阶段一次性划分给各模块，会话期间不再变动。
/// 区间按申请顺序连续分配，互不重叠。
#[derive(Debug, Default)]
pub struct DeviceAllocator {
    trackers: usize,
    buttons: usize,
    valuators: usize,
    hmds: usize,
    devices: Vec<VirtualDeviceDescriptor>,
    power_features: Vec<Feature>,
    haptic_features: Vec<Feature>,
    current_module: usize,
}

impl DeviceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册表在调用每个模块工厂之前设定当前模块下标
    pub(crate) fn begin_module(&mut self, index: usize) {
        self.current_module = index;
    }

    pub fn allocate_trackers(&mut self, count: usize) -> Range<usize> {
        let start = self.trackers;
        self.trackers += count;
        start..self.trackers
    }

    pub fn allocate_buttons(&mut self, count: usize) -> Range<usize> {
        let start = self.buttons;
        self.buttons += count;
        start..self.buttons
    }

    pub fn allocate_valuators(&mut self, count: usize) -> Range<usize> {
        let start = self.valuators;
        self.valuators += count;
        start..self.valuators
    }

    /// 认领一个 HMD 配置槽位
    pub fn allocate_hmd(&mut self) -> usize {
        let index = self.hmds;
        self.hmds += 1;
        index
    }

    /// 登记虚拟设备，返回其在设备清单中的下标
    pub fn add_virtual_device(&mut self, descriptor: VirtualDeviceDescriptor) -> usize {
        let index = self.devices.len();
        self.devices.push(descriptor);
        index
    }

    /// 登记电源能力（`local_index` 为模块内索引），返回全局能力号
    pub fn add_power_feature(&mut self, local_index: usize) -> usize {
        let id = self.power_features.len();
        self.power_features.push(Feature {
            module: self.current_module,
            index: local_index,
        });
        id
    }

    /// 登记触觉能力，返回全局能力号
    pub fn add_haptic_feature(&mut self, local_index: usize) -> usize {
        let id = self.haptic_features.len();
        self.haptic_features.push(Feature {
            module: self.current_module,
            index: local_index,
        });
        id
    }

    pub fn layout(&self) -> DeviceLayout {
        DeviceLayout {
            trackers: self.trackers,
            buttons: self.buttons,
            valuators: self.valuators,
        }
    }

    /// 用分配结果和模块表组装 Manager；索引空间从此固定
    pub fn into_manager(self, modules: Vec<Box<dyn DeviceModule>>) -> DeviceManager {
        DeviceManager::assemble(
            self.layout(),
            self.devices,
            self.hmds,
            self.power_features,
            self.haptic_features,
            modules,
        )
    }
}

// ============================================================================
// Registry
// ============================================================================

/// 模块配置段（daemon 的 toml `[[module]]` 条目）
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleConfig {
    /// 模块类型名（注册表键）
    pub kind: String,
    /// 实例名；缺省时用类型名
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_trackers")]
    pub trackers: usize,
    #[serde(default = "default_buttons")]
    pub buttons: usize,
    #[serde(default = "default_valuators")]
    pub valuators: usize,
    /// 驱动线程的更新频率
    #[serde(default = "default_rate_hz")]
    pub rate_hz: f64,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            kind: "sim".into(),
            name: None,
            trackers: default_trackers(),
            buttons: default_buttons(),
            valuators: default_valuators(),
            rate_hz: default_rate_hz(),
        }
    }
}

fn default_trackers() -> usize {
    2
}

fn default_buttons() -> usize {
    2
}

fn default_valuators() -> usize {
    1
}

fn default_rate_hz() -> f64 {
    60.0
}

/// 模块工厂：按配置段创建模块并完成索引分配
pub type ModuleFactory = Box<
    dyn Fn(&ModuleConfig, &mut DeviceAllocator) -> Result<Box<dyn DeviceModule>, ServerError>
        + Send
        + Sync,
>;

/// 类型名 → 工厂闭包的注册表
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    /// 空注册表
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// 预注册内建模块（当前只有 `sim`）
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("sim", |cfg, alloc| Ok(Box::new(SimModule::create(cfg, alloc)?)));
        registry
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&ModuleConfig, &mut DeviceAllocator) -> Result<Box<dyn DeviceModule>, ServerError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.to_owned(), Box::new(factory));
    }

    /// 按配置表创建全部模块；模块下标即其在返回表中的位置
    pub fn build(
        &self,
        configs: &[ModuleConfig],
        alloc: &mut DeviceAllocator,
    ) -> Result<Vec<Box<dyn DeviceModule>>, ServerError> {
        let mut modules = Vec::with_capacity(configs.len());
        for (index, cfg) in configs.iter().enumerate() {
            let factory = self
                .factories
                .get(&cfg.kind)
                .ok_or_else(|| ServerError::UnknownModuleType(cfg.kind.clone()))?;
            alloc.begin_module(index);
            modules.push(factory(cfg, alloc)?);
        }
        Ok(modules)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ============================================================================
// Sim module
// ============================================================================

/// 内建仿真模块
///
/// 每个 tracker 对应一个虚拟设备，驱动线程按 `rate_hz` 在圆轨道上
/// 更新全部 tracker（因此每个周期恰好产出一帧），button 周期性
/// 翻转，valuator 走正弦，电池缓慢放电。没有真实执行器：关机请求
/// 把对应 tracker 置为无效，触觉脉冲只计数。
pub struct SimModule {
    name: String,
    trackers: Range<usize>,
    buttons: Range<usize>,
    valuators: Range<usize>,
    devices: Vec<usize>,
    rate_hz: f64,
    running: Arc<AtomicBool>,
    powered_off: Arc<Mutex<HashSet<usize>>>,
    haptic_ticks: Arc<AtomicUsize>,
    thread: Option<JoinHandle<()>>,
}

impl SimModule {
    pub fn create(cfg: &ModuleConfig, alloc: &mut DeviceAllocator) -> Result<Self, ServerError> {
        if !(cfg.rate_hz.is_finite() && cfg.rate_hz > 0.0) {
            return Err(ServerError::InvalidModuleConfig {
                module: cfg.kind.clone(),
                reason: format!("rate_hz must be positive, got {}", cfg.rate_hz),
            });
        }
        let name = cfg.name.clone().unwrap_or_else(|| "sim".to_owned());
        let trackers = alloc.allocate_trackers(cfg.trackers);
        let buttons = alloc.allocate_buttons(cfg.buttons);
        let valuators = alloc.allocate_valuators(cfg.valuators);

        let mut devices = Vec::with_capacity(cfg.trackers);
        for (slot, tracker) in trackers.clone().enumerate() {
            alloc.add_power_feature(slot);
            alloc.add_haptic_feature(slot);
            devices.push(alloc.add_virtual_device(VirtualDeviceDescriptor {
                name: format!("{name}-{slot}"),
                track_type: TrackType::Full,
                ray_direction: [0.0, 0.0, -1.0],
                ray_start: 0.0,
                tracker_index: Some(tracker),
                // button / valuator 槽位轮转分给各设备
                button_indices: buttons.clone().skip(slot).step_by(cfg.trackers.max(1)).collect(),
                valuator_indices: valuators
                    .clone()
                    .skip(slot)
                    .step_by(cfg.trackers.max(1))
                    .collect(),
                has_battery: true,
            }));
        }

        Ok(Self {
            name,
            trackers,
            buttons,
            valuators,
            devices,
            rate_hz: cfg.rate_hz,
            running: Arc::new(AtomicBool::new(false)),
            powered_off: Arc::new(Mutex::new(HashSet::new())),
            haptic_ticks: Arc::new(AtomicUsize::new(0)),
            thread: None,
        })
    }

    /// 收到过的触觉脉冲总数
    pub fn haptic_tick_count(&self) -> usize {
        self.haptic_ticks.load(Ordering::Relaxed)
    }
}

impl DeviceModule for SimModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, manager: Arc<DeviceManager>) -> Result<(), ServerError> {
        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let powered_off = self.powered_off.clone();
        let trackers = self.trackers.clone();
        let buttons = self.buttons.clone();
        let valuators = self.valuators.clone();
        let devices = self.devices.clone();
        let period = Duration::from_secs_f64(1.0 / self.rate_hz);

        let thread = std::thread::Builder::new()
            .name(format!("{}_drv", self.name))
            .spawn(move || {
                sim_loop(
                    &manager,
                    &running,
                    &powered_off,
                    trackers,
                    buttons,
                    valuators,
                    &devices,
                    period,
                );
            })
            .map_err(ServerError::ThreadSpawn)?;
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(module = %self.name, "driver thread panicked");
            }
        }
    }

    fn power_off(&mut self, feature: usize) {
        if feature >= self.trackers.len() {
            warn!(module = %self.name, feature, "power-off for unknown feature");
            return;
        }
        info!(module = %self.name, feature, "powering off simulated device");
        self.powered_off.lock().insert(feature);
    }

    fn haptic_tick(&mut self, feature: usize, duration_ms: u32) {
        debug!(module = %self.name, feature, duration_ms, "haptic tick (simulated)");
        self.haptic_ticks.fetch_add(1, Ordering::Relaxed);
    }
}

#[allow(clippy::too_many_arguments)]
fn sim_loop(
    manager: &DeviceManager,
    running: &AtomicBool,
    powered_off: &Mutex<HashSet<usize>>,
    trackers: Range<usize>,
    buttons: Range<usize>,
    valuators: Range<usize>,
    devices: &[usize],
    period: Duration,
) {
    let mut frame: u64 = 0;
    let mut pressed = false;
    let mut disabled: HashSet<usize> = HashSet::new();
    let mut percent: u8 = 100;

    while running.load(Ordering::Acquire) {
        let now = manager.now_us();
        let t = now as f64 / 1e6;
        let dead = powered_off.lock().clone();

        for (slot, tracker) in trackers.clone().enumerate() {
            if dead.contains(&slot) {
                if disabled.insert(slot) {
                    manager.disable_tracker(tracker);
                }
                continue;
            }
            let phase = t * TAU * 0.25 + slot as f64;
            manager.set_tracker_state(
                tracker,
                TrackerState {
                    pose: Pose {
                        position: [phase.cos(), 1.5, phase.sin()],
                        orientation: [0.0, (phase / 2.0).sin(), 0.0, (phase / 2.0).cos()],
                    },
                    timestamp_us: now,
                    valid: true,
                },
            );
        }

        // button 约每秒翻转一次，valuator 走正弦
        if frame % 60 == 0 {
            pressed = !pressed;
            for b in buttons.clone() {
                manager.set_button_state(b, pressed);
            }
        }
        for (slot, v) in valuators.clone().enumerate() {
            manager.set_valuator_state(v, (t + slot as f64).sin());
        }

        // 缓慢放电
        if frame % 120 == 0 && frame > 0 {
            percent = percent.saturating_sub(1);
            for &device in devices {
                manager.set_battery_state(
                    device,
                    BatteryState {
                        percent,
                        charging: false,
                    },
                );
            }
        }

        frame += 1;
        std::thread::sleep(period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim_config(trackers: usize) -> ModuleConfig {
        ModuleConfig {
            kind: "sim".into(),
            name: None,
            trackers,
            buttons: 2,
            valuators: 1,
            rate_hz: 120.0,
        }
    }

    #[test]
    fn test_allocator_ranges_are_disjoint_and_sequential() {
        let mut alloc = DeviceAllocator::new();
        let a = alloc.allocate_trackers(3);
        let b = alloc.allocate_trackers(2);
        assert_eq!(a, 0..3);
        assert_eq!(b, 3..5);
        assert_eq!(alloc.allocate_buttons(4), 0..4);
        assert_eq!(alloc.allocate_hmd(), 0);
        assert_eq!(alloc.allocate_hmd(), 1);
        assert_eq!(
            alloc.layout(),
            DeviceLayout {
                trackers: 5,
                buttons: 4,
                valuators: 0
            }
        );
    }

    #[test]
    fn test_features_carry_owning_module_index() {
        let registry = ModuleRegistry::with_builtins();
        let mut alloc = DeviceAllocator::new();
        let configs = vec![sim_config(1), sim_config(2)];
        let modules = registry.build(&configs, &mut alloc).unwrap();
        assert_eq!(modules.len(), 2);

        let manager = alloc.into_manager(modules);
        assert_eq!(manager.power_feature_count(), 3);
        assert_eq!(manager.haptic_feature_count(), 3);
        assert_eq!(manager.virtual_devices().len(), 3);
        // 第二个模块的 tracker 区间接在第一个之后
        assert_eq!(manager.virtual_devices()[1].tracker_index, Some(1));
        assert_eq!(manager.virtual_devices()[2].tracker_index, Some(2));
    }

    #[test]
    fn test_registry_rejects_unknown_kind() {
        let registry = ModuleRegistry::with_builtins();
        let mut alloc = DeviceAllocator::new();
        let configs = vec![ModuleConfig {
            kind: "warp-drive".into(),
            ..sim_config(1)
        }];
        assert!(matches!(
            registry.build(&configs, &mut alloc),
            Err(ServerError::UnknownModuleType(kind)) if kind == "warp-drive"
        ));
    }

    #[test]
    fn test_sim_rejects_bad_rate() {
        let mut alloc = DeviceAllocator::new();
        let cfg = ModuleConfig {
            rate_hz: 0.0,
            ..sim_config(1)
        };
        assert!(matches!(
            SimModule::create(&cfg, &mut alloc),
            Err(ServerError::InvalidModuleConfig { .. })
        ));
    }

    #[test]
    fn test_sim_module_drives_full_frames() {
        let registry = ModuleRegistry::with_builtins();
        let mut alloc = DeviceAllocator::new();
        let modules = registry.build(&[sim_config(2)], &mut alloc).unwrap();
        let manager = Arc::new(alloc.into_manager(modules));

        DeviceManager::start_modules(&manager).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        manager.shutdown();

        let snapshot = manager.state_snapshot();
        assert!(snapshot.trackers.iter().all(|t| t.valid));
        assert!(snapshot.trackers[0].timestamp_us > 0);
    }
}
