//! 设备状态模型
//!
//! 服务端聚合、客户端镜像的规范状态对象（canonical state）。
//!
//! 索引规则：tracker / button / valuator 数组在 Manager 构造时一次性
//! 定大小，索引空间在启动时分配给各设备模块，会话期间不再变动。
//! 单个条目只做原地覆盖，不重新分配。

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 6-DOF 刚体变换
///
/// 四元数采用 scalar-last（`[x, y, z, w]`）约定。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// 位置（米）
    pub position: [f64; 3],
    /// 朝向（单位四元数，scalar-last）
    pub orientation: [f64; 4],
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            orientation: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// 单个 tracker 的状态
///
/// **注意**：`timestamp_us` 是服务端单调时钟的微秒数，不是 UNIX
/// 时间戳。非本机客户端解码时会叠加握手阶段测得的时钟偏移。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrackerState {
    /// 6-DOF 位姿
    pub pose: Pose,
    /// 采样时间戳（微秒，服务端单调时钟）
    pub timestamp_us: u64,
    /// 有效标志；驱动断流或被 `disable_tracker` 时为 false
    pub valid: bool,
}

/// 设备布局：聚合数组的尺寸，在 Manager 构造时确定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceLayout {
    pub trackers: usize,
    pub buttons: usize,
    pub valuators: usize,
}

/// 规范状态聚合
///
/// 服务端在单一状态互斥锁下修改；客户端把它作为本地影子
/// （shadow）在自己的互斥锁下覆盖。
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub trackers: Vec<TrackerState>,
    pub buttons: Vec<bool>,
    pub valuators: Vec<f64>,
}

impl DeviceState {
    /// 按布局创建全零状态
    pub fn new(layout: DeviceLayout) -> Self {
        Self {
            trackers: vec![TrackerState::default(); layout.trackers],
            buttons: vec![false; layout.buttons],
            valuators: vec![0.0; layout.valuators],
        }
    }

    /// 当前布局
    pub fn layout(&self) -> DeviceLayout {
        DeviceLayout {
            trackers: self.trackers.len(),
            buttons: self.buttons.len(),
            valuators: self.valuators.len(),
        }
    }
}

/// tracker 上报掩码
///
/// 每个 tracker 一位；更新（或禁用）时置位，frame-complete 时清零。
/// 不变量：掩码达到满模式，当且仅当自上次清零以来每个 tracker 都
/// 上报过。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportMask {
    words: Vec<u64>,
    len: usize,
}

impl ReportMask {
    /// 创建覆盖 `len` 个 tracker 的空掩码
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// 置位；索引越界会 panic（索引空间是启动时固定的）
    pub fn set(&mut self, index: usize) {
        assert!(index < self.len, "tracker index {index} out of range");
        self.words[index / 64] |= 1 << (index % 64);
    }

    pub fn is_set(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// 是否达到满模式（`len == 0` 时恒为 true）
    pub fn is_complete(&self) -> bool {
        if self.len == 0 {
            return true;
        }
        let full_words = self.len / 64;
        if self.words[..full_words].iter().any(|&w| w != u64::MAX) {
            return false;
        }
        let rest = self.len % 64;
        rest == 0 || self.words[full_words] == (1u64 << rest) - 1
    }

    /// 清零（frame-complete 之后调用）
    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// 电源 / 触觉能力的间接寻址
///
/// `{所属模块, 模块内索引}`；Manager 只按此转发请求，从不触碰
/// 驱动内部结构。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feature {
    /// 所属模块在 Manager 模块表中的下标
    pub module: usize,
    /// 模块内部的本地索引
    pub index: usize,
}

/// 单个虚拟设备的电池状态
///
/// 幂等更新：新值与旧值相等时抑制通知。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatteryState {
    /// 电量百分比（0-100）
    pub percent: u8,
    /// 是否在充电
    pub charging: bool,
}

/// HMD 配置（每台头显一份，独立互斥锁保护）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HmdConfiguration {
    /// 佩戴检测
    pub face_detected: bool,
    /// 显示链路延迟（微秒）
    pub display_latency_us: u32,
    /// 瞳距（米）
    pub ipd_m: f64,
    /// 左右眼相对 HMD tracker 的平移
    pub eye_offsets: [[f64; 3]; 2],
    /// 左右眼视场（left/right/bottom/top 的 tan 半角）
    pub eye_fovs: [[f64; 4]; 2],
}

/// 基站（lighthouse 类跟踪参考设备）的元数据
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BaseStation {
    pub serial: String,
    pub pose: Pose,
    /// 有效跟踪半径（米）
    pub tracking_radius_m: f64,
    /// 水平 / 垂直视场（弧度）
    pub fov: [f64; 2],
    /// 信道 / 模式编号
    pub mode: u8,
    /// 位姿是否已标定
    pub pose_valid: bool,
}

/// 虚拟设备的跟踪类型
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
pub enum TrackType {
    /// 无跟踪（纯按钮盒）
    #[default]
    None = 0,
    /// 仅位置
    Position = 1,
    /// 位置 + 射线方向
    Ray = 2,
    /// 完整 6-DOF
    Full = 3,
}

/// 虚拟设备描述符
///
/// 虚拟设备是由一部分物理 tracker / button / valuator 组合出来的
/// 复合输入设备，在 CONNECT 回复中作为设备清单下发。
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VirtualDeviceDescriptor {
    pub name: String,
    pub track_type: TrackType,
    /// 射线方向（设备本地坐标系）；`track_type == Ray` 时有意义
    pub ray_direction: [f64; 3],
    /// 射线起点沿方向的偏移（米）
    pub ray_start: f64,
    /// 对应的 tracker 槽位；无跟踪时为 None
    pub tracker_index: Option<usize>,
    /// 占用的 button 槽位
    pub button_indices: Vec<usize>,
    /// 占用的 valuator 槽位
    pub valuator_indices: Vec<usize>,
    /// 是否上报电池状态
    pub has_battery: bool,
}

/// 物理环境定义
///
/// GET/UPDATE-ENVIRONMENT 的载荷：单位尺度、方向约定、地面方程等。
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentDefinition {
    /// 一个坐标单位对应的米数
    pub unit_scale_m: f64,
    /// 物理空间的"上"方向
    pub up: [f64; 3],
    /// 物理空间的"前"方向
    pub forward: [f64; 3],
    /// 环境中心点
    pub center: [f64; 3],
    /// 活动半径
    pub radius: f64,
    /// 地面平面方程 `ax + by + cz = d`，存作 `[a, b, c, d]`
    pub floor_plane: [f64; 4],
}

impl Default for EnvironmentDefinition {
    fn default() -> Self {
        Self {
            unit_scale_m: 1.0,
            up: [0.0, 1.0, 0.0],
            forward: [0.0, 0.0, -1.0],
            center: [0.0; 3],
            radius: 1.5,
            floor_plane: [0.0, 1.0, 0.0, 0.0],
        }
    }
}
