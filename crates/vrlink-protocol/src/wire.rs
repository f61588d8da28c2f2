//! 有线协议定义
//!
//! 服务端与客户端之间的消息流（TCP / UDS 通用）。
//!
//! 帧格式：`[opcode: u8][reserved: u8][length: u32 LE][payload]`，
//! `length` 为整帧字节数（含 6 字节帧头）。所有整数小端序，浮点数
//! 按 f64 的 LE 位模式编码。
//!
//! opcode 的具体取值是一份内部契约：两端必须链接同一版本的本 crate，
//! 跨版本兼容性只由 CONNECT 握手中的协议版本号保证。

use crate::error::ProtocolError;
use crate::state::{
    BaseStation, BatteryState, DeviceLayout, DeviceState, EnvironmentDefinition, HmdConfiguration,
    Pose, TrackType, TrackerState, VirtualDeviceDescriptor,
};
use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 当前协议版本
pub const PROTOCOL_VERSION: u32 = 3;

/// 能力标志：tracker 状态携带时间戳
pub const CAP_TIMESTAMPS: u32 = 1 << 0;
/// 能力标志：tracker 状态携带有效标志
pub const CAP_VALID_FLAGS: u32 = 1 << 1;
/// 能力标志：服务端发布共享内存段
pub const CAP_SHARED_MEMORY: u32 = 1 << 2;

/// 帧头长度（opcode + reserved + length）
pub const HEADER_LEN: usize = 6;

/// 单帧长度上限；超出即按协议错误断开（防御损坏的对端）
pub const MAX_FRAME_LEN: u32 = 1 << 20;

// ============================================================================
// Opcode
// ============================================================================

/// 消息 opcode
///
/// `0x0x` 为客户端 → 服务端，`0x8x` 为服务端 → 客户端。
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum Opcode {
    // 客户端 → 服务端
    ConnectRequest = 0x01,
    StartStream = 0x02,
    StopStream = 0x03,
    PacketRequest = 0x04,
    PowerOff = 0x05,
    HapticTick = 0x06,
    BaseStationsRequest = 0x07,
    EnvironmentRequest = 0x08,
    EnvironmentUpdateRequest = 0x09,

    // 服务端 → 客户端
    ConnectReply = 0x81,
    Packet = 0x82,
    BaseStationsReply = 0x83,
    EnvironmentReply = 0x84,
    EnvironmentUpdateReply = 0x85,
    BatteryUpdate = 0x86,
    HmdConfigUpdate = 0x87,
    EnvironmentPush = 0x88,
}

// ============================================================================
// Messages
// ============================================================================

/// CONNECT 回复载荷
///
/// 握手期间一次性下发：协商版本、能力标志、设备清单、共享内存段
/// 名称（若启用且对端同机）以及用于时钟校正的服务端时间戳。
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectReply {
    /// 服务端实际采用的协议版本（两端最大版本的较小值）
    pub version: u32,
    /// 能力标志（`CAP_*` 按位或）
    pub flags: u32,
    /// 聚合数组布局
    pub layout: DeviceLayout,
    /// 虚拟设备清单
    pub virtual_devices: Vec<VirtualDeviceDescriptor>,
    /// HMD 配置数量
    pub hmd_count: u32,
    /// 电源能力数量
    pub power_features: u32,
    /// 触觉能力数量
    pub haptic_features: u32,
    /// 共享内存段名称与 blob 尺寸；仅对同机客户端下发
    pub shm: Option<(String, u32)>,
    /// 服务端单调时钟（微秒），用于一次性时钟偏移估计
    pub server_time_us: u64,
}

/// 协议消息
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Connect {
        /// 客户端的最大支持版本
        version: u32,
    },
    ConnectReply(ConnectReply),
    StartStream,
    StopStream,
    PacketRequest,
    /// 完整状态包；载荷与共享内存 blob 编码一致
    Packet(DeviceState),
    PowerOff {
        feature: u32,
    },
    HapticTick {
        feature: u32,
        duration_ms: u32,
    },
    BaseStationsRequest,
    BaseStationsReply(Vec<BaseStation>),
    EnvironmentRequest,
    EnvironmentReply(EnvironmentDefinition),
    EnvironmentUpdateRequest(EnvironmentDefinition),
    EnvironmentUpdateReply,
    EnvironmentPush(EnvironmentDefinition),
    BatteryUpdate {
        device: u32,
        state: BatteryState,
    },
    HmdConfigUpdate {
        index: u32,
        config: HmdConfiguration,
    },
}

impl Message {
    /// 消息对应的 opcode
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::Connect { .. } => Opcode::ConnectRequest,
            Message::ConnectReply(_) => Opcode::ConnectReply,
            Message::StartStream => Opcode::StartStream,
            Message::StopStream => Opcode::StopStream,
            Message::PacketRequest => Opcode::PacketRequest,
            Message::Packet(_) => Opcode::Packet,
            Message::PowerOff { .. } => Opcode::PowerOff,
            Message::HapticTick { .. } => Opcode::HapticTick,
            Message::BaseStationsRequest => Opcode::BaseStationsRequest,
            Message::BaseStationsReply(_) => Opcode::BaseStationsReply,
            Message::EnvironmentRequest => Opcode::EnvironmentRequest,
            Message::EnvironmentReply(_) => Opcode::EnvironmentReply,
            Message::EnvironmentUpdateRequest(_) => Opcode::EnvironmentUpdateRequest,
            Message::EnvironmentUpdateReply => Opcode::EnvironmentUpdateReply,
            Message::EnvironmentPush(_) => Opcode::EnvironmentPush,
            Message::BatteryUpdate { .. } => Opcode::BatteryUpdate,
            Message::HmdConfigUpdate { .. } => Opcode::HmdConfigUpdate,
        }
    }
}

// ============================================================================
// Payload reader
// ============================================================================

/// 载荷读取器：带长度检查的小端序字段提取
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.len() < n {
            return Err(ProtocolError::TooShort {
                need: n,
                have: self.buf.len(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        let v = self.buf[0];
        self.buf = &self.buf[1..];
        Ok(v)
    }

    fn bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        let v = u16::from_le_bytes([self.buf[0], self.buf[1]]);
        self.buf = &self.buf[2..];
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[..4]);
        self.buf = &self.buf[4..];
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[..8]);
        self.buf = &self.buf[8..];
        Ok(u64::from_le_bytes(raw))
    }

    fn f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(f64::from_bits(self.u64()?))
    }

    fn f64_array<const N: usize>(&mut self) -> Result<[f64; N], ProtocolError> {
        let mut out = [0.0; N];
        for v in &mut out {
            *v = self.f64()?;
        }
        Ok(out)
    }

    /// u16 长度前缀的 UTF-8 字符串
    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u16()? as usize;
        self.need(len)?;
        let s = std::str::from_utf8(&self.buf[..len])
            .map_err(|_| ProtocolError::InvalidPayload("non-UTF-8 string"))?
            .to_owned();
        self.buf = &self.buf[len..];
        Ok(s)
    }

    fn pose(&mut self) -> Result<Pose, ProtocolError> {
        Ok(Pose {
            position: self.f64_array()?,
            orientation: self.f64_array()?,
        })
    }

    fn finish(self) -> Result<(), ProtocolError> {
        if !self.buf.is_empty() {
            return Err(ProtocolError::InvalidPayload("trailing bytes"));
        }
        Ok(())
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_pose(buf: &mut BytesMut, pose: &Pose) {
    for v in pose.position {
        buf.put_f64_le(v);
    }
    for v in pose.orientation {
        buf.put_f64_le(v);
    }
}

// ============================================================================
// Packet (state blob) encoding
// ============================================================================

/// 编码完整状态 blob
///
/// PACKET 载荷与共享内存 blob 使用同一编码，两条路径共享解码器。
pub fn encode_packet(state: &DeviceState, buf: &mut BytesMut) {
    buf.put_u32_le(state.trackers.len() as u32);
    buf.put_u32_le(state.buttons.len() as u32);
    buf.put_u32_le(state.valuators.len() as u32);
    for t in &state.trackers {
        put_pose(buf, &t.pose);
        buf.put_u64_le(t.timestamp_us);
        buf.put_u8(t.valid as u8);
    }
    for &b in &state.buttons {
        buf.put_u8(b as u8);
    }
    for &v in &state.valuators {
        buf.put_f64_le(v);
    }
}

/// 状态 blob 的编码尺寸（用于共享内存 blob 定容）
pub fn packet_len(layout: DeviceLayout) -> usize {
    12 + layout.trackers * (7 * 8 + 8 + 1) + layout.buttons + layout.valuators * 8
}

fn decode_packet_reader(r: &mut Reader<'_>) -> Result<DeviceState, ProtocolError> {
    let trackers = r.u32()? as usize;
    let buttons = r.u32()? as usize;
    let valuators = r.u32()? as usize;
    // 头部计数来自网络，先对剩余载荷校验再按计数分配
    let body = trackers
        .checked_mul(7 * 8 + 8 + 1)
        .and_then(|n| n.checked_add(buttons))
        .and_then(|n| n.checked_add(valuators.checked_mul(8)?))
        .ok_or(ProtocolError::InvalidPayload("blob header counts"))?;
    r.need(body)?;
    let mut state = DeviceState::new(DeviceLayout {
        trackers,
        buttons,
        valuators,
    });
    fill_packet(r, &mut state)?;
    Ok(state)
}

fn fill_packet(r: &mut Reader<'_>, state: &mut DeviceState) -> Result<(), ProtocolError> {
    for t in &mut state.trackers {
        t.pose = r.pose()?;
        t.timestamp_us = r.u64()?;
        t.valid = r.bool()?;
    }
    for b in &mut state.buttons {
        *b = r.bool()?;
    }
    for v in &mut state.valuators {
        *v = r.f64()?;
    }
    Ok(())
}

/// 解码状态 blob（重新分配）
pub fn decode_packet(payload: &[u8]) -> Result<DeviceState, ProtocolError> {
    let mut r = Reader::new(payload);
    let state = decode_packet_reader(&mut r)?;
    r.finish()?;
    Ok(state)
}

/// 原地解码状态 blob
///
/// 影子状态按布局一次性分配，之后只覆盖；布局不符即报错。
pub fn decode_packet_into(payload: &[u8], state: &mut DeviceState) -> Result<(), ProtocolError> {
    let mut r = Reader::new(payload);
    let trackers = r.u32()? as usize;
    let buttons = r.u32()? as usize;
    let valuators = r.u32()? as usize;
    let layout = state.layout();
    if trackers != layout.trackers || buttons != layout.buttons || valuators != layout.valuators {
        return Err(ProtocolError::LayoutMismatch("blob header counts"));
    }
    fill_packet(&mut r, state)?;
    r.finish()
}

// ============================================================================
// Message encoding
// ============================================================================

/// 编码一条完整消息（帧头 + 载荷）到输出缓冲
pub fn encode_message(msg: &Message, buf: &mut BytesMut) {
    let start = buf.len();
    buf.put_u8(msg.opcode().into());
    buf.put_u8(0); // reserved
    buf.put_u32_le(0); // 长度占位，载荷写完后回填

    match msg {
        Message::Connect { version } => buf.put_u32_le(*version),
        Message::ConnectReply(reply) => encode_connect_reply(reply, buf),
        Message::StartStream
        | Message::StopStream
        | Message::PacketRequest
        | Message::BaseStationsRequest
        | Message::EnvironmentRequest
        | Message::EnvironmentUpdateReply => {},
        Message::Packet(state) => encode_packet(state, buf),
        Message::PowerOff { feature } => buf.put_u32_le(*feature),
        Message::HapticTick {
            feature,
            duration_ms,
        } => {
            buf.put_u32_le(*feature);
            buf.put_u32_le(*duration_ms);
        },
        Message::BaseStationsReply(stations) => {
            buf.put_u32_le(stations.len() as u32);
            for s in stations {
                put_string(buf, &s.serial);
                put_pose(buf, &s.pose);
                buf.put_f64_le(s.tracking_radius_m);
                buf.put_f64_le(s.fov[0]);
                buf.put_f64_le(s.fov[1]);
                buf.put_u8(s.mode);
                buf.put_u8(s.pose_valid as u8);
            }
        },
        Message::EnvironmentReply(env)
        | Message::EnvironmentUpdateRequest(env)
        | Message::EnvironmentPush(env) => encode_environment(env, buf),
        Message::BatteryUpdate { device, state } => {
            buf.put_u32_le(*device);
            buf.put_u8(state.percent);
            buf.put_u8(state.charging as u8);
        },
        Message::HmdConfigUpdate { index, config } => {
            buf.put_u32_le(*index);
            encode_hmd_configuration(config, buf);
        },
    }

    let frame_len = (buf.len() - start) as u32;
    buf[start + 2..start + 6].copy_from_slice(&frame_len.to_le_bytes());
}

fn encode_connect_reply(reply: &ConnectReply, buf: &mut BytesMut) {
    buf.put_u32_le(reply.version);
    buf.put_u32_le(reply.flags);
    buf.put_u32_le(reply.layout.trackers as u32);
    buf.put_u32_le(reply.layout.buttons as u32);
    buf.put_u32_le(reply.layout.valuators as u32);
    buf.put_u32_le(reply.virtual_devices.len() as u32);
    for vd in &reply.virtual_devices {
        put_string(buf, &vd.name);
        buf.put_u8(vd.track_type.into());
        for v in vd.ray_direction {
            buf.put_f64_le(v);
        }
        buf.put_f64_le(vd.ray_start);
        // tracker 槽位：-1 表示无跟踪
        buf.put_i32_le(vd.tracker_index.map_or(-1, |i| i as i32));
        buf.put_u16_le(vd.button_indices.len() as u16);
        for &i in &vd.button_indices {
            buf.put_u32_le(i as u32);
        }
        buf.put_u16_le(vd.valuator_indices.len() as u16);
        for &i in &vd.valuator_indices {
            buf.put_u32_le(i as u32);
        }
        buf.put_u8(vd.has_battery as u8);
    }
    buf.put_u32_le(reply.hmd_count);
    buf.put_u32_le(reply.power_features);
    buf.put_u32_le(reply.haptic_features);
    match &reply.shm {
        Some((name, blob_size)) => {
            buf.put_u8(1);
            put_string(buf, name);
            buf.put_u32_le(*blob_size);
        },
        None => buf.put_u8(0),
    }
    buf.put_u64_le(reply.server_time_us);
}

fn encode_environment(env: &EnvironmentDefinition, buf: &mut BytesMut) {
    buf.put_f64_le(env.unit_scale_m);
    for v in env.up {
        buf.put_f64_le(v);
    }
    for v in env.forward {
        buf.put_f64_le(v);
    }
    for v in env.center {
        buf.put_f64_le(v);
    }
    buf.put_f64_le(env.radius);
    for v in env.floor_plane {
        buf.put_f64_le(v);
    }
}

fn encode_hmd_configuration(config: &HmdConfiguration, buf: &mut BytesMut) {
    buf.put_u8(config.face_detected as u8);
    buf.put_u32_le(config.display_latency_us);
    buf.put_f64_le(config.ipd_m);
    for eye in config.eye_offsets {
        for v in eye {
            buf.put_f64_le(v);
        }
    }
    for eye in config.eye_fovs {
        for v in eye {
            buf.put_f64_le(v);
        }
    }
}

// ============================================================================
// Message decoding
// ============================================================================

fn decode_connect_reply(r: &mut Reader<'_>) -> Result<ConnectReply, ProtocolError> {
    let version = r.u32()?;
    let flags = r.u32()?;
    let layout = DeviceLayout {
        trackers: r.u32()? as usize,
        buttons: r.u32()? as usize,
        valuators: r.u32()? as usize,
    };
    let vd_count = r.u32()? as usize;
    let mut virtual_devices = Vec::with_capacity(vd_count.min(256));
    for _ in 0..vd_count {
        let name = r.string()?;
        let track_type = TrackType::try_from(r.u8()?)
            .map_err(|_| ProtocolError::InvalidPayload("track type"))?;
        let ray_direction = r.f64_array()?;
        let ray_start = r.f64()?;
        let tracker_raw = r.u32()? as i32;
        let tracker_index = (tracker_raw >= 0).then_some(tracker_raw as usize);
        let nb = r.u16()? as usize;
        let mut button_indices = Vec::with_capacity(nb.min(256));
        for _ in 0..nb {
            button_indices.push(r.u32()? as usize);
        }
        let nv = r.u16()? as usize;
        let mut valuator_indices = Vec::with_capacity(nv.min(256));
        for _ in 0..nv {
            valuator_indices.push(r.u32()? as usize);
        }
        let has_battery = r.bool()?;
        virtual_devices.push(VirtualDeviceDescriptor {
            name,
            track_type,
            ray_direction,
            ray_start,
            tracker_index,
            button_indices,
            valuator_indices,
            has_battery,
        });
    }
    let hmd_count = r.u32()?;
    let power_features = r.u32()?;
    let haptic_features = r.u32()?;
    let shm = if r.bool()? {
        let name = r.string()?;
        let blob_size = r.u32()?;
        Some((name, blob_size))
    } else {
        None
    };
    let server_time_us = r.u64()?;
    Ok(ConnectReply {
        version,
        flags,
        layout,
        virtual_devices,
        hmd_count,
        power_features,
        haptic_features,
        shm,
        server_time_us,
    })
}

fn decode_environment(r: &mut Reader<'_>) -> Result<EnvironmentDefinition, ProtocolError> {
    Ok(EnvironmentDefinition {
        unit_scale_m: r.f64()?,
        up: r.f64_array()?,
        forward: r.f64_array()?,
        center: r.f64_array()?,
        radius: r.f64()?,
        floor_plane: r.f64_array()?,
    })
}

fn decode_hmd_configuration(r: &mut Reader<'_>) -> Result<HmdConfiguration, ProtocolError> {
    let face_detected = r.bool()?;
    let display_latency_us = r.u32()?;
    let ipd_m = r.f64()?;
    let mut eye_offsets = [[0.0; 3]; 2];
    for eye in &mut eye_offsets {
        *eye = r.f64_array()?;
    }
    let mut eye_fovs = [[0.0; 4]; 2];
    for eye in &mut eye_fovs {
        *eye = r.f64_array()?;
    }
    Ok(HmdConfiguration {
        face_detected,
        display_latency_us,
        ipd_m,
        eye_offsets,
        eye_fovs,
    })
}

fn decode_frame(opcode: Opcode, payload: &[u8]) -> Result<Message, ProtocolError> {
    let mut r = Reader::new(payload);
    let msg = match opcode {
        Opcode::ConnectRequest => Message::Connect { version: r.u32()? },
        Opcode::ConnectReply => Message::ConnectReply(decode_connect_reply(&mut r)?),
        Opcode::StartStream => Message::StartStream,
        Opcode::StopStream => Message::StopStream,
        Opcode::PacketRequest => Message::PacketRequest,
        Opcode::Packet => Message::Packet(decode_packet_reader(&mut r)?),
        Opcode::PowerOff => Message::PowerOff { feature: r.u32()? },
        Opcode::HapticTick => Message::HapticTick {
            feature: r.u32()?,
            duration_ms: r.u32()?,
        },
        Opcode::BaseStationsRequest => Message::BaseStationsRequest,
        Opcode::BaseStationsReply => {
            let count = r.u32()? as usize;
            let mut stations = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                stations.push(BaseStation {
                    serial: r.string()?,
                    pose: r.pose()?,
                    tracking_radius_m: r.f64()?,
                    fov: [r.f64()?, r.f64()?],
                    mode: r.u8()?,
                    pose_valid: r.bool()?,
                });
            }
            Message::BaseStationsReply(stations)
        },
        Opcode::EnvironmentRequest => Message::EnvironmentRequest,
        Opcode::EnvironmentReply => Message::EnvironmentReply(decode_environment(&mut r)?),
        Opcode::EnvironmentUpdateRequest => {
            Message::EnvironmentUpdateRequest(decode_environment(&mut r)?)
        },
        Opcode::EnvironmentUpdateReply => Message::EnvironmentUpdateReply,
        Opcode::EnvironmentPush => Message::EnvironmentPush(decode_environment(&mut r)?),
        Opcode::BatteryUpdate => Message::BatteryUpdate {
            device: r.u32()?,
            state: BatteryState {
                percent: r.u8()?,
                charging: r.bool()?,
            },
        },
        Opcode::HmdConfigUpdate => Message::HmdConfigUpdate {
            index: r.u32()?,
            config: decode_hmd_configuration(&mut r)?,
        },
    };
    r.finish()?;
    Ok(msg)
}

// ============================================================================
// Stream framing
// ============================================================================

/// 增量分帧解码器
///
/// 字节管道层把读到的字节喂进来，凑齐一帧就吐出一条消息；
/// EAGAIN/短读天然被缓冲吸收。
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加收到的字节
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// 取出下一条完整消息；不足一帧时返回 `Ok(None)`
    pub fn next(&mut self) -> Result<Option<Message>, ProtocolError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let opcode_raw = self.buf[0];
        let frame_len = u32::from_le_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]);
        if frame_len > MAX_FRAME_LEN {
            return Err(ProtocolError::Oversized(frame_len));
        }
        if (frame_len as usize) < HEADER_LEN {
            return Err(ProtocolError::InvalidLength(frame_len));
        }
        if self.buf.len() < frame_len as usize {
            return Ok(None);
        }
        let frame = self.buf.split_to(frame_len as usize);
        let opcode =
            Opcode::try_from(opcode_raw).map_err(|_| ProtocolError::InvalidOpcode(opcode_raw))?;
        decode_frame(opcode, &frame[HEADER_LEN..]).map(Some)
    }

    /// 当前缓冲的未消费字节数
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        let mut buf = BytesMut::new();
        encode_message(&msg, &mut buf);
        let mut dec = FrameDecoder::new();
        dec.extend(&buf);
        let out = dec.next().unwrap().expect("complete frame");
        assert_eq!(dec.pending(), 0);
        out
    }

    fn sample_state() -> DeviceState {
        let mut state = DeviceState::new(DeviceLayout {
            trackers: 2,
            buttons: 3,
            valuators: 1,
        });
        state.trackers[0] = TrackerState {
            pose: Pose {
                position: [1.0, 2.0, 3.0],
                orientation: [0.0, 0.0, 0.0, 1.0],
            },
            timestamp_us: 123_456,
            valid: true,
        };
        state.buttons[1] = true;
        state.valuators[0] = -0.5;
        state
    }

    #[test]
    fn test_connect_roundtrip() {
        let msg = roundtrip(Message::Connect {
            version: PROTOCOL_VERSION,
        });
        assert_eq!(
            msg,
            Message::Connect {
                version: PROTOCOL_VERSION
            }
        );
    }

    #[test]
    fn test_connect_reply_roundtrip() {
        let reply = ConnectReply {
            version: PROTOCOL_VERSION,
            flags: CAP_TIMESTAMPS | CAP_VALID_FLAGS | CAP_SHARED_MEMORY,
            layout: DeviceLayout {
                trackers: 2,
                buttons: 3,
                valuators: 1,
            },
            virtual_devices: vec![VirtualDeviceDescriptor {
                name: "LeftController".into(),
                track_type: TrackType::Full,
                ray_direction: [0.0, 0.0, -1.0],
                ray_start: 0.05,
                tracker_index: Some(0),
                button_indices: vec![0, 1],
                valuator_indices: vec![0],
                has_battery: true,
            }],
            hmd_count: 1,
            power_features: 2,
            haptic_features: 2,
            shm: Some(("/vrlink-test".into(), 4096)),
            server_time_us: 42_000_000,
        };
        match roundtrip(Message::ConnectReply(reply.clone())) {
            Message::ConnectReply(out) => assert_eq!(out, reply),
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn test_packet_roundtrip() {
        let state = sample_state();
        match roundtrip(Message::Packet(state.clone())) {
            Message::Packet(out) => assert_eq!(out, state),
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn test_packet_blob_matches_packet_len() {
        let state = sample_state();
        let mut buf = BytesMut::new();
        encode_packet(&state, &mut buf);
        assert_eq!(buf.len(), packet_len(state.layout()));

        let decoded = decode_packet(&buf).unwrap();
        assert_eq!(decoded, state);

        let mut shadow = DeviceState::new(state.layout());
        decode_packet_into(&buf, &mut shadow).unwrap();
        assert_eq!(shadow, state);
    }

    #[test]
    fn test_packet_into_rejects_layout_mismatch() {
        let state = sample_state();
        let mut buf = BytesMut::new();
        encode_packet(&state, &mut buf);
        let mut shadow = DeviceState::new(DeviceLayout {
            trackers: 1,
            buttons: 3,
            valuators: 1,
        });
        assert!(matches!(
            decode_packet_into(&buf, &mut shadow),
            Err(ProtocolError::LayoutMismatch(_))
        ));
    }

    #[test]
    fn test_decode_packet_rejects_forged_header_counts() {
        // 12 字节头声称一亿个 tracker：必须在分配前按余量报错
        let mut buf = BytesMut::new();
        buf.put_u32_le(100_000_000);
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        assert!(matches!(
            decode_packet(&buf),
            Err(ProtocolError::TooShort { .. })
        ));

        // 计数相乘溢出 usize 也不许 panic
        let mut buf = BytesMut::new();
        buf.put_u32_le(u32::MAX);
        buf.put_u32_le(u32::MAX);
        buf.put_u32_le(u32::MAX);
        assert!(decode_packet(&buf).is_err());
    }

    #[test]
    fn test_base_stations_roundtrip() {
        let stations = vec![
            BaseStation {
                serial: "LHB-0001".into(),
                pose: Pose::default(),
                tracking_radius_m: 5.0,
                fov: [2.0, 1.9],
                mode: 1,
                pose_valid: true,
            },
            BaseStation::default(),
        ];
        match roundtrip(Message::BaseStationsReply(stations.clone())) {
            Message::BaseStationsReply(out) => assert_eq!(out, stations),
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn test_environment_roundtrip() {
        let env = EnvironmentDefinition {
            unit_scale_m: 0.0254,
            radius: 2.5,
            ..Default::default()
        };
        match roundtrip(Message::EnvironmentUpdateRequest(env.clone())) {
            Message::EnvironmentUpdateRequest(out) => assert_eq!(out, env),
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn test_hmd_config_roundtrip() {
        let config = HmdConfiguration {
            face_detected: true,
            display_latency_us: 11_000,
            ipd_m: 0.063,
            eye_offsets: [[-0.032, 0.0, 0.0], [0.032, 0.0, 0.0]],
            eye_fovs: [[1.1, 1.0, 1.1, 1.1]; 2],
        };
        match roundtrip(Message::HmdConfigUpdate { index: 0, config }) {
            Message::HmdConfigUpdate { index, config: out } => {
                assert_eq!(index, 0);
                assert_eq!(out, config);
            },
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn test_decoder_handles_byte_at_a_time_feed() {
        let mut buf = BytesMut::new();
        encode_message(
            &Message::HapticTick {
                feature: 3,
                duration_ms: 50,
            },
            &mut buf,
        );
        let mut dec = FrameDecoder::new();
        for &b in buf.iter().take(buf.len() - 1) {
            dec.extend(&[b]);
            assert_eq!(dec.next().unwrap(), None);
        }
        dec.extend(&buf[buf.len() - 1..]);
        assert_eq!(
            dec.next().unwrap(),
            Some(Message::HapticTick {
                feature: 3,
                duration_ms: 50
            })
        );
    }

    #[test]
    fn test_decoder_handles_two_frames_in_one_feed() {
        let mut buf = BytesMut::new();
        encode_message(&Message::StartStream, &mut buf);
        encode_message(&Message::StopStream, &mut buf);
        let mut dec = FrameDecoder::new();
        dec.extend(&buf);
        assert_eq!(dec.next().unwrap(), Some(Message::StartStream));
        assert_eq!(dec.next().unwrap(), Some(Message::StopStream));
        assert_eq!(dec.next().unwrap(), None);
    }

    #[test]
    fn test_decoder_rejects_unknown_opcode() {
        let mut dec = FrameDecoder::new();
        dec.extend(&[0x7F, 0, 6, 0, 0, 0]);
        assert!(matches!(
            dec.next(),
            Err(ProtocolError::InvalidOpcode(0x7F))
        ));
    }

    #[test]
    fn test_decoder_rejects_oversized_frame() {
        let mut dec = FrameDecoder::new();
        let len = (MAX_FRAME_LEN + 1).to_le_bytes();
        dec.extend(&[0x01, 0, len[0], len[1], len[2], len[3]]);
        assert!(matches!(dec.next(), Err(ProtocolError::Oversized(_))));
    }

    #[test]
    fn test_decoder_rejects_undersized_length_field() {
        let mut dec = FrameDecoder::new();
        dec.extend(&[0x02, 0, 3, 0, 0, 0]);
        assert!(matches!(dec.next(), Err(ProtocolError::InvalidLength(3))));
    }

    #[test]
    fn test_trailing_payload_bytes_rejected() {
        // StartStream 本应无载荷
        let mut dec = FrameDecoder::new();
        dec.extend(&[0x02, 0, 7, 0, 0, 0, 0xAA]);
        assert!(matches!(
            dec.next(),
            Err(ProtocolError::InvalidPayload("trailing bytes"))
        ));
    }
}
