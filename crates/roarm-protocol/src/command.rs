//! 上位机指令协议
//!
//! 每行一个 JSON 对象，以数字字段 `T` 区分指令类型。本模块只解析
//! 核心逻辑用到的字段，其余字段被忽略。
//!
//! | T   | 指令 |
//! |-----|------|
//! | 100 | 全部关节回中位 |
//! | 101 | 单关节运动 |
//! | 102 | 全关节运动 |
//! | 105 | 位置查询（应答 1051） |
//! | 108 | 设置 PID 增益 |
//! | 109 | 复位 PID 增益 |
//! | 112 | 力矩上限配置 |
//! | 210 | 扭矩开关 |
//! | 220 | 拖动示教进入/退出 |

use crate::{Deg, ProtocolError, Rad};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

pub const T_MOVE_INIT: u64 = 100;
pub const T_SINGLE_JOINT_MOVE: u64 = 101;
pub const T_ALL_JOINTS_MOVE: u64 = 102;
pub const T_POSITION_QUERY: u64 = 105;
pub const T_POSITION_REPORT: u64 = 1051;
pub const T_GAIN_SET: u64 = 108;
pub const T_GAIN_RESET: u64 = 109;
pub const T_TORQUE_PROFILE: u64 = 112;
pub const T_TORQUE_ENABLE: u64 = 210;
pub const T_DRAG_TEACH: u64 = 220;

/// 逻辑关节编号（与指令中的 `joint` 字段一致）
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    TryFromPrimitive,
    IntoPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum JointId {
    Base = 1,
    Shoulder = 2,
    Elbow = 3,
    Hand = 4,
}

impl JointId {
    /// 全部关节
    pub const ALL: [JointId; 4] = [
        JointId::Base,
        JointId::Shoulder,
        JointId::Elbow,
        JointId::Hand,
    ];

    pub fn name(self) -> &'static str {
        match self {
            JointId::Base => "base",
            JointId::Shoulder => "shoulder",
            JointId::Elbow => "elbow",
            JointId::Hand => "hand",
        }
    }

    fn from_wire(value: u8) -> Result<Self, ProtocolError> {
        JointId::try_from(value).map_err(|_| ProtocolError::InvalidValue {
            field: "joint".to_string(),
            value: value as i64,
        })
    }
}

impl fmt::Display for JointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 力矩配置模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum TorqueProfileMode {
    /// 全部恢复最大力矩
    Reset = 0,
    /// 按关节设置
    Set = 1,
}

/// 单关节运动（T:101）
#[derive(Debug, Clone, PartialEq)]
pub struct SingleJointMove {
    pub joint: JointId,
    pub angle: Rad,
    pub speed: u32,
    pub acc: u32,
}

/// 全关节运动（T:102）
#[derive(Debug, Clone, PartialEq)]
pub struct AllJointsMove {
    pub base: Rad,
    pub shoulder: Rad,
    pub elbow: Rad,
    pub hand: Rad,
    pub speed: u32,
    pub acc: u32,
}

impl AllJointsMove {
    pub fn targets(&self) -> [(JointId, Rad); 4] {
        [
            (JointId::Base, self.base),
            (JointId::Shoulder, self.shoulder),
            (JointId::Elbow, self.elbow),
            (JointId::Hand, self.hand),
        ]
    }
}

/// 力矩配置（T:112）
///
/// 未给出的关节保持不变；`Reset` 模式下忽略各关节字段。
#[derive(Debug, Clone, PartialEq)]
pub struct TorqueProfileCommand {
    pub mode: TorqueProfileMode,
    pub base: Option<u16>,
    pub shoulder: Option<u16>,
    pub elbow: Option<u16>,
    pub hand: Option<u16>,
    /// 是否同时写入持久寄存器（掉电保持）
    pub persist: bool,
}

impl TorqueProfileCommand {
    /// 指定的关节上限
    pub fn ceilings(&self) -> Vec<(JointId, u16)> {
        [
            (JointId::Base, self.base),
            (JointId::Shoulder, self.shoulder),
            (JointId::Elbow, self.elbow),
            (JointId::Hand, self.hand),
        ]
        .into_iter()
        .filter_map(|(joint, ceiling)| ceiling.map(|c| (joint, c)))
        .collect()
    }
}

/// 设置增益（T:108）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GainSet {
    pub joint: JointId,
    pub p: u8,
    pub i: u8,
}

/// 上位机指令
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    MoveInit,
    SingleJointMove(SingleJointMove),
    AllJointsMove(AllJointsMove),
    PositionQuery,
    GainSet(GainSet),
    GainReset,
    TorqueProfile(TorqueProfileCommand),
    TorqueEnable { on: bool },
    DragTeach { enter: bool },
}

// 线上格式（字段名与上位机工具一致）

#[derive(Deserialize)]
struct WireSingleJointMove {
    joint: u8,
    rad: f64,
    #[serde(default)]
    spd: u32,
    #[serde(default)]
    acc: u32,
}

#[derive(Deserialize)]
struct WireAllJointsMove {
    base: f64,
    shoulder: f64,
    elbow: f64,
    hand: f64,
    #[serde(default)]
    spd: u32,
    #[serde(default)]
    acc: u32,
}

#[derive(Deserialize)]
struct WireTorqueProfile {
    mode: u8,
    b: Option<u16>,
    s: Option<u16>,
    e: Option<u16>,
    h: Option<u16>,
    #[serde(default)]
    persist: bool,
}

#[derive(Deserialize)]
struct WireGainSet {
    joint: u8,
    p: u8,
    #[serde(default)]
    i: u8,
}

#[derive(Deserialize)]
struct WireSwitch {
    cmd: u8,
}

impl HostCommand {
    /// 解析一行 JSON 指令
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line.trim())?;
        let code = value
            .get("T")
            .and_then(Value::as_u64)
            .ok_or(ProtocolError::MissingDiscriminator)?;

        let command = match code {
            T_MOVE_INIT => HostCommand::MoveInit,
            T_SINGLE_JOINT_MOVE => {
                let wire: WireSingleJointMove = serde_json::from_value(value)?;
                HostCommand::SingleJointMove(SingleJointMove {
                    joint: JointId::from_wire(wire.joint)?,
                    angle: Rad(wire.rad),
                    speed: wire.spd,
                    acc: wire.acc,
                })
            },
            T_ALL_JOINTS_MOVE => {
                let wire: WireAllJointsMove = serde_json::from_value(value)?;
                HostCommand::AllJointsMove(AllJointsMove {
                    base: Rad(wire.base),
                    shoulder: Rad(wire.shoulder),
                    elbow: Rad(wire.elbow),
                    hand: Rad(wire.hand),
                    speed: wire.spd,
                    acc: wire.acc,
                })
            },
            T_POSITION_QUERY => HostCommand::PositionQuery,
            T_GAIN_SET => {
                let wire: WireGainSet = serde_json::from_value(value)?;
                HostCommand::GainSet(GainSet {
                    joint: JointId::from_wire(wire.joint)?,
                    p: wire.p,
                    i: wire.i,
                })
            },
            T_GAIN_RESET => HostCommand::GainReset,
            T_TORQUE_PROFILE => {
                let wire: WireTorqueProfile = serde_json::from_value(value)?;
                let mode = TorqueProfileMode::try_from(wire.mode).map_err(|_| {
                    ProtocolError::InvalidValue {
                        field: "mode".to_string(),
                        value: wire.mode as i64,
                    }
                })?;
                HostCommand::TorqueProfile(TorqueProfileCommand {
                    mode,
                    base: wire.b,
                    shoulder: wire.s,
                    elbow: wire.e,
                    hand: wire.h,
                    persist: wire.persist,
                })
            },
            T_TORQUE_ENABLE => {
                let wire: WireSwitch = serde_json::from_value(value)?;
                HostCommand::TorqueEnable { on: wire.cmd != 0 }
            },
            T_DRAG_TEACH => {
                let wire: WireSwitch = serde_json::from_value(value)?;
                HostCommand::DragTeach {
                    enter: wire.cmd != 0,
                }
            },
            other => return Err(ProtocolError::UnknownCommand(other)),
        };
        Ok(command)
    }

    /// 编码为 JSON 行（上位机一侧与仿真器使用）
    pub fn to_json(&self) -> Value {
        match self {
            HostCommand::MoveInit => json!({ "T": T_MOVE_INIT }),
            HostCommand::SingleJointMove(m) => json!({
                "T": T_SINGLE_JOINT_MOVE,
                "joint": u8::from(m.joint),
                "rad": m.angle.0,
                "spd": m.speed,
                "acc": m.acc,
            }),
            HostCommand::AllJointsMove(m) => json!({
                "T": T_ALL_JOINTS_MOVE,
                "base": m.base.0,
                "shoulder": m.shoulder.0,
                "elbow": m.elbow.0,
                "hand": m.hand.0,
                "spd": m.speed,
                "acc": m.acc,
            }),
            HostCommand::PositionQuery => json!({ "T": T_POSITION_QUERY }),
            HostCommand::GainSet(g) => json!({
                "T": T_GAIN_SET,
                "joint": u8::from(g.joint),
                "p": g.p,
                "i": g.i,
            }),
            HostCommand::GainReset => json!({ "T": T_GAIN_RESET }),
            HostCommand::TorqueProfile(t) => json!({
                "T": T_TORQUE_PROFILE,
                "mode": u8::from(t.mode),
                "b": t.base,
                "s": t.shoulder,
                "e": t.elbow,
                "h": t.hand,
                "persist": t.persist,
            }),
            HostCommand::TorqueEnable { on } => json!({ "T": T_TORQUE_ENABLE, "cmd": (*on as u8) }),
            HostCommand::DragTeach { enter } => json!({ "T": T_DRAG_TEACH, "cmd": (*enter as u8) }),
        }
    }
}

/// 位置反馈使用的角度单位
///
/// 报文中始终显式携带，避免接收方猜测单位。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AngleUnit {
    #[default]
    Deg,
    Rad,
}

/// 位置反馈（T:1051）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    #[serde(rename = "T")]
    pub code: u64,
    pub unit: AngleUnit,
    pub b: f64,
    pub s: f64,
    pub e: f64,
    pub t: f64,
}

impl PositionReport {
    /// 由角度构造，按 `unit` 编码
    pub fn from_degrees(unit: AngleUnit, angles: [(JointId, Deg); 4]) -> Self {
        let mut report = Self {
            code: T_POSITION_REPORT,
            unit,
            b: 0.0,
            s: 0.0,
            e: 0.0,
            t: 0.0,
        };
        for (joint, deg) in angles {
            let value = match unit {
                AngleUnit::Deg => deg.0,
                AngleUnit::Rad => deg.to_rad().0,
            };
            match joint {
                JointId::Base => report.b = value,
                JointId::Shoulder => report.s = value,
                JointId::Elbow => report.e = value,
                JointId::Hand => report.t = value,
            }
        }
        report
    }

    /// 读取关节角度，统一换算为度
    pub fn angle_deg(&self, joint: JointId) -> Deg {
        let value = match joint {
            JointId::Base => self.b,
            JointId::Shoulder => self.s,
            JointId::Elbow => self.e,
            JointId::Hand => self.t,
        };
        match self.unit {
            AngleUnit::Deg => Deg(value),
            AngleUnit::Rad => Rad(value).to_deg(),
        }
    }

    pub fn to_line(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
