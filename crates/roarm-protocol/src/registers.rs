//! 舵机寄存器表
//!
//! 每个寄存器都带有区域标签：
//! - **Volatile**：掉电恢复默认值，可任意频率写入
//! - **Persistent**：掉电保持（EEPROM），必须经过 unlock → write → lock
//!
//! 寄存器表是数据而非代码：不同舵机家族通过不同的 [`RegisterMap`] 描述，
//! 上层根据 `region` 决定走易失路径还是持久路径。

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// 力矩上限最大值（千分比）
pub const TORQUE_CEILING_MAX: u16 = 1000;

/// 默认位置环 P 增益
pub const DEFAULT_GAIN_P: u8 = 16;

/// 默认位置环 I 增益
pub const DEFAULT_GAIN_I: u8 = 0;

/// EEPROM 锁寄存器：写 0 解锁，写 1 上锁
pub const EEPROM_UNLOCKED: u8 = 0;
pub const EEPROM_LOCKED: u8 = 1;

/// 寄存器区域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    /// 易失（RAM），掉电复位
    Volatile,
    /// 持久（EEPROM），掉电保持
    Persistent,
}

/// 寄存器宽度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Width {
    Byte,
    Word,
}

/// 单个寄存器描述
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    pub name: &'static str,
    pub address: u8,
    pub width: Width,
    pub region: Region,
}

impl Register {
    pub const fn volatile(name: &'static str, address: u8, width: Width) -> Self {
        Self {
            name,
            address,
            width,
            region: Region::Volatile,
        }
    }

    pub const fn persistent(name: &'static str, address: u8, width: Width) -> Self {
        Self {
            name,
            address,
            width,
            region: Region::Persistent,
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.region == Region::Persistent
    }

    /// 该寄存器可容纳的最大值
    pub fn max_value(&self) -> u16 {
        match self.width {
            Width::Byte => u8::MAX as u16,
            Width::Word => u16::MAX,
        }
    }
}

/// 舵机工作模式（持久寄存器）
///
/// 位置指令速度或加速度为 0 时，ST 系列固件会把该寄存器改写为
/// `OpenLoopPwm` 并存入 EEPROM，此后位置指令全部失效。
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    TryFromPrimitive,
    IntoPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// 位置伺服
    Position = 0,
    /// 恒速（轮式）
    Speed = 1,
    /// 开环 PWM
    OpenLoopPwm = 2,
    /// 步进
    Step = 3,
}

/// 舵机家族寄存器表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    pub gain_p: Register,
    pub gain_i: Register,
    pub operating_mode: Register,
    pub torque_enable: Register,
    pub torque_limit: Register,
    pub max_torque: Register,
    pub eeprom_lock: Register,
    pub present_position: Register,
}

impl RegisterMap {
    /// ST 系列（STS3215 一类）寄存器表
    pub fn st_series() -> Self {
        Self {
            gain_p: Register::persistent("gain_p", 21, Width::Byte),
            gain_i: Register::persistent("gain_i", 23, Width::Byte),
            operating_mode: Register::persistent("operating_mode", 33, Width::Byte),
            torque_enable: Register::volatile("torque_enable", 40, Width::Byte),
            torque_limit: Register::volatile("torque_limit", 48, Width::Word),
            max_torque: Register::persistent("max_torque", 16, Width::Word),
            eeprom_lock: Register::volatile("eeprom_lock", 55, Width::Byte),
            present_position: Register::volatile("present_position", 56, Width::Word),
        }
    }

    /// 是否支持易失的力矩上限寄存器
    ///
    /// 不支持时拖动示教只能通过易失的扭矩开关放松关节。
    pub fn has_volatile_torque_limit(&self) -> bool {
        self.torque_limit.region == Region::Volatile
    }

    /// 按地址查找寄存器
    pub fn by_address(&self, address: u8) -> Option<Register> {
        self.all().into_iter().find(|r| r.address == address)
    }

    /// 全部寄存器
    pub fn all(&self) -> [Register; 8] {
        [
            self.gain_p,
            self.gain_i,
            self.operating_mode,
            self.torque_enable,
            self.torque_limit,
            self.max_torque,
            self.eeprom_lock,
            self.present_position,
        ]
    }
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::st_series()
    }
}

/// 舵机家族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServoFamily {
    /// ST 系列，力矩上限在 RAM 中
    #[default]
    StSeries,
    /// 力矩上限只有 EEPROM 版本的变体
    PersistentTorqueLimit,
}

impl ServoFamily {
    pub fn register_map(self) -> RegisterMap {
        match self {
            ServoFamily::StSeries => RegisterMap::st_series(),
            ServoFamily::PersistentTorqueLimit => {
                let mut map = RegisterMap::st_series();
                map.torque_limit = map.max_torque;
                map
            },
        }
    }
}
