//! 强类型单位系统
//!
//! 使用 NewType 模式防止弧度与角度混用。历史上位置反馈的单位混淆
//! （固件返回弧度，工具按角度比较阈值）正是漂移判断失效的根源，
//! 因此所有阈值比较统一使用 [`Deg`]，原始值在边界处立即换算。
//!
//! # 示例
//!
//! ```rust
//! use roarm_protocol::{Deg, Rad};
//!
//! let sampled = Rad(0.03).to_deg();
//! assert!((sampled.0 - 1.7).abs() < 0.1);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};

/// 每圈刻度数
pub const TICKS_PER_REV: u16 = 4096;

/// 舵机中位刻度
pub const MIDDLE_POSITION: u16 = 2047;

/// 弧度（NewType）
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rad(pub f64);

impl Rad {
    /// 零弧度常量
    pub const ZERO: Self = Rad(0.0);

    /// 转换为角度
    #[inline]
    pub fn to_deg(self) -> Deg {
        Deg(self.0.to_degrees())
    }

    /// 获取原始值
    #[inline]
    pub fn value(self) -> f64 {
        self.0
    }
}

impl fmt::Display for Rad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4} rad", self.0)
    }
}

/// 角度（NewType）
///
/// 本仓库的规范角度单位。
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Deg(pub f64);

impl Deg {
    /// 零度常量
    pub const ZERO: Self = Deg(0.0);

    /// 转换为弧度
    #[inline]
    pub fn to_rad(self) -> Rad {
        Rad(self.0.to_radians())
    }

    /// 获取原始值
    #[inline]
    pub fn value(self) -> f64 {
        self.0
    }

    /// 取绝对值
    #[inline]
    pub fn abs(self) -> Self {
        Deg(self.0.abs())
    }

    /// 转换为相对中位的刻度偏移（四舍五入）
    #[inline]
    pub fn to_tick_offset(self) -> i32 {
        (self.0 / 360.0 * TICKS_PER_REV as f64).round() as i32
    }

    /// 由相对中位的刻度偏移构造
    #[inline]
    pub fn from_tick_offset(offset: i32) -> Self {
        Deg(offset as f64 * 360.0 / TICKS_PER_REV as f64)
    }
}

impl fmt::Display for Deg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}°", self.0)
    }
}

impl From<Rad> for Deg {
    fn from(rad: Rad) -> Self {
        rad.to_deg()
    }
}

impl From<Deg> for Rad {
    fn from(deg: Deg) -> Self {
        deg.to_rad()
    }
}

impl Add for Deg {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Deg(self.0 + rhs.0)
    }
}

impl Sub for Deg {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Deg(self.0 - rhs.0)
    }
}

impl Neg for Deg {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        Deg(-self.0)
    }
}

/// 舵机或上位机上报的原始位置值
///
/// 不同来源的单位不同，采样器边界处统一换算为 [`Deg`]。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawFeedback {
    /// 舵机刻度，相对于给定中位
    Ticks { raw: u16, middle: u16 },
    /// 弧度
    Radians(f64),
    /// 角度
    Degrees(f64),
}

impl RawFeedback {
    /// 换算为规范单位（度）
    pub fn to_deg(self) -> Deg {
        match self {
            RawFeedback::Ticks { raw, middle } => {
                Deg::from_tick_offset(raw as i32 - middle as i32)
            },
            RawFeedback::Radians(rad) => Rad(rad).to_deg(),
            RawFeedback::Degrees(deg) => Deg(deg),
        }
    }
}

impl From<RawFeedback> for Deg {
    fn from(raw: RawFeedback) -> Self {
        raw.to_deg()
    }
}

/// 解码舵机位置寄存器
///
/// ST 系列舵机用 bit15 表示负方向，其余 15 位为幅值。
pub fn decode_signed_position(raw: u16) -> i32 {
    let magnitude = (raw & 0x7FFF) as i32;
    if raw & 0x8000 != 0 { -magnitude } else { magnitude }
}
