//! 位置指令的速度/加速度参数
//!
//! ST 系列固件把速度或加速度为 0 的位置指令解释为“切换到开环 PWM 模式”，
//! 并把模式值写入 EEPROM。[`MotionProfile`] 在构造时保证两者都非零：
//! - [`MotionProfile::resolve`]：宽松解析，0 替换为文档化的最小值并记录告警
//! - [`MotionProfile::try_new`]：严格构造，0 直接返回 `UnsafeCommandParameters`

use crate::bus::ServoId;
use crate::error::DriverError;
use tracing::warn;

/// 最小安全速度（步/秒）
pub const MIN_SAFE_SPEED: u16 = 100;

/// 最小安全加速度（×100 步/秒²）
pub const MIN_SAFE_ACC: u8 = 10;

/// 加速度寄存器上限
const MAX_ACC: u8 = 254;

/// 非零的速度/加速度组合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionProfile {
    speed: u16,
    acc: u8,
    substituted: bool,
}

impl MotionProfile {
    /// 严格构造：任意一项为 0 即拒绝
    pub fn try_new(servo: ServoId, speed: u16, acc: u8) -> Result<Self, DriverError> {
        if speed == 0 || acc == 0 {
            return Err(DriverError::UnsafeCommandParameters { servo, speed, acc });
        }
        Ok(Self {
            speed,
            acc: acc.min(MAX_ACC),
            substituted: false,
        })
    }

    /// 宽松解析上位机请求的数值
    ///
    /// 0 替换为 [`MIN_SAFE_SPEED`] / [`MIN_SAFE_ACC`]，超范围的值被截断。
    pub fn resolve(speed: u32, acc: u32) -> Self {
        let mut substituted = false;
        let speed = if speed == 0 {
            substituted = true;
            MIN_SAFE_SPEED
        } else {
            speed.min(u16::MAX as u32) as u16
        };
        let acc = if acc == 0 {
            substituted = true;
            MIN_SAFE_ACC
        } else {
            acc.min(MAX_ACC as u32) as u8
        };
        if substituted {
            warn!(
                "Zero speed/acceleration replaced by safe minimum (speed={}, acc={})",
                speed, acc
            );
        }
        Self {
            speed,
            acc,
            substituted,
        }
    }

    /// 最小安全组合（拖动示教保持指令使用）
    pub const fn safe_minimum() -> Self {
        Self {
            speed: MIN_SAFE_SPEED,
            acc: MIN_SAFE_ACC,
            substituted: false,
        }
    }

    pub fn speed(&self) -> u16 {
        self.speed
    }

    pub fn acc(&self) -> u8 {
        self.acc
    }

    /// 是否发生了最小值替换
    pub fn was_substituted(&self) -> bool {
        self.substituted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_substitutes_zero() {
        let profile = MotionProfile::resolve(0, 0);
        assert_eq!(profile.speed(), MIN_SAFE_SPEED);
        assert_eq!(profile.acc(), MIN_SAFE_ACC);
        assert!(profile.was_substituted());

        let profile = MotionProfile::resolve(500, 0);
        assert_eq!(profile.speed(), 500);
        assert_eq!(profile.acc(), MIN_SAFE_ACC);
    }

    #[test]
    fn test_resolve_clamps() {
        let profile = MotionProfile::resolve(100_000, 1_000);
        assert_eq!(profile.speed(), u16::MAX);
        assert_eq!(profile.acc(), 254);
        assert!(!profile.was_substituted());
    }

    #[test]
    fn test_try_new_rejects_zero() {
        assert!(matches!(
            MotionProfile::try_new(11, 0, 50),
            Err(DriverError::UnsafeCommandParameters { servo: 11, .. })
        ));
        assert!(matches!(
            MotionProfile::try_new(11, 500, 0),
            Err(DriverError::UnsafeCommandParameters { .. })
        ));
        assert!(MotionProfile::try_new(11, 500, 50).is_ok());
    }

    proptest::proptest! {
        /// 任意请求值解析后都不会出现 0
        #[test]
        fn resolved_profile_is_never_zero(speed in 0u32..70_000, acc in 0u32..400) {
            let profile = MotionProfile::resolve(speed, acc);
            proptest::prop_assert!(profile.speed() > 0);
            proptest::prop_assert!(profile.acc() > 0);
        }
    }
}
