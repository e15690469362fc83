//! 驱动层错误类型定义

use crate::bus::{BusError, ServoId};
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 重试耗尽仍未应答
    #[error("Servo {servo} did not acknowledge {operation} after {attempts} attempts")]
    BusTimeout {
        servo: ServoId,
        operation: &'static str,
        attempts: u32,
    },

    /// 其他总线错误（不重试）
    #[error("Bus error: {0}")]
    Bus(BusError),

    /// 速度或加速度为 0 的位置指令
    ///
    /// 固件会把它当成切换到开环 PWM 模式的请求并写入 EEPROM，
    /// 因此在发送前拒绝，且不允许用同样的参数重试。
    #[error(
        "Unsafe position command for servo {servo}: speed={speed}, acc={acc} \
            (zero would switch the servo to open-loop PWM mode)"
    )]
    UnsafeCommandParameters { servo: ServoId, speed: u16, acc: u8 },

    /// 上电自检发现工作模式寄存器异常
    #[error("Servo {servo} operating mode is {found}, expected {expected}")]
    ModeCorruption {
        servo: ServoId,
        found: u8,
        expected: u8,
    },

    /// 易失接口被用于持久寄存器（或反之）
    #[error("Register '{register}' is not in the {expected} region")]
    RegionMismatch {
        register: &'static str,
        expected: &'static str,
    },

    /// 同一用户动作对同一舵机重复持久写入
    #[error(
        "Persistent write to servo {servo} already performed for action #{action} ({justification})"
    )]
    PersistentWriteRepeated {
        servo: ServoId,
        action: u64,
        justification: &'static str,
    },

    /// 已被更新的动作取代的令牌
    #[error("Action #{action} ({justification}) has expired")]
    ActionExpired {
        action: u64,
        justification: &'static str,
    },

    /// 同一临界区内重复写入同一寄存器
    #[error("Register '{register}' already written in this persistent section of servo {servo}")]
    RegisterRewritten {
        servo: ServoId,
        register: &'static str,
    },

    /// 未登记的舵机
    #[error("Unknown servo id {0}")]
    UnknownServo(ServoId),

    /// 数值超出寄存器范围
    #[error("Value {value} out of range for register '{register}' (max {max})")]
    ValueOutOfRange {
        register: &'static str,
        value: u32,
        max: u32,
    },
}

impl DriverError {
    /// 是否可重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BusTimeout { .. })
    }

    /// 是否为可在安全检查点自动修复的完整性错误
    pub fn is_recoverable_integrity(&self) -> bool {
        matches!(self, Self::ModeCorruption { .. })
    }

    /// 是否为调用方参数错误（相同参数重试必然再次失败）
    pub fn is_rejected_parameters(&self) -> bool {
        matches!(
            self,
            Self::UnsafeCommandParameters { .. }
                | Self::RegionMismatch { .. }
                | Self::ValueOutOfRange { .. }
                | Self::PersistentWriteRepeated { .. }
                | Self::ActionExpired { .. }
                | Self::RegisterRewritten { .. }
        )
    }
}

impl From<BusError> for DriverError {
    fn from(err: BusError) -> Self {
        DriverError::Bus(err)
    }
}
