//! # RoArm Protocol
//!
//! 串行总线舵机机械臂的协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `registers`: 寄存器表（地址、宽度、易失/持久区域）与工作模式
//! - `units`: 强类型角度单位与舵机刻度换算
//! - `command`: 上位机 JSON 指令与位置反馈报文
//!
//! ## 单位约定
//!
//! 舵机以 4096 刻度/圈的整数刻度上报位置；上层一律使用角度（度）比较阈值，
//! 换算只发生在边界上（见 [`units`]）。

pub mod command;
pub mod registers;
pub mod units;

// 重新导出常用类型
pub use command::*;
pub use registers::*;
pub use units::*;

use thiserror::Error;

/// 协议解析错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed JSON command: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing command discriminator field 'T'")]
    MissingDiscriminator,

    #[error("Unknown command code T={0}")]
    UnknownCommand(u64),

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: String, value: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnknownCommand(999);
        assert_eq!(format!("{}", err), "Unknown command code T=999");

        let err = ProtocolError::InvalidValue {
            field: "joint".to_string(),
            value: 9,
        };
        assert!(format!("{}", err).contains("joint"));
    }
}
