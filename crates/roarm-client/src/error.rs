//! 客户端层错误类型

use roarm_driver::DriverError;
use roarm_protocol::{Deg, JointId, ProtocolError};
use thiserror::Error;

/// 客户端层错误类型
#[derive(Error, Debug)]
pub enum ClientError {
    /// 驱动层错误
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// 协议错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 镜像关节主从舵机偏差超限
    #[error("Joint {joint} mirror desync: driven channel drifted {drift} (tolerance {tolerance})")]
    MirrorDesync {
        joint: JointId,
        drift: Deg,
        tolerance: Deg,
    },

    /// 关节处于失同步状态，需要重新归位
    #[error("Joint {0} is desynchronized, re-home required")]
    JointDesynchronized(JointId),

    /// 拖动示教运行中，拒绝运动指令
    #[error("Drag-teach is active, motion command rejected")]
    DragTeachActive,

    /// 未配置的关节
    #[error("Joint {0} is not configured")]
    UnknownJoint(JointId),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// 是否可重试（仅总线超时）
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Driver(e) if e.is_retryable())
    }

    /// 是否可通过重新归位或自检恢复
    pub fn is_recoverable(&self) -> bool {
        match self {
            ClientError::MirrorDesync { .. } | ClientError::JointDesynchronized(_) => true,
            ClientError::Driver(e) => e.is_recoverable_integrity(),
            _ => false,
        }
    }
}

impl From<toml::de::Error> for ClientError {
    fn from(err: toml::de::Error) -> Self {
        ClientError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ClientError::MirrorDesync {
            joint: JointId::Shoulder,
            drift: Deg(4.5),
            tolerance: Deg(3.0),
        };
        assert_eq!(
            err.to_string(),
            "Joint shoulder mirror desync: driven channel drifted 4.50° (tolerance 3.00°)"
        );
        assert_eq!(
            ClientError::JointDesynchronized(JointId::Shoulder).to_string(),
            "Joint shoulder is desynchronized, re-home required"
        );
    }

    #[test]
    fn test_classification() {
        let timeout = ClientError::from(DriverError::BusTimeout {
            servo: 12,
            operation: "read present_position",
            attempts: 3,
        });
        assert!(timeout.is_retryable());
        assert!(!timeout.is_recoverable());
        assert!(ClientError::JointDesynchronized(JointId::Shoulder).is_recoverable());
        assert!(!ClientError::DragTeachActive.is_retryable());
    }
}
