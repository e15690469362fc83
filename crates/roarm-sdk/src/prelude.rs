//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use roarm_sdk::prelude::*;
//! ```

// 客户端层
pub use crate::client::{
    Arm, ArmConfig, ClientError, Dispatcher, DragTeachEvent, DragTeachSession, HoldCeilings,
    PositionSampler, PositionSnapshot, TickOutcome, TorqueProfile,
};

// 驱动层
pub use crate::driver::{DriverError, Justification, MotionProfile, ServoBus, ServoId};

// 协议层
pub use crate::protocol::{
    AngleUnit, Deg, HostCommand, JointId, PositionReport, ProtocolError, Rad, ServoFamily,
};
