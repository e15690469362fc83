//! 客户端模块
//!
//! 本模块在寄存器访问层之上提供机械臂的逻辑模型，包括：
//! - 关节模型（单舵机关节与镜像双舵机关节）
//! - 力矩配置与增益调节
//! - 位置采样
//! - 拖动示教（上下文 + 纯状态机 + 会话）
//! - 上位机指令分发
//!
//! # 使用场景
//!
//! 大多数用户通过 [`Dispatcher`] 使用本模块：在循环中交替调用
//! [`Dispatcher::handle_line`] 与 [`Dispatcher::tick`]。
//! 需要直接控制单个寄存器时，使用 [`Arm::access_mut`] 拿到驱动层接口。

pub mod config;
pub mod dispatcher;
pub mod drag_teach;
mod error;
pub mod joint;
pub mod sampler;
pub mod torque;

// 重新导出常用类型
pub use config::{ArmConfig, CooldownConfig, DragTeachConfig, HoldCeilings, JointConfig};
pub use dispatcher::Dispatcher;
pub use drag_teach::{
    CooldownGuard, DragAction, DragTeachContext, DragTeachEvent, DragTeachSession, Phase,
    TickInput, TickOutcome,
};
pub use error::ClientError;
pub use joint::{Arm, JointGroup, JointKind};
pub use sampler::{PositionSampler, PositionSnapshot};
pub use torque::TorqueProfile;
