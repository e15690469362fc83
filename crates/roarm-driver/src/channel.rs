//! 舵机通道
//!
//! 一个物理舵机的运行时视图。只有 [`RegisterAccess`](crate::RegisterAccess)
//! 在成功读写后更新它，其他组件只读。

use crate::bus::ServoId;
use roarm_protocol::TORQUE_CEILING_MAX;

/// 通道在关节中的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// 主动舵机（反馈的真值来源）
    Driving,
    /// 从动舵机（镜像运动）
    Driven,
}

/// 物理舵机通道
#[derive(Debug, Clone, PartialEq)]
pub struct ServoChannel {
    id: ServoId,
    role: ChannelRole,
    pub(crate) torque_ceiling: u16,
    pub(crate) torque_enabled: bool,
    pub(crate) feedback: Option<u16>,
    pub(crate) mode_suspect: bool,
}

impl ServoChannel {
    pub fn new(id: ServoId, role: ChannelRole) -> Self {
        Self {
            id,
            role,
            torque_ceiling: TORQUE_CEILING_MAX,
            torque_enabled: true,
            feedback: None,
            mode_suspect: false,
        }
    }

    pub fn driving(id: ServoId) -> Self {
        Self::new(id, ChannelRole::Driving)
    }

    pub fn driven(id: ServoId) -> Self {
        Self::new(id, ChannelRole::Driven)
    }

    pub fn id(&self) -> ServoId {
        self.id
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// 最近一次写入的易失力矩上限
    pub fn torque_ceiling(&self) -> u16 {
        self.torque_ceiling
    }

    pub fn torque_enabled(&self) -> bool {
        self.torque_enabled
    }

    /// 最近一次读到的位置刻度
    pub fn feedback(&self) -> Option<u16> {
        self.feedback
    }

    /// 工作模式寄存器是否被发现异常且尚未修复
    pub fn mode_suspect(&self) -> bool {
        self.mode_suspect
    }

    /// 是否处于满力矩保持状态
    pub fn is_full_torque(&self) -> bool {
        self.torque_enabled && self.torque_ceiling == TORQUE_CEILING_MAX
    }
}
