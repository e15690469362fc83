//! 位置采样
//!
//! 每个决策周期读取一次关节反馈，形成带时间戳的快照。
//! 规范单位是度，舵机刻度与弧度只在这里换算。

use std::time::Instant;

use roarm_driver::ServoBus;
use roarm_protocol::{AngleUnit, Deg, JointId, PositionReport, RawFeedback};
use tracing::warn;

use crate::error::ClientError;
use crate::joint::Arm;

/// 一个时间点的关节角度快照
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    taken_at: Instant,
    angles: [Option<Deg>; 4],
}

fn slot(joint: JointId) -> usize {
    u8::from(joint) as usize - 1
}

impl PositionSnapshot {
    pub fn empty(taken_at: Instant) -> Self {
        Self {
            taken_at,
            angles: [None; 4],
        }
    }

    /// 由原始读数构造（单位换算在此完成）
    pub fn from_raw(
        taken_at: Instant,
        readings: impl IntoIterator<Item = (JointId, RawFeedback)>,
    ) -> Self {
        let mut snapshot = Self::empty(taken_at);
        for (joint, raw) in readings {
            snapshot.insert(joint, raw.to_deg());
        }
        snapshot
    }

    pub fn insert(&mut self, joint: JointId, angle: Deg) {
        self.angles[slot(joint)] = Some(angle);
    }

    pub fn get(&self, joint: JointId) -> Option<Deg> {
        self.angles[slot(joint)]
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }

    pub fn iter(&self) -> impl Iterator<Item = (JointId, Deg)> + '_ {
        JointId::ALL
            .into_iter()
            .filter_map(|j| self.get(j).map(|angle| (j, angle)))
    }

    /// 全部四个关节都有读数
    pub fn is_complete(&self) -> bool {
        self.angles.iter().all(Option::is_some)
    }

    /// 转换为位置反馈报文（缺失的关节返回 `None`）
    pub fn to_report(&self, unit: AngleUnit) -> Option<PositionReport> {
        let mut angles = [(JointId::Base, Deg::ZERO); 4];
        for (entry, joint) in angles.iter_mut().zip(JointId::ALL) {
            *entry = (joint, self.get(joint)?);
        }
        Some(PositionReport::from_degrees(unit, angles))
    }
}

/// 位置采样器
pub struct PositionSampler;

impl PositionSampler {
    /// 采样指定关节
    ///
    /// 单个关节读取失败只记录日志，对应条目为空；快照本身总是返回。
    pub fn sample<B: ServoBus>(
        arm: &mut Arm<B>,
        joints: &[JointId],
        now: Instant,
    ) -> PositionSnapshot {
        let mut snapshot = PositionSnapshot::empty(now);
        for &joint in joints {
            match arm.joint_feedback(joint) {
                Ok(angle) => snapshot.insert(joint, angle),
                Err(e) => warn!("Joint {} feedback unavailable: {}", joint, e),
            }
        }
        snapshot
    }

    /// 采样全部关节，任何一个失败即返回错误
    pub fn sample_all<B: ServoBus>(
        arm: &mut Arm<B>,
        now: Instant,
    ) -> Result<PositionSnapshot, ClientError> {
        let mut snapshot = PositionSnapshot::empty(now);
        for joint in arm.joint_ids() {
            let angle = arm.joint_feedback(joint)?;
            snapshot.insert(joint, angle);
        }
        Ok(snapshot)
    }
}
