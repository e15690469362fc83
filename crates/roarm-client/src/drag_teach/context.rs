//! 拖动示教上下文
//!
//! 进入示教时创建、退出时销毁，是示教期间全部可变状态的唯一所有者。

use std::fmt;
use std::time::{Duration, Instant};

use roarm_protocol::{Deg, JointId};
use smallvec::SmallVec;

use super::guard::CooldownGuard;
use crate::config::{DragTeachConfig, HoldCeilings};

/// 单个关节的示教阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// 力矩放松，可被拖动
    TorqueRelaxed,
    /// 等待稳定并读取位置
    Sensing,
    /// 以降低的力矩保持在基准位置
    TorqueHolding,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::TorqueRelaxed => "relaxed",
            Phase::Sensing => "sensing",
            Phase::TorqueHolding => "holding",
        };
        f.write_str(name)
    }
}

/// 状态机的时间参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DragTeachTimings {
    pub relax_dwell: Duration,
    pub settle: Duration,
    pub hold_dwell: Duration,
    pub max_sense_retries: u32,
}

impl From<&DragTeachConfig> for DragTeachTimings {
    fn from(config: &DragTeachConfig) -> Self {
        Self {
            relax_dwell: config.relax_dwell(),
            settle: config.settle(),
            hold_dwell: config.hold_dwell(),
            max_sense_retries: config.max_sense_retries,
        }
    }
}

/// 单个关节的示教状态
#[derive(Debug, Clone, PartialEq)]
pub struct JointState {
    pub joint: JointId,
    pub phase: Phase,
    /// 进入当前阶段的时间
    pub entered_at: Instant,
    /// 最近一次改变力矩的时间（之后 `settle` 内的读数不可信）
    pub torque_changed_at: Instant,
    /// 本轮保持的目标位置
    pub baseline: Option<Deg>,
    /// 最近一次成功读取的位置
    pub last_good: Option<Deg>,
    /// 本轮感知阶段连续失败次数
    pub sense_failures: u32,
    /// 冷却保护正在要求延长保持
    pub throttled: bool,
}

impl JointState {
    fn new(joint: JointId, now: Instant) -> Self {
        Self {
            joint,
            phase: Phase::TorqueRelaxed,
            entered_at: now,
            torque_changed_at: now,
            baseline: None,
            last_good: None,
            sense_failures: 0,
            throttled: false,
        }
    }

    pub(crate) fn enter(&mut self, phase: Phase, now: Instant) {
        self.phase = phase;
        self.entered_at = now;
    }

    /// 在当前阶段停留的时间
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.entered_at)
    }

    /// 力矩变化后是否已经稳定
    pub fn is_settled(&self, now: Instant, settle: Duration) -> bool {
        now.saturating_duration_since(self.torque_changed_at) >= settle
    }
}

/// 拖动示教上下文
#[derive(Debug, Clone)]
pub struct DragTeachContext {
    pub(crate) joints: SmallVec<[JointState; 4]>,
    pub(crate) hold_ceilings: HoldCeilings,
    pub(crate) relax_ceiling: u16,
    pub(crate) timings: DragTeachTimings,
    pub(crate) guard: CooldownGuard,
    pub(crate) started_at: Instant,
    pub(crate) ticks: u64,
}

impl DragTeachContext {
    /// 所有关节从放松状态开始
    pub fn new(
        joints: impl IntoIterator<Item = JointId>,
        config: &DragTeachConfig,
        hold_ceilings: HoldCeilings,
        now: Instant,
    ) -> Self {
        Self {
            joints: joints.into_iter().map(|j| JointState::new(j, now)).collect(),
            hold_ceilings,
            relax_ceiling: config.relax_ceiling,
            timings: DragTeachTimings::from(config),
            guard: CooldownGuard::new(config.cooldown),
            started_at: now,
            ticks: 0,
        }
    }

    pub fn joints(&self) -> &[JointState] {
        &self.joints
    }

    pub fn joint(&self, joint: JointId) -> Option<&JointState> {
        self.joints.iter().find(|s| s.joint == joint)
    }

    pub fn phase(&self, joint: JointId) -> Option<Phase> {
        self.joint(joint).map(|s| s.phase)
    }

    pub fn hold_ceilings(&self) -> HoldCeilings {
        self.hold_ceilings
    }

    pub fn set_hold_ceilings(&mut self, ceilings: HoldCeilings) {
        self.hold_ceilings = ceilings;
    }

    pub fn relax_ceiling(&self) -> u16 {
        self.relax_ceiling
    }

    pub fn timings(&self) -> DragTeachTimings {
        self.timings
    }

    pub fn guard(&self) -> &CooldownGuard {
        &self.guard
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// 这一拍需要读取位置的关节（处于感知阶段且已稳定）
    pub fn joints_to_sample(&self, now: Instant) -> SmallVec<[JointId; 4]> {
        self.joints
            .iter()
            .filter(|s| s.phase == Phase::Sensing && s.is_settled(now, self.timings.settle))
            .map(|s| s.joint)
            .collect()
    }
}
