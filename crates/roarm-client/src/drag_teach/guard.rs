//! 冷却保护
//!
//! 按关节记录滚动窗口内的放松/保持循环次数。循环过于频繁时，
//! 下一次放松之前必须先完成一次延长保持。

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use roarm_protocol::JointId;
use tracing::info;

use super::context::Phase;
use crate::config::CooldownConfig;

/// 冷却保护
#[derive(Debug, Clone)]
pub struct CooldownGuard {
    window: Duration,
    max_cycles: u32,
    extended_hold: Duration,
    cycles: BTreeMap<JointId, VecDeque<Instant>>,
    extended: BTreeMap<JointId, u32>,
}

impl CooldownGuard {
    pub fn new(config: CooldownConfig) -> Self {
        Self {
            window: config.window(),
            max_cycles: config.max_cycles,
            extended_hold: config.extended_hold(),
            cycles: BTreeMap::new(),
            extended: BTreeMap::new(),
        }
    }

    /// 记录一次循环（进入保持状态时调用）
    pub fn record_cycle(&mut self, joint: JointId, now: Instant) {
        let window = self.window;
        let cycles = self.cycles.entry(joint).or_default();
        cycles.push_back(now);
        Self::prune(cycles, window, now);
    }

    fn prune(cycles: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        while let Some(&oldest) = cycles.front() {
            if now.saturating_duration_since(oldest) > window {
                cycles.pop_front();
            } else {
                break;
            }
        }
    }

    /// 窗口内的循环次数
    pub fn recent_cycles(&mut self, joint: JointId, now: Instant) -> usize {
        let window = self.window;
        match self.cycles.get_mut(&joint) {
            Some(cycles) => {
                Self::prune(cycles, window, now);
                cycles.len()
            },
            None => 0,
        }
    }

    /// 是否处于节流状态（下一次放松需要延长保持）
    pub fn is_throttled(&mut self, joint: JointId, now: Instant) -> bool {
        self.recent_cycles(joint, now) > self.max_cycles as usize
    }

    /// 是否允许状态转换
    ///
    /// 只有 `TorqueHolding → TorqueRelaxed` 受限：窗口内循环次数超过阈值时，
    /// 要求本次保持时间达到延长保持时间；放行后窗口清空。
    pub fn permit_transition(
        &mut self,
        joint: JointId,
        from: Phase,
        to: Phase,
        now: Instant,
        held_for: Duration,
    ) -> bool {
        if !(from == Phase::TorqueHolding && to == Phase::TorqueRelaxed) {
            return true;
        }
        if !self.is_throttled(joint, now) {
            return true;
        }
        if held_for < self.extended_hold {
            return false;
        }

        if let Some(cycles) = self.cycles.get_mut(&joint) {
            cycles.clear();
        }
        *self.extended.entry(joint).or_default() += 1;
        info!(
            "Joint {} completed extended hold of {:?}, cooldown window reset",
            joint, held_for
        );
        true
    }

    /// 已完成的延长保持次数
    pub fn extended_cooldowns(&self, joint: JointId) -> u32 {
        self.extended.get(&joint).copied().unwrap_or(0)
    }

    pub fn extended_hold(&self) -> Duration {
        self.extended_hold
    }
}
