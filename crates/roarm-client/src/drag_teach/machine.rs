//! 拖动示教状态机
//!
//! 纯转换函数 `(context, input) -> (context, actions)`，每拍调用一次，
//! 不做任何总线访问。动作由会话层执行。
//!
//! ```text
//! TorqueRelaxed --relax_dwell--> Sensing --settle + 读数--> TorqueHolding
//!       ^                                                       |
//!       +------------- hold_dwell + 冷却保护放行 ----------------+
//! ```

use std::time::Instant;

use roarm_protocol::{Deg, JointId};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use super::context::{DragTeachContext, Phase};
use crate::sampler::PositionSnapshot;

/// 一拍的输入
#[derive(Debug, Clone)]
pub struct TickInput {
    pub now: Instant,
    /// 本拍的位置快照（没有关节需要采样时为 `None`）
    pub snapshot: Option<PositionSnapshot>,
}

impl TickInput {
    pub fn new(now: Instant) -> Self {
        Self {
            now,
            snapshot: None,
        }
    }

    pub fn with_snapshot(now: Instant, snapshot: PositionSnapshot) -> Self {
        Self {
            now,
            snapshot: Some(snapshot),
        }
    }

    fn angle(&self, joint: JointId) -> Option<Deg> {
        self.snapshot.as_ref().and_then(|s| s.get(joint))
    }
}

/// 可观测事件
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DragTeachEvent {
    /// 感知失败次数耗尽，退回到最近一次可信位置
    SensingFallback { joint: JointId, baseline: Deg },
    /// 从未得到可信位置，原地恢复力矩
    SensingUnavailable { joint: JointId },
    /// 循环过于频繁，开始延长保持
    CooldownEngaged { joint: JointId },
}

/// 状态机输出的动作
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DragAction {
    /// 放松关节
    Relax { joint: JointId, ceiling: u16 },
    /// 以降低的力矩保持在目标位置（最小安全速度）
    Hold {
        joint: JointId,
        target: Deg,
        ceiling: u16,
    },
    /// 原地恢复力矩，不发送位置指令
    HoldInPlace { joint: JointId, ceiling: u16 },
    /// 事件
    Notify(DragTeachEvent),
}

pub type DragActions = SmallVec<[DragAction; 8]>;

/// 推进一拍
pub fn step(mut ctx: DragTeachContext, input: &TickInput) -> (DragTeachContext, DragActions) {
    let now = input.now;
    let timings = ctx.timings;
    let mut actions = DragActions::new();
    ctx.ticks += 1;

    for index in 0..ctx.joints.len() {
        let joint = ctx.joints[index].joint;
        match ctx.joints[index].phase {
            Phase::TorqueRelaxed => {
                let state = &mut ctx.joints[index];
                if state.elapsed(now) >= timings.relax_dwell {
                    state.enter(Phase::Sensing, now);
                    state.sense_failures = 0;
                    debug!("Joint {} relaxed -> sensing", joint);
                }
            },

            Phase::Sensing => {
                if !ctx.joints[index].is_settled(now, timings.settle) {
                    continue;
                }
                let ceiling = ctx.hold_ceilings.get(joint);
                let state = &mut ctx.joints[index];

                let hold = match input.angle(joint) {
                    Some(angle) => {
                        state.last_good = Some(angle);
                        Some(DragAction::Hold {
                            joint,
                            target: angle,
                            ceiling,
                        })
                    },
                    None => {
                        state.sense_failures += 1;
                        if state.sense_failures < timings.max_sense_retries.max(1) {
                            debug!(
                                "Joint {} sensing failed ({}/{})",
                                joint, state.sense_failures, timings.max_sense_retries
                            );
                            None
                        } else if let Some(baseline) = state.last_good {
                            warn!(
                                "Joint {} sensing failed {} times, holding last known position {}",
                                joint, state.sense_failures, baseline
                            );
                            actions.push(DragAction::Notify(DragTeachEvent::SensingFallback {
                                joint,
                                baseline,
                            }));
                            Some(DragAction::Hold {
                                joint,
                                target: baseline,
                                ceiling,
                            })
                        } else {
                            warn!(
                                "Joint {} has no known position, re-asserting torque in place",
                                joint
                            );
                            actions.push(DragAction::Notify(
                                DragTeachEvent::SensingUnavailable { joint },
                            ));
                            Some(DragAction::HoldInPlace { joint, ceiling })
                        }
                    },
                };

                if let Some(action) = hold {
                    state.baseline = match action {
                        DragAction::Hold { target, .. } => Some(target),
                        _ => None,
                    };
                    state.sense_failures = 0;
                    state.enter(Phase::TorqueHolding, now);
                    state.torque_changed_at = now;
                    ctx.guard.record_cycle(joint, now);
                    actions.push(action);
                    debug!("Joint {} sensing -> holding", joint);
                }
            },

            Phase::TorqueHolding => {
                let held_for = ctx.joints[index].elapsed(now);
                if held_for < timings.hold_dwell {
                    continue;
                }
                let permitted = ctx.guard.permit_transition(
                    joint,
                    Phase::TorqueHolding,
                    Phase::TorqueRelaxed,
                    now,
                    held_for,
                );
                let state = &mut ctx.joints[index];
                if !permitted {
                    if !state.throttled {
                        state.throttled = true;
                        info!("Joint {} cycling too fast, extending hold", joint);
                        actions.push(DragAction::Notify(DragTeachEvent::CooldownEngaged {
                            joint,
                        }));
                    }
                    continue;
                }
                state.throttled = false;
                state.enter(Phase::TorqueRelaxed, now);
                state.torque_changed_at = now;
                actions.push(DragAction::Relax {
                    joint,
                    ceiling: ctx.relax_ceiling,
                });
                debug!("Joint {} holding -> relaxed", joint);
            },
        }
    }

    (ctx, actions)
}
