//! 拖动示教会话
//!
//! 持有 `Option<DragTeachContext>`，在每拍中：
//! 1. 处理挂起的退出请求（恢复满力矩后销毁上下文）
//! 2. 仅在有关节需要感知时采样位置
//! 3. 调用纯状态机 [`step`]
//! 4. 通过易失路径执行动作
//!
//! 示教期间不会产生任何持久写入。

use std::time::Instant;

use roarm_driver::{MotionProfile, ServoBus};
use roarm_protocol::JointId;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use super::context::DragTeachContext;
use super::machine::{DragAction, DragTeachEvent, TickInput, step};
use crate::config::{DragTeachConfig, HoldCeilings};
use crate::error::ClientError;
use crate::joint::Arm;
use crate::sampler::PositionSampler;

/// 一拍的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// 示教未运行
    Idle,
    /// 正常推进
    Running,
    /// 本拍完成退出
    Exited,
}

/// 拖动示教会话
pub struct DragTeachSession {
    config: DragTeachConfig,
    context: Option<DragTeachContext>,
    exit_requested: bool,
    events: Vec<DragTeachEvent>,
}

impl DragTeachSession {
    pub fn new(config: DragTeachConfig) -> Self {
        Self {
            config,
            context: None,
            exit_requested: false,
            events: Vec::new(),
        }
    }

    pub fn config(&self) -> &DragTeachConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.context.is_some()
    }

    pub fn context(&self) -> Option<&DragTeachContext> {
        self.context.as_ref()
    }

    pub fn exit_pending(&self) -> bool {
        self.exit_requested
    }

    /// 取出累计的事件
    pub fn drain_events(&mut self) -> Vec<DragTeachEvent> {
        std::mem::take(&mut self.events)
    }

    /// 进入拖动示教
    ///
    /// 保持上限取自力矩配置（若已设置），否则取配置文件。
    /// 所有关节立即放松。已在运行时为空操作。
    pub fn enter<B: ServoBus>(
        &mut self,
        arm: &mut Arm<B>,
        now: Instant,
    ) -> Result<(), ClientError> {
        if self.context.is_some() {
            self.exit_requested = false;
            return Ok(());
        }
        let ceilings = match arm.torque_profile() {
            Some(profile) => profile.overlay(self.config.hold_ceilings),
            None => self.config.hold_ceilings,
        };
        let joints = arm.joint_ids();
        let context = DragTeachContext::new(joints.iter().copied(), &self.config, ceilings, now);
        info!("Entering drag-teach for {} joints, hold ceilings {:?}", joints.len(), ceilings);

        // 先建立上下文，放松失败时退出流程仍会恢复满力矩
        self.context = Some(context);
        self.exit_requested = false;
        let relax_ceiling = self.config.relax_ceiling;
        let mut first_error = None;
        for joint in joints {
            if let Err(e) = relax(arm, joint, relax_ceiling) {
                warn!("Failed to relax joint {} on drag-teach entry: {}", joint, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 请求退出，在下一拍处理
    pub fn request_exit(&mut self) {
        if self.context.is_some() {
            self.exit_requested = true;
        }
    }

    /// 更新保持上限（下一次进入保持时生效）
    pub fn update_hold_ceilings(&mut self, ceilings: HoldCeilings) {
        if let Some(ctx) = self.context.as_mut() {
            ctx.set_hold_ceilings(ceilings);
        }
    }

    /// 配置文件中的保持上限
    pub fn configured_hold_ceilings(&self) -> HoldCeilings {
        self.config.hold_ceilings
    }

    /// 推进一拍
    ///
    /// 所有动作都会尝试执行，返回遇到的第一个错误。
    pub fn tick<B: ServoBus>(
        &mut self,
        arm: &mut Arm<B>,
        now: Instant,
    ) -> Result<TickOutcome, ClientError> {
        let Some(ctx) = self.context.take() else {
            return Ok(TickOutcome::Idle);
        };

        if self.exit_requested {
            return self.finish_exit(arm, ctx);
        }

        let to_sample = ctx.joints_to_sample(now);
        let input = if to_sample.is_empty() {
            TickInput::new(now)
        } else {
            TickInput::with_snapshot(now, PositionSampler::sample(arm, &to_sample, now))
        };

        let (ctx, actions) = step(ctx, &input);
        self.context = Some(ctx);

        let mut first_error = None;
        for action in actions {
            if let Err(e) = self.apply(arm, action) {
                warn!("Drag-teach action {:?} failed: {}", action, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(TickOutcome::Running),
        }
    }

    fn finish_exit<B: ServoBus>(
        &mut self,
        arm: &mut Arm<B>,
        ctx: DragTeachContext,
    ) -> Result<TickOutcome, ClientError> {
        let joints: SmallVec<[JointId; 4]> = ctx.joints().iter().map(|s| s.joint).collect();
        let mut first_error = None;
        for joint in joints {
            if let Err(e) = arm.restore_full_torque(joint) {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            // 保留上下文与退出请求，下一拍重试
            warn!("Drag-teach exit incomplete, retrying next tick: {}", e);
            self.context = Some(ctx);
            return Err(e);
        }

        info!(
            "Drag-teach exited after {} ticks, all joints at full torque",
            ctx.ticks()
        );
        self.exit_requested = false;
        Ok(TickOutcome::Exited)
    }

    fn apply<B: ServoBus>(
        &mut self,
        arm: &mut Arm<B>,
        action: DragAction,
    ) -> Result<(), ClientError> {
        match action {
            DragAction::Relax { joint, ceiling } => relax(arm, joint, ceiling),
            DragAction::Hold {
                joint,
                target,
                ceiling,
            } => {
                // 失同步的镜像关节不接受位置指令，原地保持直到重新归位
                if arm.joint(joint)?.is_desynchronized() {
                    debug!("Joint {} desynchronized, holding in place", joint);
                    return hold_in_place(arm, joint, ceiling);
                }
                if !arm.has_volatile_torque_limit() {
                    // 扭矩开启时锁存当前位置，目标写入失败也不会回到旧目标
                    assert_torque(arm, joint, ceiling)?;
                    return arm.set_joint_target(joint, target, MotionProfile::safe_minimum());
                }
                // 上限为 0 时先改目标再抬上限，避免关节弹回旧目标
                match arm.set_joint_target(joint, target, MotionProfile::safe_minimum()) {
                    Ok(()) => assert_torque(arm, joint, ceiling),
                    Err(e) => {
                        warn!("Joint {} target rejected, holding in place: {}", joint, e);
                        hold_in_place(arm, joint, ceiling)?;
                        Err(e)
                    },
                }
            },
            DragAction::HoldInPlace { joint, ceiling } => hold_in_place(arm, joint, ceiling),
            DragAction::Notify(event) => {
                self.events.push(event);
                Ok(())
            },
        }
    }
}

/// 放松关节：有易失力矩上限时降低上限，否则关闭扭矩
fn relax<B: ServoBus>(arm: &mut Arm<B>, joint: JointId, ceiling: u16) -> Result<(), ClientError> {
    if arm.has_volatile_torque_limit() {
        arm.set_joint_torque_ceiling(joint, ceiling)
    } else {
        arm.set_joint_torque_enabled(joint, false)
    }
}

/// 恢复保持力矩（易失路径）
fn assert_torque<B: ServoBus>(
    arm: &mut Arm<B>,
    joint: JointId,
    ceiling: u16,
) -> Result<(), ClientError> {
    if arm.has_volatile_torque_limit() {
        arm.set_joint_torque_ceiling(joint, ceiling)
    } else {
        arm.set_joint_torque_enabled(joint, true)
    }
}

/// 在当前位置保持
///
/// 舵机只在扭矩由关闭变为开启时把当前位置锁存为目标。
/// 易失上限路径放松时扭矩一直开启，因此先关再开，锁存之后才抬起上限。
fn hold_in_place<B: ServoBus>(
    arm: &mut Arm<B>,
    joint: JointId,
    ceiling: u16,
) -> Result<(), ClientError> {
    if arm.has_volatile_torque_limit() {
        arm.set_joint_torque_enabled(joint, false)?;
        arm.set_joint_torque_enabled(joint, true)?;
        arm.set_joint_torque_ceiling(joint, ceiling)
    } else {
        arm.set_joint_torque_enabled(joint, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArmConfig;
    use crate::drag_teach::Phase;
    use crate::torque::TorqueProfile;
    use roarm_driver::mock::MockServoBus;
    use roarm_protocol::{Deg, ServoFamily, TORQUE_CEILING_MAX};
    use std::time::Duration;

    fn setup() -> (MockServoBus, Arm<MockServoBus>, DragTeachSession) {
        let bus = MockServoBus::new([11, 12, 13, 14, 15]);
        let config = ArmConfig::default();
        let arm = Arm::new(bus.clone(), &config).unwrap();
        (bus, arm, DragTeachSession::new(config.drag_teach))
    }

    #[test]
    fn test_enter_relaxes_all_joints() {
        let (bus, mut arm, mut session) = setup();
        session.enter(&mut arm, Instant::now()).unwrap();
        assert!(session.is_active());
        for id in [11, 12, 13, 14, 15] {
            assert_eq!(bus.register(id, 48), 0);
        }
    }

    #[test]
    fn test_enter_then_exit_restores_full_torque() {
        let (bus, mut arm, mut session) = setup();
        let now = Instant::now();
        session.enter(&mut arm, now).unwrap();
        session.request_exit();
        assert!(session.is_active());

        let outcome = session.tick(&mut arm, now + Duration::from_millis(20)).unwrap();
        assert_eq!(outcome, TickOutcome::Exited);
        assert!(!session.is_active());
        assert!(arm.is_full_torque());
        for id in [11, 12, 13, 14, 15] {
            assert_eq!(bus.register(id, 48), TORQUE_CEILING_MAX);
            assert_eq!(bus.register(id, 40), 1);
        }
        assert_eq!(bus.total_eeprom_writes(), 0);
    }

    #[test]
    fn test_exit_retried_after_failure() {
        let (bus, mut arm, mut session) = setup();
        let now = Instant::now();
        session.enter(&mut arm, now).unwrap();
        session.request_exit();

        bus.set_unresponsive(14, true);
        assert!(session.tick(&mut arm, now).is_err());
        assert!(session.is_active());
        assert!(session.exit_pending());

        bus.set_unresponsive(14, false);
        assert_eq!(session.tick(&mut arm, now).unwrap(), TickOutcome::Exited);
        assert!(arm.is_full_torque());
    }

    #[test]
    fn test_hold_uses_reduced_ceiling_and_safe_motion() {
        let (bus, mut arm, mut session) = setup();
        let start = Instant::now();
        session.enter(&mut arm, start).unwrap();

        // 用户把肘部拖到 +30°
        bus.set_position(14, (2047 + Deg(30.0).to_tick_offset()) as u16);
        let mut t = 0;
        while session.context().and_then(|c| c.phase(JointId::Elbow))
            != Some(Phase::TorqueHolding)
        {
            t += 20;
            session.tick(&mut arm, start + Duration::from_millis(t)).unwrap();
            assert!(t < 1000);
        }

        assert_eq!(bus.register(14, 48), 800);
        let commands = bus.position_commands(14);
        assert_eq!(
            commands.last(),
            Some(&roarm_driver::mock::MockWrite::Position {
                id: 14,
                position: (2047 + Deg(30.0).to_tick_offset()) as u16,
                speed: roarm_driver::MIN_SAFE_SPEED,
                acc: roarm_driver::MIN_SAFE_ACC,
            })
        );
        assert_eq!(bus.operating_mode(14), 0);
    }

    #[test]
    fn test_profile_ceilings_used_on_entry() {
        let (bus, mut arm, mut session) = setup();
        arm.apply_torque_profile(&TorqueProfile::new().with(JointId::Base, 300), false)
            .unwrap();
        let start = Instant::now();
        session.enter(&mut arm, start).unwrap();
        assert_eq!(
            session.context().unwrap().hold_ceilings().base,
            300
        );

        let mut t = 0;
        while session.context().and_then(|c| c.phase(JointId::Base))
            != Some(Phase::TorqueHolding)
        {
            t += 20;
            session.tick(&mut arm, start + Duration::from_millis(t)).unwrap();
        }
        assert_eq!(bus.register(11, 48), 300);
    }

    #[test]
    fn test_persistent_family_relaxes_with_torque_enable() {
        let map = ServoFamily::PersistentTorqueLimit.register_map();
        let bus = MockServoBus::with_register_map([11, 12, 13, 14, 15], map);
        let config = ArmConfig {
            family: ServoFamily::PersistentTorqueLimit,
            ..ArmConfig::default()
        };
        let mut arm = Arm::new(bus.clone(), &config).unwrap();
        let mut session = DragTeachSession::new(config.drag_teach);

        let start = Instant::now();
        session.enter(&mut arm, start).unwrap();
        assert_eq!(bus.register(14, 40), 0);

        for t in (20..3000).step_by(20) {
            session.tick(&mut arm, start + Duration::from_millis(t)).unwrap();
        }
        session.request_exit();
        session.tick(&mut arm, start + Duration::from_millis(3000)).unwrap();
        assert_eq!(bus.register(14, 40), 1);
        assert_eq!(bus.total_eeprom_writes(), 0);
    }

    #[test]
    fn test_desynchronized_shoulder_still_holds() {
        let (bus, mut arm, mut session) = setup();
        let start = Instant::now();
        session.enter(&mut arm, start).unwrap();

        let shoulder_phase =
            |s: &DragTeachSession| s.context().and_then(|c| c.phase(JointId::Shoulder));
        let mut t = 0;
        while shoulder_phase(&session) != Some(Phase::TorqueHolding) {
            t += 20;
            session.tick(&mut arm, start + Duration::from_millis(t)).unwrap();
        }

        // 从动舵机偏离镜像位置 60 刻度
        bus.set_position(12, 2047 + 100);
        bus.set_position(13, 2047 - 100 + 60);
        let assert_holding = |t: u64, session: &mut DragTeachSession, arm: &mut Arm<MockServoBus>| {
            let _ = session.tick(arm, start + Duration::from_millis(t));
            if shoulder_phase(&*session) == Some(Phase::TorqueHolding) {
                assert_ne!(bus.register(12, 48), 0, "shoulder dropped at {} ms", t);
                assert_ne!(bus.register(13, 48), 0, "shoulder dropped at {} ms", t);
            }
        };
        while t < 6000 {
            t += 20;
            assert_holding(t, &mut session, &mut arm);
        }
        assert!(arm.joint(JointId::Shoulder).unwrap().is_desynchronized());

        bus.set_position(13, 2047 - 100);
        while t < 9000 {
            t += 20;
            assert_holding(t, &mut session, &mut arm);
        }
        // 原地保持，不回到旧目标
        assert_eq!(bus.position(12), 2047 + 100);
        assert_eq!(bus.position(13), 2047 - 100);
        assert_eq!(bus.total_eeprom_writes(), 0);
    }

    #[test]
    fn test_sensing_unavailable_latches_present_position() {
        let (bus, mut arm, mut session) = setup();
        // 进入示教前肩部已经失同步，且不在上一次指令的目标上
        bus.set_position(12, 2047 + 200);
        bus.set_position(13, 2047 - 200 + 60);
        assert_eq!(bus.goal(12), 2047);

        let start = Instant::now();
        session.enter(&mut arm, start).unwrap();
        let mut t = 0;
        while session.context().and_then(|c| c.phase(JointId::Shoulder))
            != Some(Phase::TorqueHolding)
        {
            t += 20;
            let _ = session.tick(&mut arm, start + Duration::from_millis(t));
            assert!(t < 2000);
        }

        assert!(
            session
                .drain_events()
                .contains(&DragTeachEvent::SensingUnavailable {
                    joint: JointId::Shoulder
                })
        );
        assert_eq!(bus.goal(12), 2047 + 200);
        assert_eq!(bus.goal(13), 2047 - 200 + 60);
        assert_eq!(bus.position(12), 2047 + 200);
        assert_eq!(bus.register(12, 48), 800);
        assert_eq!(bus.register(12, 40), 1);
        assert!(bus.position_commands(12).is_empty());
    }

    #[test]
    fn test_sensing_fallback_event() {
        let (bus, mut arm, mut session) = setup();
        let start = Instant::now();
        session.enter(&mut arm, start).unwrap();

        // 第一轮正常保持，记录可信位置
        let mut t = 0;
        while session.context().and_then(|c| c.phase(JointId::Hand))
            != Some(Phase::TorqueHolding)
        {
            t += 20;
            session.tick(&mut arm, start + Duration::from_millis(t)).unwrap();
        }
        // 之后手部舵机失去应答
        bus.set_unresponsive(15, true);
        for _ in 0..100 {
            t += 20;
            let _ = session.tick(&mut arm, start + Duration::from_millis(t));
        }
        let events = session.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            DragTeachEvent::SensingFallback {
                joint: JointId::Hand,
                ..
            }
        )));
    }
}
