//! 关节模型
//!
//! 逻辑关节到物理舵机的映射：
//! - 单舵机关节：一个通道，目标刻度 `middle + offset`
//! - 镜像双舵机关节：主动 `middle + offset`，从动 `middle - offset`，两路作为一个逻辑操作下发
//!
//! 主动舵机是反馈的真值来源，从动舵机只用于交叉校验。

use roarm_driver::{
    BootDiagnostics, BootReport, MotionProfile, RegisterAccess, RetryPolicy, ServoBus,
    ServoChannel, ServoId,
};
use roarm_protocol::{Deg, JointId, RawFeedback, TICKS_PER_REV, decode_signed_position};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::config::{ArmConfig, JointConfig};
use crate::error::ClientError;
use crate::torque::TorqueProfile;

/// 关节类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JointKind {
    Single,
    DualMirrored,
}

/// 逻辑关节
#[derive(Debug, Clone, PartialEq)]
pub struct JointGroup {
    joint: JointId,
    kind: JointKind,
    driving: ServoId,
    driven: Option<ServoId>,
    middle: u16,
    desynchronized: bool,
}

impl JointGroup {
    pub fn from_config(config: &JointConfig, middle: u16) -> Self {
        Self {
            joint: config.joint,
            kind: if config.driven.is_some() {
                JointKind::DualMirrored
            } else {
                JointKind::Single
            },
            driving: config.driving,
            driven: config.driven,
            middle,
            desynchronized: false,
        }
    }

    pub fn joint(&self) -> JointId {
        self.joint
    }

    pub fn kind(&self) -> JointKind {
        self.kind
    }

    pub fn driving(&self) -> ServoId {
        self.driving
    }

    pub fn driven(&self) -> Option<ServoId> {
        self.driven
    }

    pub fn middle(&self) -> u16 {
        self.middle
    }

    /// 是否需要重新归位
    pub fn is_desynchronized(&self) -> bool {
        self.desynchronized
    }

    /// 关节全部通道
    pub fn servos(&self) -> SmallVec<[ServoId; 2]> {
        let mut servos = SmallVec::new();
        servos.push(self.driving);
        if let Some(driven) = self.driven {
            servos.push(driven);
        }
        servos
    }

    /// 角度对应的物理目标刻度
    ///
    /// 偏移量先按行程对称截断，因此镜像关节始终满足
    /// `driving = middle + d`、`driven = middle - d`。
    pub fn targets(&self, angle: Deg) -> SmallVec<[(ServoId, u16); 2]> {
        let middle = self.middle as i32;
        let max_tick = TICKS_PER_REV as i32 - 1;
        let reach = match self.driven {
            Some(_) => middle.min(max_tick - middle).max(0),
            None => max_tick,
        };
        let offset = angle.to_tick_offset().clamp(-reach, reach);

        let mut targets = SmallVec::new();
        match self.driven {
            Some(driven) => {
                targets.push((self.driving, (middle + offset) as u16));
                targets.push((driven, (middle - offset) as u16));
            },
            None => {
                targets.push((self.driving, (middle + offset).clamp(0, max_tick) as u16));
            },
        }
        targets
    }

    /// 主动舵机刻度对应的从动舵机期望刻度
    pub fn expected_driven(&self, driving_raw: u16) -> i32 {
        2 * self.middle as i32 - driving_raw as i32
    }

    /// 舵机刻度换算为角度
    pub fn ticks_to_deg(&self, raw: u16) -> Deg {
        if raw & 0x8000 != 0 {
            Deg::from_tick_offset(decode_signed_position(raw) - self.middle as i32)
        } else {
            RawFeedback::Ticks {
                raw,
                middle: self.middle,
            }
            .to_deg()
        }
    }
}

/// 机械臂：关节模型 + 独占的寄存器访问层
pub struct Arm<B: ServoBus> {
    access: RegisterAccess<B>,
    joints: Vec<JointGroup>,
    mirror_tolerance: Deg,
    pub(crate) torque_profile: Option<TorqueProfile>,
}

impl<B: ServoBus> Arm<B> {
    pub fn new(bus: B, config: &ArmConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let joints: Vec<JointGroup> = config
            .joints
            .iter()
            .map(|j| JointGroup::from_config(j, config.middle_position))
            .collect();
        let channels = config.joints.iter().flat_map(|j| {
            std::iter::once(ServoChannel::driving(j.driving))
                .chain(j.driven.map(ServoChannel::driven))
        });
        let access = RegisterAccess::new(bus, config.family.register_map(), channels)
            .with_retry_policy(RetryPolicy {
                max_attempts: config.retry_attempts,
            });
        Ok(Self {
            access,
            joints,
            mirror_tolerance: config.mirror_tolerance(),
            torque_profile: None,
        })
    }

    pub fn access(&self) -> &RegisterAccess<B> {
        &self.access
    }

    pub fn access_mut(&mut self) -> &mut RegisterAccess<B> {
        &mut self.access
    }

    pub fn joints(&self) -> &[JointGroup] {
        &self.joints
    }

    pub fn joint_ids(&self) -> SmallVec<[JointId; 4]> {
        self.joints.iter().map(|j| j.joint).collect()
    }

    pub fn joint(&self, joint: JointId) -> Result<&JointGroup, ClientError> {
        self.joints
            .iter()
            .find(|j| j.joint == joint)
            .ok_or(ClientError::UnknownJoint(joint))
    }

    fn joint_mut(&mut self, joint: JointId) -> Result<&mut JointGroup, ClientError> {
        self.joints
            .iter_mut()
            .find(|j| j.joint == joint)
            .ok_or(ClientError::UnknownJoint(joint))
    }

    pub fn mirror_tolerance(&self) -> Deg {
        self.mirror_tolerance
    }

    /// 当前生效的力矩配置（未设置时为 `None`）
    pub fn torque_profile(&self) -> Option<&TorqueProfile> {
        self.torque_profile.as_ref()
    }

    /// 上电自检（检测并修复工作模式，恢复满力矩）
    pub fn boot(&mut self) -> Result<BootReport, ClientError> {
        Ok(BootDiagnostics::default().run(&mut self.access)?)
    }

    // ==================== 运动 ====================

    /// 设置关节目标角度
    ///
    /// 镜像关节先写主动舵机再写从动舵机；从动写入失败时关节被标记为失同步，
    /// 后续运动指令会被拒绝，直到 [`Arm::rehome`]。
    pub fn set_joint_target(
        &mut self,
        joint: JointId,
        angle: Deg,
        motion: MotionProfile,
    ) -> Result<(), ClientError> {
        let group = self.joint(joint)?;
        if group.desynchronized {
            return Err(ClientError::JointDesynchronized(joint));
        }
        let targets = group.targets(angle);
        debug!("Joint {} -> {} ({:?})", joint, angle, targets);
        self.write_targets(joint, &targets, motion)
    }

    fn write_targets(
        &mut self,
        joint: JointId,
        targets: &[(ServoId, u16)],
        motion: MotionProfile,
    ) -> Result<(), ClientError> {
        for (index, &(servo, position)) in targets.iter().enumerate() {
            if let Err(e) = self.access.command_position(servo, position, motion) {
                if index > 0 {
                    warn!(
                        "Joint {} desynchronized: servo {} rejected its mirrored target: {}",
                        joint, servo, e
                    );
                    self.joint_mut(joint)?.desynchronized = true;
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// 所有关节回到中位
    ///
    /// 失同步的关节经 [`Arm::rehome`] 归位。单个关节失败不影响其余关节，返回第一个错误。
    pub fn move_init(&mut self, motion: MotionProfile) -> Result<(), ClientError> {
        let mut first_error = None;
        for joint in self.joint_ids() {
            let result = if self.joint(joint)?.desynchronized {
                self.rehome(joint)
            } else {
                self.set_joint_target(joint, Deg::ZERO, motion)
            };
            if let Err(e) = result {
                warn!("Joint {} did not return to middle: {}", joint, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 重新归位：两路通道一起回中位，并清除失同步标记
    pub fn rehome(&mut self, joint: JointId) -> Result<(), ClientError> {
        let targets = self.joint(joint)?.targets(Deg::ZERO);
        self.write_targets(joint, &targets, MotionProfile::safe_minimum())?;
        self.joint_mut(joint)?.desynchronized = false;
        info!("Joint {} re-homed", joint);
        Ok(())
    }

    // ==================== 反馈 ====================

    /// 读取关节角度
    ///
    /// 读主动舵机；镜像关节同时读取从动舵机，与 `2·middle − driving` 比较，
    /// 超出容差时返回 `MirrorDesync` 并暂停该关节的运动。
    pub fn joint_feedback(&mut self, joint: JointId) -> Result<Deg, ClientError> {
        let group = self.joint(joint)?.clone();
        let driving_raw = self.access.read_position(group.driving)?;
        let angle = group.ticks_to_deg(driving_raw);

        if let Some(driven) = group.driven {
            let driven_raw = self.access.read_position(driven)?;
            let expected = group.expected_driven(driving_raw);
            let drift = Deg::from_tick_offset(driven_raw as i32 - expected).abs();
            if drift > self.mirror_tolerance {
                warn!(
                    "Joint {} mirror drift {} exceeds {} (driving={}, driven={})",
                    joint, drift, self.mirror_tolerance, driving_raw, driven_raw
                );
                self.joint_mut(joint)?.desynchronized = true;
                return Err(ClientError::MirrorDesync {
                    joint,
                    drift,
                    tolerance: self.mirror_tolerance,
                });
            }
        }
        Ok(angle)
    }

    // ==================== 易失力矩控制 ====================

    /// 关节全部通道的扭矩开关
    pub fn set_joint_torque_enabled(
        &mut self,
        joint: JointId,
        on: bool,
    ) -> Result<(), ClientError> {
        let servos = self.joint(joint)?.servos();
        for servo in servos {
            self.access.set_torque_enabled(servo, on)?;
        }
        Ok(())
    }

    /// 关节全部通道的易失力矩上限
    pub fn set_joint_torque_ceiling(
        &mut self,
        joint: JointId,
        ceiling: u16,
    ) -> Result<(), ClientError> {
        let servos = self.joint(joint)?.servos();
        for servo in servos {
            self.access.set_torque_ceiling(servo, ceiling)?;
        }
        Ok(())
    }

    /// 恢复关节满力矩保持
    ///
    /// 逐个通道尝试，返回第一个错误。
    pub fn restore_full_torque(&mut self, joint: JointId) -> Result<(), ClientError> {
        let mut first_error = None;
        let servos = self.joint(joint)?.servos();
        for servo in servos {
            if let Err(e) = self.access.restore_full_torque(servo) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// 当前舵机家族是否有易失的力矩上限寄存器
    pub fn has_volatile_torque_limit(&self) -> bool {
        self.access.register_map().has_volatile_torque_limit()
    }

    /// 所有通道是否都处于满力矩保持
    pub fn is_full_torque(&self) -> bool {
        self.access.channels().all(|c| c.is_full_torque())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use roarm_driver::DriverError;
    use roarm_driver::mock::MockServoBus;
    use roarm_protocol::MIDDLE_POSITION;

    fn shoulder() -> JointGroup {
        JointGroup::from_config(
            &JointConfig::mirrored(JointId::Shoulder, 12, 13),
            MIDDLE_POSITION,
        )
    }

    fn arm() -> (MockServoBus, Arm<MockServoBus>) {
        let bus = MockServoBus::new([11, 12, 13, 14, 15]);
        let arm = Arm::new(bus.clone(), &ArmConfig::default()).unwrap();
        (bus, arm)
    }

    #[test]
    fn test_single_joint_targets() {
        let base = JointGroup::from_config(&JointConfig::single(JointId::Base, 11), 2047);
        assert_eq!(base.kind(), JointKind::Single);
        assert_eq!(base.targets(Deg(90.0)).as_slice(), &[(11, 2047 + 1024)]);
        assert_eq!(base.targets(Deg(-400.0)).as_slice(), &[(11, 0)]);
    }

    #[test]
    fn test_mirrored_targets() {
        let group = shoulder();
        assert_eq!(group.kind(), JointKind::DualMirrored);
        assert_eq!(
            group.targets(Deg(45.0)).as_slice(),
            &[(12, 2047 + 512), (13, 2047 - 512)]
        );
    }

    proptest! {
        /// 镜像公式：driving = middle + d，driven = middle − d
        #[test]
        fn mirrored_targets_are_symmetric(angle in -179.0f64..179.0) {
            let group = shoulder();
            let targets = group.targets(Deg(angle));
            let d = Deg(angle).to_tick_offset();
            prop_assert_eq!(targets.len(), 2);
            prop_assert_eq!(targets[0].1 as i32, MIDDLE_POSITION as i32 + d);
            prop_assert_eq!(targets[1].1 as i32, MIDDLE_POSITION as i32 - d);
        }

        /// 超出行程时仍然保持对称
        #[test]
        fn clamped_targets_stay_symmetric(angle in -720.0f64..720.0) {
            let group = shoulder();
            let targets = group.targets(Deg(angle));
            let sum = targets[0].1 as i32 + targets[1].1 as i32;
            prop_assert_eq!(sum, 2 * MIDDLE_POSITION as i32);
        }
    }

    #[test]
    fn test_set_joint_target_mirrored() {
        let (bus, mut arm) = arm();
        arm.set_joint_target(JointId::Shoulder, Deg(-30.0), MotionProfile::safe_minimum())
            .unwrap();
        let d = Deg(-30.0).to_tick_offset();
        assert_eq!(bus.position(12) as i32, 2047 + d);
        assert_eq!(bus.position(13) as i32, 2047 - d);

        let angle = arm.joint_feedback(JointId::Shoulder).unwrap();
        assert!((angle.0 + 30.0).abs() < 0.1);
    }

    #[test]
    fn test_driven_failure_desynchronizes() {
        let (bus, mut arm) = arm();
        bus.set_unresponsive(13, true);
        let result =
            arm.set_joint_target(JointId::Shoulder, Deg(10.0), MotionProfile::safe_minimum());
        assert!(matches!(
            result,
            Err(ClientError::Driver(DriverError::BusTimeout { servo: 13, .. }))
        ));
        assert!(arm.joint(JointId::Shoulder).unwrap().is_desynchronized());

        // 失同步后拒绝运动
        bus.set_unresponsive(13, false);
        assert!(matches!(
            arm.set_joint_target(JointId::Shoulder, Deg(10.0), MotionProfile::safe_minimum()),
            Err(ClientError::JointDesynchronized(JointId::Shoulder))
        ));

        arm.rehome(JointId::Shoulder).unwrap();
        assert!(!arm.joint(JointId::Shoulder).unwrap().is_desynchronized());
        assert_eq!(bus.position(12), 2047);
        assert_eq!(bus.position(13), 2047);
    }

    #[test]
    fn test_move_init_rehomes_and_continues() {
        let (bus, mut arm) = arm();
        bus.set_unresponsive(13, true);
        assert!(arm
            .set_joint_target(JointId::Shoulder, Deg(10.0), MotionProfile::safe_minimum())
            .is_err());
        arm.set_joint_target(JointId::Elbow, Deg(20.0), MotionProfile::safe_minimum())
            .unwrap();

        // 从动舵机仍无应答：肩部归位失败，其余关节照常回中位
        assert!(arm.move_init(MotionProfile::safe_minimum()).is_err());
        assert!(arm.joint(JointId::Shoulder).unwrap().is_desynchronized());
        assert_eq!(bus.position(14), 2047);

        bus.set_unresponsive(13, false);
        arm.move_init(MotionProfile::safe_minimum()).unwrap();
        assert!(!arm.joint(JointId::Shoulder).unwrap().is_desynchronized());
        assert_eq!(bus.position(12), 2047);
        assert_eq!(bus.position(13), 2047);
    }

    #[test]
    fn test_out_of_range_middle_does_not_panic() {
        let group = JointGroup::from_config(
            &JointConfig::mirrored(JointId::Shoulder, 12, 13),
            TICKS_PER_REV + 100,
        );
        let targets = group.targets(Deg(30.0));
        let middle = (TICKS_PER_REV + 100) as i32;
        assert_eq!(targets[0].1 as i32, middle);
        assert_eq!(targets[1].1 as i32, middle);
    }

    #[test]
    fn test_driving_failure_does_not_desynchronize() {
        let (bus, mut arm) = arm();
        bus.set_unresponsive(12, true);
        assert!(arm
            .set_joint_target(JointId::Shoulder, Deg(10.0), MotionProfile::safe_minimum())
            .is_err());
        assert!(!arm.joint(JointId::Shoulder).unwrap().is_desynchronized());
    }

    #[test]
    fn test_feedback_detects_mirror_drift() {
        let (bus, mut arm) = arm();
        bus.set_position(12, 2047 + 100);
        bus.set_position(13, 2047 - 100 + 60);
        let result = arm.joint_feedback(JointId::Shoulder);
        assert!(matches!(
            result,
            Err(ClientError::MirrorDesync {
                joint: JointId::Shoulder,
                ..
            })
        ));
        assert!(arm.joint(JointId::Shoulder).unwrap().is_desynchronized());
    }

    #[test]
    fn test_feedback_within_tolerance() {
        let (bus, mut arm) = arm();
        bus.set_position(12, 2047 + 100);
        bus.set_position(13, 2047 - 100 + 10);
        let angle = arm.joint_feedback(JointId::Shoulder).unwrap();
        assert_eq!(angle, Deg::from_tick_offset(100));
    }

    #[test]
    fn test_unknown_joint() {
        let bus = MockServoBus::new([11]);
        let config = ArmConfig {
            joints: vec![JointConfig::single(JointId::Base, 11)],
            ..ArmConfig::default()
        };
        let mut arm = Arm::new(bus, &config).unwrap();
        assert!(matches!(
            arm.joint_feedback(JointId::Elbow),
            Err(ClientError::UnknownJoint(JointId::Elbow))
        ));
    }

    #[test]
    fn test_restore_full_torque() {
        let (_bus, mut arm) = arm();
        arm.set_joint_torque_ceiling(JointId::Shoulder, 0).unwrap();
        assert!(!arm.is_full_torque());
        arm.restore_full_torque(JointId::Shoulder).unwrap();
        assert!(arm.is_full_torque());
    }
}
