//! 力矩与增益调校
//!
//! 一次性操作（非循环）：
//! - [`Arm::apply_torque_profile`] / [`Arm::reset_torque_profile`]：按关节设置力矩上限
//! - [`Arm::set_gain`] / [`Arm::reset_gain`]：位置环 P/I 增益
//!
//! 每次调用签发一个用户动作，因此每个通道最多一次持久写入。

use std::collections::BTreeMap;

use roarm_driver::{Justification, ServoBus, UserAction};
use roarm_protocol::{
    DEFAULT_GAIN_I, DEFAULT_GAIN_P, JointId, Region, TORQUE_CEILING_MAX, TorqueProfileCommand,
    TorqueProfileMode,
};
use tracing::info;

use crate::config::HoldCeilings;
use crate::error::ClientError;
use crate::joint::Arm;

/// 按关节的力矩上限
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TorqueProfile {
    ceilings: BTreeMap<JointId, u16>,
}

impl TorqueProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// 全部关节最大力矩
    pub fn full() -> Self {
        JointId::ALL
            .into_iter()
            .fold(Self::new(), |p, j| p.with(j, TORQUE_CEILING_MAX))
    }

    pub fn with(mut self, joint: JointId, ceiling: u16) -> Self {
        self.ceilings.insert(joint, ceiling.min(TORQUE_CEILING_MAX));
        self
    }

    /// 由上位机指令构造（`Reset` 模式得到全满力矩配置）
    pub fn from_command(command: &TorqueProfileCommand) -> Self {
        match command.mode {
            TorqueProfileMode::Reset => Self::full(),
            TorqueProfileMode::Set => command
                .ceilings()
                .into_iter()
                .fold(Self::new(), |p, (j, c)| p.with(j, c)),
        }
    }

    pub fn get(&self, joint: JointId) -> Option<u16> {
        self.ceilings.get(&joint).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (JointId, u16)> + '_ {
        self.ceilings.iter().map(|(j, c)| (*j, *c))
    }

    pub fn is_empty(&self) -> bool {
        self.ceilings.is_empty()
    }

    /// 覆盖到保持上限上（未指定的关节保持原值）
    pub fn overlay(&self, base: HoldCeilings) -> HoldCeilings {
        let mut ceilings = base;
        for (joint, ceiling) in self.iter() {
            ceilings.set(joint, ceiling);
        }
        ceilings
    }
}

impl<B: ServoBus> Arm<B> {
    /// 应用力矩配置
    ///
    /// 易失力矩上限立即生效；`persist` 为真或舵机家族没有易失上限时，
    /// 在同一用户动作下写入持久的最大力矩寄存器。
    pub fn apply_torque_profile(
        &mut self,
        profile: &TorqueProfile,
        persist: bool,
    ) -> Result<(), ClientError> {
        let volatile = self.has_volatile_torque_limit();
        if volatile {
            for (joint, ceiling) in profile.iter() {
                self.set_joint_torque_ceiling(joint, ceiling)?;
            }
        }
        if persist || !volatile {
            self.persist_torque_profile(profile)?;
        }
        info!("Torque profile applied: {:?} (persist={})", profile, persist);
        self.record_torque_profile(profile);
        Ok(())
    }

    /// 所有关节恢复最大力矩
    pub fn reset_torque_profile(&mut self, persist: bool) -> Result<(), ClientError> {
        self.apply_torque_profile(&TorqueProfile::full(), persist)?;
        self.torque_profile = None;
        Ok(())
    }

    /// 只记录力矩配置，不写寄存器（拖动示教运行中由会话在保持时应用）
    pub fn record_torque_profile(&mut self, profile: &TorqueProfile) {
        let merged = match self.torque_profile.take() {
            Some(current) => profile
                .iter()
                .fold(current, |p, (joint, ceiling)| p.with(joint, ceiling)),
            None => profile.clone(),
        };
        self.torque_profile = Some(merged);
    }

    pub fn clear_torque_profile(&mut self) {
        self.torque_profile = None;
    }

    /// 把力矩配置写入持久寄存器（每个通道一次）
    pub fn persist_torque_profile(&mut self, profile: &TorqueProfile) -> Result<(), ClientError> {
        let action = self.access_mut().begin_action(Justification::UserTune);
        let register = self.access().register_map().max_torque;
        for (joint, ceiling) in profile.iter() {
            let servos = self.joint(joint)?.servos();
            for servo in servos {
                self.access_mut()
                    .write_persistent(servo, register, ceiling, &action)?;
            }
        }
        Ok(())
    }

    /// 设置关节位置环增益
    pub fn set_gain(&mut self, joint: JointId, p: u8, i: u8) -> Result<(), ClientError> {
        let action = self.access_mut().begin_action(Justification::UserTune);
        self.write_gain(joint, p, i, &action)?;
        info!("Joint {} gain set to P={} I={}", joint, p, i);
        Ok(())
    }

    /// 恢复关节默认增益
    pub fn reset_gain(&mut self, joint: JointId) -> Result<(), ClientError> {
        let action = self.access_mut().begin_action(Justification::UserReset);
        self.write_gain(joint, DEFAULT_GAIN_P, DEFAULT_GAIN_I, &action)?;
        info!("Joint {} gain reset", joint);
        Ok(())
    }

    fn write_gain(
        &mut self,
        joint: JointId,
        p: u8,
        i: u8,
        action: &UserAction,
    ) -> Result<(), ClientError> {
        let map = self.access().register_map().clone();
        let servos = self.joint(joint)?.servos();
        for servo in servos {
            let access = self.access_mut();
            if map.gain_p.region == Region::Volatile {
                access.write_volatile(servo, map.gain_p, p as u16)?;
                access.write_volatile(servo, map.gain_i, i as u16)?;
                continue;
            }
            let mut guard = access.unlock(servo, action)?;
            guard.write(map.gain_p, p as u16)?;
            guard.write(map.gain_i, i as u16)?;
            guard.finish()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArmConfig;
    use roarm_driver::mock::MockServoBus;
    use roarm_protocol::ServoFamily;

    fn arm() -> (MockServoBus, Arm<MockServoBus>) {
        let bus = MockServoBus::new([11, 12, 13, 14, 15]);
        let arm = Arm::new(bus.clone(), &ArmConfig::default()).unwrap();
        (bus, arm)
    }

    #[test]
    fn test_profile_from_command() {
        let command = TorqueProfileCommand {
            mode: TorqueProfileMode::Set,
            base: None,
            shoulder: Some(500),
            elbow: Some(1200),
            hand: None,
            persist: false,
        };
        let profile = TorqueProfile::from_command(&command);
        assert_eq!(profile.get(JointId::Shoulder), Some(500));
        assert_eq!(profile.get(JointId::Elbow), Some(TORQUE_CEILING_MAX));
        assert_eq!(profile.get(JointId::Base), None);

        let reset = TorqueProfile::from_command(&TorqueProfileCommand {
            mode: TorqueProfileMode::Reset,
            ..command
        });
        assert_eq!(reset, TorqueProfile::full());
    }

    #[test]
    fn test_apply_then_reset_leaves_maximum() {
        let (bus, mut arm) = arm();
        arm.apply_torque_profile(&TorqueProfile::new().with(JointId::Shoulder, 500), false)
            .unwrap();
        assert_eq!(bus.register(12, 48), 500);
        assert_eq!(bus.register(13, 48), 500);
        assert_eq!(arm.torque_profile().and_then(|p| p.get(JointId::Shoulder)), Some(500));

        arm.reset_torque_profile(false).unwrap();
        assert_eq!(bus.register(12, 48), TORQUE_CEILING_MAX);
        assert_eq!(bus.register(13, 48), TORQUE_CEILING_MAX);
        assert!(arm.torque_profile().is_none());
        assert_eq!(bus.total_eeprom_writes(), 0);
    }

    #[test]
    fn test_persisted_profile_writes_once_per_channel() {
        let (bus, mut arm) = arm();
        arm.apply_torque_profile(&TorqueProfile::new().with(JointId::Shoulder, 600), true)
            .unwrap();
        assert_eq!(bus.eeprom_writes(12), 1);
        assert_eq!(bus.eeprom_writes(13), 1);
        assert_eq!(bus.eeprom(12, 16), 600);
        assert_eq!(bus.eeprom_writes(11), 0);
    }

    #[test]
    fn test_persistent_family_uses_persistent_path() {
        let map = ServoFamily::PersistentTorqueLimit.register_map();
        let bus = MockServoBus::with_register_map([11, 12, 13, 14, 15], map);
        let config = ArmConfig {
            family: ServoFamily::PersistentTorqueLimit,
            ..ArmConfig::default()
        };
        let mut arm = Arm::new(bus.clone(), &config).unwrap();
        arm.apply_torque_profile(&TorqueProfile::new().with(JointId::Elbow, 400), false)
            .unwrap();
        assert_eq!(bus.eeprom(14, 16), 400);
        assert_eq!(bus.eeprom_writes(14), 1);
        assert_eq!(arm.access().channel(14).unwrap().torque_ceiling(), 400);
    }

    #[test]
    fn test_set_and_reset_gain() {
        let (bus, mut arm) = arm();
        arm.set_gain(JointId::Shoulder, 8, 1).unwrap();
        assert_eq!(bus.eeprom(12, 21), 8);
        assert_eq!(bus.eeprom(13, 23), 1);
        assert_eq!(bus.eeprom_writes(12), 2);

        arm.reset_gain(JointId::Shoulder).unwrap();
        assert_eq!(bus.eeprom(12, 21), DEFAULT_GAIN_P as u16);
        assert_eq!(bus.eeprom(13, 23), DEFAULT_GAIN_I as u16);

        let records = arm.access().persistent_writes();
        assert_eq!(records.len(), 8);
        assert!(records[4..].iter().all(|r| r.justification == Justification::UserReset));
    }

    #[test]
    fn test_overlay() {
        let profile = TorqueProfile::new().with(JointId::Elbow, 300);
        let ceilings = profile.overlay(HoldCeilings::default());
        assert_eq!(ceilings.elbow, 300);
        assert_eq!(ceilings.shoulder, HoldCeilings::default().shoulder);
    }
}
