//! 设备指令分发
//!
//! 单线程协作式循环的宿主：上位机指令在两拍之间处理，`tick()` 推进拖动示教。
//!
//! 拖动示教运行时：
//! - 运动类指令（T:100/101/102/210）被拒绝
//! - 力矩配置（T:112）只更新保持上限，在下一次保持时生效
//! - 位置查询（T:105）始终可用

use std::time::Instant;

use roarm_driver::{MotionProfile, ServoBus};
use roarm_protocol::{AngleUnit, HostCommand, PositionReport, TorqueProfileMode};
use tracing::{debug, info, warn};

use crate::config::ArmConfig;
use crate::drag_teach::{DragTeachEvent, DragTeachSession, TickOutcome};
use crate::error::ClientError;
use crate::joint::Arm;
use crate::sampler::PositionSampler;
use crate::torque::TorqueProfile;

/// 设备指令分发器
pub struct Dispatcher<B: ServoBus> {
    arm: Arm<B>,
    session: DragTeachSession,
    report_unit: AngleUnit,
}

impl<B: ServoBus> Dispatcher<B> {
    pub fn new(bus: B, config: &ArmConfig) -> Result<Self, ClientError> {
        Ok(Self {
            arm: Arm::new(bus, config)?,
            session: DragTeachSession::new(config.drag_teach.clone()),
            report_unit: AngleUnit::Deg,
        })
    }

    /// 位置反馈使用的单位
    pub fn with_report_unit(mut self, unit: AngleUnit) -> Self {
        self.report_unit = unit;
        self
    }

    pub fn arm(&self) -> &Arm<B> {
        &self.arm
    }

    pub fn arm_mut(&mut self) -> &mut Arm<B> {
        &mut self.arm
    }

    pub fn session(&self) -> &DragTeachSession {
        &self.session
    }

    pub fn is_drag_teach_active(&self) -> bool {
        self.session.is_active()
    }

    pub fn drain_events(&mut self) -> Vec<DragTeachEvent> {
        self.session.drain_events()
    }

    /// 推进一拍
    pub fn tick(&mut self, now: Instant) -> Result<TickOutcome, ClientError> {
        self.session.tick(&mut self.arm, now)
    }

    /// 解析并处理一行 JSON 指令，返回需要回送的报文
    pub fn handle_line(&mut self, line: &str, now: Instant) -> Result<Option<String>, ClientError> {
        let command = HostCommand::parse(line)?;
        match self.handle(command, now)? {
            Some(report) => Ok(Some(report.to_line()?)),
            None => Ok(None),
        }
    }

    fn reject_during_drag_teach(&self) -> Result<(), ClientError> {
        if self.session.is_active() {
            return Err(ClientError::DragTeachActive);
        }
        Ok(())
    }

    /// 处理一条指令
    pub fn handle(
        &mut self,
        command: HostCommand,
        now: Instant,
    ) -> Result<Option<PositionReport>, ClientError> {
        debug!("Host command: {:?}", command);
        match command {
            HostCommand::MoveInit => {
                self.reject_during_drag_teach()?;
                self.arm.move_init(MotionProfile::safe_minimum())?;
            },

            HostCommand::SingleJointMove(cmd) => {
                self.reject_during_drag_teach()?;
                let motion = MotionProfile::resolve(cmd.speed, cmd.acc);
                self.arm.set_joint_target(cmd.joint, cmd.angle.to_deg(), motion)?;
            },

            HostCommand::AllJointsMove(cmd) => {
                self.reject_during_drag_teach()?;
                let motion = MotionProfile::resolve(cmd.speed, cmd.acc);
                for (joint, angle) in cmd.targets() {
                    if self.arm.joint(joint).is_ok() {
                        self.arm.set_joint_target(joint, angle.to_deg(), motion)?;
                    }
                }
            },

            HostCommand::PositionQuery => {
                let snapshot = PositionSampler::sample_all(&mut self.arm, now)?;
                let report = snapshot.to_report(self.report_unit);
                if report.is_none() {
                    warn!("Position query on a partial arm, no report sent");
                }
                return Ok(report);
            },

            HostCommand::GainSet(gain) => {
                self.arm.set_gain(gain.joint, gain.p, gain.i)?;
            },

            HostCommand::GainReset => {
                for joint in self.arm.joint_ids() {
                    self.arm.reset_gain(joint)?;
                }
            },

            HostCommand::TorqueProfile(cmd) => {
                let profile = TorqueProfile::from_command(&cmd);
                if self.session.is_active() {
                    self.update_live_profile(cmd.mode, &profile, cmd.persist)?;
                } else {
                    match cmd.mode {
                        TorqueProfileMode::Set => {
                            self.arm.apply_torque_profile(&profile, cmd.persist)?
                        },
                        TorqueProfileMode::Reset => self.arm.reset_torque_profile(cmd.persist)?,
                    }
                }
            },

            HostCommand::TorqueEnable { on } => {
                self.reject_during_drag_teach()?;
                for joint in self.arm.joint_ids() {
                    self.arm.set_joint_torque_enabled(joint, on)?;
                }
            },

            HostCommand::DragTeach { enter: true } => {
                if self.session.is_active() {
                    info!("Drag-teach already active");
                }
                self.session.enter(&mut self.arm, now)?;
            },

            HostCommand::DragTeach { enter: false } => {
                self.session.request_exit();
            },
        }
        Ok(None)
    }

    /// 示教运行中的力矩配置：只更新保持上限
    fn update_live_profile(
        &mut self,
        mode: TorqueProfileMode,
        profile: &TorqueProfile,
        persist: bool,
    ) -> Result<(), ClientError> {
        let ceilings = match mode {
            TorqueProfileMode::Set => {
                self.arm.record_torque_profile(profile);
                profile.overlay(
                    self.session
                        .context()
                        .map(|c| c.hold_ceilings())
                        .unwrap_or_else(|| self.session.configured_hold_ceilings()),
                )
            },
            TorqueProfileMode::Reset => {
                self.arm.clear_torque_profile();
                self.session.configured_hold_ceilings()
            },
        };
        info!("Drag-teach hold ceilings updated: {:?}", ceilings);
        self.session.update_hold_ceilings(ceilings);
        if persist {
            self.arm.persist_torque_profile(profile)?;
        }
        Ok(())
    }
}
