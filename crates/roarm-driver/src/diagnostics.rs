//! 上电自检
//!
//! 持久寄存器损坏只在这里检测和修复：逐个读取工作模式寄存器，
//! 与期望值不符时记录告警、以 `BootRepair` 理由修复一次并回读确认，
//! 最后把力矩上限恢复为最大并开启扭矩。
//!
//! 工作模式正确的舵机不会产生任何持久写入，因此重复自检是幂等的。

use roarm_protocol::{OperatingMode, TORQUE_CEILING_MAX};
use tracing::{info, warn};

use crate::access::RegisterAccess;
use crate::bus::{ServoBus, ServoId};
use crate::error::DriverError;
use crate::persistent::Justification;

/// 一次工作模式修复
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeRepair {
    pub servo: ServoId,
    pub found: u8,
    /// 回读确认成功
    pub verified: bool,
}

/// 自检报告
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootReport {
    /// 已检查的舵机
    pub checked: Vec<ServoId>,
    /// 发现并修复的工作模式异常
    pub repairs: Vec<ModeRepair>,
}

impl BootReport {
    /// 是否所有舵机的工作模式都正确（或已确认修复）
    pub fn is_healthy(&self) -> bool {
        self.repairs.iter().all(|r| r.verified)
    }

    pub fn persistent_writes(&self) -> usize {
        self.repairs.len()
    }
}

/// 上电自检
#[derive(Debug, Clone, Copy)]
pub struct BootDiagnostics {
    expected_mode: OperatingMode,
}

impl Default for BootDiagnostics {
    fn default() -> Self {
        Self {
            expected_mode: OperatingMode::Position,
        }
    }
}

impl BootDiagnostics {
    pub fn new(expected_mode: OperatingMode) -> Self {
        Self { expected_mode }
    }

    pub fn expected_mode(&self) -> OperatingMode {
        self.expected_mode
    }

    /// 对全部已登记的舵机执行一次自检
    ///
    /// 整次自检共用一个 `BootRepair` 动作令牌，所以每个舵机最多一次持久写入。
    /// 总线超时直接返回错误，不做部分修复之外的补救。
    pub fn run<B: ServoBus>(
        &self,
        access: &mut RegisterAccess<B>,
    ) -> Result<BootReport, DriverError> {
        let expected = u8::from(self.expected_mode);
        let action = access.begin_action(Justification::BootRepair);
        let mode_register = access.register_map().operating_mode;
        let mut report = BootReport::default();

        for id in access.servo_ids() {
            report.checked.push(id);
            let found = access.read_operating_mode(id)?;

            if found != expected {
                let corruption = DriverError::ModeCorruption {
                    servo: id,
                    found,
                    expected,
                };
                warn!("{}, repairing", corruption);
                access.mark_mode_suspect(id, true)?;

                access.write_persistent(id, mode_register, expected as u16, &action)?;
                let verified = access.read_operating_mode(id)? == expected;
                if verified {
                    access.mark_mode_suspect(id, false)?;
                    info!("Servo {} operating mode repaired ({} -> {})", id, found, expected);
                } else {
                    warn!("Servo {} operating mode still wrong after repair", id);
                }
                report.repairs.push(ModeRepair {
                    servo: id,
                    found,
                    verified,
                });
            }

            if access.register_map().has_volatile_torque_limit() {
                access.set_torque_ceiling(id, TORQUE_CEILING_MAX)?;
            }
            access.set_torque_enabled(id, true)?;
        }

        info!(
            "Boot diagnostics: {} servos checked, {} repaired",
            report.checked.len(),
            report.repairs.len()
        );
        Ok(report)
    }
}
