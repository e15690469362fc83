//! 持久寄存器写入授权
//!
//! EEPROM 写入次数有限，因此每一次持久写入都必须绑定到一个显式的理由：
//! - 上电自检修复（每个舵机每次自检最多一次）
//! - 用户发起的调参 / 复位（每个舵机每个用户动作最多一次）
//!
//! [`UserAction`] 只能由 [`RegisterAccess::begin_action`](crate::RegisterAccess::begin_action)
//! 签发，[`PersistentWriteGuard`] 只能由 `unlock` 得到。
//! 守卫在 `finish()` 或 drop 时重新上锁，临界区无法交错。

use std::collections::HashSet;
use std::fmt;

use tracing::{error, info};

use crate::access::RegisterAccess;
use crate::bus::{ServoBus, ServoId};
use crate::error::DriverError;
use roarm_protocol::{Region, Register};

/// 持久写入理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Justification {
    /// 上电自检修复工作模式
    BootRepair,
    /// 用户调参（增益、力矩上限）
    UserTune,
    /// 用户复位为默认值
    UserReset,
}

impl Justification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Justification::BootRepair => "boot repair",
            Justification::UserTune => "user tune",
            Justification::UserReset => "user reset",
        }
    }
}

impl fmt::Display for Justification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 动作令牌
///
/// 字段私有，只能由访问层签发。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserAction {
    id: u64,
    justification: Justification,
}

impl UserAction {
    pub(crate) fn new(id: u64, justification: Justification) -> Self {
        Self { id, justification }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn justification(&self) -> Justification {
        self.justification
    }
}

/// 一次已提交的持久写入
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentWriteRecord {
    pub servo: ServoId,
    pub register: &'static str,
    pub value: u16,
    pub action: u64,
    pub justification: Justification,
}

/// 持久写入临界区
#[must_use = "dropping the guard re-locks the EEPROM immediately"]
pub struct PersistentWriteGuard<'a, B: ServoBus> {
    access: &'a mut RegisterAccess<B>,
    servo: ServoId,
    action: UserAction,
    written: HashSet<u8>,
    locked: bool,
}

impl<'a, B: ServoBus> PersistentWriteGuard<'a, B> {
    pub(crate) fn new(
        access: &'a mut RegisterAccess<B>,
        servo: ServoId,
        action: UserAction,
    ) -> Self {
        Self {
            access,
            servo,
            action,
            written: HashSet::new(),
            locked: false,
        }
    }

    pub fn servo(&self) -> ServoId {
        self.servo
    }

    /// 写入一个持久寄存器（同一临界区内每个寄存器最多一次）
    pub fn write(&mut self, register: Register, value: u16) -> Result<(), DriverError> {
        if register.region != Region::Persistent {
            return Err(DriverError::RegionMismatch {
                register: register.name,
                expected: "persistent",
            });
        }
        if value > register.max_value() {
            return Err(DriverError::ValueOutOfRange {
                register: register.name,
                value: value as u32,
                max: register.max_value() as u32,
            });
        }
        if self.written.contains(&register.address) {
            return Err(DriverError::RegisterRewritten {
                servo: self.servo,
                register: register.name,
            });
        }

        let servo = self.servo;
        self.access
            .retrying(servo, register.name, |bus| bus.write(servo, register, value))?;
        self.written.insert(register.address);

        info!(
            "Servo {} persistent {} <- {} (action #{}, {})",
            servo,
            register.name,
            value,
            self.action.id(),
            self.action.justification()
        );
        self.access.record(PersistentWriteRecord {
            servo,
            register: register.name,
            value,
            action: self.action.id(),
            justification: self.action.justification(),
        });

        // 力矩上限只有持久版本时，通道缓存同样需要更新
        if register == self.access.map.torque_limit {
            self.access.channel_mut(servo)?.torque_ceiling = value;
        }
        Ok(())
    }

    /// 结束临界区并重新上锁
    pub fn finish(mut self) -> Result<(), DriverError> {
        self.locked = true;
        self.access.relock(self.servo)
    }
}

impl<B: ServoBus> Drop for PersistentWriteGuard<'_, B> {
    fn drop(&mut self) {
        if self.locked {
            return;
        }
        if let Err(e) = self.access.relock(self.servo) {
            error!(
                "Failed to re-lock EEPROM of servo {} (action #{}): {}",
                self.servo,
                self.action.id(),
                e
            );
        }
    }
}
