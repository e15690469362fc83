//! 寄存器访问层
//!
//! 所有舵机寄存器读写的唯一入口：
//! - 总线超时在本地有限次重试，耗尽后以 `BusTimeout` 上报
//! - 易失接口拒绝持久寄存器，持久写入只能经由 [`PersistentWriteGuard`]
//! - 位置指令在发送前检查速度与加速度非零

use std::collections::{BTreeMap, HashSet};

use roarm_protocol::{
    EEPROM_LOCKED, EEPROM_UNLOCKED, Region, Register, RegisterMap, TORQUE_CEILING_MAX,
};
use tracing::{debug, trace, warn};

use crate::bus::{BusError, ServoBus, ServoId};
use crate::channel::ServoChannel;
use crate::error::DriverError;
use crate::motion::MotionProfile;
use crate::persistent::{Justification, PersistentWriteGuard, PersistentWriteRecord, UserAction};

/// 审计记录保留条数，超出后丢弃最早的记录
pub const MAX_AUDIT_RECORDS: usize = 256;

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 单次操作的最大尝试次数（含首次）
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// 寄存器访问层
///
/// 独占总线与全部 [`ServoChannel`]。
pub struct RegisterAccess<B: ServoBus> {
    pub(crate) bus: B,
    pub(crate) map: RegisterMap,
    pub(crate) channels: BTreeMap<ServoId, ServoChannel>,
    pub(crate) retry: RetryPolicy,
    next_action: u64,
    pub(crate) ledger: HashSet<(ServoId, u64)>,
    pub(crate) audit: Vec<PersistentWriteRecord>,
}

impl<B: ServoBus> RegisterAccess<B> {
    pub fn new(bus: B, map: RegisterMap, channels: impl IntoIterator<Item = ServoChannel>) -> Self {
        Self {
            bus,
            map,
            channels: channels.into_iter().map(|c| (c.id(), c)).collect(),
            retry: RetryPolicy::default(),
            next_action: 1,
            ledger: HashSet::new(),
            audit: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            max_attempts: retry.max_attempts.max(1),
        };
        self
    }

    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn channel(&self, id: ServoId) -> Result<&ServoChannel, DriverError> {
        self.channels.get(&id).ok_or(DriverError::UnknownServo(id))
    }

    pub fn channels(&self) -> impl Iterator<Item = &ServoChannel> {
        self.channels.values()
    }

    pub fn servo_ids(&self) -> Vec<ServoId> {
        self.channels.keys().copied().collect()
    }

    /// 总线（只读，用于诊断）
    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub(crate) fn channel_mut(&mut self, id: ServoId) -> Result<&mut ServoChannel, DriverError> {
        self.channels.get_mut(&id).ok_or(DriverError::UnknownServo(id))
    }

    /// 带重试执行一次总线操作
    pub(crate) fn retrying<T>(
        &mut self,
        servo: ServoId,
        operation: &'static str,
        mut op: impl FnMut(&mut B) -> Result<T, BusError>,
    ) -> Result<T, DriverError> {
        let attempts = self.retry.max_attempts;
        for attempt in 1..=attempts {
            match op(&mut self.bus) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_timeout() => {
                    debug!(
                        "Servo {} timeout on {} (attempt {}/{})",
                        servo, operation, attempt, attempts
                    );
                },
                Err(err) => return Err(DriverError::Bus(err)),
            }
        }
        Err(DriverError::BusTimeout {
            servo,
            operation,
            attempts,
        })
    }

    fn check_value(register: Register, value: u16) -> Result<(), DriverError> {
        if value > register.max_value() {
            return Err(DriverError::ValueOutOfRange {
                register: register.name,
                value: value as u32,
                max: register.max_value() as u32,
            });
        }
        Ok(())
    }

    // ==================== 易失区域 ====================

    /// 读取易失寄存器
    pub fn read_volatile(&mut self, id: ServoId, register: Register) -> Result<u16, DriverError> {
        if register.region != Region::Volatile {
            return Err(DriverError::RegionMismatch {
                register: register.name,
                expected: "volatile",
            });
        }
        self.channel(id)?;
        self.retrying(id, register.name, |bus| bus.read(id, register))
    }

    /// 写入易失寄存器（任何频率都合法）
    pub fn write_volatile(
        &mut self,
        id: ServoId,
        register: Register,
        value: u16,
    ) -> Result<(), DriverError> {
        if register.region != Region::Volatile {
            return Err(DriverError::RegionMismatch {
                register: register.name,
                expected: "volatile",
            });
        }
        Self::check_value(register, value)?;
        self.channel(id)?;
        trace!("Servo {} volatile {} <- {}", id, register.name, value);
        self.retrying(id, register.name, |bus| bus.write(id, register, value))?;

        let map = self.map.clone();
        let channel = self.channel_mut(id)?;
        if register == map.torque_limit {
            channel.torque_ceiling = value;
        } else if register == map.torque_enable {
            channel.torque_enabled = value != 0;
        }
        Ok(())
    }

    /// 读取持久寄存器的当前值（读取本身无副作用）
    pub fn read_persistent(&mut self, id: ServoId, register: Register) -> Result<u16, DriverError> {
        if register.region != Region::Persistent {
            return Err(DriverError::RegionMismatch {
                register: register.name,
                expected: "persistent",
            });
        }
        self.channel(id)?;
        self.retrying(id, register.name, |bus| bus.read(id, register))
    }

    /// 读取当前位置刻度并更新通道反馈
    pub fn read_position(&mut self, id: ServoId) -> Result<u16, DriverError> {
        let register = self.map.present_position;
        let raw = self.read_volatile(id, register)?;
        self.channel_mut(id)?.feedback = Some(raw);
        Ok(raw)
    }

    /// 扭矩开关（易失）
    pub fn set_torque_enabled(&mut self, id: ServoId, on: bool) -> Result<(), DriverError> {
        let register = self.map.torque_enable;
        self.write_volatile(id, register, on as u16)
    }

    /// 设置易失力矩上限
    ///
    /// 当前舵机家族没有易失的力矩上限寄存器时返回 `RegionMismatch`，
    /// 调用方应改用扭矩开关或一次性的持久写入。
    pub fn set_torque_ceiling(&mut self, id: ServoId, ceiling: u16) -> Result<(), DriverError> {
        let register = self.map.torque_limit;
        if ceiling > TORQUE_CEILING_MAX {
            return Err(DriverError::ValueOutOfRange {
                register: register.name,
                value: ceiling as u32,
                max: TORQUE_CEILING_MAX as u32,
            });
        }
        self.write_volatile(id, register, ceiling)
    }

    /// 恢复满力矩保持（力矩上限最大 + 扭矩开启）
    pub fn restore_full_torque(&mut self, id: ServoId) -> Result<(), DriverError> {
        if self.map.has_volatile_torque_limit() {
            self.set_torque_ceiling(id, TORQUE_CEILING_MAX)?;
        }
        self.set_torque_enabled(id, true)
    }

    // ==================== 位置指令 ====================

    /// 发送位置指令（原始参数）
    ///
    /// 速度或加速度为 0 时在发送前拒绝。
    pub fn command_position_raw(
        &mut self,
        id: ServoId,
        position: u16,
        speed: u16,
        acc: u8,
    ) -> Result<(), DriverError> {
        if speed == 0 || acc == 0 {
            warn!(
                "Rejected position command for servo {} with speed={} acc={}",
                id, speed, acc
            );
            return Err(DriverError::UnsafeCommandParameters {
                servo: id,
                speed,
                acc,
            });
        }
        self.channel(id)?;
        trace!(
            "Servo {} position <- {} (speed={}, acc={})",
            id, position, speed, acc
        );
        self.retrying(id, "write position", |bus| {
            bus.write_position(id, position, speed, acc)
        })
    }

    /// 发送位置指令
    pub fn command_position(
        &mut self,
        id: ServoId,
        position: u16,
        motion: MotionProfile,
    ) -> Result<(), DriverError> {
        self.command_position_raw(id, position, motion.speed(), motion.acc())
    }

    // ==================== 持久区域 ====================

    /// 为一次用户发起的操作（或一次上电自检）签发动作令牌
    ///
    /// 新令牌签发后，之前的令牌全部失效，账本只保留当前动作的条目。
    pub fn begin_action(&mut self, justification: Justification) -> UserAction {
        let action = UserAction::new(self.next_action, justification);
        self.next_action += 1;
        self.ledger.retain(|&(_, id)| id >= action.id());
        debug!("Begin action #{} ({})", action.id(), justification);
        action
    }

    /// 打开持久写入临界区（unlock）
    ///
    /// 返回的守卫独占本访问层，临界区结束（`finish()` 或 drop）时重新上锁。
    /// 同一动作对同一舵机只能打开一次。
    pub fn unlock(
        &mut self,
        id: ServoId,
        action: &UserAction,
    ) -> Result<PersistentWriteGuard<'_, B>, DriverError> {
        self.channel(id)?;
        if action.id() + 1 < self.next_action {
            return Err(DriverError::ActionExpired {
                action: action.id(),
                justification: action.justification().as_str(),
            });
        }
        if self.ledger.contains(&(id, action.id())) {
            return Err(DriverError::PersistentWriteRepeated {
                servo: id,
                action: action.id(),
                justification: action.justification().as_str(),
            });
        }
        let lock = self.map.eeprom_lock;
        self.retrying(id, "unlock eeprom", |bus| {
            bus.write(id, lock, EEPROM_UNLOCKED as u16)
        })?;
        self.ledger.insert((id, action.id()));
        debug!(
            "Servo {} EEPROM unlocked for action #{} ({})",
            id,
            action.id(),
            action.justification()
        );
        Ok(PersistentWriteGuard::new(self, id, *action))
    }

    /// 单个持久寄存器写入：unlock → write → lock
    pub fn write_persistent(
        &mut self,
        id: ServoId,
        register: Register,
        value: u16,
        action: &UserAction,
    ) -> Result<(), DriverError> {
        let mut guard = self.unlock(id, action)?;
        guard.write(register, value)?;
        guard.finish()
    }

    pub(crate) fn relock(&mut self, id: ServoId) -> Result<(), DriverError> {
        let lock = self.map.eeprom_lock;
        self.retrying(id, "lock eeprom", |bus| {
            bus.write(id, lock, EEPROM_LOCKED as u16)
        })
    }

    pub(crate) fn record(&mut self, record: PersistentWriteRecord) {
        if self.audit.len() >= MAX_AUDIT_RECORDS {
            self.audit.remove(0);
        }
        self.audit.push(record);
    }

    /// 持久写入审计记录（最近 [`MAX_AUDIT_RECORDS`] 条）
    pub fn persistent_writes(&self) -> &[PersistentWriteRecord] {
        &self.audit
    }

    /// 审计记录中指定舵机的持久写入次数
    pub fn persistent_write_count(&self, id: ServoId) -> usize {
        self.audit.iter().filter(|r| r.servo == id).count()
    }

    // ==================== 工作模式 ====================

    /// 读取工作模式寄存器
    ///
    /// 返回原始值；未知值保留给诊断报告。
    pub fn read_operating_mode(&mut self, id: ServoId) -> Result<u8, DriverError> {
        let register = self.map.operating_mode;
        Ok(self.read_persistent(id, register)? as u8)
    }

    pub(crate) fn mark_mode_suspect(
        &mut self,
        id: ServoId,
        suspect: bool,
    ) -> Result<(), DriverError> {
        self.channel_mut(id)?.mode_suspect = suspect;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ServoChannel;
    use crate::mock::{MockServoBus, MockWrite};
    use crate::motion::{MIN_SAFE_ACC, MIN_SAFE_SPEED};

    fn access() -> (MockServoBus, RegisterAccess<MockServoBus>) {
        let bus = MockServoBus::new([11, 12, 13]);
        let access = RegisterAccess::new(
            bus.clone(),
            RegisterMap::st_series(),
            [
                ServoChannel::driving(11),
                ServoChannel::driving(12),
                ServoChannel::driven(13),
            ],
        );
        (bus, access)
    }

    #[test]
    fn test_write_volatile_updates_channel() {
        let (bus, mut access) = access();
        access.set_torque_ceiling(12, 300).unwrap();
        assert_eq!(access.channel(12).unwrap().torque_ceiling(), 300);
        assert_eq!(bus.register(12, 48), 300);

        access.set_torque_enabled(12, false).unwrap();
        assert!(!access.channel(12).unwrap().torque_enabled());
        assert_eq!(access.persistent_write_count(12), 0);
    }

    #[test]
    fn test_write_volatile_rejects_persistent_register() {
        let (_bus, mut access) = access();
        let mode = access.register_map().operating_mode;
        assert!(matches!(
            access.write_volatile(11, mode, 0),
            Err(DriverError::RegionMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_servo() {
        let (_bus, mut access) = access();
        assert!(matches!(
            access.set_torque_enabled(99, true),
            Err(DriverError::UnknownServo(99))
        ));
    }

    #[test]
    fn test_zero_speed_rejected_before_transmission() {
        let (bus, mut access) = access();
        let result = access.command_position_raw(11, 2047, 0, 0);
        assert!(matches!(
            result,
            Err(DriverError::UnsafeCommandParameters { servo: 11, .. })
        ));
        assert!(bus.position_commands(11).is_empty());
        assert_eq!(bus.operating_mode(11), 0);
    }

    #[test]
    fn test_command_position_with_resolved_profile() {
        let (bus, mut access) = access();
        access
            .command_position(11, 3000, MotionProfile::resolve(0, 0))
            .unwrap();
        let commands = bus.position_commands(11);
        assert_eq!(commands.len(), 1);
        assert_eq!(
            commands[0],
            MockWrite::Position {
                id: 11,
                position: 3000,
                speed: MIN_SAFE_SPEED,
                acc: MIN_SAFE_ACC,
            }
        );
    }

    #[test]
    fn test_timeout_retried_then_succeeds() {
        let (bus, mut access) = access();
        bus.inject_timeouts(2);
        access.set_torque_enabled(11, true).unwrap();
    }

    #[test]
    fn test_timeout_exhausts_retries() {
        let (bus, mut access) = access();
        bus.inject_timeouts(3);
        let result = access.read_position(11);
        assert!(matches!(
            result,
            Err(DriverError::BusTimeout {
                servo: 11,
                attempts: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_write_persistent_unlock_write_lock() {
        let (bus, mut access) = access();
        let action = access.begin_action(Justification::UserTune);
        let gain_p = access.register_map().gain_p;
        access.write_persistent(12, gain_p, 8, &action).unwrap();

        assert_eq!(bus.eeprom(12, 21), 8);
        assert_eq!(bus.register(12, 55), EEPROM_LOCKED as u16);
        assert_eq!(access.persistent_write_count(12), 1);
        assert_eq!(access.persistent_writes()[0].justification, Justification::UserTune);
    }

    #[test]
    fn test_write_persistent_once_per_action() {
        let (_bus, mut access) = access();
        let action = access.begin_action(Justification::UserTune);
        let gain_p = access.register_map().gain_p;
        access.write_persistent(12, gain_p, 8, &action).unwrap();
        assert!(matches!(
            access.write_persistent(12, gain_p, 9, &action),
            Err(DriverError::PersistentWriteRepeated { servo: 12, .. })
        ));

        // 新的用户动作可以再次写入
        let next = access.begin_action(Justification::UserTune);
        access.write_persistent(12, gain_p, 9, &next).unwrap();
        assert_eq!(access.persistent_write_count(12), 2);
    }

    #[test]
    fn test_begin_action_retires_previous_actions() {
        let (_bus, mut access) = access();
        let gain_p = access.register_map().gain_p;
        let first = access.begin_action(Justification::UserTune);
        access.write_persistent(11, gain_p, 8, &first).unwrap();
        access.write_persistent(12, gain_p, 8, &first).unwrap();
        assert_eq!(access.ledger.len(), 2);

        let second = access.begin_action(Justification::UserTune);
        assert!(access.ledger.is_empty());
        assert!(matches!(
            access.write_persistent(13, gain_p, 8, &first),
            Err(DriverError::ActionExpired { .. })
        ));
        access.write_persistent(11, gain_p, 9, &second).unwrap();
        assert_eq!(access.ledger.len(), 1);
        assert_eq!(access.persistent_write_count(13), 0);
    }

    #[test]
    fn test_audit_log_is_capped() {
        let (bus, mut access) = access();
        let gain_p = access.register_map().gain_p;
        for value in 0..(MAX_AUDIT_RECORDS as u16 + 10) {
            let action = access.begin_action(Justification::UserTune);
            access.write_persistent(11, gain_p, value % 32, &action).unwrap();
        }
        let records = access.persistent_writes();
        assert_eq!(records.len(), MAX_AUDIT_RECORDS);
        assert_eq!(records[0].value, 10);
        assert_eq!(bus.eeprom_writes(11), MAX_AUDIT_RECORDS + 10);
        assert!(access.ledger.len() <= 1);
    }

    #[test]
    fn test_write_persistent_rejects_volatile_register() {
        let (bus, mut access) = access();
        let action = access.begin_action(Justification::UserTune);
        let torque = access.register_map().torque_limit;
        let result = access.write_persistent(11, torque, 500, &action);
        assert!(matches!(result, Err(DriverError::RegionMismatch { .. })));
        // 临界区失败后仍然重新上锁
        assert_eq!(bus.register(11, 55), EEPROM_LOCKED as u16);
    }

    #[test]
    fn test_unlock_timeout_surfaces_bus_timeout() {
        let (bus, mut access) = access();
        let action = access.begin_action(Justification::BootRepair);
        let mode = access.register_map().operating_mode;
        bus.set_unresponsive(13, true);
        assert!(matches!(
            access.write_persistent(13, mode, 0, &action),
            Err(DriverError::BusTimeout { servo: 13, .. })
        ));
        assert_eq!(access.persistent_write_count(13), 0);
    }
}
