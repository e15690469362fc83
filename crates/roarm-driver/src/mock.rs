//! 模拟舵机总线
//!
//! 在内存中模拟 ST 系列舵机的寄存器行为，用于单元测试、集成测试与仿真程序：
//! - 易失寄存器 + 持久寄存器影子 + 已提交的 EEPROM 三层状态
//! - 持久寄存器只有在解锁时写入才会提交到 EEPROM
//! - `power_cycle()` 复位易失寄存器，并从 EEPROM 恢复影子
//! - 速度或加速度为 0 的位置指令复现固件缺陷：工作模式被改写为开环 PWM 并提交
//! - 目标位置寄存器：扭矩开启（0 → 1）时锁存当前位置，易失力矩上限从 0 抬起时舵机回到目标
//! - 可注入超时与无应答舵机
//!
//! 句柄可克隆，测试代码持有一份用于检查，另一份交给 `RegisterAccess`。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use roarm_protocol::{
    DEFAULT_GAIN_I, DEFAULT_GAIN_P, EEPROM_LOCKED, EEPROM_UNLOCKED, MIDDLE_POSITION, OperatingMode,
    Region, Register, RegisterMap, TORQUE_CEILING_MAX,
};

use crate::bus::{BusError, ServoBus, ServoId};

/// 记录的一次总线写入
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockWrite {
    Register {
        id: ServoId,
        address: u8,
        value: u16,
    },
    Position {
        id: ServoId,
        position: u16,
        speed: u16,
        acc: u8,
    },
}

impl MockWrite {
    pub fn servo(&self) -> ServoId {
        match self {
            MockWrite::Register { id, .. } | MockWrite::Position { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone)]
struct MockServo {
    volatile: HashMap<u8, u16>,
    shadow: HashMap<u8, u16>,
    eeprom: HashMap<u8, u16>,
    eeprom_writes: usize,
    position: u16,
    goal: u16,
}

impl MockServo {
    fn new(map: &RegisterMap) -> Self {
        let mut eeprom = HashMap::new();
        eeprom.insert(map.gain_p.address, DEFAULT_GAIN_P as u16);
        eeprom.insert(map.gain_i.address, DEFAULT_GAIN_I as u16);
        eeprom.insert(map.operating_mode.address, u8::from(OperatingMode::Position) as u16);
        eeprom.insert(map.max_torque.address, TORQUE_CEILING_MAX);

        let mut servo = Self {
            volatile: HashMap::new(),
            shadow: eeprom.clone(),
            eeprom,
            eeprom_writes: 0,
            position: MIDDLE_POSITION,
            goal: MIDDLE_POSITION,
        };
        servo.reset_volatile(map);
        servo
    }

    fn reset_volatile(&mut self, map: &RegisterMap) {
        self.volatile.clear();
        self.volatile.insert(map.torque_enable.address, 1);
        self.volatile.insert(map.eeprom_lock.address, EEPROM_LOCKED as u16);
        if map.has_volatile_torque_limit() {
            self.volatile.insert(map.torque_limit.address, TORQUE_CEILING_MAX);
        }
    }

    fn unlocked(&self, map: &RegisterMap) -> bool {
        self.volatile.get(&map.eeprom_lock.address).copied() == Some(EEPROM_UNLOCKED as u16)
    }

    fn commit(&mut self, address: u8, value: u16) {
        self.eeprom.insert(address, value);
        self.eeprom_writes += 1;
    }

    fn write_volatile(&mut self, map: &RegisterMap, address: u8, value: u16) {
        let previous = self.volatile.insert(address, value).unwrap_or_default();
        if address == map.torque_enable.address && previous == 0 && value != 0 {
            self.goal = self.position;
        }
        let enabled = self.volatile.get(&map.torque_enable.address).copied() != Some(0);
        if address == map.torque_limit.address && previous == 0 && value != 0 && enabled {
            self.position = self.goal;
        }
    }
}

#[derive(Debug)]
struct MockState {
    map: RegisterMap,
    servos: BTreeMap<ServoId, MockServo>,
    log: Vec<MockWrite>,
    pending_timeouts: u32,
    unresponsive: HashSet<ServoId>,
}

impl MockState {
    fn check_link(&mut self, id: ServoId) -> Result<(), BusError> {
        if self.pending_timeouts > 0 {
            self.pending_timeouts -= 1;
            return Err(BusError::Timeout(id));
        }
        if self.unresponsive.contains(&id) || !self.servos.contains_key(&id) {
            return Err(BusError::Timeout(id));
        }
        Ok(())
    }

    fn region_of(&self, address: u8) -> Region {
        self.map
            .by_address(address)
            .map(|r| r.region)
            .unwrap_or(Region::Volatile)
    }
}

/// 模拟舵机总线
#[derive(Debug, Clone)]
pub struct MockServoBus {
    state: Arc<Mutex<MockState>>,
}

impl MockServoBus {
    /// ST 系列寄存器表的模拟总线
    pub fn new(ids: impl IntoIterator<Item = ServoId>) -> Self {
        Self::with_register_map(ids, RegisterMap::st_series())
    }

    pub fn with_register_map(ids: impl IntoIterator<Item = ServoId>, map: RegisterMap) -> Self {
        let servos = ids.into_iter().map(|id| (id, MockServo::new(&map))).collect();
        Self {
            state: Arc::new(Mutex::new(MockState {
                map,
                servos,
                log: Vec::new(),
                pending_timeouts: 0,
                unresponsive: HashSet::new(),
            })),
        }
    }

    // ==================== 故障注入 ====================

    /// 接下来的 `n` 次总线操作全部超时
    pub fn inject_timeouts(&self, n: u32) {
        self.state.lock().pending_timeouts = n;
    }

    /// 指定舵机持续无应答
    pub fn set_unresponsive(&self, id: ServoId, unresponsive: bool) {
        let mut state = self.state.lock();
        if unresponsive {
            state.unresponsive.insert(id);
        } else {
            state.unresponsive.remove(&id);
        }
    }

    /// 直接改写工作模式（影子与 EEPROM 同时改写，不计入写入次数）
    pub fn corrupt_mode(&self, id: ServoId, mode: u8) {
        let mut state = self.state.lock();
        let address = state.map.operating_mode.address;
        if let Some(servo) = state.servos.get_mut(&id) {
            servo.shadow.insert(address, mode as u16);
            servo.eeprom.insert(address, mode as u16);
        }
    }

    /// 模拟断电重启
    pub fn power_cycle(&self) {
        let mut state = self.state.lock();
        let map = state.map.clone();
        for servo in state.servos.values_mut() {
            servo.reset_volatile(&map);
            servo.shadow = servo.eeprom.clone();
        }
    }

    /// 模拟外力拖动（扭矩关闭或力矩上限很低时）
    pub fn set_position(&self, id: ServoId, position: u16) {
        if let Some(servo) = self.state.lock().servos.get_mut(&id) {
            servo.position = position;
        }
    }

    // ==================== 检查 ====================

    pub fn position(&self, id: ServoId) -> u16 {
        self.state
            .lock()
            .servos
            .get(&id)
            .map(|s| s.position)
            .unwrap_or_default()
    }

    /// 舵机当前追随的目标位置
    pub fn goal(&self, id: ServoId) -> u16 {
        self.state
            .lock()
            .servos
            .get(&id)
            .map(|s| s.goal)
            .unwrap_or_default()
    }

    /// 当前生效的寄存器值（易失或持久影子）
    pub fn register(&self, id: ServoId, address: u8) -> u16 {
        let state = self.state.lock();
        let region = state.region_of(address);
        state
            .servos
            .get(&id)
            .and_then(|s| match region {
                Region::Volatile => s.volatile.get(&address),
                Region::Persistent => s.shadow.get(&address),
            })
            .copied()
            .unwrap_or_default()
    }

    /// 已提交到 EEPROM 的值
    pub fn eeprom(&self, id: ServoId, address: u8) -> u16 {
        self.state
            .lock()
            .servos
            .get(&id)
            .and_then(|s| s.eeprom.get(&address))
            .copied()
            .unwrap_or_default()
    }

    /// 指定舵机的 EEPROM 提交次数
    pub fn eeprom_writes(&self, id: ServoId) -> usize {
        self.state
            .lock()
            .servos
            .get(&id)
            .map(|s| s.eeprom_writes)
            .unwrap_or_default()
    }

    /// 全部舵机的 EEPROM 提交次数
    pub fn total_eeprom_writes(&self) -> usize {
        self.state.lock().servos.values().map(|s| s.eeprom_writes).sum()
    }

    pub fn operating_mode(&self, id: ServoId) -> u8 {
        let address = self.state.lock().map.operating_mode.address;
        self.register(id, address) as u8
    }

    pub fn writes(&self) -> Vec<MockWrite> {
        self.state.lock().log.clone()
    }

    pub fn position_commands(&self, id: ServoId) -> Vec<MockWrite> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|w| matches!(w, MockWrite::Position { id: wid, .. } if *wid == id))
            .copied()
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }
}

impl ServoBus for MockServoBus {
    fn read(&mut self, id: ServoId, register: Register) -> Result<u16, BusError> {
        let mut state = self.state.lock();
        state.check_link(id)?;
        let position_address = state.map.present_position.address;
        let servo = state.servos.get(&id).ok_or(BusError::Timeout(id))?;
        if register.address == position_address {
            return Ok(servo.position);
        }
        let value = match register.region {
            Region::Volatile => servo.volatile.get(&register.address),
            Region::Persistent => servo.shadow.get(&register.address),
        };
        Ok(value.copied().unwrap_or_default())
    }

    fn write(&mut self, id: ServoId, register: Register, value: u16) -> Result<(), BusError> {
        let mut state = self.state.lock();
        state.check_link(id)?;
        let map = state.map.clone();
        state.log.push(MockWrite::Register {
            id,
            address: register.address,
            value,
        });
        let servo = state.servos.get_mut(&id).ok_or(BusError::Timeout(id))?;
        match register.region {
            Region::Volatile => servo.write_volatile(&map, register.address, value),
            Region::Persistent => {
                servo.shadow.insert(register.address, value);
                if servo.unlocked(&map) {
                    servo.commit(register.address, value);
                }
            },
        }
        Ok(())
    }

    fn write_position(
        &mut self,
        id: ServoId,
        position: u16,
        speed: u16,
        acc: u8,
    ) -> Result<(), BusError> {
        let mut state = self.state.lock();
        state.check_link(id)?;
        let mode_address = state.map.operating_mode.address;
        state.log.push(MockWrite::Position {
            id,
            position,
            speed,
            acc,
        });
        let servo = state.servos.get_mut(&id).ok_or(BusError::Timeout(id))?;

        if speed == 0 || acc == 0 {
            let pwm = u8::from(OperatingMode::OpenLoopPwm) as u16;
            servo.shadow.insert(mode_address, pwm);
            servo.commit(mode_address, pwm);
            return Ok(());
        }

        let in_position_mode = servo.shadow.get(&mode_address).copied()
            == Some(u8::from(OperatingMode::Position) as u16);
        if in_position_mode {
            servo.goal = position;
            servo.position = position;
        }
        Ok(())
    }
}
