//! 舵机总线抽象
//!
//! 收发原始协议帧由外部总线驱动负责，这里只约定寄存器级别的读写接口。

use roarm_protocol::Register;
use thiserror::Error;

/// 舵机总线 ID
pub type ServoId = u8;

/// 总线错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// 舵机未应答
    #[error("Servo {0} did not acknowledge")]
    Timeout(ServoId),

    /// 应答校验失败
    #[error("Servo {id} returned a corrupted status packet")]
    Corrupted { id: ServoId },

    /// 底层串口错误
    #[error("Serial transport error: {0}")]
    Io(String),
}

impl BusError {
    /// 是否为超时（可重试）
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout(_))
    }
}

/// 寄存器级总线接口
///
/// 实现方只负责传输，不做任何区域或参数检查；这些纪律由
/// [`RegisterAccess`](crate::RegisterAccess) 统一执行。
pub trait ServoBus {
    /// 读取寄存器（按 `register.width` 读 1 或 2 字节）
    fn read(&mut self, id: ServoId, register: Register) -> Result<u16, BusError>;

    /// 写入寄存器
    fn write(&mut self, id: ServoId, register: Register, value: u16) -> Result<(), BusError>;

    /// 带速度与加速度的位置指令（一次写入目标位置、速度、加速度）
    fn write_position(
        &mut self,
        id: ServoId,
        position: u16,
        speed: u16,
        acc: u8,
    ) -> Result<(), BusError>;
}

impl<T: ServoBus + ?Sized> ServoBus for Box<T> {
    fn read(&mut self, id: ServoId, register: Register) -> Result<u16, BusError> {
        (**self).read(id, register)
    }

    fn write(&mut self, id: ServoId, register: Register, value: u16) -> Result<(), BusError> {
        (**self).write(id, register, value)
    }

    fn write_position(
        &mut self,
        id: ServoId,
        position: u16,
        speed: u16,
        acc: u8,
    ) -> Result<(), BusError> {
        (**self).write_position(id, position, speed, acc)
    }
}
