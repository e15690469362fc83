//! 驱动层模块
//!
//! 本模块提供串行总线舵机的寄存器访问层，包括：
//! - 总线抽象（[`ServoBus`]，由外部舵机总线驱动实现）
//! - 易失/持久寄存器的分区读写
//! - 持久写入的 unlock → write → lock 临界区（[`PersistentWriteGuard`]）
//! - 位置指令的零速度保护（[`MotionProfile`]）
//! - 上电自检与工作模式修复（[`diagnostics`]）
//!
//! # 写入纪律
//!
//! 易失写入任何时候都合法；持久写入必须携带一次用户动作（[`UserAction`]），
//! 同一动作对同一舵机只允许一个临界区，循环控制路径拿不到新的动作令牌。

mod access;
mod bus;
mod channel;
pub mod diagnostics;
mod error;
mod motion;
mod persistent;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use access::{MAX_AUDIT_RECORDS, RegisterAccess, RetryPolicy};
pub use bus::{BusError, ServoBus, ServoId};
pub use channel::{ChannelRole, ServoChannel};
pub use diagnostics::{BootDiagnostics, BootReport, ModeRepair};
pub use error::DriverError;
pub use motion::{MIN_SAFE_ACC, MIN_SAFE_SPEED, MotionProfile};
pub use persistent::{Justification, PersistentWriteGuard, PersistentWriteRecord, UserAction};
