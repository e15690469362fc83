//! RoArm SDK - 串行总线舵机机械臂的拖动示教 SDK
//!
//! 本 SDK 采用分层架构，从底层到高层：
//!
//! - **协议层** (`protocol`): 上位机 JSON 指令、寄存器表、角度单位
//! - **驱动层** (`driver`): 易失/持久寄存器分区访问、持久写入临界区、上电自检
//! - **客户端层** (`client`): 关节模型、力矩配置、拖动示教、指令分发
//!
//! # 快速开始
//!
//! ```rust,ignore
//! use roarm_sdk::prelude::*;
//!
//! roarm_sdk::init_logger();
//! let mut dispatcher = Dispatcher::new(bus, &ArmConfig::default())?;
//! dispatcher.arm_mut().boot()?;
//! loop {
//!     // 两拍之间处理上位机指令
//!     if let Some(reply) = dispatcher.handle_line(&line, Instant::now())? { /* 回送 */ }
//!     dispatcher.tick(Instant::now())?;
//! }
//! ```

pub use roarm_client as client;
pub use roarm_driver as driver;
pub use roarm_protocol as protocol;

pub mod prelude;

// --- 用户以此为界 ---

// 协议层
pub use protocol::{AngleUnit, Deg, HostCommand, JointId, PositionReport, ProtocolError, Rad};

// 驱动层（高级用户使用）
pub use driver::{DriverError, MotionProfile, ServoBus, ServoId};

// 客户端层（推荐入口）
pub use client::{
    Arm, ArmConfig, ClientError, Dispatcher, DragTeachConfig, DragTeachSession, TickOutcome,
    TorqueProfile,
};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// 初始化日志
///
/// 默认级别 `info`，可通过 `RUST_LOG` 覆盖。日志写到标准错误，
/// 标准输出留给协议报文。`log` 门面的记录同样会被转发。
/// 重复调用是安全的（后续调用不生效）。
pub fn init_logger() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        let _ = tracing_log::LogTracer::init();
    }
}
