//! 拖动示教
//!
//! 机械臂循环地放松与保持，使人可以手动摆放关节：
//! - [`context`]：示教期间唯一的可变状态
//! - [`machine`]：纯状态转换函数
//! - [`guard`]：冷却保护
//! - [`session`]：驱动状态机、采样并执行动作

pub mod context;
pub mod guard;
pub mod machine;
pub mod session;

pub use context::{DragTeachContext, DragTeachTimings, JointState, Phase};
pub use guard::CooldownGuard;
pub use machine::{DragAction, DragActions, DragTeachEvent, TickInput, step};
pub use session::{DragTeachSession, TickOutcome};
