//! 机械臂与拖动示教配置
//!
//! 手感调校（力矩上限、增益）属于人工标定的输入，通过 TOML 文件提供。
//! 所有结构都有与默认机械臂布局一致的 `Default`，缺省字段使用默认值。
//!
//! ```toml
//! family = "st_series"
//! mirror_tolerance_deg = 3.0
//!
//! [drag_teach]
//! relax_dwell_ms = 150
//! hold_dwell_ms = 400
//!
//! [drag_teach.hold_ceilings]
//! shoulder = 850
//! elbow = 800
//!
//! [drag_teach.cooldown]
//! max_cycles = 4
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use roarm_driver::ServoId;
use roarm_protocol::{
    Deg, JointId, MIDDLE_POSITION, ServoFamily, TICKS_PER_REV, TORQUE_CEILING_MAX,
};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// 单个关节的舵机布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointConfig {
    pub joint: JointId,
    /// 主动舵机（单舵机关节的唯一舵机）
    pub driving: ServoId,
    /// 镜像从动舵机
    #[serde(default)]
    pub driven: Option<ServoId>,
}

impl JointConfig {
    pub const fn single(joint: JointId, servo: ServoId) -> Self {
        Self {
            joint,
            driving: servo,
            driven: None,
        }
    }

    pub const fn mirrored(joint: JointId, driving: ServoId, driven: ServoId) -> Self {
        Self {
            joint,
            driving,
            driven: Some(driven),
        }
    }
}

/// 机械臂配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmConfig {
    /// 舵机家族（决定寄存器表）
    pub family: ServoFamily,
    /// 中位刻度
    pub middle_position: u16,
    /// 镜像关节主从偏差容差（度）
    pub mirror_tolerance_deg: f64,
    /// 总线超时重试次数（含首次）
    pub retry_attempts: u32,
    pub joints: Vec<JointConfig>,
    pub drag_teach: DragTeachConfig,
}

impl Default for ArmConfig {
    fn default() -> Self {
        Self {
            family: ServoFamily::StSeries,
            middle_position: MIDDLE_POSITION,
            mirror_tolerance_deg: 3.0,
            retry_attempts: 3,
            joints: vec![
                JointConfig::single(JointId::Base, 11),
                JointConfig::mirrored(JointId::Shoulder, 12, 13),
                JointConfig::single(JointId::Elbow, 14),
                JointConfig::single(JointId::Hand, 15),
            ],
            drag_teach: DragTeachConfig::default(),
        }
    }
}

impl ArmConfig {
    /// 从 TOML 字符串解析并校验
    pub fn from_toml_str(content: &str) -> Result<Self, ClientError> {
        let config: ArmConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// 保存到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ClientError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ClientError::Config(e.to_string()))?;
        fs::write(path.as_ref(), content)
            .map_err(|e| ClientError::Config(format!("{}: {}", path.as_ref().display(), e)))
    }

    pub fn mirror_tolerance(&self) -> Deg {
        Deg(self.mirror_tolerance_deg)
    }

    /// 检查关节布局与数值范围
    pub fn validate(&self) -> Result<(), ClientError> {
        let mut seen_joints = Vec::new();
        let mut seen_servos = Vec::new();
        for joint in &self.joints {
            if seen_joints.contains(&joint.joint) {
                return Err(ClientError::Config(format!(
                    "joint {} configured twice",
                    joint.joint
                )));
            }
            seen_joints.push(joint.joint);
            for id in std::iter::once(joint.driving).chain(joint.driven) {
                if seen_servos.contains(&id) {
                    return Err(ClientError::Config(format!("servo {} used twice", id)));
                }
                seen_servos.push(id);
            }
        }
        if self.retry_attempts == 0 {
            return Err(ClientError::Config("retry_attempts must be at least 1".into()));
        }
        if self.middle_position >= TICKS_PER_REV {
            return Err(ClientError::Config(format!(
                "middle_position {} outside 0..{}",
                self.middle_position, TICKS_PER_REV
            )));
        }
        if self.mirror_tolerance_deg <= 0.0 {
            return Err(ClientError::Config("mirror_tolerance_deg must be positive".into()));
        }
        self.drag_teach.validate()
    }
}

/// 各关节保持力矩上限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HoldCeilings {
    pub base: u16,
    pub shoulder: u16,
    pub elbow: u16,
    pub hand: u16,
}

impl Default for HoldCeilings {
    fn default() -> Self {
        // 肩、肘承受重力，需要较大的保持力矩
        Self {
            base: 50,
            shoulder: 800,
            elbow: 800,
            hand: 50,
        }
    }
}

impl HoldCeilings {
    pub fn get(&self, joint: JointId) -> u16 {
        match joint {
            JointId::Base => self.base,
            JointId::Shoulder => self.shoulder,
            JointId::Elbow => self.elbow,
            JointId::Hand => self.hand,
        }
    }

    pub fn set(&mut self, joint: JointId, ceiling: u16) {
        let slot = match joint {
            JointId::Base => &mut self.base,
            JointId::Shoulder => &mut self.shoulder,
            JointId::Elbow => &mut self.elbow,
            JointId::Hand => &mut self.hand,
        };
        *slot = ceiling.min(TORQUE_CEILING_MAX);
    }
}

/// 冷却保护配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    /// 滚动窗口
    pub window_ms: u64,
    /// 窗口内允许的最大循环次数
    pub max_cycles: u32,
    /// 超限后强制的延长保持时间
    pub extended_hold_ms: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            window_ms: 3000,
            max_cycles: 4,
            extended_hold_ms: 1500,
        }
    }
}

impl CooldownConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn extended_hold(&self) -> Duration {
        Duration::from_millis(self.extended_hold_ms)
    }
}

/// 拖动示教配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DragTeachConfig {
    /// 控制循环周期
    pub tick_ms: u64,
    /// 放松状态的停留时间
    pub relax_dwell_ms: u64,
    /// 力矩变化后的稳定等待时间（之前的位置读数不可信）
    pub settle_ms: u64,
    /// 保持状态的停留时间
    pub hold_dwell_ms: u64,
    /// 感知阶段读取失败的最大重试次数
    pub max_sense_retries: u32,
    /// 放松时的力矩上限
    pub relax_ceiling: u16,
    pub hold_ceilings: HoldCeilings,
    pub cooldown: CooldownConfig,
}

impl Default for DragTeachConfig {
    fn default() -> Self {
        Self {
            tick_ms: 20,
            relax_dwell_ms: 150,
            settle_ms: 60,
            hold_dwell_ms: 400,
            max_sense_retries: 3,
            relax_ceiling: 0,
            hold_ceilings: HoldCeilings::default(),
            cooldown: CooldownConfig::default(),
        }
    }
}

impl DragTeachConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn relax_dwell(&self) -> Duration {
        Duration::from_millis(self.relax_dwell_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn hold_dwell(&self) -> Duration {
        Duration::from_millis(self.hold_dwell_ms)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.tick_ms == 0 {
            return Err(ClientError::Config("drag_teach.tick_ms must be positive".into()));
        }
        if self.relax_ceiling > TORQUE_CEILING_MAX {
            return Err(ClientError::Config(format!(
                "drag_teach.relax_ceiling {} exceeds {}",
                self.relax_ceiling, TORQUE_CEILING_MAX
            )));
        }
        for joint in JointId::ALL {
            let ceiling = self.hold_ceilings.get(joint);
            if ceiling > TORQUE_CEILING_MAX {
                return Err(ClientError::Config(format!(
                    "hold ceiling {} for {} exceeds {}",
                    ceiling, joint, TORQUE_CEILING_MAX
                )));
            }
        }
        if self.cooldown.max_cycles == 0 {
            return Err(ClientError::Config("cooldown.max_cycles must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_layout() {
        let config = ArmConfig::default();
        assert_eq!(config.joints.len(), 4);
        assert_eq!(config.joints[1], JointConfig::mirrored(JointId::Shoulder, 12, 13));
        assert_eq!(config.middle_position, 2047);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ArmConfig::from_toml_str(
            r#"
mirror_tolerance_deg = 2.5

[drag_teach]
hold_dwell_ms = 600

[drag_teach.hold_ceilings]
shoulder = 850

[drag_teach.cooldown]
max_cycles = 6
"#,
        )
        .unwrap();
        assert_eq!(config.mirror_tolerance(), Deg(2.5));
        assert_eq!(config.drag_teach.hold_dwell(), Duration::from_millis(600));
        assert_eq!(config.drag_teach.relax_dwell_ms, 150);
        assert_eq!(config.drag_teach.hold_ceilings.shoulder, 850);
        assert_eq!(config.drag_teach.hold_ceilings.elbow, 800);
        assert_eq!(config.drag_teach.cooldown.max_cycles, 6);
        assert_eq!(config.drag_teach.cooldown.window_ms, 3000);
        assert_eq!(config.joints.len(), 4);
    }

    #[test]
    fn test_joint_layout_from_toml() {
        let config = ArmConfig::from_toml_str(
            r#"
family = "persistent_torque_limit"

[[joints]]
joint = "base"
driving = 1

[[joints]]
joint = "shoulder"
driving = 2
driven = 3
"#,
        )
        .unwrap();
        assert_eq!(config.family, ServoFamily::PersistentTorqueLimit);
        assert_eq!(config.joints.len(), 2);
        assert_eq!(config.joints[1].driven, Some(3));
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(matches!(
            ArmConfig::from_toml_str("[drag_teach]\nrelax_ceiling = 1200\n"),
            Err(ClientError::Config(_))
        ));
        assert!(matches!(
            ArmConfig::from_toml_str("retry_attempts = 0\n"),
            Err(ClientError::Config(_))
        ));
        assert!(matches!(
            ArmConfig::from_toml_str(
                "[[joints]]\njoint = \"base\"\ndriving = 11\n\
                 [[joints]]\njoint = \"elbow\"\ndriving = 11\n"
            ),
            Err(ClientError::Config(_))
        ));
        assert!(matches!(
            ArmConfig::from_toml_str("family = 3"),
            Err(ClientError::Config(_))
        ));
        assert!(matches!(
            ArmConfig::from_toml_str("middle_position = 5000"),
            Err(ClientError::Config(_))
        ));
        assert!(matches!(
            ArmConfig::from_toml_str("middle_position = 4096"),
            Err(ClientError::Config(_))
        ));
        assert!(ArmConfig::from_toml_str("middle_position = 2100").is_ok());
    }

    #[test]
    fn test_load_and_save_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[drag_teach]\nsettle_ms = 80").unwrap();
        let config = ArmConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.drag_teach.settle(), Duration::from_millis(80));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arm.toml");
        config.save_to_file(&path).unwrap();
        assert_eq!(ArmConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_hold_ceilings_set_clamps() {
        let mut ceilings = HoldCeilings::default();
        ceilings.set(JointId::Elbow, 1500);
        assert_eq!(ceilings.get(JointId::Elbow), TORQUE_CEILING_MAX);
    }
}
