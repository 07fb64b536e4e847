//! 工位配置定义
//!
//! `StationConfig` 描述一个检测工位的接线和时序参数，在配置阶段创建后不可变。

use crate::{MAX_LINES, ProtocolError};
use std::borrow::Borrow;
use std::fmt;
use std::time::Duration;

/// 默认触发脉宽（毫秒）
pub const DEFAULT_TRIGGER_PULSE_MS: f64 = 10.0;

/// 允许的最大触发脉宽（毫秒）
///
/// 脉冲期间总线锁被独占，过长的脉宽会阻塞其他工位。
pub const MAX_TRIGGER_PULSE_MS: f64 = 1000.0;

/// 工位标识（全局唯一）
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct StationId(String);

impl StationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for StationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for StationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for StationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// 物理线类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineKind {
    /// 位置传感器输入线
    Sensor,
    /// 相机触发输出线
    Trigger,
}

impl fmt::Display for LineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineKind::Sensor => f.write_str("sensor"),
            LineKind::Trigger => f.write_str("trigger"),
        }
    }
}

/// 两个工位争用同一物理线
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineConflict {
    pub kind: LineKind,
    pub line: u8,
}

/// 单个检测工位的配置
///
/// # Example
///
/// ```
/// use inspect_protocol::StationConfig;
///
/// let top = StationConfig::new("Top", 0, 0)
///     .with_display_name("TOP")
///     .with_ejector_distance(10)
///     .with_trigger_pulse_ms(10.0);
/// assert!(top.validate().is_ok());
/// assert_eq!(top.trigger_pulse().as_millis(), 10);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StationConfig {
    /// 工位标识（全局唯一）
    pub station_id: StationId,
    /// 显示名称（无唯一性要求）
    pub display_name: String,
    /// 位置传感器输入线（0-7）
    pub sensor_line: u8,
    /// 相机触发输出线（0-7）
    pub trigger_line: u8,
    /// 传感器到剔除器的距离（透传给下游，编排层不使用）
    #[cfg_attr(feature = "serde", serde(default))]
    pub ejector_distance: i32,
    /// true = 采集前发出硬件触发脉冲；false = 由相机后端自行软触发
    #[cfg_attr(feature = "serde", serde(default = "default_true"))]
    pub use_hardware_trigger: bool,
    /// 触发脉宽（毫秒）
    #[cfg_attr(feature = "serde", serde(default = "default_pulse_ms"))]
    pub trigger_pulse_ms: f64,
    /// false 时不为该工位启动工作线程
    #[cfg_attr(feature = "serde", serde(default = "default_true"))]
    pub enabled: bool,
}

#[cfg(feature = "serde")]
fn default_true() -> bool {
    true
}

#[cfg(feature = "serde")]
fn default_pulse_ms() -> f64 {
    DEFAULT_TRIGGER_PULSE_MS
}

impl StationConfig {
    /// 创建工位配置（硬件触发、10ms 脉宽、启用）
    pub fn new(station_id: impl Into<StationId>, sensor_line: u8, trigger_line: u8) -> Self {
        let station_id = station_id.into();
        Self {
            display_name: station_id.to_string(),
            station_id,
            sensor_line,
            trigger_line,
            ejector_distance: 0,
            use_hardware_trigger: true,
            trigger_pulse_ms: DEFAULT_TRIGGER_PULSE_MS,
            enabled: true,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_ejector_distance(mut self, distance: i32) -> Self {
        self.ejector_distance = distance;
        self
    }

    pub fn with_hardware_trigger(mut self, enabled: bool) -> Self {
        self.use_hardware_trigger = enabled;
        self
    }

    pub fn with_trigger_pulse_ms(mut self, pulse_ms: f64) -> Self {
        self.trigger_pulse_ms = pulse_ms;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// 触发脉宽
    pub fn trigger_pulse(&self) -> Duration {
        Duration::from_secs_f64(self.trigger_pulse_ms.max(0.0) / 1000.0)
    }

    /// 校验单个工位的取值范围
    ///
    /// 线号冲突属于跨工位约束，由 [`StationConfig::conflicts_with`] 检查。
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.station_id.as_str().trim().is_empty() {
            return Err(ProtocolError::InvalidStation {
                station_id: self.station_id.to_string(),
                reason: "station id must not be empty".to_string(),
            });
        }

        for (kind, line) in [
            (LineKind::Sensor, self.sensor_line),
            (LineKind::Trigger, self.trigger_line),
        ] {
            if line >= MAX_LINES {
                return Err(ProtocolError::InvalidLine {
                    kind,
                    line,
                    max: MAX_LINES,
                });
            }
        }

        if !self.trigger_pulse_ms.is_finite()
            || self.trigger_pulse_ms <= 0.0
            || self.trigger_pulse_ms > MAX_TRIGGER_PULSE_MS
        {
            return Err(ProtocolError::InvalidStation {
                station_id: self.station_id.to_string(),
                reason: format!(
                    "trigger pulse {}ms out of range (0, {}]",
                    self.trigger_pulse_ms, MAX_TRIGGER_PULSE_MS
                ),
            });
        }

        Ok(())
    }

    /// 检查传感器线没有占用下游应答线
    ///
    /// 禁用的工位不占用线，不检查。
    pub fn check_ack_line(&self, ack_line: u8) -> Result<(), ProtocolError> {
        if self.enabled && self.sensor_line == ack_line {
            return Err(ProtocolError::InvalidStation {
                station_id: self.station_id.to_string(),
                reason: format!(
                    "sensor line {} is reserved for the downstream acknowledgement",
                    ack_line
                ),
            });
        }
        Ok(())
    }

    /// 检查两个工位是否争用同一物理线
    ///
    /// 只有两个工位都启用时才算冲突；禁用的工位不占用线。
    pub fn conflicts_with(&self, other: &StationConfig) -> Option<LineConflict> {
        if !self.enabled || !other.enabled {
            return None;
        }
        if self.sensor_line == other.sensor_line {
            return Some(LineConflict {
                kind: LineKind::Sensor,
                line: self.sensor_line,
            });
        }
        if self.trigger_line == other.trigger_line {
            return Some(LineConflict {
                kind: LineKind::Trigger,
                line: self.trigger_line,
            });
        }
        None
    }
}
