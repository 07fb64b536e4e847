//! # 工位布局文件
//!
//! 持久化的工位接线描述。按扩展名选择格式：
//! - `.toml`：`[[stations]]` 数组
//! - `.json`：`{ "version": 1, "stations": [...] }`
//!
//! 加载后立即校验线路唯一性，非法布局不会交给控制器。

use inspect_protocol::{
    DEFAULT_ACK_LINE, LineKind, MAX_LINES, ProtocolError, StationConfig, StationId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// 当前文件格式版本
pub const STATION_FILE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StationFileError {
    #[error("Failed to access station file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported station file format: {0} (expected .toml or .json)")]
    UnsupportedFormat(String),

    #[error("Unsupported station file version {0} (expected {STATION_FILE_VERSION})")]
    UnsupportedVersion(u32),

    #[error("Station {station_id}: {source}")]
    InvalidStation {
        station_id: StationId,
        #[source]
        source: ProtocolError,
    },

    #[error("Acknowledge line {0} out of range (must be below {MAX_LINES})")]
    InvalidAckLine(u8),

    #[error("Station {0} is defined more than once")]
    DuplicateStation(StationId),

    #[error("Stations {first} and {second} both use {kind} line {line}")]
    LineConflict {
        first: StationId,
        second: StationId,
        kind: LineKind,
        line: u8,
    },
}

/// 文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationFileFormat {
    Toml,
    Json,
}

impl StationFileFormat {
    /// 根据扩展名判断格式（不区分大小写）
    pub fn from_path(path: &Path) -> Result<Self, StationFileError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            _ => Err(StationFileError::UnsupportedFormat(
                path.display().to_string(),
            )),
        }
    }
}

/// 工位布局文件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationFile {
    #[serde(default = "default_version")]
    pub version: u32,
    /// 下游应答输入线，任何启用的工位都不得把它当作传感器线
    #[serde(default = "default_ack_line")]
    pub ack_line: u8,
    #[serde(default)]
    pub stations: Vec<StationConfig>,
}

fn default_version() -> u32 {
    STATION_FILE_VERSION
}

fn default_ack_line() -> u8 {
    DEFAULT_ACK_LINE
}

impl StationFile {
    pub fn new(stations: Vec<StationConfig>) -> Self {
        Self {
            version: STATION_FILE_VERSION,
            ack_line: DEFAULT_ACK_LINE,
            stations,
        }
    }

    /// 从文件加载并校验
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StationFileError> {
        let path = path.as_ref();
        let format = StationFileFormat::from_path(path)?;
        let content = fs::read_to_string(path)?;
        let file = Self::parse(&content, format)?;
        file.validate()?;
        Ok(file)
    }

    /// 解析文本（不校验）
    pub fn parse(content: &str, format: StationFileFormat) -> Result<Self, StationFileError> {
        let file = match format {
            StationFileFormat::Toml => toml::from_str(content)?,
            StationFileFormat::Json => serde_json::from_str(content)?,
        };
        Ok(file)
    }

    /// 序列化为文本
    pub fn render(&self, format: StationFileFormat) -> Result<String, StationFileError> {
        let content = match format {
            StationFileFormat::Toml => toml::to_string_pretty(self)?,
            StationFileFormat::Json => serde_json::to_string_pretty(self)?,
        };
        Ok(content)
    }

    /// 校验后保存到文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StationFileError> {
        let path = path.as_ref();
        let format = StationFileFormat::from_path(path)?;
        self.validate()?;
        fs::write(path, self.render(format)?)?;
        Ok(())
    }

    /// 校验布局
    ///
    /// - 版本号匹配，应答线在范围内
    /// - 每个工位的线号和脉宽合法，传感器线不占用应答线
    /// - 工位标识不重复
    /// - 启用的工位之间不共用传感器线或触发线
    pub fn validate(&self) -> Result<(), StationFileError> {
        if self.version != STATION_FILE_VERSION {
            return Err(StationFileError::UnsupportedVersion(self.version));
        }
        if self.ack_line >= MAX_LINES {
            return Err(StationFileError::InvalidAckLine(self.ack_line));
        }

        let mut seen = HashSet::new();
        for station in &self.stations {
            station
                .validate()
                .and_then(|()| station.check_ack_line(self.ack_line))
                .map_err(|source| StationFileError::InvalidStation {
                    station_id: station.station_id.clone(),
                    source,
                })?;
            if !seen.insert(&station.station_id) {
                return Err(StationFileError::DuplicateStation(
                    station.station_id.clone(),
                ));
            }
        }

        for (i, first) in self.stations.iter().enumerate() {
            for second in &self.stations[i + 1..] {
                if let Some(conflict) = first.conflicts_with(second) {
                    return Err(StationFileError::LineConflict {
                        first: first.station_id.clone(),
                        second: second.station_id.clone(),
                        kind: conflict.kind,
                        line: conflict.line,
                    });
                }
            }
        }
        Ok(())
    }

    /// 启用的工位
    pub fn enabled_stations(&self) -> impl Iterator<Item = &StationConfig> {
        self.stations.iter().filter(|s| s.enabled)
    }

    pub fn station(&self, station_id: &str) -> Option<&StationConfig> {
        self.stations
            .iter()
            .find(|s| s.station_id.as_str() == station_id)
    }
}

impl Default for StationFile {
    fn default() -> Self {
        Self::new(default_layout())
    }
}

/// 默认 7 工位布局
///
/// 传感器线和触发线依次占用 0..=6，10ms 脉宽，硬件触发。
/// 输入线 7 留给下游应答信号。
pub fn default_layout() -> Vec<StationConfig> {
    const STATIONS: [(&str, &str, i32); 7] = [
        ("TOP", "Top", 10),
        ("BOTTOM", "Bottom", 4),
        ("FEED", "Feed", 0),
        ("PICKUP1", "Pick-up 1", 0),
        ("PICKUP2", "Pick-up 2", 0),
        ("BOTTOM_SEAL", "Bottom Seal", 0),
        ("TOP_SEAL", "Top Seal", 0),
    ];

    STATIONS
        .iter()
        .zip(0u8..)
        .map(|(&(id, name, distance), line)| {
            StationConfig::new(id, line, line)
                .with_display_name(name)
                .with_ejector_distance(distance)
                .with_trigger_pulse_ms(10.0)
        })
        .collect()
}
