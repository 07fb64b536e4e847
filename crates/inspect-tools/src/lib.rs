//! # Inspect Tools - 共享数据结构和算法
//!
//! **依赖原则**: 只依赖 `inspect-protocol`，不依赖 `inspect-driver`
//!
//! ## 包含模块
//!
//! - `station_file` - 工位布局文件（TOML / JSON）
//! - `report` - 产线统计报表（纯函数）

pub mod report;
pub mod station_file;

// 重新导出常用类型
pub use report::{FleetReport, StationSummary, cycles_per_minute, percentage};
pub use station_file::{
    STATION_FILE_VERSION, StationFile, StationFileError, StationFileFormat, default_layout,
};
