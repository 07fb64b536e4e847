//! # Inspect Protocol
//!
//! 检测工位的接线描述与结果信号编码（无硬件依赖）
//!
//! ## 模块
//!
//! - `station`: 工位配置（传感器线、触发线、脉宽）
//! - `signal`: 结果码与输出字节编码（busy 位 + 3 位结果码）
//!
//! ## 线号约定
//!
//! 每个 I/O 端口固定 8 位，线号范围 `0..=7`（见 [`MAX_LINES`]）。

pub mod signal;
pub mod station;

// 重新导出常用类型
pub use signal::*;
pub use station::*;

use thiserror::Error;

/// 单个 I/O 端口的线数（每个端口 8 位）
pub const MAX_LINES: u8 = 8;

/// 默认的下游应答输入线（传感器不得占用）
pub const DEFAULT_ACK_LINE: u8 = 7;

/// 协议层错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid result code: {0} (expected 0..=7)")]
    InvalidResultCode(u8),

    #[error("Invalid {kind} line {line} (port has {max} lines)")]
    InvalidLine { kind: LineKind, line: u8, max: u8 },

    #[error("Invalid signal layout: {0}")]
    InvalidLayout(String),

    #[error("Invalid station config for {station_id}: {reason}")]
    InvalidStation { station_id: String, reason: String },
}
