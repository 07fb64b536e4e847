//! 编排层错误类型定义

use crate::state::{ControllerState, StationState};
use inspect_io::IoError;
use inspect_protocol::{LineKind, ProtocolError, StationId};
use std::time::Duration;
use thiserror::Error;

/// 控制器同步错误
///
/// 只有配置和生命周期错误会同步返回给调用者；
/// 周期内的故障（I/O、采集、检测）都在工作线程内部消化，只反映在统计和日志里。
#[derive(Error, Debug)]
pub enum ControllerError {
    /// 两个工位争用同一物理线
    #[error("Station {station_id} claims {kind} line {line} already used by {existing}")]
    ConfigConflict {
        station_id: StationId,
        existing: StationId,
        kind: LineKind,
        line: u8,
    },

    /// 配置取值非法
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ProtocolError),

    /// 控制器不在 Idle 状态
    #[error("Production already running")]
    AlreadyRunning,

    /// 没有启用的工位
    #[error("No enabled stations configured")]
    NoStationsConfigured,

    /// 该操作只允许在 Idle 状态下执行
    #[error("Operation requires an idle controller (current state: {0:?})")]
    NotIdle(ControllerState),

    /// 启用的工位没有可用的相机后端
    #[error("No camera bound to station {0}")]
    NoCamera(StationId),

    /// 构造控制器时缺少组件
    #[error("Missing component: {0}")]
    MissingComponent(&'static str),

    /// 工作线程创建失败
    #[error("Failed to spawn worker for {station_id}: {message}")]
    Spawn {
        station_id: StationId,
        message: String,
    },

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] IoError),
}

/// 工作线程未在宽限期内响应停止请求
///
/// 这是一个警告，不是 `stop()` 的失败：线程被分离（不是被杀死），
/// 其最后一次发布的状态仍可通过 `get_statistics()` 读取。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Station {station_id} did not stop within {timeout:?} (last state: {last_state:?})")]
pub struct StopTimeout {
    pub station_id: StationId,
    pub last_state: StationState,
    pub timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use inspect_io::IoDeviceError;

    #[test]
    fn test_controller_error_display() {
        let err = ControllerError::ConfigConflict {
            station_id: "Bottom".into(),
            existing: "Top".into(),
            kind: LineKind::Trigger,
            line: 3,
        };
        assert_eq!(
            format!("{}", err),
            "Station Bottom claims trigger line 3 already used by Top"
        );

        assert_eq!(
            format!("{}", ControllerError::AlreadyRunning),
            "Production already running"
        );
        assert_eq!(
            format!("{}", ControllerError::NoStationsConfigured),
            "No enabled stations configured"
        );

        let err = ControllerError::NotIdle(ControllerState::Running);
        assert!(format!("{}", err).contains("Running"));
    }

    #[test]
    fn test_from_io_error() {
        let io_error = IoError::Device(IoDeviceError::from("bus fault"));
        let err: ControllerError = io_error.into();
        assert!(matches!(err, ControllerError::Io(_)));
    }

    #[test]
    fn test_from_protocol_error() {
        let err: ControllerError = ProtocolError::InvalidResultCode(9).into();
        match err {
            ControllerError::InvalidConfig(ProtocolError::InvalidResultCode(code)) => {
                assert_eq!(code, 9)
            },
            other => panic!("Expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_stop_timeout_display() {
        let warning = StopTimeout {
            station_id: "Top".into(),
            last_state: StationState::Capturing,
            timeout: Duration::from_millis(50),
        };
        let msg = format!("{}", warning);
        assert!(msg.contains("Top") && msg.contains("Capturing") && msg.contains("50ms"));
    }
}
