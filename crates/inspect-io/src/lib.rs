//! # Inspect I/O Adapter Layer
//!
//! 数字 I/O 硬件抽象层，提供统一的线级读写接口。
//!
//! 具体的 I/O 卡驱动（DLL/内核驱动）实现 [`IoDriver`]，编排层只依赖这个 trait。
//! 驱动本身**不可重入**：同一时刻只能有一个调用者持有 `&mut`，
//! 跨线程共享由上层的 `IoChannel` 串行化。

use inspect_protocol::MAX_LINES;
use std::time::{Duration, Instant};
use thiserror::Error;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(any(test, feature = "mock"))]
pub use mock::{AckMode, MockIoDriver, MockIoHandle, PulseRecord};

/// I/O 适配层统一错误类型
#[derive(Error, Debug, Clone)]
pub enum IoError {
    #[error("Device Error: {0}")]
    Device(#[from] IoDeviceError),
    #[error("I/O operation timeout")]
    Timeout,
    #[error("I/O bus busy (lock not acquired within {0:?})")]
    BusBusy(Duration),
    #[error("I/O device not initialized")]
    NotInitialized,
    #[error("Invalid line {0} (port has {max} lines)", max = MAX_LINES)]
    InvalidLine(u8),
}

impl IoError {
    /// 是否为不可恢复的错误（设备掉线、无权限等）
    pub fn is_fatal(&self) -> bool {
        match self {
            IoError::Device(e) => e.is_fatal(),
            IoError::NotInitialized => true,
            _ => false,
        }
    }
}

/// 设备/后端错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDeviceErrorKind {
    Unknown,
    NotFound,
    NoDevice,
    AccessDenied,
    Busy,
    InvalidResponse,
    Backend,
}

/// 结构化设备错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct IoDeviceError {
    pub kind: IoDeviceErrorKind,
    pub message: String,
}

impl IoDeviceError {
    pub fn new(kind: IoDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            IoDeviceErrorKind::NoDevice
                | IoDeviceErrorKind::AccessDenied
                | IoDeviceErrorKind::NotFound
        )
    }
}

impl From<String> for IoDeviceError {
    fn from(message: String) -> Self {
        Self::new(IoDeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for IoDeviceError {
    fn from(message: &str) -> Self {
        Self::new(IoDeviceErrorKind::Unknown, message)
    }
}

/// 校验线号
pub fn check_line(line: u8) -> Result<(), IoError> {
    if line >= MAX_LINES {
        return Err(IoError::InvalidLine(line));
    }
    Ok(())
}

/// 数字 I/O 驱动
///
/// 输入线在输入端口上，输出线和结果端口在输出端口上。
pub trait IoDriver: Send {
    /// 读取一条输入线（true = 高电平/有效）
    fn read_line(&mut self, line: u8) -> Result<bool, IoError>;

    /// 写一条输出线
    fn write_line(&mut self, line: u8, level: bool) -> Result<(), IoError>;

    /// 整体写输出端口（结果码 + busy 位）
    fn write_port(&mut self, value: u8) -> Result<(), IoError>;

    /// 等待输入线变为有效，超时返回 `Ok(false)`
    ///
    /// 默认实现以 1ms 间隔轮询 `read_line`；支持中断的驱动应覆盖此方法。
    fn wait_for_line(&mut self, line: u8, timeout: Duration) -> Result<bool, IoError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.read_line(line)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl<T: IoDriver + ?Sized> IoDriver for Box<T> {
    fn read_line(&mut self, line: u8) -> Result<bool, IoError> {
        (**self).read_line(line)
    }

    fn write_line(&mut self, line: u8, level: bool) -> Result<(), IoError> {
        (**self).write_line(line, level)
    }

    fn write_port(&mut self, value: u8) -> Result<(), IoError> {
        (**self).write_port(value)
    }

    fn wait_for_line(&mut self, line: u8, timeout: Duration) -> Result<bool, IoError> {
        (**self).wait_for_line(line, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 只实现必需方法，验证默认 `wait_for_line`
    struct CountingDriver {
        reads: u32,
        high_after: u32,
    }

    impl IoDriver for CountingDriver {
        fn read_line(&mut self, _line: u8) -> Result<bool, IoError> {
            self.reads += 1;
            Ok(self.reads > self.high_after)
        }

        fn write_line(&mut self, _line: u8, _level: bool) -> Result<(), IoError> {
            Ok(())
        }

        fn write_port(&mut self, _value: u8) -> Result<(), IoError> {
            Ok(())
        }
    }

    #[test]
    fn test_default_wait_for_line_success() {
        let mut driver = CountingDriver {
            reads: 0,
            high_after: 3,
        };
        assert!(driver.wait_for_line(0, Duration::from_millis(500)).unwrap());
        assert_eq!(driver.reads, 4);
    }

    #[test]
    fn test_default_wait_for_line_timeout() {
        let mut driver = CountingDriver {
            reads: 0,
            high_after: u32::MAX,
        };
        let start = Instant::now();
        assert!(!driver.wait_for_line(0, Duration::from_millis(10)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_io_error_fatal() {
        let err = IoError::Device(IoDeviceError::new(
            IoDeviceErrorKind::NoDevice,
            "unplugged",
        ));
        assert!(err.is_fatal());
        assert!(!IoError::Timeout.is_fatal());
        assert!(!IoError::BusBusy(Duration::from_millis(5)).is_fatal());
        assert!(IoError::NotInitialized.is_fatal());
    }

    #[test]
    fn test_check_line() {
        assert!(check_line(7).is_ok());
        assert!(matches!(check_line(8), Err(IoError::InvalidLine(8))));
    }

    #[test]
    fn test_error_display() {
        let err = IoError::Device("bus fault".into());
        assert_eq!(format!("{}", err), "Device Error: Unknown: bus fault");
        assert_eq!(
            format!("{}", IoError::InvalidLine(9)),
            "Invalid line 9 (port has 8 lines)"
        );
    }
}
