//! 相机后端抽象
//!
//! 编排层不关心像素格式和相机 SDK，只要求后端能为某个工位在限定时间内交付一帧。
//! 后端在所有工位线程间共享，必须是 `Send + Sync`，并且能被不同工位并发调用。

use inspect_protocol::StationId;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// 采集到的一帧图像（像素数据不透明）
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
    pub captured_at: SystemTime,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            width,
            height,
            data: data.into(),
            captured_at: SystemTime::now(),
        }
    }

    /// 空帧（仿真和测试用）
    pub fn empty() -> Self {
        Self::new(0, 0, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// 一次采集请求
#[derive(Debug, Clone, Copy)]
pub struct CaptureRequest<'a> {
    pub station_id: &'a StationId,
    /// 最长等待时间
    pub timeout: Duration,
    /// true = 工位未使用硬件触发，后端需要自行软触发
    pub software_trigger: bool,
}

/// 采集失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Capture timed out after {0:?}")]
    Timeout(Duration),
    #[error("No camera bound to station {0}")]
    NoCamera(StationId),
    #[error("Camera backend error: {0}")]
    Backend(String),
}

/// 相机后端
///
/// 实现者自行处理每个工位到物理相机的映射。闭包也可以直接作为后端：
///
/// ```
/// use inspect_driver::{CameraBackend, CaptureError, CaptureRequest, Frame};
///
/// let camera = |_request: &CaptureRequest<'_>| Ok::<_, CaptureError>(Frame::empty());
/// let id = "Top".into();
/// let request = CaptureRequest {
///     station_id: &id,
///     timeout: std::time::Duration::from_millis(100),
///     software_trigger: false,
/// };
/// assert!(camera.capture(&request).is_ok());
/// ```
pub trait CameraBackend: Send + Sync {
    fn capture(&self, request: &CaptureRequest<'_>) -> Result<Frame, CaptureError>;
}

impl<F> CameraBackend for F
where
    F: Fn(&CaptureRequest<'_>) -> Result<Frame, CaptureError> + Send + Sync,
{
    fn capture(&self, request: &CaptureRequest<'_>) -> Result<Frame, CaptureError> {
        self(request)
    }
}
