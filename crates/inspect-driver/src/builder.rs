//! Builder 模式实现
//!
//! 提供链式构造 `ProductionController` 的便捷方式。

use crate::camera::CameraBackend;
use crate::controller::ProductionController;
use crate::error::ControllerError;
use crate::hooks::CycleHook;
use crate::inspection::InspectionCallback;
use crate::io_channel::{IoChannel, IoChannelConfig};
use crate::worker::WorkerConfig;
use inspect_io::IoDriver;
use inspect_protocol::{StationConfig, StationId};
use std::sync::Arc;

/// 控制器 Builder（链式构造）
///
/// # Example
///
/// ```
/// use inspect_driver::{CaptureError, CaptureRequest, ControllerBuilder, Frame, StationConfig};
/// use inspect_io::MockIoDriver;
///
/// let controller = ControllerBuilder::new()
///     .io_driver(MockIoDriver::new())
///     .camera(|_: &CaptureRequest<'_>| Ok::<_, CaptureError>(Frame::empty()))
///     .station(StationConfig::new("Top", 0, 0))
///     .station(StationConfig::new("Bottom", 1, 1))
///     .inspection(|_: &inspect_driver::StationId, frame: &Frame| frame.is_empty())
///     .build()
///     .unwrap();
/// assert_eq!(controller.stations().len(), 2);
/// ```
pub struct ControllerBuilder {
    driver: Option<Box<dyn IoDriver>>,
    camera: Option<Arc<dyn CameraBackend>>,
    station_cameras: Vec<(StationId, Arc<dyn CameraBackend>)>,
    inspection: Option<Arc<dyn InspectionCallback>>,
    io_config: IoChannelConfig,
    worker_config: WorkerConfig,
    stations: Vec<StationConfig>,
    hooks: Vec<Arc<dyn CycleHook>>,
}

impl ControllerBuilder {
    pub fn new() -> Self {
        Self {
            driver: None,
            camera: None,
            station_cameras: Vec::new(),
            inspection: None,
            io_config: IoChannelConfig::default(),
            worker_config: WorkerConfig::default(),
            stations: Vec::new(),
            hooks: Vec::new(),
        }
    }

    /// I/O 卡驱动（必需）
    pub fn io_driver(mut self, driver: impl IoDriver + 'static) -> Self {
        self.driver = Some(Box::new(driver));
        self
    }

    /// 默认相机后端
    pub fn camera(mut self, camera: impl CameraBackend + 'static) -> Self {
        self.camera = Some(Arc::new(camera));
        self
    }

    /// 共享的相机后端
    pub fn shared_camera(mut self, camera: Arc<dyn CameraBackend>) -> Self {
        self.camera = Some(camera);
        self
    }

    /// 为单个工位绑定相机后端
    pub fn station_camera(
        mut self,
        station_id: impl Into<StationId>,
        camera: impl CameraBackend + 'static,
    ) -> Self {
        self.station_cameras.push((station_id.into(), Arc::new(camera)));
        self
    }

    pub fn inspection(mut self, callback: impl InspectionCallback + 'static) -> Self {
        self.inspection = Some(Arc::new(callback));
        self
    }

    pub fn io_config(mut self, config: IoChannelConfig) -> Self {
        self.io_config = config;
        self
    }

    pub fn worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// 添加工位（按添加顺序校验，冲突时 `build()` 失败）
    pub fn station(mut self, station: StationConfig) -> Self {
        self.stations.push(station);
        self
    }

    pub fn stations(mut self, stations: impl IntoIterator<Item = StationConfig>) -> Self {
        self.stations.extend(stations);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn CycleHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// 构建控制器（处于 Idle 状态）
    pub fn build(self) -> Result<ProductionController, ControllerError> {
        let driver = self
            .driver
            .ok_or(ControllerError::MissingComponent("I/O driver"))?;
        if self.camera.is_none() && self.station_cameras.is_empty() {
            return Err(ControllerError::MissingComponent("camera backend"));
        }

        let io = IoChannel::new(driver, self.io_config)?;
        let mut controller = ProductionController::new(io, self.camera, self.worker_config);

        for (station_id, camera) in self.station_cameras {
            controller.bind_camera(station_id, camera)?;
        }
        for station in self.stations {
            controller.configure_station(station)?;
        }
        if let Some(callback) = self.inspection {
            controller.set_shared_inspection_callback(callback)?;
        }
        for hook in self.hooks {
            controller.add_cycle_hook(hook)?;
        }
        Ok(controller)
    }
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
