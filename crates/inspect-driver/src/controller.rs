//! 生产控制器
//!
//! 持有工位配置、共享 I/O 通道、相机后端和检测回调，负责工位线程的启动和有界停止。
//!
//! 生命周期：`Idle --start()--> Running --stop()--> Stopping --> Idle`。
//! 配置类操作（工位、检测回调、钩子）只允许在 Idle 时进行。

use crate::camera::CameraBackend;
use crate::error::{ControllerError, StopTimeout};
use crate::hooks::{CycleHook, HookManager};
use crate::inspection::InspectionCallback;
use crate::io_channel::IoChannel;
use crate::metrics::IoMetricsSnapshot;
use crate::state::{AtomicControllerState, ControllerState, FleetTotals, StationRuntimeState};
use crate::worker::{ExitNotifier, StationShared, StationWorker, WorkerConfig, WorkerContext};
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use inspect_protocol::{StationConfig, StationId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Drop 时等待工位线程退出的时长
const DROP_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// `stop()` 的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// 在宽限期内正常退出的工位
    pub stopped: Vec<StationId>,
    /// 超时未退出、已被分离的工位
    pub timed_out: Vec<StopTimeout>,
    /// 线程以 panic 结束的工位
    pub panicked: Vec<StationId>,
}

impl StopReport {
    /// 所有工位都在宽限期内正常退出
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty() && self.panicked.is_empty()
    }
}

struct WorkerHandle {
    shared: Arc<StationShared>,
    thread: JoinHandle<()>,
}

/// 多工位生产控制器
pub struct ProductionController {
    io: IoChannel,
    /// 未单独绑定相机的工位使用的后端
    camera: Option<Arc<dyn CameraBackend>>,
    station_cameras: HashMap<StationId, Arc<dyn CameraBackend>>,
    inspection: Option<Arc<dyn InspectionCallback>>,
    hooks: HookManager,
    worker_config: WorkerConfig,
    /// 按配置顺序保存
    stations: Vec<StationConfig>,
    state: AtomicControllerState,
    workers: Vec<WorkerHandle>,
    exit_rx: Option<Receiver<StationId>>,
    /// 最近一次运行的工位状态（停止后仍保留，分离的线程也继续写入）
    shared: BTreeMap<StationId, Arc<StationShared>>,
}

impl ProductionController {
    /// 创建控制器；`camera` 为默认相机后端，可再用 [`Self::bind_camera`] 为单个工位指定后端
    pub fn new(
        io: IoChannel,
        camera: Option<Arc<dyn CameraBackend>>,
        worker_config: WorkerConfig,
    ) -> Self {
        Self {
            io,
            camera,
            station_cameras: HashMap::new(),
            inspection: None,
            hooks: HookManager::new(),
            worker_config,
            stations: Vec::new(),
            state: AtomicControllerState::default(),
            workers: Vec::new(),
            exit_rx: None,
            shared: BTreeMap::new(),
        }
    }

    fn require_idle(&self) -> Result<(), ControllerError> {
        match self.state() {
            ControllerState::Idle => Ok(()),
            other => Err(ControllerError::NotIdle(other)),
        }
    }

    /// 添加或替换一个工位
    ///
    /// 同一 `station_id` 再次配置会替换原配置；与其他启用工位争用传感器线或触发线时返回
    /// [`ControllerError::ConfigConflict`]，原有配置保持不变。
    pub fn configure_station(&mut self, config: StationConfig) -> Result<(), ControllerError> {
        self.require_idle()?;
        config.validate()?;
        config.check_ack_line(self.io.config().ack_line)?;

        for existing in self
            .stations
            .iter()
            .filter(|s| s.station_id != config.station_id)
        {
            if let Some(conflict) = config.conflicts_with(existing) {
                return Err(ControllerError::ConfigConflict {
                    station_id: config.station_id.clone(),
                    existing: existing.station_id.clone(),
                    kind: conflict.kind,
                    line: conflict.line,
                });
            }
        }

        match self
            .stations
            .iter_mut()
            .find(|s| s.station_id == config.station_id)
        {
            Some(slot) => {
                info!("[{}] Station reconfigured", config.station_id);
                *slot = config;
            },
            None => {
                info!(
                    "[{}] Station configured (sensor line {}, trigger line {})",
                    config.station_id, config.sensor_line, config.trigger_line
                );
                self.stations.push(config);
            },
        }
        Ok(())
    }

    /// 移除工位，返回被移除的配置
    pub fn remove_station(
        &mut self,
        station_id: &str,
    ) -> Result<Option<StationConfig>, ControllerError> {
        self.require_idle()?;
        let removed = self
            .stations
            .iter()
            .position(|s| s.station_id.as_str() == station_id)
            .map(|idx| self.stations.remove(idx));
        Ok(removed)
    }

    pub fn stations(&self) -> &[StationConfig] {
        &self.stations
    }

    /// 设置检测回调（所有工位共用）
    pub fn set_inspection_callback<C>(&mut self, callback: C) -> Result<(), ControllerError>
    where
        C: InspectionCallback + 'static,
    {
        self.set_shared_inspection_callback(Arc::new(callback))
    }

    pub fn set_shared_inspection_callback(
        &mut self,
        callback: Arc<dyn InspectionCallback>,
    ) -> Result<(), ControllerError> {
        self.require_idle()?;
        self.inspection = Some(callback);
        Ok(())
    }

    pub fn clear_inspection_callback(&mut self) -> Result<(), ControllerError> {
        self.require_idle()?;
        self.inspection = None;
        Ok(())
    }

    /// 为单个工位绑定相机后端（覆盖默认后端）
    pub fn bind_camera(
        &mut self,
        station_id: impl Into<StationId>,
        camera: Arc<dyn CameraBackend>,
    ) -> Result<(), ControllerError> {
        self.require_idle()?;
        self.station_cameras.insert(station_id.into(), camera);
        Ok(())
    }

    fn camera_for(&self, station_id: &StationId) -> Option<Arc<dyn CameraBackend>> {
        self.station_cameras
            .get(station_id)
            .or(self.camera.as_ref())
            .cloned()
    }

    pub fn add_cycle_hook(&mut self, hook: Arc<dyn CycleHook>) -> Result<(), ControllerError> {
        self.require_idle()?;
        self.hooks.add_hook(hook);
        Ok(())
    }

    pub fn worker_config(&self) -> &WorkerConfig {
        &self.worker_config
    }

    pub fn set_worker_config(&mut self, config: WorkerConfig) -> Result<(), ControllerError> {
        self.require_idle()?;
        self.worker_config = config;
        Ok(())
    }

    /// 为每个启用的工位启动一个工作线程
    pub fn start(&mut self) -> Result<(), ControllerError> {
        if self.state() != ControllerState::Idle {
            return Err(ControllerError::AlreadyRunning);
        }
        let enabled: Vec<StationConfig> =
            self.stations.iter().filter(|s| s.enabled).cloned().collect();
        if enabled.is_empty() {
            return Err(ControllerError::NoStationsConfigured);
        }
        let mut cameras = Vec::with_capacity(enabled.len());
        for station in &enabled {
            let camera = self
                .camera_for(&station.station_id)
                .ok_or_else(|| ControllerError::NoCamera(station.station_id.clone()))?;
            cameras.push(camera);
        }

        if let Err(e) = self.io.clear_busy() {
            warn!("Failed to reset result port before start: {}", e);
        }

        let (exit_tx, exit_rx) = unbounded();
        let hooks = Arc::new(self.hooks.clone());

        self.shared.clear();
        self.workers.clear();
        self.exit_rx = Some(exit_rx);
        self.state.set(ControllerState::Running, Ordering::Release);

        for (station, camera) in enabled.into_iter().zip(cameras) {
            let ctx = WorkerContext {
                io: self.io.clone(),
                camera,
                inspection: self.inspection.clone(),
                hooks: hooks.clone(),
                config: self.worker_config,
            };
            let station_id = station.station_id.clone();
            let shared = Arc::new(StationShared::new(&station));
            let worker = StationWorker::new(station, ctx, shared.clone());
            let notifier = ExitNotifier {
                station_id: station_id.clone(),
                tx: exit_tx.clone(),
            };

            let spawned = std::thread::Builder::new()
                .name(format!("station-{}", station_id))
                .spawn(move || {
                    let _notifier = notifier;
                    worker.run();
                });

            match spawned {
                Ok(thread) => {
                    self.shared.insert(station_id, shared.clone());
                    self.workers.push(WorkerHandle { shared, thread });
                },
                Err(e) => {
                    error!("[{}] Failed to spawn worker: {}", station_id, e);
                    match self.stop(DROP_STOP_TIMEOUT) {
                        Ok(report) if !report.is_clean() => {
                            warn!("Rollback after spawn failure left {:?}", report);
                        },
                        _ => {},
                    }
                    return Err(ControllerError::Spawn {
                        station_id,
                        message: e.to_string(),
                    });
                },
            }
        }

        info!("Production started with {} stations", self.workers.len());
        Ok(())
    }

    /// 请求所有工位停止，最多等待 `timeout`
    ///
    /// 超时未退出的线程被分离，记入 [`StopReport::timed_out`]；控制器总会回到 Idle。
    /// 在 Idle 状态调用是空操作。
    pub fn stop(&mut self, timeout: Duration) -> Result<StopReport, ControllerError> {
        if self.state() == ControllerState::Idle {
            return Ok(StopReport::default());
        }
        self.state.set(ControllerState::Stopping, Ordering::Release);

        for worker in &self.workers {
            worker.shared.request_stop();
        }

        let deadline = Instant::now() + timeout;
        let mut exited = HashSet::new();
        if let Some(rx) = self.exit_rx.take() {
            while exited.len() < self.workers.len() {
                match rx.recv_deadline(deadline) {
                    Ok(station_id) => {
                        exited.insert(station_id);
                    },
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }

        let mut report = StopReport::default();
        for worker in self.workers.drain(..) {
            let station_id = worker.shared.station_id.clone();
            if exited.contains(&station_id) {
                match worker.thread.join() {
                    Ok(()) => report.stopped.push(station_id),
                    Err(_) => {
                        error!("[{}] Worker panicked", station_id);
                        report.panicked.push(station_id);
                    },
                }
            } else {
                let warning = StopTimeout {
                    station_id,
                    last_state: worker.shared.current_state(),
                    timeout,
                };
                warn!("{}, detaching thread", warning);
                report.timed_out.push(warning);
                // JoinHandle 被丢弃：线程分离，停止标志保持置位
            }
        }

        self.state.set(ControllerState::Idle, Ordering::Release);
        info!(
            "Production stopped ({} stopped, {} timed out, {} panicked)",
            report.stopped.len(),
            report.timed_out.len(),
            report.panicked.len()
        );
        Ok(report)
    }

    pub fn state(&self) -> ControllerState {
        self.state.get(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.state() == ControllerState::Running
    }

    /// 各工位的最新快照（不加锁，不会阻塞工位线程）
    ///
    /// 包含最近一次运行中的所有工位；停止后仍可读取。
    pub fn get_statistics(&self) -> BTreeMap<StationId, StationRuntimeState> {
        self.shared
            .iter()
            .map(|(id, shared)| (id.clone(), shared.snapshot()))
            .collect()
    }

    /// 单个工位的最新快照
    pub fn get_station_state(&self, station_id: &str) -> Option<StationRuntimeState> {
        self.shared.get(station_id).map(|shared| shared.snapshot())
    }

    /// 全部工位的合计
    pub fn fleet_totals(&self) -> FleetTotals {
        let states: Vec<StationRuntimeState> =
            self.shared.values().map(|shared| shared.snapshot()).collect();
        FleetTotals::from_states(&states)
    }

    /// 运行中且所有工位线程都存活、未进入 Faulted
    pub fn is_healthy(&self) -> bool {
        self.is_running()
            && self
                .workers
                .iter()
                .all(|w| !w.thread.is_finished() && !w.shared.snapshot().faulted)
    }

    pub fn get_io_metrics(&self) -> IoMetricsSnapshot {
        self.io.get_metrics()
    }
}

impl Drop for ProductionController {
    fn drop(&mut self) {
        if self.state() == ControllerState::Idle {
            return;
        }
        match self.stop(DROP_STOP_TIMEOUT) {
            Ok(report) if !report.is_clean() => {
                warn!("Controller dropped with unclean shutdown: {:?}", report);
            },
            Ok(_) => {},
            Err(e) => error!("Failed to stop controller on drop: {}", e),
        }
    }
}

impl std::fmt::Debug for ProductionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductionController")
            .field("state", &self.state())
            .field("stations", &self.stations)
            .field("workers", &self.workers.len())
            .field("has_inspection", &self.inspection.is_some())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CaptureError, CaptureRequest, Frame};
    use crate::io_channel::IoChannelConfig;
    use inspect_io::MockIoDriver;
    use inspect_protocol::LineKind;

    fn controller() -> ProductionController {
        let io = IoChannel::new(
            Box::new(MockIoDriver::new()),
            IoChannelConfig {
                settle_delay: Duration::ZERO,
                ..Default::default()
            },
        )
        .unwrap();
        let camera: Arc<dyn CameraBackend> =
            Arc::new(|_: &CaptureRequest<'_>| Ok::<_, CaptureError>(Frame::empty()));
        ProductionController::new(
            io,
            Some(camera),
            WorkerConfig {
                poll_interval: Duration::from_millis(1),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_conflict_keeps_existing_config() {
        let mut controller = controller();
        controller
            .configure_station(StationConfig::new("Top", 0, 3))
            .unwrap();

        let err = controller
            .configure_station(StationConfig::new("Bottom", 1, 3))
            .unwrap_err();
        match err {
            ControllerError::ConfigConflict {
                station_id,
                existing,
                kind,
                line,
            } => {
                assert_eq!(station_id.as_str(), "Bottom");
                assert_eq!(existing.as_str(), "Top");
                assert_eq!(kind, LineKind::Trigger);
                assert_eq!(line, 3);
            },
            other => panic!("Expected ConfigConflict, got {:?}", other),
        }

        assert_eq!(controller.stations().len(), 1);
        assert_eq!(controller.stations()[0].trigger_line, 3);
    }

    #[test]
    fn test_reconfigure_same_station() {
        let mut controller = controller();
        controller
            .configure_station(StationConfig::new("Top", 0, 0))
            .unwrap();
        controller
            .configure_station(StationConfig::new("Top", 0, 0).with_trigger_pulse_ms(20.0))
            .unwrap();
        assert_eq!(controller.stations().len(), 1);
        assert_eq!(controller.stations()[0].trigger_pulse_ms, 20.0);
    }

    #[test]
    fn test_disabled_station_frees_lines() {
        let mut controller = controller();
        controller
            .configure_station(StationConfig::new("Top", 0, 0).with_enabled(false))
            .unwrap();
        controller
            .configure_station(StationConfig::new("Spare", 0, 0))
            .unwrap();
        assert_eq!(controller.stations().len(), 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut controller = controller();
        let err = controller
            .configure_station(StationConfig::new("Top", 9, 0))
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
        assert!(controller.stations().is_empty());
    }

    #[test]
    fn test_sensor_on_ack_line_rejected() {
        let mut controller = controller();
        let ack_line = controller.io.config().ack_line;
        let err = controller
            .configure_station(StationConfig::new("Top", ack_line, 0))
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
        assert!(controller.stations().is_empty());

        // 禁用的工位不读传感器
        controller
            .configure_station(StationConfig::new("Top", ack_line, 0).with_enabled(false))
            .unwrap();
        assert_eq!(controller.stations().len(), 1);
    }

    #[test]
    fn test_start_without_stations() {
        let mut controller = controller();
        assert!(matches!(
            controller.start(),
            Err(ControllerError::NoStationsConfigured)
        ));

        controller
            .configure_station(StationConfig::new("Top", 0, 0).with_enabled(false))
            .unwrap();
        assert!(matches!(
            controller.start(),
            Err(ControllerError::NoStationsConfigured)
        ));
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_lifecycle() {
        let mut controller = controller();
        controller
            .configure_station(StationConfig::new("Top", 0, 0))
            .unwrap();

        controller.start().unwrap();
        assert!(controller.is_running());
        assert!(matches!(
            controller.start(),
            Err(ControllerError::AlreadyRunning)
        ));
        assert!(matches!(
            controller.configure_station(StationConfig::new("Bottom", 1, 1)),
            Err(ControllerError::NotIdle(ControllerState::Running))
        ));

        let report = controller.stop(Duration::from_secs(1)).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.stopped, vec![StationId::from("Top")]);
        assert_eq!(controller.state(), ControllerState::Idle);

        // 停止后统计仍可读取
        let stats = controller.get_statistics();
        assert!(stats["Top"].stop_requested);

        // 再次 stop 是空操作
        assert_eq!(
            controller.stop(Duration::from_millis(10)).unwrap(),
            StopReport::default()
        );

        // 可以重新启动
        controller.start().unwrap();
        assert!(controller.is_healthy());
        controller.stop(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_station_camera_binding() {
        let io = IoChannel::new(Box::new(MockIoDriver::new()), IoChannelConfig::default()).unwrap();
        let mut controller = ProductionController::new(io, None, WorkerConfig::default());
        controller
            .configure_station(StationConfig::new("Top", 0, 0))
            .unwrap();
        assert!(matches!(controller.start(), Err(ControllerError::NoCamera(_))));

        let camera: Arc<dyn CameraBackend> =
            Arc::new(|_: &CaptureRequest<'_>| Ok::<_, CaptureError>(Frame::empty()));
        controller.bind_camera("Top", camera).unwrap();
        controller.start().unwrap();
        controller.stop(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_remove_station() {
        let mut controller = controller();
        controller
            .configure_station(StationConfig::new("Top", 0, 0))
            .unwrap();
        let removed = controller.remove_station("Top").unwrap();
        assert_eq!(removed.map(|s| s.station_id), Some(StationId::from("Top")));
        assert!(controller.remove_station("Top").unwrap().is_none());
    }
}
