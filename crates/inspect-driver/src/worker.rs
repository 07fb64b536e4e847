//! 工位工作线程
//!
//! 每个启用的工位一个线程，独立运行自己的状态机，工位之间只共享 I/O 通道、相机后端和检测回调。
//!
//! 停止标志在每次进入新状态时检查；结果握手是单次持锁事务，
//! 一旦开始就会完整执行（包括清除 busy），停止请求在握手结束后生效。
//!
//! 总线忙（[`IoError::BusBusy`]）视为争用而非故障，不计入 I/O 故障计数：
//! 读传感器时直接重读，触发时跳过该零件，上报结果时重试。

use crate::camera::{CameraBackend, CaptureError, CaptureRequest, Frame};
use crate::hooks::{CycleOutcome, CycleRecord, HookManager};
use crate::inspection::{InspectionCallback, Verdict, panic_message, run_inspection};
use crate::io_channel::{AckOutcome, IoChannel};
use crate::state::{LastResult, StationRuntimeState, StationState};
use arc_swap::ArcSwap;
use crossbeam_channel::Sender;
use inspect_io::IoError;
use inspect_protocol::{StationConfig, StationId};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, trace, warn};

/// 工位线程配置（POD，所有工位共用）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerConfig {
    /// 传感器轮询间隔
    pub poll_interval: Duration,
    /// 单次采集超时
    pub capture_timeout: Duration,
    /// 等待下游应答的超时
    pub ack_timeout: Duration,
    /// I/O 出错后的退避时间
    pub io_fault_backoff: Duration,
    /// 连续 I/O 错误达到该次数后进入 Faulted（致命错误立即进入）
    pub max_consecutive_io_faults: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            capture_timeout: Duration::from_millis(2000),
            ack_timeout: Duration::from_millis(5000),
            io_fault_backoff: Duration::from_millis(100),
            max_consecutive_io_faults: 20,
        }
    }
}

/// 工位线程与控制器之间共享的部分
///
/// 停止标志只由控制器写；快照只由工位线程写（整体替换）。
pub(crate) struct StationShared {
    pub(crate) station_id: StationId,
    stop_requested: AtomicBool,
    published: ArcSwap<StationRuntimeState>,
}

impl StationShared {
    pub(crate) fn new(config: &StationConfig) -> Self {
        Self {
            station_id: config.station_id.clone(),
            stop_requested: AtomicBool::new(false),
            published: ArcSwap::from_pointee(StationRuntimeState::new(
                config.station_id.clone(),
                config.display_name.clone(),
            )),
        }
    }

    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub(crate) fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub(crate) fn current_state(&self) -> StationState {
        self.published.load().current_state
    }

    pub(crate) fn snapshot(&self) -> StationRuntimeState {
        let mut state = StationRuntimeState::clone(&self.published.load());
        state.stop_requested = self.is_stop_requested();
        state
    }
}

/// 工位线程运行所需的共享组件
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) io: IoChannel,
    pub(crate) camera: Arc<dyn CameraBackend>,
    pub(crate) inspection: Option<Arc<dyn InspectionCallback>>,
    pub(crate) hooks: Arc<HookManager>,
    pub(crate) config: WorkerConfig,
}

/// 线程退出时（包括 panic 展开）通知控制器
pub(crate) struct ExitNotifier {
    pub(crate) station_id: StationId,
    pub(crate) tx: Sender<StationId>,
}

impl Drop for ExitNotifier {
    fn drop(&mut self) {
        let _ = self.tx.send(self.station_id.clone());
    }
}

/// 进行中的检测周期
struct Cycle {
    started: Instant,
    verdict: Verdict,
    outcome: CycleOutcome,
}

impl Cycle {
    fn start() -> Self {
        Self {
            started: Instant::now(),
            verdict: Verdict::Pass,
            outcome: CycleOutcome::Inspected,
        }
    }
}

/// 状态机的下一步
enum Step {
    WaitSensor,
    Armed(Cycle),
    Capturing(Cycle),
    Inspecting(Cycle, Frame),
    Reporting(Cycle),
    Stopped,
    Faulted(IoError),
}

pub(crate) struct StationWorker {
    station: StationConfig,
    ctx: WorkerContext,
    shared: Arc<StationShared>,
    local: StationRuntimeState,
    /// 上一次成功读到的传感器电平（跨周期保留）
    last_sensor: Option<bool>,
    consecutive_io_faults: u32,
    sequence: u64,
    warned_no_callback: bool,
}

impl StationWorker {
    pub(crate) fn new(
        station: StationConfig,
        ctx: WorkerContext,
        shared: Arc<StationShared>,
    ) -> Self {
        let local = StationRuntimeState::new(station.station_id.clone(), station.display_name.clone());
        Self {
            station,
            ctx,
            shared,
            local,
            last_sensor: None,
            consecutive_io_faults: 0,
            sequence: 0,
            warned_no_callback: false,
        }
    }

    fn id(&self) -> &StationId {
        &self.station.station_id
    }

    pub(crate) fn run(mut self) {
        info!(
            "[{}] Worker started (sensor line {}, trigger line {}, hardware trigger: {})",
            self.id(),
            self.station.sensor_line,
            self.station.trigger_line,
            self.station.use_hardware_trigger
        );

        let mut step = Step::WaitSensor;
        loop {
            if self.shared.is_stop_requested() && !matches!(step, Step::Stopped | Step::Faulted(_))
            {
                if !matches!(step, Step::WaitSensor) {
                    debug!("[{}] Stop requested mid-cycle, part left unreported", self.id());
                }
                step = Step::Stopped;
            }

            step = match step {
                Step::WaitSensor => self.wait_sensor(),
                Step::Armed(cycle) => self.arm(cycle),
                Step::Capturing(cycle) => self.capture(cycle),
                Step::Inspecting(cycle, frame) => self.inspect(cycle, frame),
                Step::Reporting(cycle) => self.report(cycle),
                Step::Stopped => {
                    self.enter(StationState::Stopped);
                    info!(
                        "[{}] Worker stopped after {} cycles",
                        self.id(),
                        self.local.counters.cycles_completed
                    );
                    return;
                },
                Step::Faulted(e) => {
                    self.local.faulted = true;
                    self.enter(StationState::Faulted);
                    error!("[{}] Persistent I/O fault, worker exiting: {}", self.id(), e);
                    return;
                },
            };
        }
    }

    fn enter(&mut self, state: StationState) {
        trace!("[{}] {:?} -> {:?}", self.id(), self.local.current_state, state);
        self.local.current_state = state;
        self.publish();
    }

    fn publish(&self) {
        self.shared.published.store(Arc::new(self.local.clone()));
    }

    /// 记录一次 I/O 错误，返回 true 表示应进入 Faulted
    fn record_io_fault(&mut self, error: &IoError, during: &str) -> bool {
        self.local.counters.io_faults += 1;
        self.consecutive_io_faults += 1;

        if error.is_fatal() {
            return true;
        }
        let limit = self.ctx.config.max_consecutive_io_faults.max(1);
        if self.consecutive_io_faults >= limit {
            return true;
        }
        warn!(
            "[{}] I/O fault during {} ({}/{}): {}",
            self.id(),
            during,
            self.consecutive_io_faults,
            limit,
            error
        );
        false
    }

    fn wait_sensor(&mut self) -> Step {
        self.enter(StationState::WaitSensor);

        loop {
            if self.shared.is_stop_requested() {
                return Step::Stopped;
            }

            match self.ctx.io.read_input(self.station.sensor_line) {
                Ok(level) => {
                    self.consecutive_io_faults = 0;
                    // 第一次成功读数只作为基准，不触发
                    let previous = self.last_sensor.replace(level);
                    if level && previous == Some(false) {
                        debug!("[{}] Part detected", self.id());
                        return Step::Armed(Cycle::start());
                    }
                    spin_sleep::sleep(self.ctx.config.poll_interval);
                },
                Err(IoError::BusBusy(waited)) => {
                    // 其他工位长时间占用总线，属于争用，直接重读
                    debug!("[{}] Bus busy for {:?} on sensor read", self.id(), waited);
                },
                Err(e) => {
                    if self.record_io_fault(&e, "sensor read") {
                        return Step::Faulted(e);
                    }
                    self.publish();
                    std::thread::sleep(self.ctx.config.io_fault_backoff);
                },
            }
        }
    }

    fn arm(&mut self, cycle: Cycle) -> Step {
        self.enter(StationState::Armed);

        if !self.station.use_hardware_trigger {
            return Step::Capturing(cycle);
        }

        match self
            .ctx
            .io
            .pulse_output(self.station.trigger_line, self.station.trigger_pulse())
        {
            Ok(()) => {
                self.consecutive_io_faults = 0;
                Step::Capturing(cycle)
            },
            Err(IoError::BusBusy(waited)) => {
                self.local.counters.cycles_errored += 1;
                warn!(
                    "[{}] Bus busy for {:?}, trigger missed, part skipped",
                    self.id(),
                    waited
                );
                Step::WaitSensor
            },
            Err(e) => {
                self.local.counters.cycles_errored += 1;
                if self.record_io_fault(&e, "trigger pulse") {
                    return Step::Faulted(e);
                }
                warn!("[{}] Trigger failed, part skipped", self.id());
                Step::WaitSensor
            },
        }
    }

    fn capture(&mut self, mut cycle: Cycle) -> Step {
        self.enter(StationState::Capturing);

        let request = CaptureRequest {
            station_id: &self.station.station_id,
            timeout: self.ctx.config.capture_timeout,
            software_trigger: !self.station.use_hardware_trigger,
        };
        let camera = &self.ctx.camera;
        let result = catch_unwind(AssertUnwindSafe(|| camera.capture(&request))).unwrap_or_else(
            |payload| {
                Err(CaptureError::Backend(format!(
                    "camera backend panicked: {}",
                    panic_message(payload.as_ref())
                )))
            },
        );

        match result {
            Ok(frame) => Step::Inspecting(cycle, frame),
            Err(e) => {
                self.local.counters.capture_failures += 1;
                self.local.counters.cycles_errored += 1;
                warn!("[{}] {}, reporting FAIL", self.id(), e);
                cycle.verdict = Verdict::FAIL;
                cycle.outcome = CycleOutcome::CaptureFailed;
                Step::Reporting(cycle)
            },
        }
    }

    fn inspect(&mut self, mut cycle: Cycle, frame: Frame) -> Step {
        self.enter(StationState::Inspecting);

        match &self.ctx.inspection {
            None => {
                if !self.warned_no_callback {
                    warn!(
                        "[{}] No inspection callback registered, passing all parts",
                        self.station.station_id
                    );
                    self.warned_no_callback = true;
                }
                cycle.verdict = Verdict::Pass;
            },
            Some(callback) => {
                match run_inspection(callback.as_ref(), &self.station.station_id, &frame) {
                    Ok(verdict) => cycle.verdict = verdict,
                    Err(e) => {
                        self.local.counters.inspection_faults += 1;
                        warn!("[{}] {}, reporting FAIL", self.station.station_id, e);
                        cycle.verdict = Verdict::FAIL;
                        cycle.outcome = CycleOutcome::InspectionFault;
                    },
                }
            },
        }

        Step::Reporting(cycle)
    }

    fn report(&mut self, cycle: Cycle) -> Step {
        self.enter(StationState::Reporting);

        let io = self.ctx.io.clone();
        // 拿不到总线时结果尚未写出，重试直到拿到或被要求停止
        let result = loop {
            match self.handshake(&io, &cycle) {
                Err(IoError::BusBusy(waited)) => {
                    if self.shared.is_stop_requested() {
                        debug!(
                            "[{}] Stop requested while bus busy, part left unreported",
                            self.id()
                        );
                        return Step::Stopped;
                    }
                    debug!(
                        "[{}] Bus busy for {:?}, retrying result report",
                        self.id(),
                        waited
                    );
                },
                other => break other,
            }
        };

        match result {
            Ok(ack) => self.complete_cycle(cycle, ack),
            Err(e) => {
                self.local.counters.cycles_errored += 1;
                if self.record_io_fault(&e, "result report") {
                    return Step::Faulted(e);
                }
                warn!("[{}] Result for this part was not delivered", self.id());
                Step::WaitSensor
            },
        }
    }

    /// 写结果 → Acknowledging → 等待应答 → 清 busy（同一次持锁）
    fn handshake(&mut self, io: &IoChannel, cycle: &Cycle) -> Result<AckOutcome, IoError> {
        let mut handshake = io.begin_handshake()?;
        handshake.write_result(cycle.verdict.result_code())?;
        self.enter(StationState::Acknowledging);
        let ack = handshake.await_ack(self.ctx.config.ack_timeout)?;
        handshake.finish()?;
        Ok(ack)
    }

    fn complete_cycle(&mut self, cycle: Cycle, ack: AckOutcome) -> Step {
        self.consecutive_io_faults = 0;
        let acknowledged = ack.is_acknowledged();
        let counters = &mut self.local.counters;

        counters.cycles_completed += 1;
        if !acknowledged {
            counters.ack_timeouts += 1;
        }
        match cycle.outcome {
            CycleOutcome::Inspected if cycle.verdict.passed() => counters.cycles_passed += 1,
            CycleOutcome::Inspected | CycleOutcome::InspectionFault => counters.cycles_failed += 1,
            // 已计入 cycles_errored
            CycleOutcome::CaptureFailed => {},
        }

        let completed_at = SystemTime::now();
        self.local.last_result = Some(LastResult {
            verdict: cycle.verdict,
            acknowledged,
            timestamp: completed_at,
        });
        self.sequence += 1;

        let record = CycleRecord {
            station_id: self.station.station_id.clone(),
            sequence: self.sequence,
            verdict: cycle.verdict,
            outcome: cycle.outcome,
            acknowledged,
            cycle_time: cycle.started.elapsed(),
            completed_at,
        };

        if acknowledged {
            debug!(
                "[{}] Cycle #{} {} in {:?}",
                self.id(),
                record.sequence,
                record.verdict,
                record.cycle_time
            );
        } else {
            warn!(
                "[{}] Cycle #{} {}: no acknowledgement within {:?}, continuing",
                self.id(),
                record.sequence,
                record.verdict,
                self.ctx.config.ack_timeout
            );
        }

        self.publish();
        self.ctx.hooks.trigger_all(&record);
        Step::WaitSensor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::CycleHook;
    use crate::io_channel::IoChannelConfig;
    use crossbeam_channel::unbounded;
    use inspect_io::{AckMode, MockIoDriver, MockIoHandle};

    fn context(camera: Arc<dyn CameraBackend>) -> (WorkerContext, MockIoHandle) {
        let driver = MockIoDriver::new();
        let handle = driver.handle();
        let io = IoChannel::new(
            Box::new(driver),
            IoChannelConfig {
                settle_delay: Duration::ZERO,
                lock_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        )
        .unwrap();
        let ctx = WorkerContext {
            io,
            camera,
            inspection: None,
            hooks: Arc::new(HookManager::new()),
            config: WorkerConfig {
                poll_interval: Duration::from_millis(1),
                capture_timeout: Duration::from_millis(20),
                ack_timeout: Duration::from_millis(20),
                io_fault_backoff: Duration::from_millis(1),
                max_consecutive_io_faults: 3,
            },
        };
        (ctx, handle)
    }

    fn ok_camera() -> Arc<dyn CameraBackend> {
        Arc::new(|_: &CaptureRequest<'_>| Ok::<_, CaptureError>(Frame::empty()))
    }

    /// 在当前线程跑 worker，直到 `done` 返回 true 后请求停止
    fn run_until(
        worker: StationWorker,
        shared: &Arc<StationShared>,
        done: impl Fn(&StationRuntimeState) -> bool,
    ) -> StationRuntimeState {
        let (tx, rx) = unbounded();
        let id = shared.station_id.clone();
        let thread = std::thread::spawn(move || {
            let _notify = ExitNotifier { station_id: id, tx };
            worker.run();
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(&shared.snapshot()) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        shared.request_stop();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        thread.join().unwrap();
        shared.snapshot()
    }

    #[test]
    fn test_rising_edge_cycle() {
        let (ctx, handle) = context(ok_camera());
        let station = StationConfig::new("Top", 0, 0);
        handle.script_input(0, [false, false, true, true, false]);

        let shared = Arc::new(StationShared::new(&station));
        let worker = StationWorker::new(station, ctx, shared.clone());
        let state = run_until(worker, &shared, |s| s.counters.cycles_completed >= 1);

        assert_eq!(state.counters.cycles_completed, 1);
        assert_eq!(state.counters.cycles_passed, 1);
        assert_eq!(state.current_state, StationState::Stopped);
        assert_eq!(handle.pulses_on(0).len(), 1);
        assert_eq!(handle.ack_waits(), 1);
        assert!(state.last_result.unwrap().acknowledged);
    }

    #[test]
    fn test_initially_high_sensor_is_baseline() {
        let (ctx, handle) = context(ok_camera());
        let station = StationConfig::new("Top", 0, 0);
        handle.script_input(0, [true, true, true]);

        let shared = Arc::new(StationShared::new(&station));
        let worker = StationWorker::new(station, ctx, shared.clone());
        let state = run_until(worker, &shared, |_| handle.pending_script(0) == 0);

        assert_eq!(state.counters.cycles_completed, 0);
        assert!(handle.pulses().is_empty());
    }

    #[test]
    fn test_software_trigger_skips_pulse() {
        let camera: Arc<dyn CameraBackend> = Arc::new(|request: &CaptureRequest<'_>| {
            assert!(request.software_trigger);
            Ok::<_, CaptureError>(Frame::empty())
        });
        let (ctx, handle) = context(camera);
        let station = StationConfig::new("Feed", 2, 2).with_hardware_trigger(false);
        handle.script_input(2, [false, true]);

        let shared = Arc::new(StationShared::new(&station));
        let worker = StationWorker::new(station, ctx, shared.clone());
        let state = run_until(worker, &shared, |s| s.counters.cycles_completed >= 1);

        assert_eq!(state.counters.cycles_completed, 1);
        assert!(handle.pulses().is_empty());
    }

    #[test]
    fn test_trigger_fault_skips_report() {
        let (ctx, handle) = context(ok_camera());
        let station = StationConfig::new("Top", 0, 0);
        handle.inject_write_faults(1);
        handle.script_input(0, [false, true]);

        let shared = Arc::new(StationShared::new(&station));
        let worker = StationWorker::new(station, ctx, shared.clone());
        let state = run_until(worker, &shared, |s| s.counters.cycles_errored >= 1);

        assert_eq!(state.counters.cycles_errored, 1);
        assert_eq!(state.counters.cycles_completed, 0);
        assert_eq!(handle.ack_waits(), 0);
        assert!(!state.faulted);
    }

    #[test]
    fn test_ack_timeout_counted() {
        let (ctx, handle) = context(ok_camera());
        handle.set_ack_mode(AckMode::Never);
        let station = StationConfig::new("Top", 0, 0);
        handle.script_input(0, [false, true]);

        let shared = Arc::new(StationShared::new(&station));
        let worker = StationWorker::new(station, ctx, shared.clone());
        let state = run_until(worker, &shared, |s| s.counters.cycles_completed >= 1);

        assert_eq!(state.counters.ack_timeouts, 1);
        assert!(!state.last_result.unwrap().acknowledged);
        assert_eq!(handle.last_port_value(), Some(0));
    }

    #[test]
    fn test_fatal_io_fault_enters_faulted() {
        let (ctx, handle) = context(ok_camera());
        handle.set_disconnected(true);
        let station = StationConfig::new("Top", 0, 0);

        let shared = Arc::new(StationShared::new(&station));
        let worker = StationWorker::new(station, ctx, shared.clone());
        // 不请求停止，线程应自行退出
        worker.run();

        let state = shared.snapshot();
        assert!(state.faulted);
        assert_eq!(state.current_state, StationState::Faulted);
        assert_eq!(state.counters.io_faults, 1);
    }

    #[test]
    fn test_consecutive_faults_escalate() {
        let (ctx, handle) = context(ok_camera());
        handle.inject_read_faults(10);
        let station = StationConfig::new("Top", 0, 0);

        let shared = Arc::new(StationShared::new(&station));
        let worker = StationWorker::new(station, ctx, shared.clone());
        worker.run();

        let state = shared.snapshot();
        assert!(state.faulted);
        assert_eq!(state.counters.io_faults, 3);
    }

    /// 在钩子内读取已发布的状态
    struct SnapshotHook {
        shared: Arc<StationShared>,
        seen: parking_lot::Mutex<Vec<(u64, u64)>>,
    }

    impl CycleHook for SnapshotHook {
        fn on_cycle_complete(&self, record: &CycleRecord) {
            let published = self.shared.snapshot().counters.cycles_completed;
            self.seen.lock().push((record.sequence, published));
        }
    }

    #[test]
    fn test_counters_published_before_hooks() {
        let (mut ctx, handle) = context(ok_camera());
        let station = StationConfig::new("Top", 0, 0);
        handle.script_input(0, [false, true, false, true]);

        let shared = Arc::new(StationShared::new(&station));
        let hook = Arc::new(SnapshotHook {
            shared: shared.clone(),
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let mut hooks = HookManager::new();
        hooks.add_hook(hook.clone());
        ctx.hooks = Arc::new(hooks);

        let worker = StationWorker::new(station, ctx, shared.clone());
        let state = run_until(worker, &shared, |s| s.counters.cycles_completed >= 2);

        assert_eq!(state.counters.cycles_completed, 2);
        assert_eq!(*hook.seen.lock(), vec![(1, 1), (2, 2)]);
    }

    #[test]
    fn test_bus_busy_is_not_an_io_fault() {
        let (mut ctx, handle) = context(ok_camera());
        // 任何一次计入的 I/O 故障都会直接进入 Faulted
        ctx.config.max_consecutive_io_faults = 1;
        let io = ctx.io.clone();
        let station = StationConfig::new("Top", 0, 0);
        handle.script_input(0, [false, true]);

        // 另一方持有总线超过 lock_timeout
        let (held_tx, held_rx) = unbounded();
        let holder_io = io.clone();
        let holder = std::thread::spawn(move || {
            let _handshake = holder_io.begin_handshake().unwrap();
            held_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(250));
        });
        held_rx.recv().unwrap();

        let shared = Arc::new(StationShared::new(&station));
        let worker = StationWorker::new(station, ctx, shared.clone());
        let state = run_until(worker, &shared, |s| s.counters.cycles_completed >= 1);
        holder.join().unwrap();

        assert!(io.get_metrics().lock_timeouts >= 1);
        assert_eq!(state.counters.io_faults, 0);
        assert_eq!(state.counters.cycles_completed, 1);
        assert!(!state.faulted);
    }

    #[test]
    fn test_stop_before_start() {
        let (ctx, _handle) = context(ok_camera());
        let station = StationConfig::new("Top", 0, 0);
        let shared = Arc::new(StationShared::new(&station));
        shared.request_stop();

        StationWorker::new(station, ctx, shared.clone()).run();
        let state = shared.snapshot();
        assert_eq!(state.current_state, StationState::Stopped);
        assert!(state.stop_requested);
    }
}
