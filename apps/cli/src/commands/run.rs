//! run 命令
//!
//! 用 Mock I/O 驱动、合成相机和随机检测仿真运行整条产线，
//! 周期性打印统计，Ctrl-C 或到达时长后有界停止。

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use inspect_driver::{
    AsyncCycleRecorder, ControllerBuilder, CycleOutcome, CycleRecord, IoChannelConfig, StationId,
    StationRuntimeState, WorkerConfig,
};
use inspect_io::{AckMode, MockIoDriver};
use inspect_tools::{FleetReport, StationFile, StationSummary};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::simulation::{FeederConfig, PartFeeder, random_inspection, synthetic_camera};

/// 仿真运行参数
#[derive(Args, Debug)]
pub struct RunCommand {
    /// 工位布局文件（不指定时使用默认 7 工位布局）
    #[arg(short, long)]
    pub stations: Option<PathBuf>,

    /// 运行时长（秒），0 表示直到 Ctrl-C
    #[arg(short, long, default_value_t = 0)]
    pub duration: u64,

    /// 平均来料间隔（毫秒）
    #[arg(long, default_value_t = 500)]
    pub part_interval_ms: u64,

    /// 不良率（0.0 - 1.0）
    #[arg(long, default_value_t = 0.05)]
    pub fail_rate: f64,

    /// 采集失败率（0.0 - 1.0）
    #[arg(long, default_value_t = 0.0)]
    pub capture_fail_rate: f64,

    /// 下游应答延迟（毫秒）
    #[arg(long)]
    pub ack_delay_ms: Option<u64>,

    /// 模拟下游从不应答
    #[arg(long, conflicts_with = "ack_delay_ms")]
    pub no_ack: bool,

    /// 应答超时（毫秒）
    #[arg(long, default_value_t = 5000)]
    pub ack_timeout_ms: u64,

    /// 统计打印间隔（秒），0 表示只在结束时打印
    #[arg(long, default_value_t = 2)]
    pub report_interval: u64,

    /// 停止宽限期（毫秒）
    #[arg(long, default_value_t = 2000)]
    pub stop_timeout_ms: u64,

    /// 以 JSON 输出最终报表
    #[arg(long)]
    pub json: bool,
}

/// 周期记录汇总（由记录消费线程统计）
#[derive(Debug, Default, Clone)]
pub struct CycleTally {
    pub records: u64,
    pub inspection_faults: u64,
    pub capture_failures: u64,
    pub unacknowledged: u64,
    pub max_cycle_time: Duration,
}

impl CycleTally {
    fn add(&mut self, record: &CycleRecord) {
        self.records += 1;
        match record.outcome {
            CycleOutcome::Inspected => {},
            CycleOutcome::InspectionFault => self.inspection_faults += 1,
            CycleOutcome::CaptureFailed => self.capture_failures += 1,
        }
        if !record.acknowledged {
            self.unacknowledged += 1;
        }
        self.max_cycle_time = self.max_cycle_time.max(record.cycle_time);
    }
}

impl RunCommand {
    /// 执行仿真
    pub fn execute(&self) -> Result<()> {
        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        ctrlc::set_handler(move || {
            r.store(false, Ordering::SeqCst);
        })
        .context("Failed to install Ctrl-C handler")?;

        println!("💡 Press Ctrl-C to stop the line");

        let report = self.run_simulation(&running)?;

        if self.json {
            println!("{}", report.to_json()?);
        } else {
            println!();
            println!("📊 Final statistics:");
            print!("{}", report.render_table());
        }

        let faulted: Vec<&str> = report
            .faulted_stations()
            .map(|s| s.station_id.as_str())
            .collect();
        if !faulted.is_empty() {
            bail!("Stations faulted during the run: {}", faulted.join(", "));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("--fail-rate", self.fail_rate),
            ("--capture-fail-rate", self.capture_fail_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                bail!("{} must be between 0.0 and 1.0, got {}", name, rate);
            }
        }
        if self.part_interval_ms == 0 {
            bail!("--part-interval-ms must be greater than 0");
        }
        Ok(())
    }

    fn ack_mode(&self) -> AckMode {
        if self.no_ack {
            return AckMode::Never;
        }
        match self.ack_delay_ms {
            Some(ms) => AckMode::After(Duration::from_millis(ms)),
            None => AckMode::Immediate,
        }
    }

    fn load_stations(&self) -> Result<StationFile> {
        match &self.stations {
            Some(path) => StationFile::load(path)
                .with_context(|| format!("Failed to load station file {}", path.display())),
            None => Ok(StationFile::default()),
        }
    }

    /// 运行仿真直到 `running` 被清除或到达时长，返回最终报表
    pub fn run_simulation(&self, running: &AtomicBool) -> Result<FleetReport> {
        self.validate()?;
        let file = self.load_stations()?;

        let driver = MockIoDriver::new();
        let io = driver.handle();
        io.set_ack_mode(self.ack_mode());

        let (recorder, records) = AsyncCycleRecorder::new();
        let dropped = recorder.dropped_records().clone();

        let mut controller = ControllerBuilder::new()
            .io_driver(driver)
            .io_config(IoChannelConfig {
                ack_line: file.ack_line,
                ..Default::default()
            })
            .camera(synthetic_camera(self.capture_fail_rate))
            .inspection(random_inspection(self.fail_rate))
            .worker_config(WorkerConfig {
                ack_timeout: Duration::from_millis(self.ack_timeout_ms),
                ..Default::default()
            })
            .stations(file.stations.iter().cloned())
            .hook(Arc::new(recorder))
            .build()
            .context("Failed to build production controller")?;

        let consumer_done = Arc::new(AtomicBool::new(false));
        let consumer = spawn_record_consumer(records, consumer_done.clone())?;

        controller
            .start()
            .context("Failed to start production line")?;

        let sensor_lines = file.enabled_stations().map(|s| s.sensor_line).collect();
        let feeder = PartFeeder::spawn(
            io,
            sensor_lines,
            FeederConfig {
                part_interval: Duration::from_millis(self.part_interval_ms),
                ..Default::default()
            },
        )
        .context("Failed to spawn part feeder")?;

        info!(
            "Production line running with {} stations",
            file.enabled_stations().count()
        );

        let started = Instant::now();
        let run_for = (self.duration > 0).then(|| Duration::from_secs(self.duration));
        let report_every =
            (self.report_interval > 0).then(|| Duration::from_secs(self.report_interval));
        let mut last_report = Instant::now();
        let mut unhealthy_logged = false;

        while running.load(Ordering::SeqCst) {
            if run_for.is_some_and(|d| started.elapsed() >= d) {
                break;
            }
            if !unhealthy_logged && !controller.is_healthy() {
                warn!("One or more stations faulted; remaining stations keep running");
                unhealthy_logged = true;
            }
            if report_every.is_some_and(|d| last_report.elapsed() >= d) {
                let report = fleet_report(&controller.get_statistics(), started.elapsed());
                println!();
                print!("{}", report.render_table());
                last_report = Instant::now();
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        let parts_fed = feeder.parts_fed();
        feeder.stop();

        info!("Stopping production line");
        let stop_report = controller
            .stop(Duration::from_millis(self.stop_timeout_ms))
            .context("Failed to stop production line")?;
        for timeout in &stop_report.timed_out {
            warn!("{}", timeout);
        }
        for station_id in &stop_report.panicked {
            warn!("[{}] Worker thread panicked", station_id);
        }

        let elapsed = started.elapsed();
        let report = fleet_report(&controller.get_statistics(), elapsed);
        let metrics = controller.get_io_metrics();
        drop(controller);

        consumer_done.store(true, Ordering::Release);
        let tally = consumer
            .join()
            .map_err(|_| anyhow!("Cycle record consumer panicked"))?;

        info!(
            "Fed {} parts, recorded {} cycles ({} dropped), {} capture failures, {} inspection faults, {} unacknowledged, slowest cycle {:?}",
            parts_fed,
            tally.records,
            dropped.load(Ordering::Relaxed),
            tally.capture_failures,
            tally.inspection_faults,
            tally.unacknowledged,
            tally.max_cycle_time
        );
        info!(
            "I/O: {} transactions, {} pulses, {} results, {} ack timeouts, {} lock timeouts, max lock wait {}us",
            metrics.transactions_total,
            metrics.pulses_total,
            metrics.results_sent,
            metrics.ack_timeouts,
            metrics.lock_timeouts,
            metrics.max_lock_wait_us
        );

        Ok(report)
    }
}

/// 记录消费线程：统计周期记录，直到通道关闭或 `done` 置位且队列已空
fn spawn_record_consumer(
    records: Receiver<CycleRecord>,
    done: Arc<AtomicBool>,
) -> Result<JoinHandle<CycleTally>> {
    std::thread::Builder::new()
        .name("cycle-records".to_string())
        .spawn(move || {
            let mut tally = CycleTally::default();
            loop {
                match records.recv_timeout(Duration::from_millis(100)) {
                    Ok(record) => {
                        debug!(
                            "[{}] cycle #{} {} ({:?}, ack={}, {:?})",
                            record.station_id,
                            record.sequence,
                            record.verdict,
                            record.outcome,
                            record.acknowledged,
                            record.cycle_time
                        );
                        tally.add(&record);
                    },
                    Err(RecvTimeoutError::Timeout) => {
                        if done.load(Ordering::Acquire) {
                            break;
                        }
                    },
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            tally
        })
        .context("Failed to spawn cycle record consumer")
}

/// 控制器快照转换为报表
pub fn fleet_report(
    states: &BTreeMap<StationId, StationRuntimeState>,
    elapsed: Duration,
) -> FleetReport {
    let stations = states
        .values()
        .map(|state| StationSummary {
            station_id: state.station_id.to_string(),
            display_name: state.display_name.clone(),
            state: format!("{:?}", state.current_state),
            cycles_completed: state.counters.cycles_completed,
            cycles_passed: state.counters.cycles_passed,
            cycles_failed: state.counters.cycles_failed,
            cycles_errored: state.counters.cycles_errored,
            ack_timeouts: state.counters.ack_timeouts,
            faulted: state.faulted,
        })
        .collect();
    FleetReport::new(stations, elapsed)
}
