//! 仿真组件
//!
//! - 合成相机：按概率失败，否则返回随机像素帧
//! - 随机检测：按不良率判 FAIL，随机选择细分结果码
//! - 来料模拟：周期性拉高各工位的位置传感器输入线

use inspect_driver::{
    CameraBackend, CaptureError, CaptureRequest, Frame, InspectionCallback, ResultCode, StationId,
    Verdict,
};
use inspect_io::MockIoHandle;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// 合成帧尺寸
const FRAME_WIDTH: u32 = 64;
const FRAME_HEIGHT: u32 = 48;

/// 合成相机
pub fn synthetic_camera(capture_fail_rate: f64) -> impl CameraBackend + 'static {
    move |request: &CaptureRequest<'_>| {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(capture_fail_rate) {
            return Err(CaptureError::Backend(format!(
                "simulated capture failure on {}",
                request.station_id
            )));
        }
        let data: Vec<u8> = (0..FRAME_WIDTH * FRAME_HEIGHT).map(|_| rng.r#gen()).collect();
        Ok(Frame::new(FRAME_WIDTH, FRAME_HEIGHT, data))
    }
}

/// 随机检测
pub fn random_inspection(fail_rate: f64) -> impl InspectionCallback + 'static {
    move |_: &StationId, frame: &Frame| -> Verdict {
        if frame.is_empty() {
            return Verdict::FAIL;
        }
        let mut rng = rand::thread_rng();
        if !rng.gen_bool(fail_rate) {
            return Verdict::Pass;
        }
        Verdict::Fail(ResultCode::from_bits(rng.gen_range(1..=7)))
    }
}

/// 来料模拟参数
#[derive(Debug, Clone, Copy)]
pub struct FeederConfig {
    /// 平均来料间隔（实际间隔在 0.5x ~ 1.5x 之间抖动）
    pub part_interval: Duration,
    /// 传感器保持高电平的时长
    pub sensor_hold: Duration,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            part_interval: Duration::from_millis(500),
            sensor_hold: Duration::from_millis(20),
        }
    }
}

struct LineFeed {
    line: u8,
    next_at: Instant,
    high_until: Option<Instant>,
}

/// 来料模拟线程
pub struct PartFeeder {
    stop: Arc<AtomicBool>,
    parts_fed: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl PartFeeder {
    pub fn spawn(
        io: MockIoHandle,
        sensor_lines: Vec<u8>,
        config: FeederConfig,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let parts_fed = Arc::new(AtomicU64::new(0));

        let thread_stop = stop.clone();
        let thread_fed = parts_fed.clone();
        let thread = std::thread::Builder::new()
            .name("part-feeder".to_string())
            .spawn(move || feed_loop(io, sensor_lines, config, &thread_stop, &thread_fed))?;

        Ok(Self {
            stop,
            parts_fed,
            thread: Some(thread),
        })
    }

    pub fn parts_fed(&self) -> u64 {
        self.parts_fed.load(Ordering::Relaxed)
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PartFeeder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn jittered(interval: Duration, rng: &mut impl Rng) -> Duration {
    interval.mul_f64(rng.gen_range(0.5..1.5))
}

fn feed_loop(
    io: MockIoHandle,
    sensor_lines: Vec<u8>,
    config: FeederConfig,
    stop: &AtomicBool,
    parts_fed: &AtomicU64,
) {
    let mut rng = rand::thread_rng();
    let start = Instant::now();
    let mut feeds: Vec<LineFeed> = sensor_lines
        .into_iter()
        .map(|line| LineFeed {
            line,
            next_at: start + jittered(config.part_interval, &mut rng),
            high_until: None,
        })
        .collect();

    while !stop.load(Ordering::Acquire) {
        let now = Instant::now();
        for feed in &mut feeds {
            match feed.high_until {
                Some(until) if now >= until => {
                    io.set_input(feed.line, false);
                    feed.high_until = None;
                    feed.next_at = now + jittered(config.part_interval, &mut rng);
                },
                Some(_) => {},
                None if now >= feed.next_at => {
                    trace!("Part arrived at sensor line {}", feed.line);
                    io.set_input(feed.line, true);
                    feed.high_until = Some(now + config.sensor_hold);
                    parts_fed.fetch_add(1, Ordering::Relaxed);
                },
                None => {},
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    for feed in &feeds {
        io.set_input(feed.line, false);
    }
    debug!("Part feeder stopped");
}
