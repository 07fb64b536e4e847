//! 共享 I/O 通道
//!
//! 所有工位共用一张 I/O 卡，底层驱动不可重入。`IoChannel` 用一把总线锁串行化所有访问，
//! 并把需要原子完成的多步操作（触发脉冲、结果握手）放在同一次持锁事务内：
//!
//! - **脉冲**：拉高 → 保持 → 拉低，期间其他工位无法访问总线
//! - **结果握手**：写 busy+结果码 → 等待应答 → 稳定延时 → 清 busy（无论是否应答）
//!
//! 获取锁有上限（`lock_timeout`），超时返回 [`IoError::BusBusy`]。这是总线争用而非设备故障，
//! 工位据此跳过本轮或重试，不计入 I/O 故障。

use crate::metrics::{IoMetrics, IoMetricsSnapshot};
use inspect_io::{IoDriver, IoError, check_line};
use inspect_protocol::{DEFAULT_ACK_LINE, ProtocolError, ResultCode, SignalLayout};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// I/O 通道配置（POD）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IoChannelConfig {
    /// 下游应答输入线
    pub ack_line: u8,
    /// 结果端口位布局
    pub signal_layout: SignalLayout,
    /// 获取总线锁的最长等待时间
    ///
    /// 应大于最长的单次事务（应答超时 + 稳定延时），否则握手期间其他工位的访问会
    /// 以 [`IoError::BusBusy`] 返回（按争用处理，不算故障）。
    pub lock_timeout: Duration,
    /// 收到应答后、清 busy 前的稳定延时
    pub settle_delay: Duration,
}

impl Default for IoChannelConfig {
    fn default() -> Self {
        Self {
            ack_line: DEFAULT_ACK_LINE,
            signal_layout: SignalLayout::default(),
            lock_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_millis(100),
        }
    }
}

impl IoChannelConfig {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        self.signal_layout.validate()?;
        if check_line(self.ack_line).is_err() {
            return Err(ProtocolError::InvalidLayout(format!(
                "ack line {} out of range",
                self.ack_line
            )));
        }
        Ok(())
    }
}

/// 一次结果握手的结局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// 下游在超时前应答
    Acknowledged,
    /// 等待超时（busy 已清除）
    TimedOut,
}

impl AckOutcome {
    pub fn is_acknowledged(self) -> bool {
        self == Self::Acknowledged
    }
}

/// 串行化的共享 I/O 通道（可克隆，克隆共享同一把锁和驱动）
#[derive(Clone)]
pub struct IoChannel {
    driver: Arc<Mutex<Box<dyn IoDriver>>>,
    config: IoChannelConfig,
    metrics: Arc<IoMetrics>,
}

impl IoChannel {
    /// 接管驱动
    pub fn new(driver: Box<dyn IoDriver>, config: IoChannelConfig) -> Result<Self, ProtocolError> {
        config.validate()?;
        Ok(Self {
            driver: Arc::new(Mutex::new(driver)),
            config,
            metrics: Arc::new(IoMetrics::new()),
        })
    }

    pub fn config(&self) -> &IoChannelConfig {
        &self.config
    }

    pub fn get_metrics(&self) -> IoMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn acquire(&self) -> Result<MutexGuard<'_, Box<dyn IoDriver>>, IoError> {
        let start = Instant::now();
        match self.driver.try_lock_for(self.config.lock_timeout) {
            Some(guard) => {
                self.metrics.record_lock_wait(start.elapsed().as_micros() as u64);
                Ok(guard)
            },
            None => {
                self.metrics.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                Err(IoError::BusBusy(self.config.lock_timeout))
            },
        }
    }

    fn track<T>(&self, result: Result<T, IoError>) -> Result<T, IoError> {
        if result.is_err() {
            self.metrics.device_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// 读取一条输入线
    pub fn read_input(&self, line: u8) -> Result<bool, IoError> {
        let mut driver = self.acquire()?;
        self.track(driver.read_line(line))
    }

    /// 在输出线上发出一个脉冲（整个脉冲期间持有总线锁）
    ///
    /// 拉高失败时仍尝试拉低，保证输出线不会停留在有效电平。
    pub fn pulse_output(&self, line: u8, width: Duration) -> Result<(), IoError> {
        check_line(line)?;
        let mut driver = self.acquire()?;

        if let Err(e) = self.track(driver.write_line(line, true)) {
            if let Err(cleanup) = self.track(driver.write_line(line, false)) {
                warn!(
                    "Failed to deassert line {} after assert failure: {}",
                    line, cleanup
                );
            }
            return Err(e);
        }
        spin_sleep::sleep(width);

        // 拉低失败重试一次
        if let Err(e) = self.track(driver.write_line(line, false)) {
            warn!("Failed to deassert line {}: {}, retrying", line, e);
            self.track(driver.write_line(line, false))?;
        }

        self.metrics.pulses_total.fetch_add(1, Ordering::Relaxed);
        trace!("Pulsed line {} for {:?}", line, width);
        Ok(())
    }

    /// 开始一次结果握手（持有总线锁直到握手结束）
    pub fn begin_handshake(&self) -> Result<ResultHandshake<'_>, IoError> {
        let driver = self.acquire()?;
        Ok(ResultHandshake {
            channel: self,
            driver,
            code: ResultCode::Pass,
            busy: false,
        })
    }

    /// 发送结果并等待下游应答（单次持锁事务）
    ///
    /// 无论应答与否，返回前都会清除 busy；只有在写端口本身失败时才返回错误。
    pub fn send_result_and_await_ack(
        &self,
        code: ResultCode,
        timeout: Duration,
    ) -> Result<AckOutcome, IoError> {
        let mut handshake = self.begin_handshake()?;
        handshake.write_result(code)?;
        let outcome = handshake.await_ack(timeout)?;
        handshake.finish()?;
        Ok(outcome)
    }

    /// 清除 busy 位并把结果码归零
    pub fn clear_busy(&self) -> Result<(), IoError> {
        let value = self.config.signal_layout.encode(false, ResultCode::Pass);
        let mut driver = self.acquire()?;
        self.track(driver.write_port(value))
    }
}

/// 进行中的结果握手
///
/// 持有总线锁；busy 一旦置位，即使调用方中途返回错误，Drop 时也会尽力清除。
pub struct ResultHandshake<'a> {
    channel: &'a IoChannel,
    driver: MutexGuard<'a, Box<dyn IoDriver>>,
    code: ResultCode,
    busy: bool,
}

impl ResultHandshake<'_> {
    /// 写结果码并置 busy
    pub fn write_result(&mut self, code: ResultCode) -> Result<(), IoError> {
        let layout = self.channel.config.signal_layout;
        self.code = code;
        self.busy = true;
        self.channel
            .track(self.driver.write_port(layout.encode(true, code)))?;
        self.channel
            .metrics
            .results_sent
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 等待应答；应答后保持结果稳定 `settle_delay`
    pub fn await_ack(&mut self, timeout: Duration) -> Result<AckOutcome, IoError> {
        let config = self.channel.config;
        let acked = self
            .channel
            .track(self.driver.wait_for_line(config.ack_line, timeout))?;
        if acked {
            if !config.settle_delay.is_zero() {
                std::thread::sleep(config.settle_delay);
            }
            Ok(AckOutcome::Acknowledged)
        } else {
            self.channel
                .metrics
                .ack_timeouts
                .fetch_add(1, Ordering::Relaxed);
            Ok(AckOutcome::TimedOut)
        }
    }

    /// 清除 busy 并释放总线
    pub fn finish(mut self) -> Result<(), IoError> {
        self.clear()
    }

    fn clear(&mut self) -> Result<(), IoError> {
        if !self.busy {
            return Ok(());
        }
        let value = self.channel.config.signal_layout.encode(false, self.code);
        self.busy = false;
        self.channel.track(self.driver.write_port(value))
    }
}

impl Drop for ResultHandshake<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.clear() {
            warn!("Failed to clear busy after aborted handshake: {}", e);
        }
    }
}

impl std::fmt::Debug for IoChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoChannel")
            .field("config", &self.config)
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inspect_io::{AckMode, MockIoDriver};

    fn channel(config: IoChannelConfig) -> (IoChannel, inspect_io::MockIoHandle) {
        let driver = MockIoDriver::new();
        let handle = driver.handle();
        (IoChannel::new(Box::new(driver), config).unwrap(), handle)
    }

    fn fast_config() -> IoChannelConfig {
        IoChannelConfig {
            settle_delay: Duration::ZERO,
            lock_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = IoChannelConfig {
            ack_line: 9,
            ..Default::default()
        };
        assert!(IoChannel::new(Box::new(MockIoDriver::new()), config).is_err());
    }

    #[test]
    fn test_pulse_width_and_deassert() {
        let (io, handle) = channel(fast_config());
        io.pulse_output(2, Duration::from_millis(10)).unwrap();

        let pulses = handle.pulses_on(2);
        assert_eq!(pulses.len(), 1);
        assert!(pulses[0].duration >= Duration::from_millis(10));
        assert!(!handle.output_level(2));
        assert_eq!(io.get_metrics().pulses_total, 1);
    }

    #[test]
    fn test_pulse_assert_failure_leaves_line_low() {
        let (io, handle) = channel(fast_config());
        handle.inject_write_faults(1);
        assert!(io.pulse_output(1, Duration::from_millis(1)).is_err());
        assert!(!handle.output_level(1));
        assert_eq!(io.get_metrics().device_errors, 1);
    }

    #[test]
    fn test_pulse_cleanup_failure_is_counted() {
        let (io, handle) = channel(fast_config());
        // 拉高失败，随后的清理拉低也失败
        handle.inject_write_faults(2);
        assert!(io.pulse_output(1, Duration::from_millis(1)).is_err());
        assert!(!handle.output_level(1));
        assert_eq!(io.get_metrics().device_errors, 2);
        assert_eq!(io.get_metrics().pulses_total, 0);
    }

    #[test]
    fn test_handshake_acknowledged() {
        let (io, handle) = channel(fast_config());
        let outcome = io
            .send_result_and_await_ack(ResultCode::FailGeneral, Duration::from_millis(50))
            .unwrap();
        assert_eq!(outcome, AckOutcome::Acknowledged);
        // busy+FAIL，然后清 busy
        assert_eq!(handle.port_writes(), vec![0b1000_0111, 0b0000_0111]);
    }

    #[test]
    fn test_handshake_timeout_still_clears_busy() {
        let (io, handle) = channel(fast_config());
        handle.set_ack_mode(AckMode::Never);

        let outcome = io
            .send_result_and_await_ack(ResultCode::Pass, Duration::from_millis(10))
            .unwrap();
        assert_eq!(outcome, AckOutcome::TimedOut);

        let (busy, _) = SignalLayout::default().decode(handle.last_port_value().unwrap());
        assert!(!busy);
        assert_eq!(io.get_metrics().ack_timeouts, 1);
    }

    #[test]
    fn test_bus_busy_when_lock_held() {
        let (io, handle) = channel(IoChannelConfig {
            lock_timeout: Duration::from_millis(5),
            ..fast_config()
        });
        handle.set_ack_mode(AckMode::Never);

        let holder = io.clone();
        let t = std::thread::spawn(move || {
            holder.send_result_and_await_ack(ResultCode::Pass, Duration::from_millis(100))
        });
        std::thread::sleep(Duration::from_millis(20));

        assert!(matches!(io.read_input(0), Err(IoError::BusBusy(_))));
        assert!(t.join().unwrap().is_ok());
        assert_eq!(io.get_metrics().lock_timeouts, 1);
    }

    #[test]
    fn test_aborted_handshake_clears_busy() {
        let (io, handle) = channel(fast_config());
        {
            let mut handshake = io.begin_handshake().unwrap();
            handshake.write_result(ResultCode::FailType3).unwrap();
            assert_eq!(handle.last_port_value(), Some(0b1000_0011));
        }
        assert_eq!(handle.last_port_value(), Some(0b0000_0011));
        // 锁已释放
        assert!(io.read_input(0).is_ok());
    }

    #[test]
    fn test_clear_busy() {
        let (io, handle) = channel(fast_config());
        io.clear_busy().unwrap();
        assert_eq!(handle.last_port_value(), Some(0));
    }
}
