//! I/O 总线指标
//!
//! 所有计数器都使用原子操作，可以在任何线程读取，不会与工作线程争用总线锁。

use std::sync::atomic::{AtomicU64, Ordering};

/// 共享 I/O 通道的实时指标
#[derive(Debug, Default)]
pub struct IoMetrics {
    /// 成功获取总线锁的事务数
    pub transactions_total: AtomicU64,

    /// 获取总线锁超时次数
    ///
    /// 持续增长说明有事务占用总线过久（通常是应答等待过长）。
    pub lock_timeouts: AtomicU64,

    /// 设备返回的错误数
    pub device_errors: AtomicU64,

    /// 已完成的触发脉冲数
    pub pulses_total: AtomicU64,

    /// 已发送的结果数
    pub results_sent: AtomicU64,

    /// 应答超时次数
    pub ack_timeouts: AtomicU64,

    /// 最长的锁等待时间（微秒）
    pub max_lock_wait_us: AtomicU64,
}

impl IoMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_lock_wait(&self, wait_us: u64) {
        self.transactions_total.fetch_add(1, Ordering::Relaxed);
        self.max_lock_wait_us.fetch_max(wait_us, Ordering::Relaxed);
    }

    /// 获取指标快照
    ///
    /// 各计数器分别原子读取，彼此之间可能有微小的时间差。
    pub fn snapshot(&self) -> IoMetricsSnapshot {
        IoMetricsSnapshot {
            transactions_total: self.transactions_total.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
            pulses_total: self.pulses_total.load(Ordering::Relaxed),
            results_sent: self.results_sent.load(Ordering::Relaxed),
            ack_timeouts: self.ack_timeouts.load(Ordering::Relaxed),
            max_lock_wait_us: self.max_lock_wait_us.load(Ordering::Relaxed),
        }
    }

    /// 重置所有计数器
    pub fn reset(&self) {
        self.transactions_total.store(0, Ordering::Relaxed);
        self.lock_timeouts.store(0, Ordering::Relaxed);
        self.device_errors.store(0, Ordering::Relaxed);
        self.pulses_total.store(0, Ordering::Relaxed);
        self.results_sent.store(0, Ordering::Relaxed);
        self.ack_timeouts.store(0, Ordering::Relaxed);
        self.max_lock_wait_us.store(0, Ordering::Relaxed);
    }
}

/// 指标快照（不可变）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoMetricsSnapshot {
    pub transactions_total: u64,
    pub lock_timeouts: u64,
    pub device_errors: u64,
    pub pulses_total: u64,
    pub results_sent: u64,
    pub ack_timeouts: u64,
    pub max_lock_wait_us: u64,
}

impl IoMetricsSnapshot {
    /// 锁超时占全部锁请求的比例（0-100）
    pub fn lock_timeout_rate(&self) -> f64 {
        let attempts = self.transactions_total + self.lock_timeouts;
        if attempts == 0 {
            return 0.0;
        }
        (self.lock_timeouts as f64 / attempts as f64) * 100.0
    }
}
