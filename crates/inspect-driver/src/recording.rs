//! 异步周期记录
//!
//! 工位线程只做一次 `try_send`，记录的落盘/上报由接收端线程完成。
//! 队列满时丢弃记录并计数，不阻塞检测节拍。

use crate::hooks::{CycleHook, CycleRecord};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// 默认队列容量
pub const DEFAULT_RECORDER_CAPACITY: usize = 4096;

/// 异步周期记录钩子
pub struct AsyncCycleRecorder {
    tx: Sender<CycleRecord>,
    dropped_records: Arc<AtomicU64>,
    record_counter: Arc<AtomicU64>,
}

impl AsyncCycleRecorder {
    #[must_use]
    pub fn new() -> (Self, Receiver<CycleRecord>) {
        Self::with_capacity(DEFAULT_RECORDER_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> (Self, Receiver<CycleRecord>) {
        let (tx, rx) = bounded(capacity);
        let recorder = Self {
            tx,
            dropped_records: Arc::new(AtomicU64::new(0)),
            record_counter: Arc::new(AtomicU64::new(0)),
        };
        (recorder, rx)
    }

    /// 丢弃计数器（可在钩子移交给控制器之前克隆出来）
    #[must_use]
    pub fn dropped_records(&self) -> &Arc<AtomicU64> {
        &self.dropped_records
    }

    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped_records.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn record_counter(&self) -> &Arc<AtomicU64> {
        &self.record_counter
    }

    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.record_counter.load(Ordering::Relaxed)
    }
}

impl CycleHook for AsyncCycleRecorder {
    #[inline]
    fn on_cycle_complete(&self, record: &CycleRecord) {
        if self.tx.try_send(record.clone()).is_err() {
            self.dropped_records.fetch_add(1, Ordering::Relaxed);
        } else {
            self.record_counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}
