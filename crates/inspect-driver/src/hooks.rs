//! 周期钩子
//!
//! 每个工位在一个检测周期结束（结果已发出）后，在工位线程上依次触发已注册的钩子。
//! 钩子运行在检测节拍的关键路径上，实现必须非阻塞：
//! 需要落盘或上报的数据应通过 channel 转交给其他线程（参见 [`crate::recording`]）。
//! 钩子 panic 会被捕获并记录，不影响工位线程与后续钩子。
//!
//! ```rust
//! use inspect_driver::hooks::{CycleHook, HookManager};
//! use inspect_driver::recording::AsyncCycleRecorder;
//! use std::sync::Arc;
//!
//! let mut hooks = HookManager::new();
//! let (recorder, _rx) = AsyncCycleRecorder::new();
//! hooks.add_hook(Arc::new(recorder));
//! assert_eq!(hooks.len(), 1);
//! ```

use crate::inspection::{Verdict, panic_message};
use inspect_protocol::StationId;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::warn;

/// 一个周期的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// 检测回调给出判定
    Inspected,
    /// 检测回调出错或 panic，按 FAIL 处理
    InspectionFault,
    /// 采集失败，按 FAIL 处理
    CaptureFailed,
}

/// 周期记录
#[derive(Debug, Clone, PartialEq)]
pub struct CycleRecord {
    pub station_id: StationId,
    /// 工位自启动以来的周期序号（从 1 开始）
    pub sequence: u64,
    pub verdict: Verdict,
    pub outcome: CycleOutcome,
    pub acknowledged: bool,
    /// 从检测到上升沿到清除 busy 的耗时
    pub cycle_time: Duration,
    pub completed_at: SystemTime,
}

/// 周期钩子
pub trait CycleHook: Send + Sync {
    /// 周期结束（结果已发出、busy 已清除）后调用
    fn on_cycle_complete(&self, record: &CycleRecord);
}

/// 钩子管理器
///
/// 只能在控制器空闲时修改；启动时冻结为 `Arc<HookManager>` 分发给各工位线程。
#[derive(Default, Clone)]
pub struct HookManager {
    hooks: Vec<Arc<dyn CycleHook>>,
}

impl HookManager {
    #[must_use]
    pub const fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add_hook(&mut self, hook: Arc<dyn CycleHook>) {
        self.hooks.push(hook);
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
    }

    /// 依次触发所有钩子
    pub fn trigger_all(&self, record: &CycleRecord) {
        for hook in self.hooks.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| hook.on_cycle_complete(record)));
            if let Err(payload) = result {
                warn!(
                    "[{}] Cycle hook panicked on cycle {}: {}",
                    record.station_id,
                    record.sequence,
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl std::fmt::Debug for HookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookManager").field("hooks", &self.hooks.len()).finish()
    }
}
