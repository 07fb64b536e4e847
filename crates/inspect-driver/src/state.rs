//! 状态定义
//!
//! - [`StationState`]：单个工位状态机的状态
//! - [`ControllerState`]：控制器生命周期
//! - [`StationRuntimeState`]：工位线程发布的只读快照

use crate::inspection::Verdict;
use inspect_protocol::{ResultCode, StationId};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::SystemTime;

/// 工位状态
///
/// ```text
/// Idle ─start→ WaitSensor ─上升沿→ Armed ─→ Capturing ─→ Inspecting ─→ Reporting ─→ Acknowledging ─┐
///                  ↑                                                                             │
///                  └─────────────────────────────────────────────────────────────────────────────┘
/// 任意状态 ─停止请求→ Stopped        持续 I/O 故障 → Faulted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum StationState {
    #[default]
    Idle = 0,
    /// 轮询传感器，等待上升沿
    WaitSensor = 1,
    /// 已检测到工件，准备触发
    Armed = 2,
    Capturing = 3,
    Inspecting = 4,
    /// 写结果码并置 busy
    Reporting = 5,
    /// 等待下游应答
    Acknowledging = 6,
    Stopped = 7,
    /// 持续 I/O 故障，线程已退出
    Faulted = 8,
}

impl StationState {
    /// 从 u8 转换（无效值视为 Idle）
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::WaitSensor,
            2 => Self::Armed,
            3 => Self::Capturing,
            4 => Self::Inspecting,
            5 => Self::Reporting,
            6 => Self::Acknowledging,
            7 => Self::Stopped,
            8 => Self::Faulted,
            _ => Self::Idle,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// 工位线程已退出（或从未启动）
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::Stopped | Self::Faulted)
    }

    /// 处于一个检测周期中间（工件已被检测到，结果尚未发出）
    pub fn in_cycle(self) -> bool {
        matches!(
            self,
            Self::Armed | Self::Capturing | Self::Inspecting | Self::Reporting | Self::Acknowledging
        )
    }
}

/// 控制器生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ControllerState {
    #[default]
    Idle = 0,
    Running = 1,
    Stopping = 2,
}

impl ControllerState {
    /// 从 u8 转换（无效值视为 Idle）
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Idle,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// 控制器状态（原子版本，用于线程间共享）
#[derive(Debug)]
pub struct AtomicControllerState {
    inner: AtomicU8,
}

impl AtomicControllerState {
    pub fn new(state: ControllerState) -> Self {
        Self {
            inner: AtomicU8::new(state.as_u8()),
        }
    }

    pub fn get(&self, ordering: Ordering) -> ControllerState {
        ControllerState::from_u8(self.inner.load(ordering))
    }

    pub fn set(&self, state: ControllerState, ordering: Ordering) {
        self.inner.store(state.as_u8(), ordering);
    }

    /// 比较并交换，成功返回 true
    pub fn compare_exchange(
        &self,
        current: ControllerState,
        new: ControllerState,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        self.inner
            .compare_exchange(current.as_u8(), new.as_u8(), success, failure)
            .is_ok()
    }
}

impl Default for AtomicControllerState {
    fn default() -> Self {
        Self::new(ControllerState::Idle)
    }
}

/// 最近一次发出的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastResult {
    pub verdict: Verdict,
    pub acknowledged: bool,
    pub timestamp: SystemTime,
}

impl LastResult {
    pub fn result_code(&self) -> ResultCode {
        self.verdict.result_code()
    }
}

/// 工位计数器
///
/// - `cycles_completed = cycles_passed + cycles_failed + 采集失败数`
/// - `cycles_errored = 采集失败数 + 触发失败数 + 结果发送失败数`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StationCounters {
    /// 已发出结果的周期数（包括应答超时）
    pub cycles_completed: u64,
    pub cycles_passed: u64,
    /// 判为不合格的周期（含检测故障）
    pub cycles_failed: u64,
    /// 采集/触发/发送环节出错的周期
    pub cycles_errored: u64,
    pub ack_timeouts: u64,
    /// 所有环节的 I/O 错误数
    pub io_faults: u64,
    pub capture_failures: u64,
    pub inspection_faults: u64,
}

impl StationCounters {
    /// 合格率（0-100），无完成周期时为 0
    pub fn pass_rate(&self) -> f64 {
        if self.cycles_completed == 0 {
            return 0.0;
        }
        self.cycles_passed as f64 / self.cycles_completed as f64 * 100.0
    }

    pub(crate) fn accumulate(&mut self, other: &StationCounters) {
        self.cycles_completed += other.cycles_completed;
        self.cycles_passed += other.cycles_passed;
        self.cycles_failed += other.cycles_failed;
        self.cycles_errored += other.cycles_errored;
        self.ack_timeouts += other.ack_timeouts;
        self.io_faults += other.io_faults;
        self.capture_failures += other.capture_failures;
        self.inspection_faults += other.inspection_faults;
    }
}

/// 工位运行时快照
///
/// 由工位线程独占写入，在每次状态切换时整体发布，读者拿到的总是某一时刻的一致视图。
#[derive(Debug, Clone, PartialEq)]
pub struct StationRuntimeState {
    pub station_id: StationId,
    pub display_name: String,
    pub current_state: StationState,
    pub counters: StationCounters,
    pub last_result: Option<LastResult>,
    /// 读取快照时停止标志的值
    pub stop_requested: bool,
    pub faulted: bool,
}

impl StationRuntimeState {
    pub fn new(station_id: StationId, display_name: impl Into<String>) -> Self {
        Self {
            station_id,
            display_name: display_name.into(),
            current_state: StationState::Idle,
            counters: StationCounters::default(),
            last_result: None,
            stop_requested: false,
            faulted: false,
        }
    }

    pub fn last_result_timestamp(&self) -> Option<SystemTime> {
        self.last_result.map(|r| r.timestamp)
    }
}

/// 全部工位的合计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FleetTotals {
    pub stations: usize,
    pub faulted_stations: usize,
    pub counters: StationCounters,
}

impl FleetTotals {
    pub fn from_states<'a>(states: impl IntoIterator<Item = &'a StationRuntimeState>) -> Self {
        let mut totals = FleetTotals::default();
        for state in states {
            totals.stations += 1;
            if state.faulted {
                totals.faulted_stations += 1;
            }
            totals.counters.accumulate(&state.counters);
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_station_state_roundtrip() {
        for value in 0..=8u8 {
            assert_eq!(StationState::from_u8(value).as_u8(), value);
        }
        assert_eq!(StationState::from_u8(200), StationState::Idle);
    }

    #[test]
    fn test_station_state_classification() {
        assert!(StationState::Faulted.is_terminal());
        assert!(!StationState::WaitSensor.is_terminal());
        assert!(StationState::Capturing.in_cycle());
        assert!(!StationState::WaitSensor.in_cycle());
    }

    #[test]
    fn test_atomic_controller_state() {
        let state = AtomicControllerState::default();
        assert_eq!(state.get(Ordering::Relaxed), ControllerState::Idle);

        assert!(state.compare_exchange(
            ControllerState::Idle,
            ControllerState::Running,
            Ordering::AcqRel,
            Ordering::Acquire
        ));
        assert!(!state.compare_exchange(
            ControllerState::Idle,
            ControllerState::Running,
            Ordering::AcqRel,
            Ordering::Acquire
        ));

        state.set(ControllerState::Stopping, Ordering::Release);
        assert_eq!(state.get(Ordering::Acquire), ControllerState::Stopping);
    }

    #[test]
    fn test_pass_rate() {
        let counters = StationCounters {
            cycles_completed: 4,
            cycles_passed: 3,
            cycles_failed: 1,
            ..Default::default()
        };
        assert_eq!(counters.pass_rate(), 75.0);
        assert_eq!(StationCounters::default().pass_rate(), 0.0);
    }

    #[test]
    fn test_fleet_totals() {
        let mut top = StationRuntimeState::new("Top".into(), "TOP");
        top.counters.cycles_completed = 3;
        top.counters.cycles_passed = 2;
        let mut bottom = StationRuntimeState::new("Bottom".into(), "BOTTOM");
        bottom.counters.cycles_completed = 1;
        bottom.counters.io_faults = 5;
        bottom.faulted = true;

        let totals = FleetTotals::from_states([&top, &bottom]);
        assert_eq!(totals.stations, 2);
        assert_eq!(totals.faulted_stations, 1);
        assert_eq!(totals.counters.cycles_completed, 4);
        assert_eq!(totals.counters.cycles_passed, 2);
        assert_eq!(totals.counters.io_faults, 5);
    }
}
