//! # 产线统计报表
//!
//! 纯数据结构和纯函数：由调用方把控制器快照转换成 [`StationSummary`]，
//! 这里只负责比率计算和文本渲染。

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;

/// 计算百分比（分母为 0 时返回 0）
pub fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}

/// 计算每分钟周期数
pub fn cycles_per_minute(cycles: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    cycles as f64 * 60.0 / secs
}

/// 单个工位的统计摘要
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StationSummary {
    pub station_id: String,
    pub display_name: String,
    /// 状态机当前状态（文本）
    pub state: String,
    pub cycles_completed: u64,
    pub cycles_passed: u64,
    pub cycles_failed: u64,
    pub cycles_errored: u64,
    pub ack_timeouts: u64,
    pub faulted: bool,
}

impl StationSummary {
    /// 合格率（%，按完成周期计）
    pub fn pass_rate(&self) -> f64 {
        percentage(self.cycles_passed, self.cycles_completed)
    }

    /// 不合格率（%）
    pub fn fail_rate(&self) -> f64 {
        percentage(self.cycles_failed, self.cycles_completed)
    }

    /// 应答超时率（%）
    pub fn ack_timeout_rate(&self) -> f64 {
        percentage(self.ack_timeouts, self.cycles_completed)
    }
}

/// 全产线报表
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetReport {
    /// 统计时长（秒）
    pub elapsed_secs: f64,
    pub stations: Vec<StationSummary>,
}

impl FleetReport {
    pub fn new(stations: Vec<StationSummary>, elapsed: Duration) -> Self {
        Self {
            elapsed_secs: elapsed.as_secs_f64(),
            stations,
        }
    }

    /// 各计数器的全产线合计（`station_id` 为 `"TOTAL"`）
    pub fn totals(&self) -> StationSummary {
        let mut total = StationSummary {
            station_id: "TOTAL".to_string(),
            display_name: "Total".to_string(),
            state: String::new(),
            ..Default::default()
        };
        for s in &self.stations {
            total.cycles_completed += s.cycles_completed;
            total.cycles_passed += s.cycles_passed;
            total.cycles_failed += s.cycles_failed;
            total.cycles_errored += s.cycles_errored;
            total.ack_timeouts += s.ack_timeouts;
            total.faulted |= s.faulted;
        }
        total
    }

    pub fn pass_rate(&self) -> f64 {
        self.totals().pass_rate()
    }

    /// 全产线吞吐（周期/分钟）
    pub fn throughput_per_minute(&self) -> f64 {
        cycles_per_minute(
            self.totals().cycles_completed,
            Duration::from_secs_f64(self.elapsed_secs.max(0.0)),
        )
    }

    pub fn faulted_stations(&self) -> impl Iterator<Item = &StationSummary> {
        self.stations.iter().filter(|s| s.faulted)
    }

    /// 渲染为对齐的文本表格
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<14} {:<14} {:>8} {:>8} {:>8} {:>8} {:>8} {:>7}",
            "STATION", "STATE", "DONE", "PASS", "FAIL", "ERROR", "NO-ACK", "PASS%"
        );
        let total = self.totals();
        for s in self.stations.iter().chain(std::iter::once(&total)) {
            let state = if s.faulted && s.station_id != "TOTAL" {
                "Faulted"
            } else {
                s.state.as_str()
            };
            let _ = writeln!(
                out,
                "{:<14} {:<14} {:>8} {:>8} {:>8} {:>8} {:>8} {:>6.1}%",
                s.station_id,
                state,
                s.cycles_completed,
                s.cycles_passed,
                s.cycles_failed,
                s.cycles_errored,
                s.ack_timeouts,
                s.pass_rate()
            );
        }
        let _ = writeln!(
            out,
            "elapsed {:.1}s, throughput {:.1} parts/min",
            self.elapsed_secs,
            self.throughput_per_minute()
        );
        out
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
