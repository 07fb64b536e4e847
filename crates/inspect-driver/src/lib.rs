//! # Inspect Driver
//!
//! 多工位视觉检测产线的编排层：
//! - 每个工位一个工作线程，运行 传感器 → 触发 → 采集 → 检测 → 上报 → 应答 的状态机
//! - 共享 I/O 卡的串行化访问（脉冲和结果握手都是原子事务）
//! - 工位状态无锁发布（ArcSwap），统计读取不阻塞工位线程
//! - 有界停止：超时的工位线程被分离而不是无限等待
//! - 周期钩子：异步记录每个周期的结果
//!
//! # Example
//!
//! ```no_run
//! use inspect_driver::{CaptureError, CaptureRequest, ControllerBuilder, Frame, StationConfig, StationId};
//! use inspect_io::MockIoDriver;
//! use std::time::Duration;
//!
//! let mut controller = ControllerBuilder::new()
//!     .io_driver(MockIoDriver::new())
//!     .camera(|_: &CaptureRequest<'_>| Ok::<_, CaptureError>(Frame::empty()))
//!     .station(StationConfig::new("Top", 0, 0).with_ejector_distance(10))
//!     .inspection(|_: &StationId, frame: &Frame| !frame.is_empty())
//!     .build()?;
//!
//! controller.start()?;
//! std::thread::sleep(Duration::from_secs(1));
//! let report = controller.stop(Duration::from_secs(2))?;
//! assert!(report.is_clean());
//!
//! for (id, state) in controller.get_statistics() {
//!     println!("{}: {} cycles", id, state.counters.cycles_completed);
//! }
//! # Ok::<(), inspect_driver::ControllerError>(())
//! ```

mod builder;
pub mod camera;
mod controller;
mod error;
pub mod hooks;
pub mod inspection;
pub mod io_channel;
pub mod metrics;
pub mod recording;
pub mod state;
mod worker;

pub use builder::ControllerBuilder;
pub use camera::{CameraBackend, CaptureError, CaptureRequest, Frame};
pub use controller::{ProductionController, StopReport};
pub use error::{ControllerError, StopTimeout};
pub use hooks::{CycleHook, CycleOutcome, CycleRecord, HookManager};
pub use inspection::{InspectionCallback, InspectionError, IntoVerdict, Verdict};
pub use io_channel::{AckOutcome, IoChannel, IoChannelConfig, ResultHandshake};
pub use metrics::{IoMetrics, IoMetricsSnapshot};
pub use recording::AsyncCycleRecorder;
pub use state::*;
pub use worker::WorkerConfig;

// 常用协议类型
pub use inspect_protocol::{LineKind, ResultCode, SignalLayout, StationConfig, StationId};
