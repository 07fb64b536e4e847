//! 检测回调
//!
//! 检测算法由应用注入，在工位线程上同步执行。回调可以返回布尔值、[`Verdict`]，
//! 或者它们的 `Result` 形式；返回错误或 panic 都按检测故障处理，该件判为 FAIL。

use crate::camera::Frame;
use inspect_protocol::{ResultCode, StationId};
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use thiserror::Error;

/// 检测判定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    #[default]
    Pass,
    /// 不合格，附带细分结果码
    Fail(ResultCode),
}

impl Verdict {
    /// 通用不合格
    pub const FAIL: Verdict = Verdict::Fail(ResultCode::FailGeneral);

    pub fn passed(self) -> bool {
        self.result_code().is_pass()
    }

    /// 写到结果端口上的结果码
    pub fn result_code(self) -> ResultCode {
        match self {
            Verdict::Pass => ResultCode::Pass,
            Verdict::Fail(code) => code,
        }
    }
}

impl From<bool> for Verdict {
    fn from(passed: bool) -> Self {
        if passed { Verdict::Pass } else { Verdict::FAIL }
    }
}

impl From<ResultCode> for Verdict {
    fn from(code: ResultCode) -> Self {
        if code.is_pass() {
            Verdict::Pass
        } else {
            Verdict::Fail(code)
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.result_code(), f)
    }
}

/// 检测故障
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InspectionError {
    /// 回调返回了错误
    #[error("Inspection failed: {0}")]
    Failed(String),
    /// 回调 panic
    #[error("Inspection panicked: {0}")]
    Panicked(String),
}

/// 可转换为判定结果的回调返回值
pub trait IntoVerdict {
    fn into_verdict(self) -> Result<Verdict, InspectionError>;
}

impl IntoVerdict for bool {
    fn into_verdict(self) -> Result<Verdict, InspectionError> {
        Ok(self.into())
    }
}

impl IntoVerdict for Verdict {
    fn into_verdict(self) -> Result<Verdict, InspectionError> {
        Ok(self)
    }
}

impl<E: fmt::Display> IntoVerdict for Result<bool, E> {
    fn into_verdict(self) -> Result<Verdict, InspectionError> {
        self.map(Verdict::from)
            .map_err(|e| InspectionError::Failed(e.to_string()))
    }
}

impl<E: fmt::Display> IntoVerdict for Result<Verdict, E> {
    fn into_verdict(self) -> Result<Verdict, InspectionError> {
        self.map_err(|e| InspectionError::Failed(e.to_string()))
    }
}

/// 检测回调
///
/// 所有工位共用一个回调实例，可能被多个工位线程并发调用，因此必须是 `Send + Sync`。
/// 闭包 `Fn(&StationId, &Frame) -> R`（`R: IntoVerdict`）自动实现本 trait：
///
/// ```
/// use inspect_driver::{Frame, InspectionCallback, StationId, Verdict};
///
/// let callback = |_station: &StationId, frame: &Frame| !frame.is_empty();
/// let verdict = callback.inspect(&"Top".into(), &Frame::empty()).unwrap();
/// assert_eq!(verdict, Verdict::FAIL);
/// ```
pub trait InspectionCallback: Send + Sync {
    fn inspect(&self, station_id: &StationId, frame: &Frame) -> Result<Verdict, InspectionError>;
}

impl<F, R> InspectionCallback for F
where
    F: Fn(&StationId, &Frame) -> R + Send + Sync,
    R: IntoVerdict,
{
    fn inspect(&self, station_id: &StationId, frame: &Frame) -> Result<Verdict, InspectionError> {
        self(station_id, frame).into_verdict()
    }
}

/// 执行回调并捕获 panic
pub(crate) fn run_inspection(
    callback: &dyn InspectionCallback,
    station_id: &StationId,
    frame: &Frame,
) -> Result<Verdict, InspectionError> {
    catch_unwind(AssertUnwindSafe(|| callback.inspect(station_id, frame)))
        .unwrap_or_else(|payload| Err(InspectionError::Panicked(panic_message(payload.as_ref()))))
}

/// 提取 panic 负载中的消息
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn top() -> StationId {
        StationId::from("Top")
    }

    #[test]
    fn test_verdict_codes() {
        assert!(Verdict::Pass.passed());
        assert_eq!(Verdict::from(false), Verdict::FAIL);
        assert_eq!(Verdict::FAIL.result_code(), ResultCode::FailGeneral);
        assert_eq!(
            Verdict::from(ResultCode::FailType2),
            Verdict::Fail(ResultCode::FailType2)
        );
        assert_eq!(Verdict::from(ResultCode::Pass), Verdict::Pass);
        assert_eq!(Verdict::Fail(ResultCode::FailType4).to_string(), "FAIL_TYPE_4");
    }

    #[test]
    fn test_bool_closure() {
        let callback = |_: &StationId, _: &Frame| true;
        assert_eq!(callback.inspect(&top(), &Frame::empty()), Ok(Verdict::Pass));
    }

    #[test]
    fn test_result_closure_error() {
        let callback = |_: &StationId, _: &Frame| -> Result<bool, String> {
            Err("model not loaded".to_string())
        };
        assert_eq!(
            callback.inspect(&top(), &Frame::empty()),
            Err(InspectionError::Failed("model not loaded".to_string()))
        );
    }

    #[test]
    fn test_verdict_closure() {
        let callback = |station: &StationId, _: &Frame| -> Result<Verdict, std::io::Error> {
            if station.as_str() == "Top" {
                Ok(Verdict::Fail(ResultCode::FailType1))
            } else {
                Ok(Verdict::Pass)
            }
        };
        assert_eq!(
            callback.inspect(&top(), &Frame::empty()),
            Ok(Verdict::Fail(ResultCode::FailType1))
        );
    }

    #[test]
    fn test_panic_is_caught() {
        let callback = |_: &StationId, _: &Frame| -> bool { panic!("division by zero") };
        let result = run_inspection(&callback, &top(), &Frame::empty());
        assert_eq!(
            result,
            Err(InspectionError::Panicked("division by zero".to_string()))
        );
    }

    #[test]
    fn test_formatted_panic_message() {
        let callback = |station: &StationId, _: &Frame| -> bool { panic!("bad frame from {}", station) };
        let result = run_inspection(&callback, &top(), &Frame::empty());
        assert_eq!(
            result,
            Err(InspectionError::Panicked("bad frame from Top".to_string()))
        );
    }
}
