//! 结果信号编码
//!
//! 向下游分选机（handler）输出的是一个 8 位端口值：
//!
//! ```text
//! bit:   7    6  5  4  3    2  1  0
//!      BUSY   -  -  -  -  [ RESULT ]      （默认布局：busy_bit=7, result_bit=0）
//! ```
//!
//! busy 位和 3 位结果码的起始位可按产线配置调整（见 [`SignalLayout`]）。

use crate::ProtocolError;
use std::fmt;

/// 3 位结果码
///
/// `Pass = 0`，`FailGeneral = 7`，其余为细分的不良类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, num_enum::TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ResultCode {
    #[default]
    Pass = 0,
    FailType1 = 1,
    FailType2 = 2,
    FailType3 = 3,
    FailType4 = 4,
    FailType5 = 5,
    FailType6 = 6,
    FailGeneral = 7,
}

impl ResultCode {
    /// 结果码掩码（3 位）
    pub const MASK: u8 = 0x07;

    /// 从 u8 转换（超出 0..=7 返回错误）
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Self::try_from(value).map_err(|_| ProtocolError::InvalidResultCode(value))
    }

    /// 从端口位中截取（只取低 3 位，总是成功）
    pub fn from_bits(bits: u8) -> Self {
        match bits & Self::MASK {
            0 => Self::Pass,
            1 => Self::FailType1,
            2 => Self::FailType2,
            3 => Self::FailType3,
            4 => Self::FailType4,
            5 => Self::FailType5,
            6 => Self::FailType6,
            _ => Self::FailGeneral,
        }
    }

    /// 布尔结果映射：通过 → `Pass`，不通过 → `FailGeneral`
    pub fn from_passed(passed: bool) -> Self {
        if passed { Self::Pass } else { Self::FailGeneral }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_pass(self) -> bool {
        self == Self::Pass
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::Pass => f.write_str("PASS"),
            ResultCode::FailGeneral => f.write_str("FAIL"),
            other => write!(f, "FAIL_TYPE_{}", other.as_u8()),
        }
    }
}

/// 输出端口位布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SignalLayout {
    /// busy 位位置（0-7）
    pub busy_bit: u8,
    /// 3 位结果码的起始位（0-5）
    pub result_bit: u8,
}

impl Default for SignalLayout {
    fn default() -> Self {
        Self {
            busy_bit: 7,
            result_bit: 0,
        }
    }
}

impl SignalLayout {
    /// 校验布局：结果码 3 位不得越界，且不得覆盖 busy 位
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.busy_bit > 7 {
            return Err(ProtocolError::InvalidLayout(format!(
                "busy bit {} out of range",
                self.busy_bit
            )));
        }
        if self.result_bit > 5 {
            return Err(ProtocolError::InvalidLayout(format!(
                "result bits {}..={} exceed port width",
                self.result_bit,
                self.result_bit + 2
            )));
        }
        if (self.result_bit..self.result_bit + 3).contains(&self.busy_bit) {
            return Err(ProtocolError::InvalidLayout(format!(
                "busy bit {} overlaps result bits {}..={}",
                self.busy_bit,
                self.result_bit,
                self.result_bit + 2
            )));
        }
        Ok(())
    }

    /// 编码输出字节
    pub fn encode(&self, busy: bool, code: ResultCode) -> u8 {
        let mut value = (code.as_u8() & ResultCode::MASK) << self.result_bit;
        if busy {
            value |= 1 << self.busy_bit;
        }
        value
    }

    /// 解码输出字节，返回 `(busy, code)`
    pub fn decode(&self, value: u8) -> (bool, ResultCode) {
        let busy = value & (1 << self.busy_bit) != 0;
        let code = ResultCode::from_bits(value >> self.result_bit);
        (busy, code)
    }
}
