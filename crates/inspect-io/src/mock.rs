//! Mock I/O 驱动
//!
//! 内存中的可编程 I/O 卡，用于测试和仿真：
//! - 每条输入线可预置读数序列（读完后保持最后一个值）
//! - 记录所有触发脉冲（线号、时长）和结果端口写入
//! - 可配置应答行为和故障注入
//! - 检测总线交错访问（某条输出线拉高期间发生的其他访问）
//!
//! `MockIoDriver` 被移交给 `IoChannel` 后，测试通过克隆出的 [`MockIoHandle`] 观察和操控状态。

use crate::{IoDeviceError, IoDeviceErrorKind, IoDriver, IoError, check_line};
use inspect_protocol::MAX_LINES;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 下游应答模拟方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// 立即应答
    #[default]
    Immediate,
    /// 从不应答（等待至超时）
    Never,
    /// 延迟后应答（超过等待时间则视为超时）
    After(Duration),
}

/// 一次完整的触发脉冲
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseRecord {
    pub line: u8,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct MockState {
    scripts: HashMap<u8, VecDeque<bool>>,
    inputs: [bool; MAX_LINES as usize],
    outputs: [bool; MAX_LINES as usize],
    asserted_at: [Option<Instant>; MAX_LINES as usize],
    pulses: Vec<PulseRecord>,
    port_writes: Vec<u8>,
    line_reads: HashMap<u8, u64>,
    ack_waits: u64,
    ack_mode: AckMode,
    read_faults: u32,
    write_faults: u32,
    disconnected: bool,
    interleaved: u64,
}

impl MockState {
    /// 任一输出线处于拉高状态时的其他访问都计为交错
    fn note_access(&mut self, line: Option<u8>) {
        let busy = self
            .outputs
            .iter()
            .enumerate()
            .any(|(idx, high)| *high && Some(idx as u8) != line);
        if busy {
            self.interleaved += 1;
        }
    }

    fn check_connected(&self) -> Result<(), IoError> {
        if self.disconnected {
            return Err(IoError::Device(IoDeviceError::new(
                IoDeviceErrorKind::NoDevice,
                "I/O card disconnected",
            )));
        }
        Ok(())
    }
}

/// 可编程 Mock I/O 驱动
pub struct MockIoDriver {
    state: Arc<Mutex<MockState>>,
}

/// Mock 驱动的观察/操控句柄（可克隆，跨线程共享）
#[derive(Clone)]
pub struct MockIoHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockIoDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// 获取观察句柄
    pub fn handle(&self) -> MockIoHandle {
        MockIoHandle {
            state: self.state.clone(),
        }
    }
}

impl Default for MockIoDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl IoDriver for MockIoDriver {
    fn read_line(&mut self, line: u8) -> Result<bool, IoError> {
        check_line(line)?;
        let mut state = self.state.lock();
        state.check_connected()?;
        state.note_access(None);
        *state.line_reads.entry(line).or_insert(0) += 1;

        if state.read_faults > 0 {
            state.read_faults -= 1;
            return Err(IoError::Device(IoDeviceError::new(
                IoDeviceErrorKind::InvalidResponse,
                format!("injected read fault on line {}", line),
            )));
        }

        let next = state.scripts.get_mut(&line).and_then(|s| s.pop_front());
        if let Some(level) = next {
            state.inputs[line as usize] = level;
        }
        Ok(state.inputs[line as usize])
    }

    fn write_line(&mut self, line: u8, level: bool) -> Result<(), IoError> {
        check_line(line)?;
        let mut state = self.state.lock();
        state.check_connected()?;
        state.note_access(Some(line));

        if state.write_faults > 0 {
            state.write_faults -= 1;
            return Err(IoError::Device(IoDeviceError::new(
                IoDeviceErrorKind::Backend,
                format!("injected write fault on line {}", line),
            )));
        }

        let idx = line as usize;
        match (state.outputs[idx], level) {
            (false, true) => state.asserted_at[idx] = Some(Instant::now()),
            (true, false) => {
                if let Some(at) = state.asserted_at[idx].take() {
                    state.pulses.push(PulseRecord {
                        line,
                        duration: at.elapsed(),
                    });
                }
            },
            _ => {},
        }
        state.outputs[idx] = level;
        Ok(())
    }

    fn write_port(&mut self, value: u8) -> Result<(), IoError> {
        let mut state = self.state.lock();
        state.check_connected()?;
        state.note_access(None);
        state.port_writes.push(value);
        Ok(())
    }

    fn wait_for_line(&mut self, line: u8, timeout: Duration) -> Result<bool, IoError> {
        check_line(line)?;
        let mode = {
            let mut state = self.state.lock();
            state.check_connected()?;
            state.ack_waits += 1;
            state.ack_mode
        };

        match mode {
            AckMode::Immediate => Ok(true),
            AckMode::Never => {
                std::thread::sleep(timeout);
                Ok(false)
            },
            AckMode::After(delay) if delay <= timeout => {
                std::thread::sleep(delay);
                Ok(true)
            },
            AckMode::After(_) => {
                std::thread::sleep(timeout);
                Ok(false)
            },
        }
    }
}

impl MockIoHandle {
    /// 预置输入线的读数序列（每次读取消耗一个值，读完后保持最后的值）
    pub fn script_input(&self, line: u8, values: impl IntoIterator<Item = bool>) {
        let mut state = self.state.lock();
        state.scripts.entry(line).or_default().extend(values);
    }

    /// 直接设置输入线电平（清除该线剩余的脚本）
    pub fn set_input(&self, line: u8, level: bool) {
        let mut state = self.state.lock();
        state.scripts.remove(&line);
        if let Some(slot) = state.inputs.get_mut(line as usize) {
            *slot = level;
        }
    }

    /// 输入线剩余脚本长度
    pub fn pending_script(&self, line: u8) -> usize {
        self.state.lock().scripts.get(&line).map(|s| s.len()).unwrap_or(0)
    }

    pub fn set_ack_mode(&self, mode: AckMode) {
        self.state.lock().ack_mode = mode;
    }

    /// 接下来 `count` 次读操作返回错误
    pub fn inject_read_faults(&self, count: u32) {
        self.state.lock().read_faults = count;
    }

    /// 接下来 `count` 次写线操作返回错误
    pub fn inject_write_faults(&self, count: u32) {
        self.state.lock().write_faults = count;
    }

    /// 模拟设备拔出/重新插入
    pub fn set_disconnected(&self, disconnected: bool) {
        self.state.lock().disconnected = disconnected;
    }

    /// 所有已完成的触发脉冲
    pub fn pulses(&self) -> Vec<PulseRecord> {
        self.state.lock().pulses.clone()
    }

    /// 指定输出线上已完成的脉冲
    pub fn pulses_on(&self, line: u8) -> Vec<PulseRecord> {
        self.state
            .lock()
            .pulses
            .iter()
            .filter(|p| p.line == line)
            .copied()
            .collect()
    }

    /// 结果端口的全部写入值
    pub fn port_writes(&self) -> Vec<u8> {
        self.state.lock().port_writes.clone()
    }

    /// 结果端口最后一次写入值
    pub fn last_port_value(&self) -> Option<u8> {
        self.state.lock().port_writes.last().copied()
    }

    pub fn output_level(&self, line: u8) -> bool {
        self.state
            .lock()
            .outputs
            .get(line as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn line_reads(&self, line: u8) -> u64 {
        self.state.lock().line_reads.get(&line).copied().unwrap_or(0)
    }

    pub fn ack_waits(&self) -> u64 {
        self.state.lock().ack_waits
    }

    /// 脉冲期间发生的交错访问次数（应始终为 0）
    pub fn interleaved_accesses(&self) -> u64 {
        self.state.lock().interleaved
    }
}
