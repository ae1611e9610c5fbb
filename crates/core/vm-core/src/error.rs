//! 控制平面错误类型
//!
//! 所有生命周期、请求队列和 EMT 操作都返回 [`VmResult`]。
//! `VmError` 实现了 `Clone`，同一个结果可以同时交给请求的等待者和日志。

use std::fmt;

use thiserror::Error;
use vm_common::ConfigError;

use crate::request::ReqState;
use crate::state::VmState;

/// 一次状态转换尝试中的 (from, to) 对
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transition {
    pub from: VmState,
    pub to: VmState,
}

impl Transition {
    pub const fn new(from: VmState, to: VmState) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

fn list_transitions(transitions: &[Transition]) -> String {
    transitions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// 统一的控制平面错误类型
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    /// 当前状态不是任何一个候选转换的起点
    #[error("{who}: invalid VM state {current} (attempted: {})", list_transitions(.attempted))]
    InvalidState {
        who: String,
        current: VmState,
        attempted: Vec<Transition>,
    },

    /// 屏障内的 CPU 发现 VM 不在预期的过渡状态
    #[error("{who}: unexpected unstable VM state {current}")]
    UnexpectedUnstableState { who: String, current: VmState },

    /// 句柄指向的 VM 已经销毁或正在销毁
    #[error("invalid VM handle")]
    InvalidVmHandle,

    #[error("invalid virtual CPU id {0}")]
    InvalidCpuId(u32),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// 在不允许的线程上调用（例如在 EMT 上销毁 VM）
    #[error("wrong thread: {0}")]
    WrongThread(String),

    /// 请求包池耗尽
    #[error("out of request packets")]
    NoMemory,

    #[error("timed out")]
    Timeout,

    /// 请求包不在该操作要求的状态
    #[error("request is {actual}, expected {expected}")]
    RequestState {
        expected: &'static str,
        actual: ReqState,
    },

    #[error("too many virtual CPUs: {requested} (max {max})")]
    TooManyCpus { requested: u32, max: u32 },

    #[error("not supported: {0}")]
    NotSupported(String),

    /// 宿主侧失败，例如全局调度器的停机调用失败
    #[error("host failure: {0}")]
    Host(String),

    /// 存档引擎报告的失败
    #[error("saved state failure: {0}")]
    SavedState(String),

    /// 暂时无法完成，稍后重试
    #[error("try again")]
    TryAgain,

    #[error("the VM was powered off during the live save")]
    LivePoweredOff,

    #[error("the VM hit a fatal error during the live save")]
    LiveFatalError,

    #[error("the VM entered guru meditation during the live save")]
    LiveGuruMeditation,

    #[error("operation cancelled")]
    Cancelled,

    /// EMT 正在退出，请求无法投递
    #[error("the VM is terminating")]
    Terminating,

    /// 屏障回调中再次发起屏障
    #[error("rendezvous recursion detected")]
    Deadlock,

    #[error("callback not registered")]
    CallbackNotFound,

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 执行引擎报告的不可恢复错误
    #[error("execution engine failure: {0}")]
    Engine(String),
}

impl VmError {
    /// 是否属于"前置条件不满足"一类，调用者可以安全重试其他操作
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            VmError::InvalidState { .. } | VmError::UnexpectedUnstableState { .. }
        )
    }
}

/// 控制平面结果类型
pub type VmResult<T> = Result<T, VmError>;
