//! # vm-core - 虚拟机控制平面
//!
//! 管理一台虚拟机的生命周期，为每个 vCPU 运行一个模拟线程（EMT），并提供其他线程让
//! EMT 执行工作的唯一安全通道。
//!
//! ## 主要组件
//!
//! - **状态机**: [`VmState`] 与状态转换表，[`Vm::try_set_state`] 原子地尝试一组转换
//! - **生命周期**: [`Vm::power_on`]、[`Vm::suspend`]、[`Vm::reset`]、[`Vm::power_off`]、
//!   [`Vm::destroy`] 等，基于 [`Vm::emt_rendezvous`] 屏障实现
//! - **请求队列**: [`Vm::req_call_wait`] 等把闭包投递到指定 CPU、任意空闲 CPU 或全部 CPU
//! - **停机策略**: [`HaltMethod`] 决定客户机空闲时 EMT 如何等待
//! - **外部协作者**: [`VmBackends`] 汇集执行引擎、设备、存档引擎等 Trait 对象
//!
//! ## 示例
//!
//! ```rust,ignore
//! use vm_core::{VmBackends, VmConfig, VmHandle, SuspendReason};
//!
//! let vm = VmHandle::create(VmConfig::new().with_cpu_count(4), VmBackends::new())?;
//! vm.power_on()?;
//! vm.suspend(SuspendReason::User)?;
//! vm.power_off()?;
//! vm.destroy()?;
//! ```

pub mod backend;
pub mod callbacks;
pub mod config;
pub mod cpu;
mod emt;
pub mod error;
pub mod event;
pub mod ff;
pub mod halt;
pub mod lifecycle;
pub mod rendezvous;
pub mod request;
pub mod save;
pub mod state;
pub mod status;
pub mod vm;

pub use backend::{
    Debugger, DeviceManager, ExecutionEngine, GlobalScheduler, IdleEngine, LiveSave,
    NoTimers, NoopDevices, ResetKind, SaveAfter, SaveTarget, SavedStateEngine, TimerSource,
    UnsupportedSavedState, UserHooks, VmBackends,
};
pub use callbacks::{AtErrorCallback, AtRuntimeErrorCallback, AtStateCallback};
pub use config::{HaltTuning, MAX_CPUS, VmConfig};
pub use cpu::{CpuStats, CpuStatsSnapshot, VCpu, VCpuState};
pub use error::{Transition, VmError, VmResult};
pub use ff::{CpuForcedActions, ForcedActions, NotifyFlags, VmForcedActions};
pub use halt::HaltMethod;
pub use lifecycle::{ResumeReason, RuntimeErrorFlags, SuspendReason};
pub use rendezvous::RendezvousKind;
pub use request::{ReqFlags, ReqFn, ReqState, ReqTarget, RequestHandle, RequestPoolStats};
pub use save::DEFAULT_MAX_DOWNTIME;
pub use state::VmState;
pub use status::EmStatus;
pub use vm::{ResetCounts, Vm, VmHandle, VmStats};
