//! 外部协作者接口
//!
//! 执行引擎、设备管理、保存状态引擎、全局调度器、定时器和调试器都通过这里的 Trait
//! 接入控制平面。控制平面只在固定的时间点调用它们，其内部实现对本 crate 不透明。

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cpu::VCpu;
use crate::error::{VmError, VmResult};
use crate::lifecycle::{ResumeReason, SuspendReason};
use crate::status::EmStatus;
use crate::vm::Vm;

/// 客户机执行引擎
pub trait ExecutionEngine: Send + Sync {
    /// 在 CPU 的 EMT 上初始化执行上下文
    fn init_cpu(&self, _cpu: &VCpu) -> VmResult<()> {
        Ok(())
    }

    /// 执行一个时间片
    ///
    /// 返回 `Halt` 表示客户机空闲，`Reset` 表示客户机请求复位，`Terminate` 表示 EMT 应退出。
    /// 返回错误会让 VM 进入 guru meditation。
    fn execute(&self, vm: &Vm, cpu: &VCpu) -> VmResult<EmStatus>;

    /// 打断正在执行客户机代码的 CPU
    fn poke(&self, _cpu: &VCpu) {}

    /// 复位 CPU 的客户机可见状态
    fn reset_cpu(&self, _cpu: &VCpu) {}

    fn term(&self) {}
}

/// 复位方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Hard,
    /// 软复位，附带设备层给出的原因标志
    Soft(u32),
}

/// 设备管理
pub trait DeviceManager: Send + Sync {
    fn init(&self, _vm: &Vm) -> VmResult<()> {
        Ok(())
    }

    /// 设备自身的失败通过运行时错误报告，不阻止开机
    fn power_on(&self, _vm: &Vm) {}

    fn suspend(&self, _vm: &Vm, _reason: SuspendReason) {}

    fn resume(&self, _vm: &Vm, _reason: ResumeReason) {}

    fn power_off(&self, _vm: &Vm) {}

    fn reset(&self, _vm: &Vm) {}

    fn soft_reset(&self, _vm: &Vm, _flags: u32) {}

    /// 客户机触发复位时，询问应执行哪种复位
    fn reset_kind(&self, _vm: &Vm) -> ResetKind {
        ResetKind::Hard
    }

    /// 复位时针对单个 CPU 的设备状态（APIC 等）
    fn reset_cpu(&self, _vm: &Vm, _cpu: &VCpu) {}

    /// 处理设备的异步通知
    fn service_async(&self, _vm: &Vm, _cpu: &VCpu) {}

    fn term(&self, _vm: &Vm) {}
}

/// 保存目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveTarget {
    File(PathBuf),
    /// 迁移用的流，值是对端地址
    Stream(String),
}

impl fmt::Display for SaveTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveTarget::File(path) => write!(f, "file {}", path.display()),
            SaveTarget::Stream(peer) => write!(f, "stream {peer}"),
        }
    }
}

/// 保存完成后 VM 的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveAfter {
    /// 保存后继续使用（快照）
    Continue,
    /// 保存后关机销毁
    Destroy,
    /// 迁移到另一台主机
    Teleport,
}

/// 一次在线保存操作
///
/// `step1` 在客户机仍在运行时执行，`step2` 在所有 CPU 挂起之后执行，`done` 无论成败都会调用。
pub trait LiveSave: Send {
    fn step1(&mut self, vm: &Vm) -> VmResult<()>;
    fn step2(&mut self, vm: &Vm) -> VmResult<()>;
    fn done(&mut self, _vm: &Vm) {}
}

/// 保存状态引擎
pub trait SavedStateEngine: Send + Sync {
    /// 挂起状态下的一次性保存
    fn save(&self, vm: &Vm, target: &SaveTarget, after: SaveAfter) -> VmResult<()>;

    /// 开始一次在线保存；`max_downtime` 是最后挂起阶段允许的停顿
    fn live_save(
        &self,
        vm: &Vm,
        target: &SaveTarget,
        after: SaveAfter,
        max_downtime: Duration,
    ) -> VmResult<Box<dyn LiveSave>>;

    fn load(&self, vm: &Vm, source: &SaveTarget) -> VmResult<()>;

    /// 取消正在进行的保存，返回是否真的有保存被取消
    fn cancel(&self, _vm: &Vm) -> bool {
        false
    }
}

/// 宿主机上多个 VM 共享的特权调度器
pub trait GlobalScheduler: Send + Sync {
    fn init(&self, _vm: &Vm) -> VmResult<()> {
        Ok(())
    }

    fn term(&self, _vm: &Vm) {}

    /// 阻塞到 `deadline` 或被唤醒
    fn halt(&self, cpu: &VCpu, deadline: Instant) -> VmResult<()>;

    fn wake_up(&self, cpu: &VCpu);

    fn poke(&self, _cpu: &VCpu) {}

    /// 该 CPU 是否允许在调度器里停机
    fn may_halt_in_scheduler(&self, _cpu_id: u32) -> bool {
        true
    }
}

/// 虚拟时钟与定时器
pub trait TimerSource: Send + Sync {
    /// 运行到期的定时器，返回距下一个到期点的时间；没有定时器时返回 `None`
    fn run_timers(&self, vm: &Vm, cpu: &VCpu) -> Option<Duration>;

    /// 虚拟时钟落后真实时间的量
    fn catch_up_lag(&self) -> Duration {
        Duration::ZERO
    }
}

/// 调试器前端
pub trait Debugger: Send + Sync {
    /// 处理 DBGF 强制动作；`cpu` 为 `None` 时处理 VM 级事件
    fn service(&self, vm: &Vm, cpu: Option<&VCpu>) -> EmStatus;
}

/// 状态变化以外的生命周期钩子
pub trait UserHooks: Send + Sync {
    /// EMT 开始运行
    fn notify_emt_init(&self, _vm: &Vm, _cpu: &VCpu) {}

    /// EMT 退出循环之后
    fn notify_emt_term(&self, _vm: &Vm, _cpu: &VCpu) {}

    /// 配置了"复位改为关机"，一次复位请求即将变成关机
    fn notify_reset_turned_into_power_off(&self, _vm: &Vm) {}
}

/// 没有真正执行引擎时使用：每个时间片都报告客户机空闲
#[derive(Debug, Default)]
pub struct IdleEngine;

impl ExecutionEngine for IdleEngine {
    fn execute(&self, _vm: &Vm, _cpu: &VCpu) -> VmResult<EmStatus> {
        Ok(EmStatus::Halt)
    }
}

#[derive(Debug, Default)]
pub struct NoopDevices;

impl DeviceManager for NoopDevices {}

/// 不支持保存/加载
#[derive(Debug, Default)]
pub struct UnsupportedSavedState;

impl SavedStateEngine for UnsupportedSavedState {
    fn save(&self, _vm: &Vm, target: &SaveTarget, _after: SaveAfter) -> VmResult<()> {
        Err(VmError::NotSupported(format!("saving to {target}")))
    }

    fn live_save(
        &self,
        _vm: &Vm,
        target: &SaveTarget,
        _after: SaveAfter,
        _max_downtime: Duration,
    ) -> VmResult<Box<dyn LiveSave>> {
        Err(VmError::NotSupported(format!("live saving to {target}")))
    }

    fn load(&self, _vm: &Vm, source: &SaveTarget) -> VmResult<()> {
        Err(VmError::NotSupported(format!("loading from {source}")))
    }
}

/// 没有虚拟定时器
#[derive(Debug, Default)]
pub struct NoTimers;

impl TimerSource for NoTimers {
    fn run_timers(&self, _vm: &Vm, _cpu: &VCpu) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Default)]
struct NoHooks;

impl UserHooks for NoHooks {}

/// 控制平面的全部外部协作者
#[derive(Clone)]
pub struct VmBackends {
    pub engine: Arc<dyn ExecutionEngine>,
    pub devices: Arc<dyn DeviceManager>,
    pub saved_state: Arc<dyn SavedStateEngine>,
    pub timers: Arc<dyn TimerSource>,
    pub scheduler: Option<Arc<dyn GlobalScheduler>>,
    pub debugger: Option<Arc<dyn Debugger>>,
    pub hooks: Arc<dyn UserHooks>,
}

impl Default for VmBackends {
    fn default() -> Self {
        Self {
            engine: Arc::new(IdleEngine),
            devices: Arc::new(NoopDevices),
            saved_state: Arc::new(UnsupportedSavedState),
            timers: Arc::new(NoTimers),
            scheduler: None,
            debugger: None,
            hooks: Arc::new(NoHooks),
        }
    }
}

impl VmBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_devices(mut self, devices: Arc<dyn DeviceManager>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_saved_state(mut self, saved_state: Arc<dyn SavedStateEngine>) -> Self {
        self.saved_state = saved_state;
        self
    }

    pub fn with_timers(mut self, timers: Arc<dyn TimerSource>) -> Self {
        self.timers = timers;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn GlobalScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_debugger(mut self, debugger: Arc<dyn Debugger>) -> Self {
        self.debugger = Some(debugger);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn UserHooks>) -> Self {
        self.hooks = hooks;
        self
    }
}

impl fmt::Debug for VmBackends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmBackends")
            .field("scheduler", &self.scheduler.is_some())
            .field("debugger", &self.debugger.is_some())
            .finish_non_exhaustive()
    }
}
