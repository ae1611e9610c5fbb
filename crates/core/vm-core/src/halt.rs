//! 停机/等待策略
//!
//! EMT 没有客户机代码可执行时通过当前策略休眠：
//!
//! - `halt`：VM 处于运行状态，但本 CPU 在等定时器或中断
//! - `wait`：VM 未运行（挂起、未上电等），等外部事件
//! - `notify`：任意线程唤醒停机/等待中的 EMT，或打断正在执行的 CPU
//!
//! 当前策略保存在 VM 上，只能通过屏障（[`Vm::set_halt_method`]）切换。

use std::fmt;
use std::sync::atomic::{Ordering, fence};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::cpu::{VCpu, VCpuState};
use crate::error::{VmError, VmResult};
use crate::ff::{CpuForcedActions, NotifyFlags, VmForcedActions};
use crate::rendezvous::RendezvousKind;
use crate::status::EmStatus;
use crate::vm::Vm;

/// 没有定时器时一次阻塞的上限
const MAX_BLOCK: Duration = Duration::from_millis(15);
/// 传统策略：低于该时长自旋
const LEGACY_SPIN: Duration = Duration::from_micros(50);
/// 传统策略：低于该时长让出 CPU
const LEGACY_YIELD: Duration = Duration::from_micros(870);
/// 传统策略：低于该时长睡 1ms
const LEGACY_SHORT_BLOCK: Duration = Duration::from_millis(2);
/// 等待（非停机）时一次阻塞的上限，到点后重新检查
const WAIT_SLICE: Duration = Duration::from_secs(1);
/// 每阻塞多少次更新一次平均超睡时间
const OVERSLEEP_SAMPLE: u32 = 16;
/// 每阻塞多少次清空一次超睡统计
const OVERSLEEP_FLUSH: u32 = 64;

/// 停机策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum HaltMethod {
    /// 仅用于配置：有全局调度器时选 `GlobalScheduler`，否则选 `SpinBlock`
    #[default]
    Default = 0,
    /// VM 对象尚未就绪时使用
    Bootstrap,
    /// 只根据下一个定时器到期时间决定自旋还是阻塞
    Legacy,
    /// 在 `Legacy` 基础上跟踪时钟追赶量，落后时强制自旋
    SpinBlock,
    /// 交给宿主机上的全局调度器
    GlobalScheduler,
}

impl HaltMethod {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => HaltMethod::Bootstrap,
            2 => HaltMethod::Legacy,
            3 => HaltMethod::SpinBlock,
            4 => HaltMethod::GlobalScheduler,
            _ => HaltMethod::Default,
        }
    }

    /// 把 `Default` 落实成具体策略
    pub fn resolve(self, has_scheduler: bool) -> HaltMethod {
        match self {
            HaltMethod::Default if has_scheduler => HaltMethod::GlobalScheduler,
            HaltMethod::Default => HaltMethod::SpinBlock,
            other => other,
        }
    }

    /// 初始化策略的 VM 级状态，返回实际生效的策略
    fn init(self, vm: &Vm) -> VmResult<HaltMethod> {
        match self {
            HaltMethod::GlobalScheduler => match &vm.backends().scheduler {
                Some(scheduler) => {
                    scheduler.init(vm)?;
                    Ok(HaltMethod::GlobalScheduler)
                }
                None => {
                    warn!("{}: no global scheduler available, falling back to spin/block", vm.name());
                    HaltMethod::SpinBlock.init(vm)
                }
            },
            HaltMethod::SpinBlock => {
                for cpu in vm.cpus() {
                    *cpu.halt.lock() = HaltScratch::default();
                }
                Ok(HaltMethod::SpinBlock)
            }
            HaltMethod::Default => HaltMethod::Default
                .resolve(vm.backends().scheduler.is_some())
                .init(vm),
            other => Ok(other),
        }
    }

    pub(crate) fn term(self, vm: &Vm) {
        if self == HaltMethod::GlobalScheduler
            && let Some(scheduler) = &vm.backends().scheduler
        {
            scheduler.term(vm);
        }
    }

    /// 客户机停机，直到 `vm_mask`/`cpu_mask` 中任一标志置位
    fn halt(
        self,
        vm: &Vm,
        cpu: &VCpu,
        vm_mask: VmForcedActions,
        cpu_mask: CpuForcedActions,
    ) -> VmResult<()> {
        match self {
            HaltMethod::Bootstrap => bootstrap_wait(vm, cpu),
            HaltMethod::Legacy => legacy_halt(vm, cpu, vm_mask, cpu_mask),
            HaltMethod::SpinBlock | HaltMethod::Default => spin_block_halt(vm, cpu, vm_mask, cpu_mask),
            HaltMethod::GlobalScheduler => scheduler_halt(vm, cpu, vm_mask, cpu_mask),
        }
    }

    fn wait(self, vm: &Vm, cpu: &VCpu) -> VmResult<()> {
        match self {
            HaltMethod::Bootstrap => bootstrap_wait(vm, cpu),
            HaltMethod::GlobalScheduler => scheduler_wait(vm, cpu),
            _ => default_wait(vm, cpu),
        }
    }

    fn notify(self, vm: &Vm, cpu: &VCpu, flags: NotifyFlags) {
        fence(Ordering::SeqCst);
        if self == HaltMethod::GlobalScheduler
            && let Some(scheduler) = &vm.backends().scheduler
        {
            if cpu.is_waiting() {
                scheduler.wake_up(cpu);
            } else if flags.contains(NotifyFlags::POKE) {
                scheduler.poke(cpu);
            }
            // 也可能阻塞在普通事件上（调度器初始化之前进入的等待）
            cpu.event.signal();
            return;
        }

        if cpu.is_waiting() || cpu.state() != VCpuState::Executing {
            cpu.event.signal();
        } else if flags.contains(NotifyFlags::POKE) {
            vm.backends().engine.poke(cpu);
        }
    }
}

impl fmt::Display for HaltMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HaltMethod::Default => "default",
            HaltMethod::Bootstrap => "bootstrap",
            HaltMethod::Legacy => "legacy",
            HaltMethod::SpinBlock => "spin-block",
            HaltMethod::GlobalScheduler => "global-scheduler",
        };
        f.write_str(name)
    }
}

/// 每个 CPU 的停机统计与自适应状态
#[derive(Debug, Clone, Default)]
pub struct HaltScratch {
    /// 正处于追赶时钟的自旋模式
    pub spinning: bool,
    /// 上一次阻塞结束的时刻
    pub last_block: Option<Instant>,
    pub blocks: u32,
    /// 当前统计窗口内累计的超睡时间
    pub total_oversleep: Duration,
    /// 平均超睡时间
    pub avg_oversleep: Duration,
}

impl HaltScratch {
    fn record_block(&mut self, requested: Duration, slept: Duration) {
        self.blocks += 1;
        self.total_oversleep += slept.saturating_sub(requested);
        if self.blocks % OVERSLEEP_SAMPLE == 0 {
            self.avg_oversleep = self.total_oversleep / self.blocks;
        }
        if self.blocks >= OVERSLEEP_FLUSH {
            self.blocks = 0;
            self.total_oversleep = Duration::ZERO;
        }
        self.last_block = Some(Instant::now());
    }
}

fn halt_wakeup(vm: &Vm, cpu: &VCpu, vm_mask: VmForcedActions, cpu_mask: CpuForcedActions) -> bool {
    vm.is_terminating() || vm.ff.any(vm_mask) || cpu.ff.any(cpu_mask)
}

fn wait_wakeup(vm: &Vm, cpu: &VCpu) -> bool {
    halt_wakeup(
        vm,
        cpu,
        VmForcedActions::SUSPENDED_MASK,
        CpuForcedActions::SUSPENDED_MASK,
    )
}

/// 在 CPU 的事件上阻塞至多 `timeout`；期间可被 [`HaltMethod::notify`] 唤醒
fn block_on_event(cpu: &VCpu, timeout: Duration, wakeup: impl Fn() -> bool) -> bool {
    cpu.waiting.store(true, Ordering::SeqCst);
    fence(Ordering::SeqCst);
    let signaled = if wakeup() {
        true
    } else {
        cpu.event.wait_timeout(timeout)
    };
    cpu.waiting.store(false, Ordering::SeqCst);
    signaled
}

fn next_timer(vm: &Vm, cpu: &VCpu) -> Duration {
    vm.backends()
        .timers
        .run_timers(vm, cpu)
        .unwrap_or(MAX_BLOCK)
}

fn bootstrap_wait(vm: &Vm, cpu: &VCpu) -> VmResult<()> {
    // 就绪之前只有 CPU 0 处理 VM 级请求
    let vm_mask = if cpu.id() == 0 || vm.is_ready() {
        VmForcedActions::REQUEST
    } else {
        VmForcedActions::empty()
    };
    let wakeup = || halt_wakeup(vm, cpu, vm_mask, CpuForcedActions::REQUEST | CpuForcedActions::RENDEZVOUS);
    if !wakeup() {
        cpu.stats().waits.increment();
        block_on_event(cpu, WAIT_SLICE, wakeup);
    }
    Ok(())
}

fn default_wait(vm: &Vm, cpu: &VCpu) -> VmResult<()> {
    let wakeup = || wait_wakeup(vm, cpu);
    while !wakeup() {
        cpu.stats().waits.increment();
        if block_on_event(cpu, WAIT_SLICE, wakeup) {
            break;
        }
    }
    Ok(())
}

fn legacy_halt(
    vm: &Vm,
    cpu: &VCpu,
    vm_mask: VmForcedActions,
    cpu_mask: CpuForcedActions,
) -> VmResult<()> {
    let wakeup = || halt_wakeup(vm, cpu, vm_mask, cpu_mask);
    loop {
        let next = next_timer(vm, cpu);
        if wakeup() {
            return Ok(());
        }

        if next < LEGACY_SPIN {
            cpu.stats().halt_spins.increment();
            std::hint::spin_loop();
        } else if next < LEGACY_YIELD {
            cpu.stats().halt_yields.increment();
            std::thread::yield_now();
        } else if next < LEGACY_SHORT_BLOCK {
            cpu.stats().halt_blocks.increment();
            block_on_event(cpu, Duration::from_millis(1), wakeup);
        } else {
            cpu.stats().halt_blocks.increment();
            let timeout = (next - Duration::from_millis(1)).min(MAX_BLOCK);
            block_on_event(cpu, timeout, wakeup);
        }
    }
}

fn spin_block_halt(
    vm: &Vm,
    cpu: &VCpu,
    vm_mask: VmForcedActions,
    cpu_mask: CpuForcedActions,
) -> VmResult<()> {
    let tuning = &vm.config().halt;
    let wakeup = || halt_wakeup(vm, cpu, vm_mask, cpu_mask);

    let lag = vm.backends().timers.catch_up_lag();
    let block_interval = {
        let mut scratch = cpu.halt.lock();
        if scratch.spinning {
            if lag < tuning.stop_spinning() {
                debug!("EMT-{}: clock caught up ({lag:?}), leaving spin mode", cpu.id());
                scratch.spinning = false;
            }
        } else if lag >= tuning.start_spinning() {
            debug!("EMT-{}: clock lagging by {lag:?}, entering spin mode", cpu.id());
            scratch.spinning = true;
        }
        scratch.spinning.then(|| tuning.block_interval(lag))
    };

    loop {
        let next = next_timer(vm, cpu);
        if wakeup() {
            return Ok(());
        }

        let (avg_oversleep, last_block) = {
            let scratch = cpu.halt.lock();
            (scratch.avg_oversleep, scratch.last_block)
        };
        if next < tuning.spin_block_threshold() + avg_oversleep {
            cpu.stats().halt_spins.increment();
            std::hint::spin_loop();
            continue;
        }
        if let Some(interval) = block_interval
            && last_block.is_some_and(|t| t.elapsed() < interval)
        {
            cpu.stats().halt_spins.increment();
            std::hint::spin_loop();
            continue;
        }

        let requested = next.min(MAX_BLOCK).saturating_sub(avg_oversleep);
        let started = Instant::now();
        cpu.stats().halt_blocks.increment();
        block_on_event(cpu, requested, wakeup);
        cpu.halt.lock().record_block(requested, started.elapsed());
    }
}

fn scheduler_halt(
    vm: &Vm,
    cpu: &VCpu,
    vm_mask: VmForcedActions,
    cpu_mask: CpuForcedActions,
) -> VmResult<()> {
    let Some(scheduler) = vm.backends().scheduler.clone() else {
        return spin_block_halt(vm, cpu, vm_mask, cpu_mask);
    };
    let wakeup = || halt_wakeup(vm, cpu, vm_mask, cpu_mask);
    loop {
        let next = next_timer(vm, cpu);
        if wakeup() {
            return Ok(());
        }
        if next < LEGACY_SPIN {
            cpu.stats().halt_spins.increment();
            std::hint::spin_loop();
            continue;
        }
        if !cpu.may_halt_in_scheduler() {
            cpu.stats().halt_blocks.increment();
            block_on_event(cpu, next.min(MAX_BLOCK), wakeup);
            continue;
        }

        cpu.stats().halt_blocks.increment();
        cpu.waiting.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        let result = if wakeup() {
            Ok(())
        } else {
            scheduler.halt(cpu, Instant::now() + next)
        };
        cpu.waiting.store(false, Ordering::SeqCst);
        if let Err(e) = result {
            return Err(scheduler_failed(vm, cpu, e));
        }
    }
}

fn scheduler_wait(vm: &Vm, cpu: &VCpu) -> VmResult<()> {
    let Some(scheduler) = vm.backends().scheduler.clone() else {
        return default_wait(vm, cpu);
    };
    while !wait_wakeup(vm, cpu) {
        cpu.stats().waits.increment();
        cpu.waiting.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        let result = if wait_wakeup(vm, cpu) {
            Ok(())
        } else {
            scheduler.halt(cpu, Instant::now() + WAIT_SLICE)
        };
        cpu.waiting.store(false, Ordering::SeqCst);
        if let Err(e) = result {
            return Err(scheduler_failed(vm, cpu, e));
        }
    }
    Ok(())
}

/// 调度器失败意味着停机子系统已经不可信，让所有 EMT 退出
fn scheduler_failed(vm: &Vm, cpu: &VCpu, e: VmError) -> VmError {
    error!("EMT-{}: global scheduler halt failed: {e}", cpu.id());
    vm.request_terminate();
    VmError::Host(format!("global scheduler halt failed: {e}"))
}

impl Vm {
    /// 当前生效的停机策略
    pub fn halt_method(&self) -> HaltMethod {
        HaltMethod::from_u8(self.halt_method.load(Ordering::Acquire))
    }

    /// 客户机停机，直到有需要处理的强制动作
    pub(crate) fn wait_halted(&self, cpu: &VCpu) -> VmResult<()> {
        cpu.stats().halts.increment();
        let previous = cpu.state();
        cpu.set_state(VCpuState::Halted);
        let result = self.halt_method().halt(
            self,
            cpu,
            VmForcedActions::HALTED_MASK,
            CpuForcedActions::HALTED_MASK,
        );
        // 停机期间可能被关机的屏障改成了 Stopped
        if cpu.state() == VCpuState::Halted {
            cpu.set_state(previous);
        }
        cpu.ff.clear(CpuForcedActions::TIMER);
        result
    }

    /// VM 未运行时等待外部事件
    pub(crate) fn wait_for_event(&self, cpu: &VCpu) -> VmResult<()> {
        self.halt_method().wait(self, cpu)
    }

    /// 唤醒 `cpu` 的 EMT；`POKE` 会打断正在执行的 CPU
    pub fn notify_cpu(&self, cpu: &VCpu, flags: NotifyFlags) {
        self.halt_method().notify(self, cpu, flags);
    }

    /// 唤醒所有 EMT
    pub fn notify_all_cpus(&self, flags: NotifyFlags) {
        self.stats.wake_all.increment();
        let method = self.halt_method();
        for cpu in self.cpus() {
            method.notify(self, cpu, flags);
        }
    }

    /// 切换停机策略
    ///
    /// 通过升序屏障执行：每个 CPU 更新自己"能否在调度器中停机"的配置，
    /// CPU 0 终止旧策略并初始化新策略。
    pub fn set_halt_method(&self, method: HaltMethod) -> VmResult<()> {
        let resolved = method.resolve(self.backends().scheduler.is_some());
        if resolved == HaltMethod::Bootstrap {
            return Err(VmError::InvalidParameter(
                "the bootstrap halt method cannot be selected".into(),
            ));
        }

        self.emt_rendezvous(RendezvousKind::Ascending, true, move |vm, cpu| {
            let may_halt = vm
                .backends()
                .scheduler
                .as_ref()
                .is_some_and(|s| s.may_halt_in_scheduler(cpu.id()));
            cpu.set_may_halt_in_scheduler(may_halt);

            if cpu.id() == 0 {
                let old = vm.halt_method();
                old.term(vm);
                let active = resolved.init(vm)?;
                vm.halt_method.store(active as u8, Ordering::Release);
                info!("{}: halt method {old} -> {active}", vm.name());
            }
            Ok(EmStatus::Success)
        })?;
        Ok(())
    }
}
