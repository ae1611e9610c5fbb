//! VM 全局记录与句柄
//!
//! [`Vm`] 由所有 EMT 共享，保存当前状态、状态临界区、VM 级请求队列和强制动作、
//! 每个 vCPU 的记录以及外部协作者。调用方通过 [`VmHandle`] 持有它。
//!
//! # 创建流程
//!
//! 1. 校验配置，构造 `Vm`（状态 `Creating`，停机策略 `Bootstrap`）
//! 2. 为每个 vCPU 启动一个 EMT 线程
//! 3. 把构造请求投递到 VM 级队列；此时只有 EMT 0 处理 VM 级请求
//! 4. EMT 0 完成构造并把状态切到 `Created`

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;
use vm_common::{Config, LockFreeCounter};

use crate::backend::VmBackends;
use crate::callbacks::{CallbackGuard, Callbacks};
use crate::config::{MAX_CPUS, VmConfig};
use crate::cpu::VCpu;
use crate::error::{Transition, VmError, VmResult};
use crate::ff::{ForcedActions, NotifyFlags, VmForcedActions};
use crate::halt::HaltMethod;
use crate::lifecycle::{ResumeReason, SuspendReason};
use crate::rendezvous::Rendezvous;
use crate::request::{ReqTarget, RequestPool, RequestQueues};
use crate::state::VmState;
use crate::status::EmStatus;

/// VM 级计数器
#[derive(Debug, Default)]
pub struct VmStats {
    pub resets: LockFreeCounter,
    pub soft_resets: LockFreeCounter,
    pub hard_resets: LockFreeCounter,
    pub errors: LockFreeCounter,
    pub runtime_errors: LockFreeCounter,
    /// 唤醒全部 EMT 的次数
    pub wake_all: LockFreeCounter,
}

/// 复位计数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetCounts {
    pub total: u64,
    pub soft: u64,
    pub hard: u64,
}

/// VM 全局记录
pub struct Vm {
    name: String,
    uuid: Uuid,
    config: VmConfig,
    backends: VmBackends,

    state: AtomicU8,
    prev_state: AtomicU8,
    pub(crate) callbacks: Callbacks,

    cpus: Vec<VCpu>,
    pub(crate) ff: ForcedActions<VmForcedActions>,
    pub(crate) requests: RequestQueues,
    pub(crate) pool: RequestPool,
    pub(crate) rendezvous: Rendezvous,
    pub(crate) halt_method: AtomicU8,

    /// 构造完成，VM 对象可供所有 EMT 使用
    ready: AtomicBool,
    terminate: AtomicBool,
    active_emts: AtomicU32,
    components_destroyed: AtomicBool,
    threads: Mutex<Vec<Option<JoinHandle<()>>>>,
    holders: AtomicUsize,

    pub(crate) execution_cap: AtomicU32,
    pub(crate) power_off_instead_of_reset: AtomicBool,
    pub(crate) suspend_reason: AtomicU8,
    pub(crate) resume_reason: AtomicU8,
    pub(crate) teleported_and_not_fully_resumed: AtomicBool,
    pub(crate) stats: VmStats,
}

impl Vm {
    fn new(config: VmConfig, backends: VmBackends) -> Self {
        let cpus = (0..config.cpu_count).map(VCpu::new).collect();
        Self {
            name: config.name.clone(),
            uuid: Uuid::new_v4(),
            backends,
            state: AtomicU8::new(VmState::Creating as u8),
            prev_state: AtomicU8::new(VmState::Creating as u8),
            callbacks: Callbacks::new(),
            cpus,
            ff: ForcedActions::new(),
            requests: RequestQueues::new(),
            pool: RequestPool::new(config.max_outstanding_requests),
            rendezvous: Rendezvous::new(),
            halt_method: AtomicU8::new(HaltMethod::Bootstrap as u8),
            ready: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
            active_emts: AtomicU32::new(0),
            components_destroyed: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            holders: AtomicUsize::new(0),
            execution_cap: AtomicU32::new(config.execution_cap),
            power_off_instead_of_reset: AtomicBool::new(config.power_off_instead_of_reset),
            suspend_reason: AtomicU8::new(SuspendReason::Invalid as u8),
            resume_reason: AtomicU8::new(ResumeReason::Invalid as u8),
            teleported_and_not_fully_resumed: AtomicBool::new(false),
            stats: VmStats::default(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn backends(&self) -> &VmBackends {
        &self.backends
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpus.len() as u32
    }

    pub fn cpus(&self) -> &[VCpu] {
        &self.cpus
    }

    pub fn cpu(&self, id: u32) -> VmResult<&VCpu> {
        self.cpus.get(id as usize).ok_or(VmError::InvalidCpuId(id))
    }

    /// 调用线程对应的 vCPU；调用线程不是 EMT 时返回 `None`
    pub fn current_cpu(&self) -> Option<&VCpu> {
        let me = thread::current().id();
        self.cpus.iter().find(|cpu| cpu.thread_id() == Some(me))
    }

    /// 某个 vCPU 的 EMT 线程
    pub fn emt_thread_id(&self, id: u32) -> VmResult<Option<thread::ThreadId>> {
        self.cpu(id).map(VCpu::thread_id)
    }

    /// 仍在循环中的 EMT 数量
    pub fn active_emts(&self) -> u32 {
        self.active_emts.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_terminating(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// 让所有 EMT 尽快退出
    pub(crate) fn request_terminate(&self) {
        self.terminate.store(true, Ordering::Release);
        self.ff.set(VmForcedActions::CHECK_VM_STATE);
        self.notify_all_cpus(NotifyFlags::POKE);
    }

    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    pub fn error_count(&self) -> u64 {
        self.stats.errors.get()
    }

    pub fn runtime_error_count(&self) -> u64 {
        self.stats.runtime_errors.get()
    }

    pub fn reset_counts(&self) -> ResetCounts {
        ResetCounts {
            total: self.stats.resets.get(),
            soft: self.stats.soft_resets.get(),
            hard: self.stats.hard_resets.get(),
        }
    }

    // ===== 状态机 =====

    pub fn state(&self) -> VmState {
        VmState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 最近一次迁移之前的状态
    pub fn prev_state(&self) -> VmState {
        VmState::from_u8(self.prev_state.load(Ordering::Acquire))
    }

    pub fn state_name(state: VmState) -> &'static str {
        state.name()
    }

    /// 尝试一组 (from, to) 转换，按顺序取第一个起点等于当前状态的那个
    ///
    /// 成功时返回命中的转换序号（从 1 开始）。没有命中时状态不变，失败被记录到日志
    /// 并交给错误回调。
    ///
    /// # 错误
    ///
    /// - 某个 (from, to) 不在状态转换表中：`VmError::InvalidParameter`
    /// - 当前状态不是任何一个起点：`VmError::InvalidState`
    pub fn try_set_state(&self, who: &str, transitions: &[(VmState, VmState)]) -> VmResult<usize> {
        if let Some((from, to)) = transitions.iter().find(|(from, to)| !from.can_transition(*to)) {
            error!("{who}: illegal transition {from} -> {to} requested");
            return Err(VmError::InvalidParameter(format!(
                "{who}: {from} -> {to} is not a legal transition"
            )));
        }

        let guard = self.callbacks.at_state.lock();
        let current = self.state();
        if let Some(index) = transitions.iter().position(|(from, _)| *from == current) {
            let to = transitions[index].1;
            self.set_state_locked(&guard, to, current, false);
            return Ok(index + 1);
        }
        drop(guard);

        let attempted: Vec<Transition> = transitions
            .iter()
            .map(|(from, to)| Transition::new(*from, *to))
            .collect();
        for (i, t) in attempted.iter().enumerate() {
            error!("{who}: transition #{} {t} not taken", i + 1);
        }
        error!("{who}: current state is {current}");
        let err = VmError::InvalidState {
            who: who.to_string(),
            current,
            attempted,
        };
        self.set_error(&err, who);
        Err(err)
    }

    /// 无条件迁移到 `new`，调用者必须持有状态临界区
    ///
    /// `check_state` 为真时置位 VM 级 `CHECK_VM_STATE`，让其他 EMT 重新评估；
    /// 普通迁移清除该标志。
    pub(crate) fn set_state_locked(
        &self,
        guard: &CallbackGuard<'_, dyn Fn(&Vm, VmState, VmState) + Send + Sync>,
        new: VmState,
        old: VmState,
        check_state: bool,
    ) {
        debug_assert!(
            old.can_transition(new),
            "{}: {old} -> {new} is not in the transition table",
            self.name
        );
        debug!("{}: {old} -> {new}", self.name);
        self.prev_state.store(old as u8, Ordering::Release);
        self.state.store(new as u8, Ordering::Release);
        if check_state {
            self.ff.set(VmForcedActions::CHECK_VM_STATE);
        } else {
            self.ff.clear(VmForcedActions::CHECK_VM_STATE);
        }

        for callback in guard.snapshot() {
            callback(self, new, old);
            // 回调把 VM 带向了销毁，后面的通知已经没有意义
            if new != VmState::Destroying && self.state() == VmState::Destroying {
                break;
            }
        }
    }

    /// 报告一个错误：计数、记录日志并调用错误回调
    pub fn set_error(&self, err: &VmError, who: &str) {
        self.stats.errors.increment();
        warn!("{}: {who}: {err}", self.name);
        let guard = self.callbacks.at_error.lock();
        for callback in guard.snapshot() {
            callback(self, err, who);
        }
    }

    // ===== 创建与销毁 =====

    /// 在 EMT 0 上完成构造
    fn construct(&self, cpu0: &VCpu) -> VmResult<EmStatus> {
        self.ready.store(true, Ordering::Release);
        self.notify_all_cpus(NotifyFlags::empty());
        info!("{}: constructing on EMT-{}", self.name, cpu0.id());

        let result = self.construct_components();
        if let Err(e) = &result {
            error!("{}: construction failed: {e}", self.name);
            self.destroy_components();
        }
        result.map(|_| EmStatus::Success)
    }

    fn construct_components(&self) -> VmResult<()> {
        self.req_call_wait(ReqTarget::AllAscending, |vm, cpu| {
            vm.backends.engine.init_cpu(cpu)?;
            Ok(EmStatus::Success)
        })?;
        self.backends.devices.init(self)?;
        self.set_halt_method(self.config.halt_method)?;
        self.try_set_state("create", &[(VmState::Creating, VmState::Created)])?;
        Ok(())
    }

    /// 拆除各组件；只执行一次（EMT 0 退出或显式销毁时）
    pub(crate) fn destroy_components(&self) {
        if self.components_destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("{}: tearing down components", self.name);
        self.halt_method().term(self);
        self.backends.devices.term(self);
        self.backends.engine.term();
    }

    /// EMT 0 拆除组件前等待其他 EMT 离开执行引擎，最多等 `timeout`
    pub(crate) fn wait_for_other_emts(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.active_emts() > 1 {
            if Instant::now() >= deadline {
                warn!(
                    "{}: {} EMT(s) still active, tearing down anyway",
                    self.name,
                    self.active_emts() - 1
                );
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// EMT 退出计数；每个 EMT 无论走哪条路径都只扣减一次
    pub(crate) fn account_emt_exit(&self, cpu: &VCpu) {
        if !cpu.been_thru_destroy.swap(true, Ordering::AcqRel) {
            let left = self.active_emts.fetch_sub(1, Ordering::AcqRel) - 1;
            debug!("EMT-{}: accounted for exit, {left} EMT(s) left", cpu.id());
        }
    }

    /// 让所有 EMT 退出并回收线程，然后终结残留的请求
    ///
    /// 从编号最高的 CPU 开始通知，CPU 0 承担清理工作，最后才回收它以外的线程。
    pub(crate) fn destroy_uvm(&self, timeout: Duration) {
        self.terminate.store(true, Ordering::Release);
        self.ff.set(VmForcedActions::CHECK_VM_STATE);
        for cpu in self.cpus.iter().rev() {
            cpu.event.signal();
            self.notify_cpu(cpu, NotifyFlags::POKE);
        }

        let deadline = Instant::now() + timeout;
        let mut threads = std::mem::take(&mut *self.threads.lock());
        // EMT 0 等其他 EMT 退出后才拆除组件，所以最后回收
        for slot in threads.iter_mut().rev() {
            let Some(handle) = slot.take() else {
                continue;
            };
            let name = handle.thread().name().unwrap_or("EMT").to_string();
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("{}: {name} panicked", self.name);
                }
            } else {
                warn!("{}: {name} did not exit within {timeout:?}, detaching", self.name);
            }
        }

        self.kill_pending_requests();
        info!("{}: all EMTs gone ({} still active)", self.name, self.active_emts());
    }

    /// 进入 `Terminated` 并清理回调
    pub(crate) fn finish_destroy(&self) -> VmResult<()> {
        self.try_set_state("destroy", &[(VmState::Destroying, VmState::Terminated)])?;
        info!("{}: terminated", self.name);
        Ok(())
    }

    /// 强制进入 `Terminated`，只用于最后一个句柄释放时的兜底
    fn force_terminated(&self) {
        let _guard = self.callbacks.at_state.lock();
        let old = self.state();
        warn!("{}: forcing {old} -> {}", self.name, VmState::Terminated);
        self.prev_state.store(old as u8, Ordering::Release);
        self.state.store(VmState::Terminated as u8, Ordering::Release);
    }
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("state", &self.state())
            .field("cpus", &self.cpus.len())
            .field("active_emts", &self.active_emts())
            .finish_non_exhaustive()
    }
}

/// 用户持有的 VM 句柄
///
/// 克隆会增加持有者计数。最后一个句柄在非 EMT 线程上释放而 VM 尚未销毁时，
/// 会尽力关机并销毁 VM。
pub struct VmHandle {
    vm: Arc<Vm>,
}

impl VmHandle {
    /// 创建 VM：启动所有 EMT 并在 EMT 0 上完成构造
    ///
    /// # 示例
    ///
    /// ```rust,ignore
    /// let vm = VmHandle::create(VmConfig::new().with_cpu_count(2), VmBackends::new())?;
    /// vm.power_on()?;
    /// ```
    pub fn create(config: VmConfig, backends: VmBackends) -> VmResult<VmHandle> {
        if config.cpu_count > MAX_CPUS {
            return Err(VmError::TooManyCpus {
                requested: config.cpu_count,
                max: MAX_CPUS,
            });
        }
        config.validate()?;

        let vm = Arc::new(Vm::new(config, backends));
        info!(
            "{}: creating VM {} with {} vCPU(s)",
            vm.name,
            vm.uuid,
            vm.cpu_count()
        );

        vm.active_emts.store(vm.cpu_count(), Ordering::Release);
        for id in 0..vm.cpu_count() {
            let emt_vm = Arc::clone(&vm);
            let spawned = thread::Builder::new()
                .name(format!("EMT-{id}"))
                .stack_size(vm.config.emt_stack_size)
                .spawn(move || emt_vm.emt_main(id));
            match spawned {
                Ok(handle) => {
                    vm.cpus[id as usize].register_thread(handle.thread().id());
                    vm.threads.lock().push(Some(handle));
                }
                Err(e) => {
                    error!("{}: failed to spawn EMT-{id}: {e}", vm.name);
                    // 未启动的 EMT 不会自己扣减
                    for cpu in &vm.cpus[id as usize..] {
                        vm.account_emt_exit(cpu);
                    }
                    vm.destroy_uvm(vm.config.destroy_timeout());
                    return Err(VmError::Host(format!("failed to spawn EMT-{id}: {e}")));
                }
            }
        }

        let result = vm.req_call_wait(ReqTarget::AnyQueue, |vm, cpu| vm.construct(cpu));
        if let Err(e) = result {
            vm.destroy_uvm(vm.config.destroy_timeout());
            return Err(e);
        }

        vm.holders.store(1, Ordering::Release);
        info!("{}: created", vm.name);
        Ok(VmHandle { vm })
    }

    /// 当前持有者数量
    pub fn holders(&self) -> usize {
        self.vm.holders.load(Ordering::Acquire)
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }
}

impl Deref for VmHandle {
    type Target = Vm;

    fn deref(&self) -> &Vm {
        &self.vm
    }
}

impl Clone for VmHandle {
    fn clone(&self) -> Self {
        self.vm.holders.fetch_add(1, Ordering::AcqRel);
        Self {
            vm: Arc::clone(&self.vm),
        }
    }
}

impl fmt::Debug for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmHandle")
            .field("vm", &self.vm)
            .field("holders", &self.holders())
            .finish()
    }
}

impl Drop for VmHandle {
    fn drop(&mut self) {
        if self.vm.holders.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let vm = &self.vm;
        if vm.state() == VmState::Terminated || vm.current_cpu().is_some() {
            return;
        }

        warn!("{}: last handle released in state {}, destroying", vm.name, vm.state());
        if !matches!(vm.state(), VmState::Off | VmState::OffLs | VmState::Destroying) {
            let _ = vm.power_off();
        }
        if let Err(e) = vm.destroy() {
            warn!("{}: destroy on release failed: {e}", vm.name);
            vm.destroy_uvm(vm.config.destroy_timeout());
            vm.force_terminated();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_for_other_emts_times_out_while_emts_run() {
        let vm = VmHandle::create(VmConfig::new().with_cpu_count(3), VmBackends::new()).unwrap();
        assert!(!vm.wait_for_other_emts(Duration::from_millis(20)));

        vm.power_off().unwrap();
        vm.destroy().unwrap();
        assert_eq!(vm.active_emts(), 0);
        assert!(vm.wait_for_other_emts(Duration::from_millis(20)));
    }
}
