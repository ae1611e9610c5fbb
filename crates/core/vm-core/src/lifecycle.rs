//! VM 生命周期操作
//!
//! 需要所有 vCPU 一致观察到的操作（开机、关机、挂起、恢复、复位）都通过降序屏障实现：
//!
//! 1. 编号最大的 CPU 最先进入回调，尝试迁移到过渡状态（如 `Suspending`）；失败时
//!    其余 CPU 的回调被跳过
//! 2. 每个 CPU 完成自己那一份工作（标记启动/停止、清理本地强制动作）
//! 3. CPU 0 最后进入回调，通知设备并迁移到稳定状态（如 `Suspended`）
//!
//! 销毁只能在非 EMT 线程上发起。

use std::sync::atomic::Ordering;

use bitflags::bitflags;
use log::{debug, error, info, warn};

use crate::backend::ResetKind;
use crate::cpu::{VCpu, VCpuState};
use crate::error::{Transition, VmError, VmResult};
use crate::ff::{CpuForcedActions, NotifyFlags, VmForcedActions};
use crate::rendezvous::RendezvousKind;
use crate::request::ReqTarget;
use crate::state::VmState;
use crate::status::EmStatus;
use crate::vm::Vm;

/// 挂起原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SuspendReason {
    Invalid = 0,
    User,
    /// VM 自身（客户机或存档流程）发起
    Vm,
    RuntimeError,
    HostSuspend,
    HostBatteryLow,
}

impl SuspendReason {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => SuspendReason::User,
            2 => SuspendReason::Vm,
            3 => SuspendReason::RuntimeError,
            4 => SuspendReason::HostSuspend,
            5 => SuspendReason::HostBatteryLow,
            _ => SuspendReason::Invalid,
        }
    }
}

/// 恢复原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResumeReason {
    Invalid = 0,
    User,
    Vm,
    /// 从存档加载之后
    StateRestored,
    /// 保存完成之后
    StateSaved,
    HostResume,
}

impl ResumeReason {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ResumeReason::User,
            2 => ResumeReason::Vm,
            3 => ResumeReason::StateRestored,
            4 => ResumeReason::StateSaved,
            5 => ResumeReason::HostResume,
            _ => ResumeReason::Invalid,
        }
    }
}

bitflags! {
    /// 运行时错误的处理方式
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RuntimeErrorFlags: u32 {
        /// 致命：VM 停在 `FatalError`
        const FATAL = 1 << 0;
        /// 挂起 VM，原因记为 `RuntimeError`
        const SUSPEND = 1 << 1;
        /// 不等待处理完成（非 EMT 调用者把工作交给 EMT）
        const NO_WAIT = 1 << 2;
    }
}

/// 降序屏障里第一个进入回调的 CPU
fn is_first(vm: &Vm, cpu: &VCpu) -> bool {
    cpu.id() + 1 == vm.cpu_count()
}

/// 过渡状态检查：屏障中后进入的 CPU 必须看到先进入者设置的状态
fn expect_state(vm: &Vm, who: &str, expected: &[VmState]) -> VmResult<VmState> {
    let current = vm.state();
    if expected.contains(&current) {
        return Ok(current);
    }
    error!("{}: {who}: unexpected state {current}", vm.name());
    Err(VmError::UnexpectedUnstableState {
        who: who.to_string(),
        current,
    })
}

/// 屏障状态码只在 EMT 内部有意义
fn done(result: VmResult<EmStatus>) -> VmResult<()> {
    result.map(|_| ())
}

impl Vm {
    /// 开机：`Created` → `PoweringOn` → `Running`
    pub fn power_on(&self) -> VmResult<()> {
        debug!("{}: power on", self.name());
        done(self.emt_rendezvous(RendezvousKind::Descending, true, |vm, cpu| {
            if is_first(vm, cpu) {
                vm.try_set_state("power_on", &[(VmState::Created, VmState::PoweringOn)])?;
            }
            expect_state(vm, "power_on", &[VmState::PoweringOn])?;

            cpu.set_state(VCpuState::Started);

            if cpu.id() == 0 {
                vm.backends().devices.power_on(vm);
                vm.set_state(VmState::Running, VmState::PoweringOn);
                info!("{}: powered on", vm.name());
            }
            Ok(EmStatus::Success)
        }))
    }

    /// 挂起：`Running` → `Suspending` → `Suspended`，
    /// 或 `RunningLs` → `SuspendingExtLs` → `SuspendedExtLs`
    pub fn suspend(&self, reason: SuspendReason) -> VmResult<()> {
        if reason == SuspendReason::Invalid {
            return Err(VmError::InvalidParameter("invalid suspend reason".into()));
        }
        debug!("{}: suspend ({reason:?})", self.name());
        done(self.emt_rendezvous(RendezvousKind::Descending, true, move |vm, cpu| {
            if is_first(vm, cpu) {
                vm.try_set_state(
                    "suspend",
                    &[
                        (VmState::Running, VmState::Suspending),
                        (VmState::RunningLs, VmState::SuspendingExtLs),
                    ],
                )?;
                vm.suspend_reason.store(reason as u8, Ordering::Release);
            }
            expect_state(vm, "suspend", &[VmState::Suspending, VmState::SuspendingExtLs])?;

            if cpu.id() == 0 {
                vm.backends().devices.suspend(vm, reason);
                vm.try_set_state(
                    "suspend",
                    &[
                        (VmState::Suspending, VmState::Suspended),
                        (VmState::SuspendingExtLs, VmState::SuspendedExtLs),
                    ],
                )
                .map_err(|_| VmError::UnexpectedUnstableState {
                    who: "suspend".into(),
                    current: vm.state(),
                })?;
                info!("{}: suspended ({reason:?})", vm.name());
            }
            Ok(EmStatus::Suspend)
        }))
    }

    /// 最近一次挂起的原因；从未挂起时为 `Invalid`
    pub fn suspend_reason(&self) -> SuspendReason {
        SuspendReason::from_u8(self.suspend_reason.load(Ordering::Acquire))
    }

    /// 恢复：`Suspended` → `Resuming` → `Running`
    pub fn resume(&self, reason: ResumeReason) -> VmResult<()> {
        if reason == ResumeReason::Invalid {
            return Err(VmError::InvalidParameter("invalid resume reason".into()));
        }
        debug!("{}: resume ({reason:?})", self.name());
        done(self.emt_rendezvous(RendezvousKind::Descending, true, move |vm, cpu| {
            if is_first(vm, cpu) {
                vm.try_set_state("resume", &[(VmState::Suspended, VmState::Resuming)])?;
                vm.resume_reason.store(reason as u8, Ordering::Release);
            }
            expect_state(vm, "resume", &[VmState::Resuming])?;

            if cpu.id() == 0 {
                vm.backends().devices.resume(vm, reason);
                vm.set_state(VmState::Running, VmState::Resuming);
                vm.teleported_and_not_fully_resumed
                    .store(false, Ordering::Release);
                info!("{}: resumed ({reason:?})", vm.name());
            }
            Ok(EmStatus::Resume)
        }))
    }

    /// 最近一次恢复的原因；从未恢复时为 `Invalid`
    pub fn resume_reason(&self) -> ResumeReason {
        ResumeReason::from_u8(self.resume_reason.load(Ordering::Acquire))
    }

    /// 迁移出去之后尚未恢复运行
    pub fn teleported_and_not_fully_resumed(&self) -> bool {
        self.teleported_and_not_fully_resumed.load(Ordering::Acquire)
    }

    /// 关机，最终停在 `Off`（后台存档进行中时停在 `OffLs`）
    ///
    /// 可以从 `Created`、`Running`、`Suspended`、`Debugging`、`LoadFailure`、
    /// `GuruMeditation`、`FatalError` 及其后台存档影子状态发起。
    pub fn power_off(&self) -> VmResult<()> {
        debug!("{}: power off", self.name());
        done(self.emt_rendezvous(RendezvousKind::Descending, true, |vm, cpu| {
            if is_first(vm, cpu) {
                let index = vm.try_set_state(
                    "power_off",
                    &[
                        (VmState::Running, VmState::PoweringOff),
                        (VmState::Suspended, VmState::PoweringOff),
                        (VmState::Debugging, VmState::PoweringOff),
                        (VmState::LoadFailure, VmState::PoweringOff),
                        (VmState::GuruMeditation, VmState::PoweringOff),
                        (VmState::FatalError, VmState::PoweringOff),
                        (VmState::Created, VmState::PoweringOff),
                        (VmState::RunningLs, VmState::PoweringOffLs),
                        (VmState::DebuggingLs, VmState::PoweringOffLs),
                        (VmState::GuruMeditationLs, VmState::PoweringOffLs),
                        (VmState::FatalErrorLs, VmState::PoweringOffLs),
                    ],
                )?;
                // 后台存档还在跑
                if index > 7 && vm.backends().saved_state.cancel(vm) {
                    info!("{}: live save cancelled by power off", vm.name());
                }
            }
            let state = expect_state(vm, "power_off", &[VmState::PoweringOff, VmState::PoweringOffLs])?;

            cpu.set_state(VCpuState::Stopped);
            debug!("EMT-{}: stopped, {:?}", cpu.id(), cpu.stats().snapshot());

            if cpu.id() == 0 {
                vm.backends().devices.power_off(vm);
                let guard = vm.callbacks.at_state.lock();
                if state == VmState::PoweringOffLs {
                    vm.set_state_locked(&guard, VmState::OffLs, VmState::PoweringOffLs, false);
                } else {
                    vm.set_state_locked(&guard, VmState::Off, VmState::PoweringOff, false);
                }
                drop(guard);
                info!("{}: powered off", vm.name());
            }
            Ok(EmStatus::Off)
        }))
    }

    /// 硬复位
    ///
    /// 设置了"复位改为关机"时改为关机。挂起状态下复位后仍然是挂起；后台存档进行中时
    /// 复位后进入 `SuspendedLs`，由存档流程继续。
    pub fn reset(&self) -> VmResult<()> {
        self.reset_common(ResetKind::Hard)
    }

    /// 软复位，只支持单个 vCPU 的 VM
    ///
    /// `flags` 原样传给设备管理。
    pub fn soft_reset(&self, flags: u32) -> VmResult<()> {
        self.reset_common(ResetKind::Soft(flags))
    }

    fn reset_common(&self, kind: ResetKind) -> VmResult<()> {
        debug!("{}: reset ({kind:?})", self.name());
        match kind {
            ResetKind::Hard => {
                if self.power_off_instead_of_reset.load(Ordering::Acquire) {
                    info!("{}: reset turned into power off", self.name());
                    self.backends().hooks.notify_reset_turned_into_power_off(self);
                    return self.power_off();
                }
                done(self.emt_rendezvous(RendezvousKind::Descending, true, hard_reset))
            }
            ResetKind::Soft(flags) => {
                if self.cpu_count() > 1 {
                    let err = VmError::NotSupported(format!(
                        "soft reset with {} virtual CPUs",
                        self.cpu_count()
                    ));
                    self.set_error(&err, "soft_reset");
                    return Err(err);
                }
                done(self.emt_rendezvous(RendezvousKind::Descending, true, move |vm, cpu| {
                    soft_reset(vm, cpu, flags)
                }))
            }
        }
    }

    /// 请求一次延迟复位：EMT 下一轮处理强制动作时执行
    pub fn request_reset(&self) {
        debug!("{}: reset requested", self.name());
        self.ff.set(VmForcedActions::RESET);
        self.notify_all_cpus(NotifyFlags::POKE);
    }

    /// 处理 VM 级 `RESET` 强制动作（调用者已清除该标志）
    ///
    /// 复位方式由设备管理决定。
    pub(crate) fn reset_ff(&self, cpu: &VCpu) -> VmResult<EmStatus> {
        let kind = self.backends().devices.reset_kind(self);
        debug!("EMT-{}: servicing delayed {kind:?} reset", cpu.id());
        self.reset_common(kind)?;
        Ok(EmStatus::Reset)
    }

    /// 销毁 VM，只能从 `Off` 发起，并且不能在 EMT 上调用
    ///
    /// 所有 EMT 按降序退出循环，CPU 0 最后退出并拆除组件；随后回收线程，
    /// VM 进入 `Terminated`。之后再次销毁会失败。
    pub fn destroy(&self) -> VmResult<()> {
        if let Some(cpu) = self.current_cpu() {
            return Err(VmError::WrongThread(format!(
                "destroy called on EMT-{}",
                cpu.id()
            )));
        }
        self.try_set_state("destroy", &[(VmState::Off, VmState::Destroying)])?;
        info!("{}: destroying", self.name());

        let result = self.req_call_wait(ReqTarget::AllDescending, |vm, cpu| {
            if cpu.id() == 0 {
                vm.destroy_components();
            }
            vm.account_emt_exit(cpu);
            Ok(EmStatus::Terminate)
        });
        match result {
            // 最后一个 EMT 可能先于完成通知退出
            Ok(_) | Err(VmError::Terminating) => {}
            Err(e) => warn!("{}: destroy request failed: {e}", self.name()),
        }

        self.destroy_uvm(self.config().destroy_timeout());
        self.finish_destroy()
    }

    /// 执行引擎遇到不可恢复的内部错误
    ///
    /// 从 `Running`/`RunningLs` 无条件进入 guru meditation，置位 `CHECK_VM_STATE`
    /// 让其他 EMT 尽快停下，取消后台存档并唤醒所有 EMT。
    pub fn set_guru_meditation(&self) -> VmResult<()> {
        let guard = self.callbacks.at_state.lock();
        let current = self.state();
        let next = match current {
            VmState::Running => VmState::GuruMeditation,
            VmState::RunningLs => VmState::GuruMeditationLs,
            _ => {
                drop(guard);
                let err = VmError::InvalidState {
                    who: "guru_meditation".into(),
                    current,
                    attempted: vec![
                        Transition::new(VmState::Running, VmState::GuruMeditation),
                        Transition::new(VmState::RunningLs, VmState::GuruMeditationLs),
                    ],
                };
                self.set_error(&err, "guru_meditation");
                return Err(err);
            }
        };
        self.set_state_locked(&guard, next, current, true);
        drop(guard);

        error!("{}: guru meditation ({current} -> {next})", self.name());
        if self.backends().saved_state.cancel(self) {
            info!("{}: live save cancelled", self.name());
        }
        self.notify_all_cpus(NotifyFlags::POKE);
        Ok(())
    }

    /// 报告运行时错误
    ///
    /// `FATAL` 把 VM 停在 `FatalError`（后台存档中为 `FatalErrorLs` 并取消存档）；
    /// `SUSPEND` 在运行中时以 `RuntimeError` 为原因挂起。无论哪种都会计数并调用
    /// 运行时错误回调。`NO_WAIT` 由非 EMT 调用时，处理交给任意 EMT 异步完成。
    pub fn set_runtime_error(
        &self,
        flags: RuntimeErrorFlags,
        error_id: &str,
        message: &str,
    ) -> VmResult<()> {
        if flags.contains(RuntimeErrorFlags::FATAL) && flags.contains(RuntimeErrorFlags::SUSPEND) {
            return Err(VmError::InvalidParameter(
                "runtime error cannot be both fatal and suspending".into(),
            ));
        }
        if flags.contains(RuntimeErrorFlags::NO_WAIT) && self.current_cpu().is_none() {
            let error_id = error_id.to_string();
            let message = message.to_string();
            return self.req_call_void_no_wait(ReqTarget::AnyQueue, move |vm, _cpu| {
                if let Err(e) = vm.runtime_error_common(flags, &error_id, &message) {
                    warn!("{}: runtime error '{error_id}': {e}", vm.name());
                }
            });
        }
        self.runtime_error_common(flags, error_id, message)
    }

    fn runtime_error_common(
        &self,
        flags: RuntimeErrorFlags,
        error_id: &str,
        message: &str,
    ) -> VmResult<()> {
        warn!("{}: raising runtime error '{error_id}' ({flags:?})", self.name());

        let result = if flags.contains(RuntimeErrorFlags::FATAL) {
            done(self.emt_rendezvous(RendezvousKind::Descending, true, |vm, cpu| {
                if is_first(vm, cpu) {
                    let index = vm.try_set_state(
                        "runtime_error",
                        &[
                            (VmState::Running, VmState::FatalError),
                            (VmState::RunningLs, VmState::FatalErrorLs),
                        ],
                    )?;
                    if index == 2 {
                        vm.backends().saved_state.cancel(vm);
                    }
                    vm.ff.set(VmForcedActions::CHECK_VM_STATE);
                }
                Ok(EmStatus::Suspend)
            }))
        } else if flags.contains(RuntimeErrorFlags::SUSPEND) {
            // 磁盘写满之类的情况会连续报告多次，只在运行中时挂起
            if self.state().is_running() {
                self.suspend(SuspendReason::RuntimeError)
            } else {
                Ok(())
            }
        } else {
            Ok(())
        };

        let guard = self.callbacks.at_runtime_error.lock();
        self.stats.runtime_errors.increment();
        for callback in guard.snapshot() {
            callback(self, flags, error_id, message);
        }
        drop(guard);

        result
    }

    /// 进入调试器
    ///
    /// `Running`、`GuruMeditation` 进入 `Debugging`，后台存档中的对应状态进入 `DebuggingLs`。
    pub fn enter_debugging(&self) -> VmResult<()> {
        done(self.emt_rendezvous(RendezvousKind::Once, true, |vm, _cpu| {
            vm.try_set_state(
                "enter_debugging",
                &[
                    (VmState::Running, VmState::Debugging),
                    (VmState::RunningLs, VmState::DebuggingLs),
                    (VmState::GuruMeditation, VmState::Debugging),
                    (VmState::GuruMeditationLs, VmState::DebuggingLs),
                ],
            )?;
            Ok(EmStatus::Debug)
        }))
    }

    /// 离开调试器，回到运行
    pub fn leave_debugging(&self) -> VmResult<()> {
        done(self.emt_rendezvous(RendezvousKind::Once, true, |vm, _cpu| {
            vm.try_set_state(
                "leave_debugging",
                &[
                    (VmState::Debugging, VmState::Running),
                    (VmState::DebuggingLs, VmState::RunningLs),
                ],
            )?;
            Ok(EmStatus::Resume)
        }))
    }

    /// 热拔出 vCPU：在它自己的 EMT 上复位 CPU 状态并让它等待启动信号
    ///
    /// 不等待完成。EMT 仍然存在，继续参与屏障和请求处理。
    pub fn hot_unplug_cpu(&self, id: u32) -> VmResult<()> {
        self.cpu(id)?;
        info!("{}: hot unplugging vCPU {id}", self.name());
        self.req_call_no_wait(ReqTarget::Cpu(id), |vm, cpu| {
            debug!("EMT-{}: unplugged", cpu.id());
            cpu.set_online(false);
            cpu.ff.retain(CpuForcedActions::REQUEST | CpuForcedActions::RENDEZVOUS);
            vm.backends().engine.reset_cpu(cpu);
            vm.backends().devices.reset_cpu(vm, cpu);
            Ok(EmStatus::WaitSipi)
        })
    }

    /// 热插入 vCPU
    pub fn hot_plug_cpu(&self, id: u32) -> VmResult<()> {
        let cpu = self.cpu(id)?;
        info!("{}: hot plugging vCPU {id}", self.name());
        cpu.set_online(true);
        self.notify_cpu(cpu, NotifyFlags::empty());
        Ok(())
    }

    /// 设置执行上限（1..=100，单位为百分比）
    pub fn set_cpu_execution_cap(&self, cap: u32) -> VmResult<()> {
        if !(1..=100).contains(&cap) {
            return Err(VmError::InvalidParameter(format!(
                "execution cap {cap} is outside 1..=100"
            )));
        }
        debug!("{}: execution cap {cap}%", self.name());
        self.execution_cap.store(cap, Ordering::Release);
        Ok(())
    }

    pub fn cpu_execution_cap(&self) -> u32 {
        self.execution_cap.load(Ordering::Acquire)
    }

    /// 复位时改为关机
    pub fn set_power_off_instead_of_reset(&self, enabled: bool) {
        self.power_off_instead_of_reset
            .store(enabled, Ordering::Release);
    }

    pub fn power_off_instead_of_reset(&self) -> bool {
        self.power_off_instead_of_reset.load(Ordering::Acquire)
    }

    /// 在状态临界区内做一次已知合法的迁移
    pub(crate) fn set_state(&self, new: VmState, old: VmState) {
        let guard = self.callbacks.at_state.lock();
        let current = self.state();
        if current != old {
            warn!("{}: expected {old} before moving to {new}, found {current}", self.name());
            if !current.can_transition(new) {
                error!("{}: refusing {current} -> {new}", self.name());
                return;
            }
        }
        self.set_state_locked(&guard, new, current, false);
    }
}

/// 硬复位的屏障回调
fn hard_reset(vm: &Vm, cpu: &VCpu) -> VmResult<EmStatus> {
    if is_first(vm, cpu) {
        vm.try_set_state(
            "reset",
            &[
                (VmState::Running, VmState::Resetting),
                (VmState::Suspended, VmState::Resetting),
                (VmState::RunningLs, VmState::ResettingLs),
            ],
        )?;
        vm.stats.resets.increment();
        vm.stats.hard_resets.increment();
    }
    expect_state(vm, "reset", &[VmState::Resetting, VmState::ResettingLs])?;

    // 请求不能丢，其余的强制动作都作废
    cpu.ff.retain(CpuForcedActions::REQUEST);
    vm.backends().engine.reset_cpu(cpu);
    vm.backends().devices.reset_cpu(vm, cpu);

    if cpu.id() != 0 {
        return Ok(EmStatus::Reset);
    }

    vm.backends().devices.reset(vm);

    let guard = vm.callbacks.at_state.lock();
    let state = vm.state();
    if state == VmState::Resetting {
        let next = if vm.prev_state() == VmState::Suspended {
            VmState::Suspended
        } else {
            VmState::Running
        };
        vm.set_state_locked(&guard, next, VmState::Resetting, false);
    } else {
        vm.set_state_locked(&guard, VmState::SuspendingLs, VmState::ResettingLs, false);
    }
    drop(guard);
    info!("{}: hard reset done", vm.name());

    if state == VmState::Resetting {
        return Ok(EmStatus::Reset);
    }
    // 后台存档中：复位之后直接挂起，由存档流程继续
    vm.backends().devices.suspend(vm, SuspendReason::Vm);
    vm.set_state(VmState::SuspendedLs, VmState::SuspendingLs);
    Ok(EmStatus::Suspend)
}

/// 软复位的屏障回调
fn soft_reset(vm: &Vm, cpu: &VCpu, flags: u32) -> VmResult<EmStatus> {
    if is_first(vm, cpu) {
        vm.try_set_state(
            "soft_reset",
            &[
                (VmState::Running, VmState::SoftResetting),
                (VmState::Suspended, VmState::SoftResetting),
                (VmState::RunningLs, VmState::SoftResettingLs),
            ],
        )?;
        vm.stats.resets.increment();
        vm.stats.soft_resets.increment();
    }
    expect_state(vm, "soft_reset", &[VmState::SoftResetting, VmState::SoftResettingLs])?;

    if cpu.id() == 0 {
        vm.backends().devices.soft_reset(vm, flags);
        vm.backends().engine.reset_cpu(cpu);

        // 内存没有变化，后台存档不需要挂起
        let guard = vm.callbacks.at_state.lock();
        let state = vm.state();
        if state == VmState::SoftResetting {
            let next = if vm.prev_state() == VmState::Suspended {
                VmState::Suspended
            } else {
                VmState::Running
            };
            vm.set_state_locked(&guard, next, VmState::SoftResetting, false);
        } else {
            vm.set_state_locked(&guard, VmState::RunningLs, VmState::SoftResettingLs, false);
        }
        drop(guard);
        info!("{}: soft reset done (flags {flags:#x})", vm.name());
    }
    Ok(EmStatus::Reschedule)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reasons_round_trip_through_u8() {
        for reason in [
            SuspendReason::User,
            SuspendReason::Vm,
            SuspendReason::RuntimeError,
            SuspendReason::HostSuspend,
            SuspendReason::HostBatteryLow,
        ] {
            assert_eq!(SuspendReason::from_u8(reason as u8), reason);
        }
        for reason in [
            ResumeReason::User,
            ResumeReason::Vm,
            ResumeReason::StateRestored,
            ResumeReason::StateSaved,
            ResumeReason::HostResume,
        ] {
            assert_eq!(ResumeReason::from_u8(reason as u8), reason);
        }
        assert_eq!(SuspendReason::from_u8(200), SuspendReason::Invalid);
    }

    #[test]
    fn test_runtime_error_flags_debug() {
        let flags = RuntimeErrorFlags::SUSPEND | RuntimeErrorFlags::NO_WAIT;
        assert_eq!(format!("{flags:?}"), "RuntimeErrorFlags(SUSPEND | NO_WAIT)");
        assert!(!flags.contains(RuntimeErrorFlags::FATAL));
    }

    #[test]
    fn test_set_state_refuses_transition_outside_table() {
        use crate::backend::VmBackends;
        use crate::config::VmConfig;
        use crate::vm::VmHandle;

        let vm = VmHandle::create(VmConfig::new().with_cpu_count(1), VmBackends::new()).unwrap();
        assert_eq!(vm.state(), VmState::Created);

        // 期望的旧状态不符，且 Created -> Running 不在迁移表中
        vm.set_state(VmState::Running, VmState::PoweringOn);
        assert_eq!(vm.state(), VmState::Created);

        vm.power_off().unwrap();
        vm.destroy().unwrap();
    }
}
