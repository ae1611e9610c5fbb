//! 保存、迁移（teleport）与加载 VM 状态
//!
//! 已挂起的 VM 在 EMT 0 上一次性保存（`Suspended` → `Saving` → `Suspended`）。
//! 运行中的 VM 走在线保存：第一遍在调用者线程上进行，客户机在 `RunningLs` 中继续运行；
//! 然后挂起所有 CPU（`SuspendingLs` → `SuspendedLs`），由 EMT 0 完成保存
//! （`Saving` → `Suspended`）。保存后不会自动恢复运行。
//!
//! 在线保存期间 VM 可能被挂起、复位、关机或遇到致命错误，这些都会让它停在一个影子
//! 状态里，保存流程结束时再映射回普通状态图。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::backend::{LiveSave, SaveAfter, SaveTarget};
use crate::error::{VmError, VmResult};
use crate::lifecycle::SuspendReason;
use crate::rendezvous::RendezvousKind;
use crate::request::ReqTarget;
use crate::state::VmState;
use crate::status::EmStatus;
use crate::vm::Vm;

/// [`Vm::save`] 使用的停机时间预算
pub const DEFAULT_MAX_DOWNTIME: Duration = Duration::from_millis(250);

/// VM 停在调试器中时两次挂起尝试之间的间隔
const TRY_AGAIN_DELAY: Duration = Duration::from_millis(250);

type LiveSlot = Arc<Mutex<Option<Box<dyn LiveSave>>>>;

fn check_target(target: &SaveTarget) -> VmResult<()> {
    match target {
        SaveTarget::File(path) if path.as_os_str().is_empty() => {
            Err(VmError::InvalidParameter("empty saved state file name".into()))
        }
        SaveTarget::Stream(peer) if peer.is_empty() => {
            Err(VmError::InvalidParameter("empty stream peer".into()))
        }
        _ => Ok(()),
    }
}

impl Vm {
    /// 保存 VM 状态
    ///
    /// 返回本次保存是否挂起了 VM。运行中保存的 VM 最终处于挂起状态，由调用者决定
    /// 是否恢复。
    ///
    /// # 错误
    ///
    /// - `WrongThread`：在 EMT 上调用
    /// - `InvalidState`：VM 既不是 `Running` 也不是 `Suspended`
    /// - `LivePoweredOff`、`LiveFatalError`、`LiveGuruMeditation`：在线保存期间 VM
    ///   离开了运行状态
    pub fn save(&self, target: SaveTarget, continue_afterwards: bool) -> VmResult<bool> {
        let after = if continue_afterwards {
            SaveAfter::Continue
        } else {
            SaveAfter::Destroy
        };
        self.save_teleport(target, after, DEFAULT_MAX_DOWNTIME)
    }

    /// 把 VM 在线迁移到 `target`，目标必须是流
    ///
    /// 在下一次恢复前，VM 报告
    /// [`teleported_and_not_fully_resumed`](Vm::teleported_and_not_fully_resumed)。
    pub fn teleport(&self, target: SaveTarget, max_downtime: Duration) -> VmResult<bool> {
        if !matches!(target, SaveTarget::Stream(_)) {
            return Err(VmError::InvalidParameter(format!(
                "teleport needs a stream, got {target}"
            )));
        }
        self.save_teleport(target, SaveAfter::Teleport, max_downtime)
    }

    fn save_teleport(
        &self,
        target: SaveTarget,
        after: SaveAfter,
        max_downtime: Duration,
    ) -> VmResult<bool> {
        if let Some(cpu) = self.current_cpu() {
            return Err(VmError::WrongThread(format!(
                "saving on EMT-{} would deadlock",
                cpu.id()
            )));
        }
        check_target(&target)?;
        info!("{}: saving to {target} ({after:?})", self.name());

        let slot: LiveSlot = Arc::new(Mutex::new(None));
        let start_slot = Arc::clone(&slot);
        self.req_call_wait(ReqTarget::Cpu(0), move |vm, _cpu| {
            vm.start_save(&target, after, max_downtime, &start_slot)
        })?;

        let Some(mut live) = slot.lock().take() else {
            return Ok(false);
        };

        let suspended = Arc::new(AtomicBool::new(false));
        let result = match live.step1(self) {
            Ok(()) => self.live_finish(live, &suspended),
            Err(e) => {
                warn!("{}: live save pass failed: {e}", self.name());
                let slot: LiveSlot = Arc::new(Mutex::new(Some(live)));
                self.live_done(&slot);

                let flag = Arc::clone(&suspended);
                let cleanup = self.emt_rendezvous(RendezvousKind::Once, false, move |vm, _cpu| {
                    live_step1_cleanup(vm, &flag)
                });
                match cleanup {
                    Err(cleanup) if e == VmError::Cancelled => Err(cleanup),
                    _ => Err(e),
                }
            }
        };

        let suspended = suspended.load(Ordering::Acquire);
        debug!("{}: save finished: {result:?}, suspended {suspended}", self.name());
        result.map(|()| suspended)
    }

    /// EMT 0：进入 `Saving` 或 `RunningLs` 并开始保存
    fn start_save(
        &self,
        target: &SaveTarget,
        after: SaveAfter,
        max_downtime: Duration,
        slot: &LiveSlot,
    ) -> VmResult<EmStatus> {
        let index = self.try_set_state(
            "save",
            &[
                (VmState::Suspended, VmState::Saving),
                (VmState::Running, VmState::RunningLs),
            ],
        )?;

        if index == 1 && after != SaveAfter::Teleport {
            let result = self.backends().saved_state.save(self, target, after);
            self.set_state(VmState::Suspended, VmState::Saving);
            return result.map(|()| EmStatus::Success);
        }

        if after == SaveAfter::Teleport {
            self.teleported_and_not_fully_resumed
                .store(true, Ordering::Release);
        }
        match self
            .backends()
            .saved_state
            .live_save(self, target, after, max_downtime)
        {
            Ok(live) => {
                *slot.lock() = Some(live);
                Ok(EmStatus::Success)
            }
            Err(e) => {
                self.teleported_and_not_fully_resumed
                    .store(false, Ordering::Release);
                if index == 1 {
                    self.set_state(VmState::Suspended, VmState::Saving);
                } else {
                    self.set_state(VmState::Running, VmState::RunningLs);
                }
                Err(e)
            }
        }
    }

    /// 为最后一遍挂起 VM，并把保存交给 EMT 0
    fn live_finish(&self, live: Box<dyn LiveSave>, suspended: &Arc<AtomicBool>) -> VmResult<()> {
        let mut result = Ok(EmStatus::Success);
        if self.state() != VmState::Saving {
            loop {
                let flag = Arc::clone(suspended);
                result = self.emt_rendezvous(RendezvousKind::Descending, true, move |vm, cpu| {
                    live_do_suspend(vm, cpu.id(), &flag)
                });
                if result != Err(VmError::TryAgain) {
                    break;
                }
                debug!("{}: VM is in the debugger, retrying suspend", self.name());
                std::thread::sleep(TRY_AGAIN_DELAY);
            }
        }

        let slot: LiveSlot = Arc::new(Mutex::new(Some(live)));
        match result {
            Ok(_) => {
                let step2 = Arc::clone(&slot);
                self.req_call_wait(ReqTarget::Cpu(0), move |vm, _cpu| {
                    vm.live_step2(&step2).map(|()| EmStatus::Success)
                })?;
                Ok(())
            }
            Err(e) => {
                self.live_done(&slot);
                Err(e)
            }
        }
    }

    /// EMT 0：所有 CPU 挂起后的最后一遍
    fn live_step2(&self, slot: &LiveSlot) -> VmResult<()> {
        let Some(mut live) = slot.lock().take() else {
            return Err(VmError::SavedState("live save handle already consumed".into()));
        };

        match self.state() {
            VmState::SuspendedLs => self.set_state(VmState::Saving, VmState::SuspendedLs),
            VmState::Saving => {}
            _ => self.set_state(VmState::Saving, VmState::SuspendedExtLs),
        }

        let result = live.step2(self);
        live.done(self);
        self.set_state(VmState::Suspended, VmState::Saving);
        info!("{}: live save complete", self.name());
        result
    }

    /// 在 EMT 0 上释放在线保存
    fn live_done(&self, slot: &LiveSlot) {
        let done = Arc::clone(slot);
        let result = self.req_call_void_wait(ReqTarget::Cpu(0), move |vm, _cpu| {
            if let Some(mut live) = done.lock().take() {
                live.done(vm);
            }
        });
        if let Err(e) = result {
            warn!("{}: releasing live save failed: {e}", self.name());
        }
    }

    /// 把存档加载到 `Created` 或 `Suspended` 的 VM 中，完成后处于挂起状态
    ///
    /// 失败时 VM 停在 `LoadFailure`，之后只能关机。`teleporting` 表示这是一次迁入。
    pub fn load(&self, source: SaveTarget, teleporting: bool) -> VmResult<()> {
        check_target(&source)?;
        info!("{}: loading from {source}", self.name());
        self.req_call_wait(ReqTarget::Cpu(0), move |vm, _cpu| {
            vm.load_on_emt(&source, teleporting)
                .map(|()| EmStatus::Success)
        })?;
        Ok(())
    }

    fn load_on_emt(&self, source: &SaveTarget, teleporting: bool) -> VmResult<()> {
        self.try_set_state(
            "load",
            &[
                (VmState::Created, VmState::Loading),
                (VmState::Suspended, VmState::Loading),
            ],
        )?;
        self.teleported_and_not_fully_resumed
            .store(teleporting, Ordering::Release);

        let errors_before = self.error_count();
        match self.backends().saved_state.load(self, source) {
            Ok(()) => {
                self.set_state(VmState::Suspended, VmState::Loading);
                info!("{}: state restored from {source}", self.name());
                Ok(())
            }
            Err(e) => {
                self.teleported_and_not_fully_resumed
                    .store(false, Ordering::Release);
                self.set_state(VmState::LoadFailure, VmState::Loading);
                let err = VmError::SavedState(format!(
                    "unable to restore the saved state from {source}: {e}"
                ));
                // 存档引擎可能已经报告了更具体的错误
                if self.error_count() == errors_before {
                    self.set_error(&err, "load");
                }
                Err(err)
            }
        }
    }
}

/// 在线保存第一遍结束后挂起 VM 的屏障回调
fn live_do_suspend(vm: &Vm, id: u32, suspended: &AtomicBool) -> VmResult<EmStatus> {
    if id + 1 == vm.cpu_count() {
        let guard = vm.callbacks.at_state.lock();
        let state = vm.state();
        let outcome = match state {
            VmState::RunningLs => {
                vm.set_state_locked(&guard, VmState::SuspendingLs, state, false);
                Ok(())
            }
            // 在线保存期间被用户挂起或被复位挂起
            VmState::SuspendedExtLs | VmState::SuspendedLs => Ok(()),
            VmState::DebuggingLs => Err(VmError::TryAgain),
            VmState::OffLs => {
                vm.set_state_locked(&guard, VmState::Off, state, false);
                Err(VmError::LivePoweredOff)
            }
            VmState::FatalErrorLs => {
                vm.set_state_locked(&guard, VmState::FatalError, state, false);
                Err(VmError::LiveFatalError)
            }
            VmState::GuruMeditationLs => {
                vm.set_state_locked(&guard, VmState::GuruMeditation, state, false);
                Err(VmError::LiveGuruMeditation)
            }
            current => Err(VmError::UnexpectedUnstableState {
                who: "live_suspend".into(),
                current,
            }),
        };
        drop(guard);
        if let Err(e) = outcome {
            debug!("{}: live suspend refused in {state}: {e}", vm.name());
            return Err(e);
        }
    }

    let state = vm.state();
    if !matches!(
        state,
        VmState::SuspendingLs | VmState::SuspendedLs | VmState::SuspendedExtLs
    ) {
        return Err(VmError::UnexpectedUnstableState {
            who: "live_suspend".into(),
            current: state,
        });
    }

    if id == 0 && state == VmState::SuspendingLs {
        vm.backends().devices.suspend(vm, SuspendReason::Vm);
        vm.try_set_state("live_suspend", &[(VmState::SuspendingLs, VmState::SuspendedLs)])
            .map_err(|_| VmError::UnexpectedUnstableState {
                who: "live_suspend".into(),
                current: vm.state(),
            })?;
        suspended.store(true, Ordering::Release);
    }
    Ok(EmStatus::Suspend)
}

/// 把在线保存失败留下的影子状态映射回普通状态图
fn live_step1_cleanup(vm: &Vm, suspended: &AtomicBool) -> VmResult<EmStatus> {
    let index = vm.try_set_state(
        "live_cleanup",
        &[
            (VmState::OffLs, VmState::Off),
            (VmState::FatalErrorLs, VmState::FatalError),
            (VmState::GuruMeditationLs, VmState::GuruMeditation),
            (VmState::SuspendedLs, VmState::Suspended),
            (VmState::Saving, VmState::Suspended),
            (VmState::SuspendedExtLs, VmState::Suspended),
            (VmState::RunningLs, VmState::Running),
            (VmState::DebuggingLs, VmState::Debugging),
        ],
    )?;
    match index {
        1 => Err(VmError::LivePoweredOff),
        2 => Err(VmError::LiveFatalError),
        3 => Err(VmError::LiveGuruMeditation),
        4 => {
            suspended.store(true, Ordering::Release);
            Ok(EmStatus::Success)
        }
        _ => Ok(EmStatus::Success),
    }
}
