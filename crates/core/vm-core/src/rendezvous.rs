//! EMT 屏障（rendezvous）
//!
//! 按固定的顺序规则在每个虚拟 CPU 的 EMT 上运行回调。生命周期操作建立在它之上：
//! 每个 CPU 完成迁移中属于自己的那部分，回调按 CPU 编号判断"第一个"和"最后一个"。
//!
//! 同一时刻只有一个屏障在进行。等待发起自己屏障的 EMT 会继续响应进行中的屏障，
//! 两个发起者不会互相死锁。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::cpu::VCpu;
use crate::error::{VmError, VmResult};
use crate::ff::{CpuForcedActions, NotifyFlags};
use crate::request::ReqTarget;
use crate::state::VmState;
use crate::status::{EmStatus, merge_results};
use crate::vm::Vm;

const POLL: Duration = Duration::from_millis(10);
const LOCK_POLL: Duration = Duration::from_millis(1);

/// 回调在各 CPU 上的分发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RendezvousKind {
    /// 只有发起的 EMT 运行回调，其他 EMT 等它完成
    Once,
    /// 所有 EMT 同时运行回调
    AllAtOnce,
    /// 所有 EMT 按到达顺序逐个运行回调
    OneByOne,
    /// 所有 EMT 依次运行回调，CPU 0 最先
    Ascending,
    /// 所有 EMT 依次运行回调，CPU N-1 最先
    Descending,
}

pub type RendezvousFn = Arc<dyn Fn(&Vm, &VCpu) -> VmResult<EmStatus> + Send + Sync>;

struct Session {
    generation: u64,
    kind: RendezvousKind,
    stop_on_error: bool,
    callback: RendezvousFn,
    initiator: u32,
    entered: u32,
    done: u32,
    returned: u32,
    /// 升序/降序中当前轮到的位置
    turn: u32,
    /// 逐个模式下有回调正在运行
    busy: bool,
    failed: bool,
    result: VmResult<EmStatus>,
}

impl Session {
    fn record(&mut self, result: VmResult<EmStatus>) {
        if result.is_err() {
            self.failed = true;
        }
        let acc = std::mem::replace(&mut self.result, Ok(EmStatus::Success));
        self.result = merge_results(acc, result);
    }

    fn skip_callback(&self) -> bool {
        self.failed && self.stop_on_error
    }
}

pub(crate) struct Rendezvous {
    locked: AtomicBool,
    session: Mutex<Option<Session>>,
    cond: Condvar,
    generations: Mutex<u64>,
}

impl Rendezvous {
    pub(crate) fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            session: Mutex::new(None),
            cond: Condvar::new(),
            generations: Mutex::new(0),
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn next_generation(&self) -> u64 {
        let mut generation = self.generations.lock();
        *generation += 1;
        *generation
    }
}

/// 在会话条件变量上等待 `ready` 成立；会话被替换或 VM 终止时放弃
fn wait_session<F>(
    vm: &Vm,
    guard: &mut MutexGuard<'_, Option<Session>>,
    generation: u64,
    ready: F,
) -> VmResult<()>
where
    F: Fn(&Session) -> bool,
{
    loop {
        match guard.as_ref() {
            Some(s) if s.generation == generation => {
                if ready(s) {
                    return Ok(());
                }
            }
            _ => return Err(VmError::Terminating),
        }
        if vm.is_terminating() {
            return Err(VmError::Terminating);
        }
        vm.rendezvous.cond.wait_for(guard, POLL);
    }
}

impl Vm {
    /// 按 `kind` 在各 EMT 上运行 `callback`
    ///
    /// 在非 EMT 线程上调用时整个操作转交给一个 EMT。结果是所有已运行回调中的
    /// 第一个错误，没有错误时取最严格的状态。`stop_on_error` 为真时第一个失败之后
    /// 的回调被跳过。
    pub fn emt_rendezvous<F>(
        &self,
        kind: RendezvousKind,
        stop_on_error: bool,
        callback: F,
    ) -> VmResult<EmStatus>
    where
        F: Fn(&Vm, &VCpu) -> VmResult<EmStatus> + Send + Sync + 'static,
    {
        let callback: RendezvousFn = Arc::new(callback);
        match self.current_cpu() {
            Some(cpu) => self.rendezvous_on(cpu, kind, stop_on_error, callback),
            None => {
                trace!("{}: forwarding {kind:?} rendezvous to an EMT", self.name());
                self.req_call_wait(ReqTarget::AnyIdle, move |vm, cpu| {
                    vm.rendezvous_on(cpu, kind, stop_on_error, Arc::clone(&callback))
                })
            }
        }
    }

    fn rendezvous_on(
        &self,
        cpu: &VCpu,
        kind: RendezvousKind,
        stop_on_error: bool,
        callback: RendezvousFn,
    ) -> VmResult<EmStatus> {
        if cpu.in_rendezvous.load(Ordering::Acquire) {
            warn!("EMT-{}: nested rendezvous refused", cpu.id());
            return Err(VmError::Deadlock);
        }

        // 没有其他 EMT 需要等
        if self.cpu_count() == 1
            || (self.state() == VmState::Destroying && self.active_emts() < self.cpu_count())
        {
            cpu.in_rendezvous.store(true, Ordering::Release);
            let result = callback(self, cpu);
            cpu.in_rendezvous.store(false, Ordering::Release);
            return result;
        }

        while !self.rendezvous.try_lock() {
            if self.is_terminating() {
                return Err(VmError::Terminating);
            }
            if cpu.ff.test_and_clear(CpuForcedActions::RENDEZVOUS) {
                let _ = self.rendezvous_ff(cpu);
            } else {
                cpu.event.wait_timeout(LOCK_POLL);
            }
        }

        let generation = self.rendezvous.next_generation();
        *self.rendezvous.session.lock() = Some(Session {
            generation,
            kind,
            stop_on_error,
            callback,
            initiator: cpu.id(),
            entered: 0,
            done: 0,
            returned: 0,
            turn: 0,
            busy: false,
            failed: false,
            result: Ok(EmStatus::Success),
        });
        debug!("EMT-{}: {kind:?} rendezvous #{generation} started", cpu.id());

        for other in self.cpus().iter().filter(|c| c.id() != cpu.id()) {
            other.ff.set(CpuForcedActions::RENDEZVOUS);
            self.notify_cpu(other, NotifyFlags::POKE);
        }

        let own = self.participate(cpu);

        let result = {
            let count = self.cpu_count();
            let mut guard = self.rendezvous.session.lock();
            let waited = wait_session(self, &mut guard, generation, |s| s.returned >= count);
            let session = guard.take();
            self.rendezvous.cond.notify_all();
            match (waited, session) {
                (Ok(()), Some(session)) => session.result,
                _ => {
                    warn!("EMT-{}: rendezvous #{generation} abandoned", cpu.id());
                    own.and(Err(VmError::Terminating))
                }
            }
        };
        self.rendezvous.unlock();
        debug!("EMT-{}: rendezvous #{generation} finished: {result:?}", cpu.id());
        result
    }

    /// 加入进行中的屏障；EMT 循环在本 CPU 的屏障标志置位时调用
    pub(crate) fn rendezvous_ff(&self, cpu: &VCpu) -> VmResult<EmStatus> {
        if cpu.in_rendezvous.load(Ordering::Acquire) {
            // 外层循环稍后会再处理
            cpu.ff.set(CpuForcedActions::RENDEZVOUS);
            return Ok(EmStatus::Success);
        }
        self.participate(cpu)
    }

    fn participate(&self, cpu: &VCpu) -> VmResult<EmStatus> {
        cpu.in_rendezvous.store(true, Ordering::Release);
        let result = self.participate_inner(cpu);
        cpu.in_rendezvous.store(false, Ordering::Release);
        result
    }

    fn participate_inner(&self, cpu: &VCpu) -> VmResult<EmStatus> {
        let count = self.cpu_count();
        let cond = &self.rendezvous.cond;
        let mut guard = self.rendezvous.session.lock();
        let Some(session) = guard.as_mut() else {
            return Ok(EmStatus::Success);
        };
        let generation = session.generation;
        let kind = session.kind;
        let initiator = session.initiator;
        let callback = Arc::clone(&session.callback);
        session.entered += 1;
        cpu.stats().rendezvous.increment();
        cond.notify_all();
        trace!("EMT-{}: entered rendezvous #{generation}", cpu.id());

        let outcome = match kind {
            RendezvousKind::Once => {
                wait_session(self, &mut guard, generation, |s| s.entered >= count).and_then(|_| {
                    if cpu.id() == initiator {
                        self.run_callback(cpu, &mut guard, generation, &callback)
                    } else {
                        wait_session(self, &mut guard, generation, |s| s.done >= 1)
                    }
                })
            }
            RendezvousKind::AllAtOnce => {
                wait_session(self, &mut guard, generation, |s| s.entered >= count)
                    .and_then(|_| self.run_callback(cpu, &mut guard, generation, &callback))
                    .and_then(|_| wait_session(self, &mut guard, generation, |s| s.done >= count))
            }
            RendezvousKind::OneByOne => {
                wait_session(self, &mut guard, generation, |s| !s.busy)
                    .and_then(|_| {
                        if let Some(s) = guard.as_mut() {
                            s.busy = true;
                        }
                        let ran = self.run_callback(cpu, &mut guard, generation, &callback);
                        if let Some(s) = guard.as_mut() {
                            s.busy = false;
                        }
                        cond.notify_all();
                        ran
                    })
                    .and_then(|_| wait_session(self, &mut guard, generation, |s| s.done >= count))
            }
            RendezvousKind::Ascending | RendezvousKind::Descending => {
                let position = match kind {
                    RendezvousKind::Ascending => cpu.id(),
                    _ => count - 1 - cpu.id(),
                };
                wait_session(self, &mut guard, generation, |s| s.turn == position)
                    .and_then(|_| self.run_callback(cpu, &mut guard, generation, &callback))
                    .and_then(|_| {
                        if let Some(s) = guard.as_mut() {
                            s.turn += 1;
                        }
                        cond.notify_all();
                        wait_session(self, &mut guard, generation, |s| s.done >= count)
                    })
            }
        };

        match guard.as_mut() {
            Some(s) if s.generation == generation => {
                s.returned += 1;
                cond.notify_all();
                match outcome {
                    Ok(()) => s.result.clone(),
                    Err(e) => Err(e),
                }
            }
            _ => Err(VmError::Terminating),
        }
    }
    /// 在会话解锁的情况下为 `cpu` 运行回调并记录结果
    fn run_callback(
        &self,
        cpu: &VCpu,
        guard: &mut MutexGuard<'_, Option<Session>>,
        generation: u64,
        callback: &RendezvousFn,
    ) -> VmResult<()> {
        let skip = guard.as_ref().is_some_and(Session::skip_callback);
        let result = if skip {
            None
        } else {
            Some(MutexGuard::unlocked(guard, || callback(self, cpu)))
        };
        match guard.as_mut() {
            Some(s) if s.generation == generation => {
                if let Some(result) = result {
                    s.record(result);
                }
                s.done += 1;
                self.rendezvous.cond.notify_all();
                Ok(())
            }
            _ => Err(VmError::Terminating),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_record_merges() {
        let mut session = Session {
            generation: 1,
            kind: RendezvousKind::AllAtOnce,
            stop_on_error: true,
            callback: Arc::new(|_: &Vm, _: &VCpu| Ok(EmStatus::Success)),
            initiator: 0,
            entered: 0,
            done: 0,
            returned: 0,
            turn: 0,
            busy: false,
            failed: false,
            result: Ok(EmStatus::Success),
        };
        session.record(Ok(EmStatus::Suspend));
        assert_eq!(session.result, Ok(EmStatus::Suspend));
        assert!(!session.skip_callback());
        session.record(Err(VmError::TryAgain));
        session.record(Ok(EmStatus::Off));
        assert_eq!(session.result, Err(VmError::TryAgain));
        assert!(session.skip_callback());
    }

    #[test]
    fn test_lock_is_exclusive() {
        let rendezvous = Rendezvous::new();
        assert!(rendezvous.try_lock());
        assert!(!rendezvous.try_lock());
        rendezvous.unlock();
        assert!(rendezvous.try_lock());
        assert_eq!(rendezvous.next_generation(), 1);
        assert_eq!(rendezvous.next_generation(), 2);
    }
}
