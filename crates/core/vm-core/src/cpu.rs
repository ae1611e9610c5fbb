//! 虚拟 CPU 记录
//!
//! [`VCpu`] 在整个生命周期内归 [`Vm`](crate::Vm) 所有。只有它的 EMT 代表它执行；
//! 其他线程可以读取它、置位强制动作标志、向它投递请求或唤醒它。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::ThreadId;

use parking_lot::Mutex;
use serde::Serialize;
use vm_common::LockFreeCounter;

use crate::event::WaitEvent;
use crate::ff::{CpuForcedActions, ForcedActions};
use crate::halt::HaltScratch;
use crate::request::RequestQueues;

/// 单个虚拟 CPU 的执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VCpuState {
    /// 未开机或已关机
    Stopped = 0,
    /// 已开机，可以执行客户机代码
    Started,
    /// 正在执行引擎内
    Executing,
    /// 客户机停机，EMT 处于停机策略中
    Halted,
}

impl VCpuState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => VCpuState::Started,
            2 => VCpuState::Executing,
            3 => VCpuState::Halted,
            _ => VCpuState::Stopped,
        }
    }
}

/// 每个虚拟 CPU 的计数器
#[derive(Debug, Default)]
pub struct CpuStats {
    pub halts: LockFreeCounter,
    pub halt_blocks: LockFreeCounter,
    pub halt_spins: LockFreeCounter,
    pub halt_yields: LockFreeCounter,
    pub waits: LockFreeCounter,
    pub requests: LockFreeCounter,
    pub quanta: LockFreeCounter,
    pub rendezvous: LockFreeCounter,
}

/// [`CpuStats`] 的快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuStatsSnapshot {
    pub halts: u64,
    pub halt_blocks: u64,
    pub halt_spins: u64,
    pub halt_yields: u64,
    pub waits: u64,
    pub requests: u64,
    pub quanta: u64,
    pub rendezvous: u64,
}

impl CpuStats {
    pub fn snapshot(&self) -> CpuStatsSnapshot {
        CpuStatsSnapshot {
            halts: self.halts.get(),
            halt_blocks: self.halt_blocks.get(),
            halt_spins: self.halt_spins.get(),
            halt_yields: self.halt_yields.get(),
            waits: self.waits.get(),
            requests: self.requests.get(),
            quanta: self.quanta.get(),
            rendezvous: self.rendezvous.get(),
        }
    }
}

pub struct VCpu {
    id: u32,
    state: AtomicU8,
    online: AtomicBool,
    pub(crate) ff: ForcedActions<CpuForcedActions>,
    pub(crate) requests: RequestQueues,
    /// EMT 停机或等待时阻塞的事件
    pub(crate) event: WaitEvent,
    /// EMT 停机或等待期间置位，需要发信号才能唤醒
    pub(crate) waiting: AtomicBool,
    thread_id: OnceLock<ThreadId>,
    /// 本 EMT 已从活动 EMT 计数中扣除
    pub(crate) been_thru_destroy: AtomicBool,
    pub(crate) in_rendezvous: AtomicBool,
    may_halt_in_scheduler: AtomicBool,
    pub(crate) halt: Mutex<HaltScratch>,
    stats: CpuStats,
}

impl VCpu {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            state: AtomicU8::new(VCpuState::Stopped as u8),
            online: AtomicBool::new(true),
            ff: ForcedActions::new(),
            requests: RequestQueues::new(),
            event: WaitEvent::new(),
            waiting: AtomicBool::new(false),
            thread_id: OnceLock::new(),
            been_thru_destroy: AtomicBool::new(false),
            in_rendezvous: AtomicBool::new(false),
            may_halt_in_scheduler: AtomicBool::new(false),
            halt: Mutex::new(HaltScratch::default()),
            stats: CpuStats::default(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> VCpuState {
        VCpuState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: VCpuState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// 热拔出后为假，直到重新插入
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// VM 运行时本 EMT 是否执行客户机代码
    pub fn can_execute(&self) -> bool {
        self.is_online() && matches!(self.state(), VCpuState::Started | VCpuState::Executing)
    }

    /// 运行本 CPU 的 EMT 的原生线程
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.thread_id.get().copied()
    }

    pub(crate) fn register_thread(&self, id: ThreadId) {
        let _ = self.thread_id.set(id);
    }

    pub fn forced_actions(&self) -> &ForcedActions<CpuForcedActions> {
        &self.ff
    }

    /// EMT 当前是否阻塞在停机或等待中
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn may_halt_in_scheduler(&self) -> bool {
        self.may_halt_in_scheduler.load(Ordering::Acquire)
    }

    pub(crate) fn set_may_halt_in_scheduler(&self, allowed: bool) {
        self.may_halt_in_scheduler.store(allowed, Ordering::Release);
    }

    pub(crate) fn has_pending_requests(&self) -> bool {
        !self.requests.is_empty()
    }

    pub fn stats(&self) -> &CpuStats {
        &self.stats
    }
}

impl std::fmt::Debug for VCpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VCpu")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("online", &self.is_online())
            .field("ff", &self.ff)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_cpu_is_stopped_and_online() {
        let cpu = VCpu::new(3);
        assert_eq!(cpu.id(), 3);
        assert_eq!(cpu.state(), VCpuState::Stopped);
        assert!(cpu.is_online());
        assert!(!cpu.can_execute());
        assert!(cpu.thread_id().is_none());
    }

    #[test]
    fn test_can_execute_requires_online() {
        let cpu = VCpu::new(0);
        cpu.set_state(VCpuState::Started);
        assert!(cpu.can_execute());
        cpu.set_online(false);
        assert!(!cpu.can_execute());
    }

    #[test]
    fn test_thread_registration_is_sticky() {
        let cpu = VCpu::new(0);
        let me = std::thread::current().id();
        cpu.register_thread(me);
        let other = std::thread::spawn(|| std::thread::current().id()).join().unwrap();
        cpu.register_thread(other);
        assert_eq!(cpu.thread_id(), Some(me));
    }
}
