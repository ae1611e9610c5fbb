//! 跨线程请求包
//!
//! 请求是某个线程希望在指定 EMT（或任意 EMT）上执行的闭包。请求包取自无锁回收池，
//! 经由各目标的无锁队列投递，并且恰好完成一次。
//!
//! # 示例
//!
//! ```rust,ignore
//! // 在 CPU 1 上运行闭包并等待其状态
//! let status = vm.req_call_wait(ReqTarget::Cpu(1), |_vm, cpu| {
//!     log::info!("running on EMT-{}", cpu.id());
//!     Ok(EmStatus::Success)
//! })?;
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use vm_common::{AtomicList, LockFreeCounter};

use crate::cpu::VCpu;
use crate::error::{VmError, VmResult};
use crate::ff::{CpuForcedActions, NotifyFlags, VmForcedActions};
use crate::status::{EmStatus, merge_results};
use crate::vm::Vm;

/// 回收池划分的空闲链表数
const REQ_FREE_LISTS: usize = 8;
/// 缓存超过这个数量的请求包直接释放
const REQ_MAX_CACHED: usize = 128;
/// 等待时的时间片，EMT 等待者借此继续响应屏障和请求
const REQ_WAIT_SLICE: Duration = Duration::from_millis(10);

/// 请求的执行目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReqTarget {
    /// 指定的虚拟 CPU；调用者就是该 CPU 的 EMT 时直接执行
    Cpu(u32),
    /// 经 VM 级队列交给任意 EMT；调用者本身是 EMT 时拒绝
    AnyIdle,
    /// 经 VM 级队列交给任意 EMT，任何线程都可调用
    AnyQueue,
    /// 依次在每个 CPU 上执行，0 到 N-1
    AllAscending,
    /// 依次在每个 CPU 上执行，N-1 到 0
    AllDescending,
}

impl ReqTarget {
    pub fn is_vm_wide(self) -> bool {
        matches!(self, ReqTarget::AnyIdle | ReqTarget::AnyQueue)
    }

    pub fn is_all(self) -> bool {
        matches!(self, ReqTarget::AllAscending | ReqTarget::AllDescending)
    }
}

bitflags! {
    /// 请求选项
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReqFlags: u32 {
        /// 走目标的优先队列
        const PRIORITY = 1 << 0;
        /// 调用者不等待，由执行方释放请求包
        const NO_WAIT = 1 << 1;
        /// 函数本身不返回状态
        const VOID = 1 << 2;
        /// 目标正在执行客户机代码时打断它
        const POKE = 1 << 3;
    }
}

/// 请求包的生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReqState {
    Free = 0,
    Allocated,
    Queued,
    Processing,
    Completed,
    Invalid,
}

impl ReqState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReqState::Free,
            1 => ReqState::Allocated,
            2 => ReqState::Queued,
            3 => ReqState::Processing,
            4 => ReqState::Completed,
            _ => ReqState::Invalid,
        }
    }
}

impl fmt::Display for ReqState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReqState::Free => "free",
            ReqState::Allocated => "allocated",
            ReqState::Queued => "queued",
            ReqState::Processing => "processing",
            ReqState::Completed => "completed",
            ReqState::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

type OnceFn = Box<dyn FnOnce(&Vm, &VCpu) -> VmResult<EmStatus> + Send>;
type SharedFn = Arc<dyn Fn(&Vm, &VCpu) -> VmResult<EmStatus> + Send + Sync>;

/// 请求携带的工作
///
/// `Shared` 函数可以投递给多个 CPU，"所有 CPU"类目标必须使用它。
pub enum ReqFn {
    Once(OnceFn),
    Shared(SharedFn),
}

impl ReqFn {
    pub fn once<F>(f: F) -> Self
    where
        F: FnOnce(&Vm, &VCpu) -> VmResult<EmStatus> + Send + 'static,
    {
        ReqFn::Once(Box::new(f))
    }

    pub fn shared<F>(f: F) -> Self
    where
        F: Fn(&Vm, &VCpu) -> VmResult<EmStatus> + Send + Sync + 'static,
    {
        ReqFn::Shared(Arc::new(f))
    }

    pub fn void<F>(f: F) -> Self
    where
        F: FnOnce(&Vm, &VCpu) + Send + 'static,
    {
        ReqFn::once(move |vm, cpu| {
            f(vm, cpu);
            Ok(EmStatus::Success)
        })
    }

    pub fn void_shared<F>(f: F) -> Self
    where
        F: Fn(&Vm, &VCpu) + Send + Sync + 'static,
    {
        ReqFn::shared(move |vm, cpu| {
            f(vm, cpu);
            Ok(EmStatus::Success)
        })
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, ReqFn::Shared(_))
    }

    fn call(self, vm: &Vm, cpu: &VCpu) -> VmResult<EmStatus> {
        match self {
            ReqFn::Once(f) => f(vm, cpu),
            ReqFn::Shared(f) => f(vm, cpu),
        }
    }
}

impl fmt::Debug for ReqFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReqFn::Once(_) => f.write_str("ReqFn::Once(..)"),
            ReqFn::Shared(_) => f.write_str("ReqFn::Shared(..)"),
        }
    }
}

struct RequestInner {
    target: ReqTarget,
    flags: ReqFlags,
    func: Option<ReqFn>,
    result: Option<VmResult<EmStatus>>,
    /// "所有 CPU"请求拆分出的各 CPU 请求包指向原请求
    parent: Option<Arc<Request>>,
}

impl Default for RequestInner {
    fn default() -> Self {
        Self {
            target: ReqTarget::AnyQueue,
            flags: ReqFlags::empty(),
            func: None,
            result: None,
            parent: None,
        }
    }
}

/// 请求包，通过 [`RequestHandle`] 访问
pub struct Request {
    state: AtomicU8,
    completions: AtomicU32,
    pending_children: AtomicU32,
    inner: Mutex<RequestInner>,
    done: Mutex<bool>,
    done_cv: Condvar,
    /// 所属池的计数
    owner: Arc<PoolAccounting>,
}

impl Request {
    fn new(owner: Arc<PoolAccounting>) -> Self {
        Self {
            state: AtomicU8::new(ReqState::Allocated as u8),
            completions: AtomicU32::new(0),
            pending_children: AtomicU32::new(0),
            inner: Mutex::new(RequestInner::default()),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
            owner,
        }
    }

    fn state(&self) -> ReqState {
        ReqState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ReqState, to: ReqState) -> Result<(), ReqState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ReqState::from_u8)
    }

    fn prepare(&self, target: ReqTarget, flags: ReqFlags, func: ReqFn) {
        {
            let mut inner = self.inner.lock();
            inner.target = target;
            inner.flags = flags;
            inner.func = Some(func);
            inner.result = None;
            inner.parent = None;
        }
        self.completions.store(0, Ordering::Relaxed);
        self.pending_children.store(0, Ordering::Relaxed);
        *self.done.lock() = false;
        self.state.store(ReqState::Allocated as u8, Ordering::Release);
    }

    /// 清空目标和工作，不把内容带给下一个使用者
    fn reset(&self) {
        *self.inner.lock() = RequestInner::default();
        self.completions.store(0, Ordering::Relaxed);
        self.pending_children.store(0, Ordering::Relaxed);
        *self.done.lock() = false;
        self.state.store(ReqState::Free as u8, Ordering::Release);
    }

    fn routing(&self) -> (ReqTarget, ReqFlags) {
        let inner = self.inner.lock();
        (inner.target, inner.flags)
    }

    fn store_result(&self, result: VmResult<EmStatus>) {
        let mut inner = self.inner.lock();
        inner.result = Some(match inner.result.take() {
            None => result,
            Some(prev) => merge_results(prev, result),
        });
    }

    /// 标记完成并唤醒等待者；有父请求时返回它
    fn signal_completed(&self) -> Option<Arc<Request>> {
        let parent = self.inner.lock().parent.take();
        self.completions.fetch_add(1, Ordering::AcqRel);
        let mut done = self.done.lock();
        *done = true;
        self.state.store(ReqState::Completed as u8, Ordering::Release);
        self.done_cv.notify_all();
        parent
    }

    pub(crate) fn complete(&self, result: VmResult<EmStatus>) {
        self.store_result(result.clone());
        if let Some(parent) = self.signal_completed() {
            parent.child_finished(result, 1);
        }
    }

    /// 记录 `count` 个已完成（或永远不会入队）的拆分请求包
    fn child_finished(&self, result: VmResult<EmStatus>, count: u32) {
        self.store_result(result);
        if self.pending_children.fetch_sub(count, Ordering::AcqRel) == count {
            let _ = self.signal_completed();
        }
    }

    /// 最多等待 `timeout`，完成时返回真
    fn wait_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.done_cv.wait_until(&mut done, deadline).timed_out() {
                break;
            }
        }
        *done
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        // 在空闲链表之外销毁的请求包同样计为已释放
        if ReqState::from_u8(*self.state.get_mut()) != ReqState::Free {
            self.owner.retire();
        }
    }
}

/// 调用者持有的请求句柄
pub struct RequestHandle(Arc<Request>);

impl RequestHandle {
    pub fn state(&self) -> ReqState {
        self.0.state()
    }

    pub fn target(&self) -> ReqTarget {
        self.0.routing().0
    }

    pub fn flags(&self) -> ReqFlags {
        self.0.routing().1
    }

    /// 完成后的函数结果
    pub fn result(&self) -> Option<VmResult<EmStatus>> {
        if self.state() != ReqState::Completed {
            return None;
        }
        self.0.inner.lock().result.clone()
    }

    /// 完成事件触发的次数，只会是 0 或 1
    pub fn completions(&self) -> u32 {
        self.0.completions.load(Ordering::Acquire)
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (target, flags) = self.0.routing();
        f.debug_struct("RequestHandle")
            .field("state", &self.state())
            .field("target", &target)
            .field("flags", &flags)
            .finish()
    }
}

/// 一个目标的优先队列和普通队列
pub(crate) struct RequestQueues {
    priority: AtomicList<Arc<Request>>,
    normal: AtomicList<Arc<Request>>,
}

impl RequestQueues {
    pub(crate) fn new() -> Self {
        Self {
            priority: AtomicList::new(),
            normal: AtomicList::new(),
        }
    }

    fn push(&self, req: Arc<Request>, priority: bool) {
        if priority {
            self.priority.push(req);
        } else {
            self.normal.push(req);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.normal.is_empty()
    }

    /// 最早的优先请求包，没有时取最早的普通请求包
    fn take_oldest(&self) -> Option<Arc<Request>> {
        Self::take_oldest_from(&self.priority).or_else(|| Self::take_oldest_from(&self.normal))
    }

    fn take_oldest_from(list: &AtomicList<Arc<Request>>) -> Option<Arc<Request>> {
        let mut chain = list.take_all();
        let oldest = chain.pop_back();
        if !chain.is_empty() {
            list.push_back_chain(chain);
        }
        oldest
    }

    fn drain(&self) -> Vec<Arc<Request>> {
        let mut all: Vec<_> = self.priority.take_all().collect();
        all.extend(self.normal.take_all());
        all
    }
}

/// 请求包池统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestPoolStats {
    pub allocs: u64,
    pub frees: u64,
    /// 新建请求包的分配次数
    pub fresh: u64,
    /// 从空闲链表取得的分配次数
    pub recycled: u64,
    /// 当前缓存在空闲链表中的请求包
    pub cached: usize,
    /// 已分配尚未归还的请求包
    pub outstanding: usize,
}

/// 池与其分出的每个请求包共享的计数
struct PoolAccounting {
    outstanding: AtomicUsize,
    frees: LockFreeCounter,
}

impl PoolAccounting {
    fn retire(&self) {
        self.frees.increment();
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// 无锁回收池
pub(crate) struct RequestPool {
    free: [AtomicList<Arc<Request>>; REQ_FREE_LISTS],
    next_free: AtomicUsize,
    cached: AtomicUsize,
    accounting: Arc<PoolAccounting>,
    max_outstanding: usize,
    allocs: LockFreeCounter,
    fresh: LockFreeCounter,
    recycled: LockFreeCounter,
}

impl RequestPool {
    pub(crate) fn new(max_outstanding: usize) -> Self {
        Self {
            free: std::array::from_fn(|_| AtomicList::new()),
            next_free: AtomicUsize::new(0),
            cached: AtomicUsize::new(0),
            accounting: Arc::new(PoolAccounting {
                outstanding: AtomicUsize::new(0),
                frees: LockFreeCounter::new(0),
            }),
            max_outstanding,
            allocs: LockFreeCounter::new(0),
            fresh: LockFreeCounter::new(0),
            recycled: LockFreeCounter::new(0),
        }
    }

    fn alloc(&self, target: ReqTarget, flags: ReqFlags, func: ReqFn) -> VmResult<Arc<Request>> {
        self.allocs.increment();
        let outstanding = self.accounting.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        if outstanding > self.max_outstanding {
            self.accounting.retire();
            warn!("request pool exhausted ({} outstanding packets)", outstanding - 1);
            return Err(VmError::NoMemory);
        }

        let req = match self.take_cached() {
            Some(req) => {
                self.recycled.increment();
                req
            }
            None => {
                self.fresh.increment();
                // 新建即处于已分配状态，上面已经计数
                Arc::new(Request::new(Arc::clone(&self.accounting)))
            }
        };
        req.prepare(target, flags, func);
        Ok(req)
    }

    fn take_cached(&self) -> Option<Arc<Request>> {
        for _ in 0..REQ_FREE_LISTS {
            let idx = self.next_free.fetch_add(1, Ordering::Relaxed) % REQ_FREE_LISTS;
            let mut chain = self.free[idx].take_all();
            if let Some(req) = chain.pop_front() {
                self.free[idx].push_chain(chain);
                self.cached.fetch_sub(1, Ordering::AcqRel);
                return Some(req);
            }
        }
        None
    }

    /// 归还请求包；没有其他持有者时才回收，否则由最后一个持有者在释放时处理
    fn release(&self, req: Arc<Request>) {
        if Arc::strong_count(&req) != 1 {
            return;
        }
        req.reset();
        self.accounting.retire();
        if self.cached.load(Ordering::Acquire) >= REQ_MAX_CACHED {
            return;
        }
        self.cached.fetch_add(1, Ordering::AcqRel);
        let idx = self.next_free.fetch_add(1, Ordering::Relaxed) % REQ_FREE_LISTS;
        self.free[idx].push(req);
    }

    pub(crate) fn stats(&self) -> RequestPoolStats {
        RequestPoolStats {
            allocs: self.allocs.get(),
            frees: self.accounting.frees.get(),
            fresh: self.fresh.get(),
            recycled: self.recycled.get(),
            cached: self.cached.load(Ordering::Acquire),
            outstanding: self.accounting.outstanding.load(Ordering::Acquire),
        }
    }
}

/// EMT 处理哪一组队列
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestScope {
    Vm,
    Cpu,
}

impl Vm {
    /// 为 `target` 分配请求包
    pub fn req_alloc(
        &self,
        target: ReqTarget,
        flags: ReqFlags,
        func: ReqFn,
    ) -> VmResult<RequestHandle> {
        match target {
            ReqTarget::Cpu(id) if id >= self.cpu_count() => return Err(VmError::InvalidCpuId(id)),
            ReqTarget::AllAscending | ReqTarget::AllDescending if !func.is_shared() => {
                return Err(VmError::InvalidParameter(
                    "requests for all CPUs need a shared function".into(),
                ));
            }
            _ => {}
        }
        self.pool.alloc(target, flags, func).map(RequestHandle)
    }

    /// 投递请求，非 `NO_WAIT` 时等待其完成
    ///
    /// `timeout` 为 `None` 时一直等待。超时只是让调用者不再等待，请求包仍留在队列中，
    /// 照样恰好执行一次。
    pub fn req_queue(&self, req: &RequestHandle, timeout: Option<Duration>) -> VmResult<()> {
        let (target, flags) = req.0.routing();
        let caller = self.current_cpu();

        if target == ReqTarget::AnyIdle && caller.is_some() {
            return Err(VmError::WrongThread(
                "an EMT cannot queue to any idle CPU; target a specific CPU instead".into(),
            ));
        }
        if self.is_terminating() {
            return Err(VmError::Terminating);
        }
        req.0
            .transition(ReqState::Allocated, ReqState::Queued)
            .map_err(|actual| VmError::RequestState {
                expected: "allocated",
                actual,
            })?;

        let notify = if flags.contains(ReqFlags::POKE) {
            NotifyFlags::POKE
        } else {
            NotifyFlags::empty()
        };
        match target {
            ReqTarget::AllAscending | ReqTarget::AllDescending => {
                return self.queue_all(req, target, flags, timeout);
            }
            ReqTarget::Cpu(id) => {
                let cpu = self.cpu(id)?;
                if caller.is_some_and(|c| c.id() == id) {
                    trace!("EMT-{id}: executing request inline");
                    let _ = self.execute_request(cpu, Arc::clone(&req.0));
                    return Ok(());
                }
                cpu.requests
                    .push(Arc::clone(&req.0), flags.contains(ReqFlags::PRIORITY));
                cpu.ff.set(CpuForcedActions::REQUEST);
                self.notify_cpu(cpu, notify);
            }
            ReqTarget::AnyIdle | ReqTarget::AnyQueue => {
                self.requests
                    .push(Arc::clone(&req.0), flags.contains(ReqFlags::PRIORITY));
                self.ff.set(VmForcedActions::REQUEST);
                self.notify_all_cpus(notify);
            }
        }

        if flags.contains(ReqFlags::NO_WAIT) {
            return Ok(());
        }
        self.req_wait(req, timeout)
    }

    /// 把"所有 CPU"请求按顺序拆分为每个 CPU 一个请求包
    ///
    /// 调用者的请求包在所有拆分包完成后完成一次，携带合并后的结果。
    fn queue_all(
        &self,
        req: &RequestHandle,
        target: ReqTarget,
        flags: ReqFlags,
        timeout: Option<Duration>,
    ) -> VmResult<()> {
        let func = match req.0.inner.lock().func.take() {
            Some(ReqFn::Shared(f)) => f,
            _ => {
                let err =
                    VmError::InvalidParameter("requests for all CPUs need a shared function".into());
                req.0.complete(Err(err.clone()));
                return Err(err);
            }
        };

        let count = self.cpu_count();
        let order: Vec<u32> = match target {
            ReqTarget::AllAscending => (0..count).collect(),
            _ => (0..count).rev().collect(),
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        let waiting = !flags.contains(ReqFlags::NO_WAIT);
        let mut timed_out = false;
        req.0.pending_children.store(count, Ordering::Release);

        for (queued, &id) in order.iter().enumerate() {
            let left = count - queued as u32;
            let child_flags = if waiting && !timed_out {
                flags
            } else {
                flags | ReqFlags::NO_WAIT
            };
            let child = match self.pool.alloc(
                ReqTarget::Cpu(id),
                child_flags,
                ReqFn::Shared(Arc::clone(&func)),
            ) {
                Ok(child) => child,
                Err(e) => {
                    req.0.child_finished(Err(e.clone()), left);
                    return Err(e);
                }
            };
            child.inner.lock().parent = Some(Arc::clone(&req.0));
            let child = RequestHandle(child);

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match self.req_queue(&child, remaining) {
                Ok(()) => {
                    if !child_flags.contains(ReqFlags::NO_WAIT) {
                        self.pool.release(child.0);
                    }
                }
                Err(VmError::Timeout) => {
                    debug!("request for CPU {id} timed out; queuing the rest without waiting");
                    timed_out = true;
                }
                Err(e) => {
                    // 没能入队的请求包在这里计数
                    let never_queued = if child.state() == ReqState::Allocated {
                        child.0.inner.lock().parent = None;
                        left
                    } else {
                        left - 1
                    };
                    if never_queued > 0 {
                        req.0.child_finished(Err(e.clone()), never_queued);
                    }
                    return Err(e);
                }
            }
        }

        if timed_out {
            return Err(VmError::Timeout);
        }
        if !waiting {
            return Ok(());
        }
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        self.req_wait(req, remaining)
    }

    /// 等待已投递的请求完成
    pub fn req_wait(&self, req: &RequestHandle, timeout: Option<Duration>) -> VmResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let caller = self.current_cpu();
        let vm_wide = req.0.routing().0.is_vm_wide();

        loop {
            match req.state() {
                ReqState::Completed => return Ok(()),
                ReqState::Queued | ReqState::Processing => {}
                actual => {
                    return Err(VmError::RequestState {
                        expected: "queued",
                        actual,
                    });
                }
            }

            if let Some(cpu) = caller {
                // 等待中的 EMT 必须继续响应屏障和 VM 级队列，否则它等的请求包可能永远轮不到
                if cpu.ff.test_and_clear(CpuForcedActions::RENDEZVOUS) {
                    let _ = self.rendezvous_ff(cpu);
                }
                if vm_wide && self.ff.is_set(VmForcedActions::REQUEST) {
                    let _ = self.process_requests(cpu, RequestScope::Vm);
                }
            } else if self.active_emts() == 0 {
                return Err(VmError::Terminating);
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(VmError::Timeout);
                    }
                    (deadline - now).min(REQ_WAIT_SLICE)
                }
                None => REQ_WAIT_SLICE,
            };
            req.0.wait_done(slice);
        }
    }

    /// 把请求包归还给池；只有已分配或已完成的请求包可以释放
    pub fn req_free(&self, req: RequestHandle) -> VmResult<()> {
        match req.state() {
            ReqState::Allocated | ReqState::Completed => {
                self.pool.release(req.0);
                Ok(())
            }
            actual => Err(VmError::RequestState {
                expected: "allocated or completed",
                actual,
            }),
        }
    }

    /// 一次完成分配和投递
    ///
    /// 等待型请求返回的句柄已完成并携带结果。
    pub fn req_call(
        &self,
        target: ReqTarget,
        flags: ReqFlags,
        func: ReqFn,
        timeout: Option<Duration>,
    ) -> VmResult<RequestHandle> {
        let req = self.req_alloc(target, flags, func)?;
        match self.req_queue(&req, timeout) {
            Ok(()) => Ok(req),
            Err(e) => {
                if req.state() == ReqState::Allocated {
                    let _ = self.req_free(req);
                }
                Err(e)
            }
        }
    }

    fn call_and_collect(&self, target: ReqTarget, flags: ReqFlags, func: ReqFn) -> VmResult<EmStatus> {
        let req = self.req_call(target, flags, func, None)?;
        let result = req.result().unwrap_or(Ok(EmStatus::Success));
        let _ = self.req_free(req);
        result
    }

    /// 在 `target` 上运行 `f` 并等待其状态
    pub fn req_call_wait<F>(&self, target: ReqTarget, f: F) -> VmResult<EmStatus>
    where
        F: Fn(&Vm, &VCpu) -> VmResult<EmStatus> + Send + Sync + 'static,
    {
        self.call_and_collect(target, ReqFlags::empty(), ReqFn::shared(f))
    }

    /// 同 [`Vm::req_call_wait`]，但走优先队列
    pub fn req_priority_call_wait<F>(&self, target: ReqTarget, f: F) -> VmResult<EmStatus>
    where
        F: Fn(&Vm, &VCpu) -> VmResult<EmStatus> + Send + Sync + 'static,
    {
        self.call_and_collect(target, ReqFlags::PRIORITY, ReqFn::shared(f))
    }

    /// 在 `target` 上运行无状态函数并等待
    pub fn req_call_void_wait<F>(&self, target: ReqTarget, f: F) -> VmResult<()>
    where
        F: Fn(&Vm, &VCpu) + Send + Sync + 'static,
    {
        self.call_and_collect(target, ReqFlags::VOID, ReqFn::void_shared(f))
            .map(|_| ())
    }

    /// 把 `f` 投递到 `target` 后立即返回
    pub fn req_call_no_wait<F>(&self, target: ReqTarget, f: F) -> VmResult<()>
    where
        F: Fn(&Vm, &VCpu) -> VmResult<EmStatus> + Send + Sync + 'static,
    {
        let req = self.req_call(target, ReqFlags::NO_WAIT, ReqFn::shared(f), None)?;
        self.pool.release(req.0);
        Ok(())
    }

    /// 把无状态函数投递到 `target` 后立即返回
    pub fn req_call_void_no_wait<F>(&self, target: ReqTarget, f: F) -> VmResult<()>
    where
        F: Fn(&Vm, &VCpu) + Send + Sync + 'static,
    {
        let flags = ReqFlags::NO_WAIT | ReqFlags::VOID;
        let req = self.req_call(target, flags, ReqFn::void_shared(f), None)?;
        self.pool.release(req.0);
        Ok(())
    }

    pub fn request_pool_stats(&self) -> RequestPoolStats {
        self.pool.stats()
    }

    /// 在 `cpu` 的 EMT 上处理一组队列，优先队列在前
    ///
    /// 某个请求返回非成功状态时提前结束，并把该状态交回 EMT 循环。
    pub(crate) fn process_requests(&self, cpu: &VCpu, scope: RequestScope) -> EmStatus {
        let queues = match scope {
            RequestScope::Vm => &self.requests,
            RequestScope::Cpu => &cpu.requests,
        };
        loop {
            let Some(req) = queues.take_oldest() else {
                self.mark_requests(cpu, scope, false);
                if queues.is_empty() {
                    return EmStatus::Success;
                }
                // 生产者与清除标志竞争：重新置位后再取一轮
                self.mark_requests(cpu, scope, true);
                continue;
            };
            let status = self.execute_request(cpu, req);
            if !status.is_success() {
                // 并发的取用者可能已清除标志，剩下的包不能失去标志
                if !queues.is_empty() {
                    self.mark_requests(cpu, scope, true);
                    if scope == RequestScope::Vm {
                        self.notify_all_cpus(NotifyFlags::empty());
                    }
                }
                return status;
            }
        }
    }

    /// 置位或清除 `scope` 对应的 `REQUEST` 标志
    fn mark_requests(&self, cpu: &VCpu, scope: RequestScope, pending: bool) {
        match (scope, pending) {
            (RequestScope::Vm, true) => self.ff.set(VmForcedActions::REQUEST),
            (RequestScope::Vm, false) => self.ff.clear(VmForcedActions::REQUEST),
            (RequestScope::Cpu, true) => cpu.ff.set(CpuForcedActions::REQUEST),
            (RequestScope::Cpu, false) => cpu.ff.clear(CpuForcedActions::REQUEST),
        }
    }

    fn execute_request(&self, cpu: &VCpu, req: Arc<Request>) -> EmStatus {
        if let Err(actual) = req.transition(ReqState::Queued, ReqState::Processing) {
            warn!("EMT-{}: skipping request in state {actual}", cpu.id());
            return EmStatus::Success;
        }
        cpu.stats().requests.increment();

        let (func, flags) = {
            let mut inner = req.inner.lock();
            (inner.func.take(), inner.flags)
        };
        let result = match func {
            Some(func) => func.call(self, cpu),
            None => Err(VmError::InvalidParameter("request has no function".into())),
        };
        let status = match &result {
            Ok(status) => *status,
            Err(e) => {
                debug!("EMT-{}: request failed: {e}", cpu.id());
                EmStatus::Success
            }
        };
        req.complete(result);

        if flags.contains(ReqFlags::NO_WAIT) {
            self.pool.release(req);
        }
        status
    }

    /// 以 `Terminating` 完成所有仍在队列中的请求包
    pub(crate) fn kill_pending_requests(&self) {
        let mut killed = 0usize;
        let mut pending = self.requests.drain();
        for cpu in self.cpus() {
            pending.extend(cpu.requests.drain());
        }
        for req in pending {
            if req.transition(ReqState::Queued, ReqState::Processing).is_ok() {
                let no_wait = req.inner.lock().flags.contains(ReqFlags::NO_WAIT);
                req.complete(Err(VmError::Terminating));
                killed += 1;
                if no_wait {
                    self.pool.release(req);
                }
            }
        }
        if killed > 0 {
            warn!("{}: killed {killed} pending request(s)", self.name());
        }
    }
}
