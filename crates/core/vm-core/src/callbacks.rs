//! 通知回调注册表
//!
//! 三类回调：状态变化、致命错误、运行时错误。每类有自己的临界区，回调在临界区内同步调用。
//! 注册和注销都以回调对象（`Arc`）的身份为准。

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::error::{VmError, VmResult};
use crate::lifecycle::RuntimeErrorFlags;
use crate::state::VmState;
use crate::vm::Vm;

/// 状态变化回调：`(vm, new, old)`
pub type AtStateCallback = Arc<dyn Fn(&Vm, VmState, VmState) + Send + Sync>;
/// 错误回调：`(vm, error, who)`
pub type AtErrorCallback = Arc<dyn Fn(&Vm, &VmError, &str) + Send + Sync>;
/// 运行时错误回调：`(vm, flags, error_id, message)`
pub type AtRuntimeErrorCallback = Arc<dyn Fn(&Vm, RuntimeErrorFlags, &str, &str) + Send + Sync>;

/// 回调对象的身份（数据指针）
fn identity<T: ?Sized>(callback: &Arc<T>) -> *const () {
    Arc::as_ptr(callback) as *const ()
}

/// 受可重入锁保护的回调列表
pub(crate) struct CallbackList<T: ?Sized> {
    entries: ReentrantMutex<RefCell<Vec<Arc<T>>>>,
}

/// 持有回调列表的临界区
pub(crate) struct CallbackGuard<'a, T: ?Sized> {
    guard: ReentrantMutexGuard<'a, RefCell<Vec<Arc<T>>>>,
}

impl<T: ?Sized> CallbackGuard<'_, T> {
    /// 当前注册的回调；返回副本，回调内部可以安全地再次进入本列表
    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.guard.borrow().clone()
    }
}

impl<T: ?Sized> CallbackList<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: ReentrantMutex::new(RefCell::new(Vec::new())),
        }
    }

    pub(crate) fn lock(&self) -> CallbackGuard<'_, T> {
        CallbackGuard {
            guard: self.entries.lock(),
        }
    }

    fn register(&self, callback: Arc<T>) {
        self.entries.lock().borrow_mut().push(callback);
    }

    fn deregister(&self, callback: &Arc<T>) -> VmResult<()> {
        let guard = self.entries.lock();
        let mut entries = guard.borrow_mut();
        let target = identity(callback);
        match entries.iter().position(|c| identity(c) == target) {
            Some(pos) => {
                entries.remove(pos);
                Ok(())
            }
            None => Err(VmError::CallbackNotFound),
        }
    }
}

/// VM 的三个回调列表
pub(crate) struct Callbacks {
    /// 同时也是状态临界区
    pub(crate) at_state: CallbackList<dyn Fn(&Vm, VmState, VmState) + Send + Sync>,
    pub(crate) at_error: CallbackList<dyn Fn(&Vm, &VmError, &str) + Send + Sync>,
    pub(crate) at_runtime_error:
        CallbackList<dyn Fn(&Vm, RuntimeErrorFlags, &str, &str) + Send + Sync>,
}

impl Callbacks {
    pub(crate) fn new() -> Self {
        Self {
            at_state: CallbackList::new(),
            at_error: CallbackList::new(),
            at_runtime_error: CallbackList::new(),
        }
    }
}

impl Vm {
    /// 注册状态变化回调
    ///
    /// 回调在状态临界区内调用，除非是在走向销毁，否则不能在回调里再发起状态迁移。
    pub fn register_at_state(&self, callback: AtStateCallback) {
        self.callbacks.at_state.register(callback);
    }

    pub fn deregister_at_state(&self, callback: &AtStateCallback) -> VmResult<()> {
        self.callbacks.at_state.deregister(callback)
    }

    pub fn register_at_error(&self, callback: AtErrorCallback) {
        self.callbacks.at_error.register(callback);
    }

    pub fn deregister_at_error(&self, callback: &AtErrorCallback) -> VmResult<()> {
        self.callbacks.at_error.deregister(callback)
    }

    pub fn register_at_runtime_error(&self, callback: AtRuntimeErrorCallback) {
        self.callbacks.at_runtime_error.register(callback);
    }

    pub fn deregister_at_runtime_error(&self, callback: &AtRuntimeErrorCallback) -> VmResult<()> {
        self.callbacks.at_runtime_error.deregister(callback)
    }
}
