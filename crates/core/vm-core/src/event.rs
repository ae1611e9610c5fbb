//! 自动复位事件
//!
//! 用于 EMT 的停机/等待和请求完成通知。信号在没有等待者时会被保留，
//! 下一次等待立即返回并消耗它，因此"先置标志、再发信号"的唤醒方式不会丢失。

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// 自动复位事件
#[derive(Debug, Default)]
pub struct WaitEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl WaitEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发信号，唤醒一个等待者（没有等待者时保留信号）
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_one();
    }

    /// 等待信号或超时；收到信号返回 `true`
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                break;
            }
        }
        std::mem::replace(&mut *signaled, false)
    }

    /// 丢弃残留的信号
    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }
}
