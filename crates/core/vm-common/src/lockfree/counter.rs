//! 无锁计数器
//!
//! 用于统计场景的原子计数器，例如请求包池的分配/回收次数、vCPU 的停机次数。

use std::sync::atomic::{AtomicU64, Ordering};

/// 无锁计数器
///
/// 统计类计数只需要最终一致，因此全部使用 `Relaxed`。
#[derive(Debug, Default)]
pub struct LockFreeCounter {
    value: AtomicU64,
}

impl LockFreeCounter {
    /// 创建新的计数器
    pub const fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
        }
    }

    /// 加一，返回加一之前的值
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::Relaxed)
    }

    /// 减一，返回减一之前的值；已经为零时保持为零
    pub fn decrement(&self) -> u64 {
        self.value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)))
            .unwrap_or(0)
    }

    /// 加上 `delta`，返回之前的值
    pub fn add(&self, delta: u64) -> u64 {
        self.value.fetch_add(delta, Ordering::Relaxed)
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// 读出当前值并清零
    pub fn take(&self) -> u64 {
        self.value.swap(0, Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.set(0);
    }
}
