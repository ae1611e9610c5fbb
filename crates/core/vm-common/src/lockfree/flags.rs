//! 原子位标志
//!
//! 一个 32 位的原子位集合，供"强制动作"一类的粘滞标志使用：
//! 任意线程都可以置位，拥有者线程在合适的时机检查并清除。

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// 原子位集合
#[derive(Default)]
pub struct AtomicFlags {
    bits: AtomicU32,
}

impl AtomicFlags {
    pub const fn new(bits: u32) -> Self {
        Self {
            bits: AtomicU32::new(bits),
        }
    }

    /// 置位 `mask` 中的所有位
    pub fn set(&self, mask: u32) {
        self.bits.fetch_or(mask, Ordering::AcqRel);
    }

    /// 清除 `mask` 中的所有位
    pub fn clear(&self, mask: u32) {
        self.bits.fetch_and(!mask, Ordering::AcqRel);
    }

    /// `mask` 中的位是否全部置位
    pub fn is_set(&self, mask: u32) -> bool {
        self.bits.load(Ordering::Acquire) & mask == mask
    }

    /// `mask` 中是否有任意一位置位
    pub fn any(&self, mask: u32) -> bool {
        self.bits.load(Ordering::Acquire) & mask != 0
    }

    /// 清除 `mask` 并返回清除前是否有任意一位置位
    pub fn test_and_clear(&self, mask: u32) -> bool {
        self.bits.fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    /// 只保留 `mask` 中的位，其余全部清除
    pub fn retain(&self, mask: u32) {
        self.bits.fetch_and(mask, Ordering::AcqRel);
    }

    pub fn bits(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }
}

impl fmt::Debug for AtomicFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtomicFlags({:#x})", self.bits())
    }
}
