//! 强制动作标志（forced-action flags）
//!
//! 粘滞位：任意线程都可以置位，EMT 在离开客户机执行或停机时检查并处理。
//! VM 级标志对所有 EMT 可见，CPU 级标志只属于一个 vCPU。

use std::fmt;
use std::marker::PhantomData;

use bitflags::{Flags, bitflags};
use vm_common::AtomicFlags;

bitflags! {
    /// VM 级强制动作
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmForcedActions: u32 {
        /// VM 级请求队列非空
        const REQUEST = 1 << 0;
        /// VM 状态发生了需要所有 EMT 重新评估的变化
        const CHECK_VM_STATE = 1 << 1;
        /// 延迟复位
        const RESET = 1 << 2;
        /// 调试器需要处理
        const DBGF = 1 << 3;
    }
}

bitflags! {
    /// CPU 级强制动作
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CpuForcedActions: u32 {
        const REQUEST = 1 << 0;
        /// 有一个屏障等待本 CPU 参与
        const RENDEZVOUS = 1 << 1;
        const DBGF = 1 << 2;
        /// 设备异步通知
        const ASYNC_NOTIFY = 1 << 3;
        const TIMER = 1 << 4;
        const INTERRUPT = 1 << 5;
    }
}

bitflags! {
    /// 唤醒 vCPU 时附带的选项
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NotifyFlags: u32 {
        /// CPU 正在执行客户机代码时，打断它
        const POKE = 1 << 0;
    }
}

impl VmForcedActions {
    /// 结束"挂起等待"的 VM 级标志
    pub const SUSPENDED_MASK: Self = Self::REQUEST.union(Self::DBGF).union(Self::RESET);
    /// 结束"客户机停机"的 VM 级标志
    pub const HALTED_MASK: Self = Self::SUSPENDED_MASK.union(Self::CHECK_VM_STATE);
}

impl CpuForcedActions {
    /// 结束"挂起等待"的 CPU 级标志
    pub const SUSPENDED_MASK: Self = Self::REQUEST
        .union(Self::RENDEZVOUS)
        .union(Self::DBGF)
        .union(Self::ASYNC_NOTIFY);
    /// 结束"客户机停机"的 CPU 级标志
    pub const HALTED_MASK: Self = Self::SUSPENDED_MASK
        .union(Self::TIMER)
        .union(Self::INTERRUPT);
}

/// 一组原子的强制动作标志
pub struct ForcedActions<F> {
    flags: AtomicFlags,
    _marker: PhantomData<F>,
}

impl<F: Flags<Bits = u32>> ForcedActions<F> {
    pub const fn new() -> Self {
        Self {
            flags: AtomicFlags::new(0),
            _marker: PhantomData,
        }
    }

    pub fn set(&self, flags: F) {
        self.flags.set(flags.bits());
    }

    pub fn clear(&self, flags: F) {
        self.flags.clear(flags.bits());
    }

    /// 所有位都已置位
    pub fn is_set(&self, flags: F) -> bool {
        self.flags.is_set(flags.bits())
    }

    /// 任意一位已置位
    pub fn any(&self, flags: F) -> bool {
        self.flags.any(flags.bits())
    }

    pub fn test_and_clear(&self, flags: F) -> bool {
        self.flags.test_and_clear(flags.bits())
    }

    /// 清除 `keep` 以外的所有位
    pub fn retain(&self, keep: F) {
        self.flags.retain(keep.bits());
    }

    pub fn bits(&self) -> u32 {
        self.flags.bits()
    }
}

impl<F: Flags<Bits = u32>> Default for ForcedActions<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> fmt::Debug for ForcedActions<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForcedActions({:#x})", self.flags.bits())
    }
}
