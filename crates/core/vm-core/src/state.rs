//! 虚拟机状态与状态转换表
//!
//! `VmState` 是 VM 的全局状态。带 `Ls` 后缀的状态是"后台存档进行中"的影子状态，
//! 最终总会回到对应的普通状态。所有合法的 (from, to) 对都列在 [`VmState::targets`] 中，
//! 任何状态转换请求都要先经过这张表的校验。

use std::fmt;

use serde::{Deserialize, Serialize};

/// VM 全局状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum VmState {
    Creating = 0,
    Created,
    Loading,
    PoweringOn,
    Resuming,
    Running,
    RunningLs,
    Resetting,
    ResettingLs,
    SoftResetting,
    SoftResettingLs,
    Suspending,
    SuspendingLs,
    SuspendingExtLs,
    Suspended,
    SuspendedLs,
    SuspendedExtLs,
    Saving,
    Debugging,
    DebuggingLs,
    PoweringOff,
    PoweringOffLs,
    Off,
    OffLs,
    FatalError,
    FatalErrorLs,
    GuruMeditation,
    GuruMeditationLs,
    LoadFailure,
    Destroying,
    Terminated,
}

use VmState::*;

const ALL_STATES: [VmState; 31] = [
    Creating,
    Created,
    Loading,
    PoweringOn,
    Resuming,
    Running,
    RunningLs,
    Resetting,
    ResettingLs,
    SoftResetting,
    SoftResettingLs,
    Suspending,
    SuspendingLs,
    SuspendingExtLs,
    Suspended,
    SuspendedLs,
    SuspendedExtLs,
    Saving,
    Debugging,
    DebuggingLs,
    PoweringOff,
    PoweringOffLs,
    Off,
    OffLs,
    FatalError,
    FatalErrorLs,
    GuruMeditation,
    GuruMeditationLs,
    LoadFailure,
    Destroying,
    Terminated,
];

impl VmState {
    /// 全部状态，按声明顺序
    pub fn all() -> &'static [VmState] {
        &ALL_STATES
    }

    /// 从原子存储中的数值还原
    pub(crate) fn from_u8(value: u8) -> Self {
        ALL_STATES
            .get(usize::from(value))
            .copied()
            .unwrap_or(Terminated)
    }

    /// 状态名（大写，例如 `RUNNING_LS`）
    pub const fn name(self) -> &'static str {
        match self {
            Creating => "CREATING",
            Created => "CREATED",
            Loading => "LOADING",
            PoweringOn => "POWERING_ON",
            Resuming => "RESUMING",
            Running => "RUNNING",
            RunningLs => "RUNNING_LS",
            Resetting => "RESETTING",
            ResettingLs => "RESETTING_LS",
            SoftResetting => "SOFT_RESETTING",
            SoftResettingLs => "SOFT_RESETTING_LS",
            Suspending => "SUSPENDING",
            SuspendingLs => "SUSPENDING_LS",
            SuspendingExtLs => "SUSPENDING_EXT_LS",
            Suspended => "SUSPENDED",
            SuspendedLs => "SUSPENDED_LS",
            SuspendedExtLs => "SUSPENDED_EXT_LS",
            Saving => "SAVING",
            Debugging => "DEBUGGING",
            DebuggingLs => "DEBUGGING_LS",
            PoweringOff => "POWERING_OFF",
            PoweringOffLs => "POWERING_OFF_LS",
            Off => "OFF",
            OffLs => "OFF_LS",
            FatalError => "FATAL_ERROR",
            FatalErrorLs => "FATAL_ERROR_LS",
            GuruMeditation => "GURU_MEDITATION",
            GuruMeditationLs => "GURU_MEDITATION_LS",
            LoadFailure => "LOAD_FAILURE",
            Destroying => "DESTROYING",
            Terminated => "TERMINATED",
        }
    }

    /// 从该状态出发可以到达的状态
    pub const fn targets(self) -> &'static [VmState] {
        match self {
            Creating => &[Created],
            Created => &[Loading, PoweringOn, PoweringOff],
            Loading => &[Suspended, LoadFailure],
            PoweringOn => &[Running],
            Resuming => &[Running],
            Running => &[
                PoweringOff,
                Suspending,
                Resetting,
                SoftResetting,
                RunningLs,
                Debugging,
                FatalError,
                GuruMeditation,
            ],
            RunningLs => &[
                PoweringOffLs,
                SuspendingLs,
                SuspendingExtLs,
                ResettingLs,
                SoftResettingLs,
                Running,
                DebuggingLs,
                FatalErrorLs,
                GuruMeditationLs,
            ],
            Resetting => &[Running, Suspended],
            ResettingLs => &[SuspendingLs],
            SoftResetting => &[Running, Suspended],
            SoftResettingLs => &[RunningLs],
            Suspending => &[Suspended],
            SuspendingLs => &[Suspending, SuspendedLs],
            SuspendingExtLs => &[Suspending, SuspendedExtLs],
            Suspended => &[
                PoweringOff,
                Saving,
                Resetting,
                SoftResetting,
                Resuming,
                Loading,
            ],
            SuspendedLs => &[Suspended, Saving],
            SuspendedExtLs => &[Suspended, Saving],
            Saving => &[Suspended],
            Debugging => &[Running, PoweringOff],
            DebuggingLs => &[Debugging, RunningLs, PoweringOffLs],
            PoweringOff => &[Off],
            PoweringOffLs => &[PoweringOff, OffLs],
            Off => &[Destroying],
            OffLs => &[Off],
            FatalError => &[PoweringOff],
            FatalErrorLs => &[FatalError, PoweringOffLs],
            GuruMeditation => &[Debugging, PoweringOff],
            GuruMeditationLs => &[GuruMeditation, DebuggingLs, PoweringOffLs],
            LoadFailure => &[PoweringOff],
            Destroying => &[Terminated],
            Terminated => &[],
        }
    }

    /// `self -> to` 是否是表中声明的合法转换
    pub fn can_transition(self, to: VmState) -> bool {
        self.targets().contains(&to)
    }

    /// 客户机是否在执行（包括后台存档期间）
    pub const fn is_running(self) -> bool {
        matches!(self, Running | RunningLs)
    }

    /// 是否为后台存档的影子状态
    pub const fn is_live_save(self) -> bool {
        matches!(
            self,
            RunningLs
                | ResettingLs
                | SoftResettingLs
                | SuspendingLs
                | SuspendingExtLs
                | SuspendedLs
                | SuspendedExtLs
                | DebuggingLs
                | PoweringOffLs
                | OffLs
                | FatalErrorLs
                | GuruMeditationLs
        )
    }

    /// 是否为瞬态（某个操作正在进行中）
    pub const fn is_transitional(self) -> bool {
        matches!(
            self,
            Creating
                | Loading
                | PoweringOn
                | Resuming
                | Resetting
                | ResettingLs
                | SoftResetting
                | SoftResettingLs
                | Suspending
                | SuspendingLs
                | SuspendingExtLs
                | Saving
                | PoweringOff
                | PoweringOffLs
                | Destroying
        )
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
