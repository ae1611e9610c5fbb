//! EMT 调度状态码
//!
//! 请求处理函数、屏障回调和执行引擎都返回 [`EmStatus`]，告诉 EMT 循环下一步该做什么。
//! 枚举按"严格程度"从高到低声明，合并多个结果时取最严格的那个。

use std::fmt;

use crate::error::VmResult;

/// EMT 调度状态（越靠前越严格）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EmStatus {
    /// EMT 应该退出循环
    Terminate,
    /// 进入调试器
    Debug,
    /// VM 已关机
    Off,
    /// VM 已挂起
    Suspend,
    /// VM 已复位
    Reset,
    /// 客户机空闲
    Halt,
    /// vCPU 等待启动信号（已热拔出）
    WaitSipi,
    /// VM 已恢复运行
    Resume,
    /// 重新评估调度
    Reschedule,
    #[default]
    Success,
}

impl EmStatus {
    /// 取两者中更严格的一个
    pub fn merge(self, other: EmStatus) -> EmStatus {
        self.min(other)
    }

    pub fn is_success(self) -> bool {
        self == EmStatus::Success
    }
}

impl fmt::Display for EmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 合并两个回调结果：先出现的错误优先，否则取更严格的状态
pub fn merge_results(acc: VmResult<EmStatus>, next: VmResult<EmStatus>) -> VmResult<EmStatus> {
    match (acc, next) {
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e),
        (Ok(a), Ok(b)) => Ok(a.merge(b)),
    }
}
