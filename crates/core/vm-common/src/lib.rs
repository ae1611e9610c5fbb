//! VM通用库
//!
//! 提供控制平面各部分共用的基础设施：无锁链表与计数器、日志初始化、配置 Trait。

pub mod config;
pub mod lockfree;
pub mod logging;

pub use config::{Config, ConfigDiff, ConfigError};
pub use lockfree::{AtomicFlags, AtomicList, Chain, LockFreeCounter};
pub use logging::{init_logging, init_test_logging};
