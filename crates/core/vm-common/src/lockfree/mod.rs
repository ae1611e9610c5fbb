//! 无锁数据结构
//!
//! - [`AtomicList`]: 多生产者单消费者链表，支持"整链取走、尾部挂回"
//! - [`LockFreeCounter`]: 统计计数器
//! - [`AtomicFlags`]: 原子位标志

mod atomic_list;
mod counter;
mod flags;

pub use atomic_list::{AtomicList, Chain, Iter};
pub use counter::LockFreeCounter;
pub use flags::AtomicFlags;
