//! 原子单链表
//!
//! 多生产者、单消费者的 Treiber 链表。生产者用 CAS 把节点压到表头；
//! 消费者用一次 `swap` 取走整条链 ([`AtomicList::take_all`])，只处理其中一部分，
//! 再把没处理完的尾部挂回去 ([`AtomicList::push_back_chain`])。整个热路径上没有互斥锁。
//!
//! 链表中的顺序是"新的在前"：表头是最后压入的元素，表尾是最早压入的元素。

use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

/// 无锁单链表表头
pub struct AtomicList<T> {
    head: AtomicPtr<Node<T>>,
    _marker: PhantomData<Box<Node<T>>>,
}

// SAFETY: 节点只通过原子表头在线程间转移所有权，任何时刻只有一个线程拥有某个节点。
unsafe impl<T: Send> Send for AtomicList<T> {}
unsafe impl<T: Send> Sync for AtomicList<T> {}

impl<T> AtomicList<T> {
    /// 创建空链表
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// 链表当前是否为空（只是一个快照）
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// 压入一个元素，成为新的表头
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: node 还没有发布，当前线程独占。
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// 一次性取走整条链
    pub fn take_all(&self) -> Chain<T> {
        Chain {
            head: self.head.swap(ptr::null_mut(), Ordering::AcqRel),
            _marker: PhantomData,
        }
    }

    /// 把一条链整体压到表头之前，链中的元素被视为比现有元素更新
    pub fn push_chain(&self, chain: Chain<T>) {
        let Some((first, last)) = chain.into_raw() else {
            return;
        };
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: last 属于一条尚未发布的链。
            unsafe { (*last).next = head };
            match self
                .head
                .compare_exchange_weak(head, first, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// 把一条较旧的链挂回去，使其排在所有现有元素之后
    ///
    /// 如果表头为空，直接安装；否则把期间到达的新元素取走，
    /// 把旧链接到它们的尾部，然后重试。
    pub fn push_back_chain(&self, chain: Chain<T>) {
        let Some((mut first, _last)) = chain.into_raw() else {
            return;
        };
        loop {
            match self.head.compare_exchange(
                ptr::null_mut(),
                first,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(_) => {
                    let newer = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
                    if newer.is_null() {
                        continue;
                    }
                    // SAFETY: newer 这条链刚刚被取出，当前线程独占。
                    unsafe {
                        let mut tail = newer;
                        while !(*tail).next.is_null() {
                            tail = (*tail).next;
                        }
                        (*tail).next = first;
                    }
                    first = newer;
                }
            }
        }
    }
}

impl<T> Default for AtomicList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for AtomicList<T> {
    fn drop(&mut self) {
        drop(self.take_all());
    }
}

impl<T> fmt::Debug for AtomicList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicList")
            .field("empty", &self.is_empty())
            .finish()
    }
}

/// 从 [`AtomicList`] 取出的、当前线程独占的一条链
///
/// 顺序与链表相同：`pop_front` 得到最新的元素，`pop_back` 得到最旧的元素。
pub struct Chain<T> {
    head: *mut Node<T>,
    _marker: PhantomData<Box<Node<T>>>,
}

// SAFETY: Chain 独占它的所有节点。
unsafe impl<T: Send> Send for Chain<T> {}

impl<T> Chain<T> {
    /// 空链
    pub const fn empty() -> Self {
        Self {
            head: ptr::null_mut(),
            _marker: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// 节点个数（需要遍历）
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// 取出最新的元素
    pub fn pop_front(&mut self) -> Option<T> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: head 非空且由本链独占。
        let node = unsafe { Box::from_raw(self.head) };
        self.head = node.next;
        Some(node.value)
    }

    /// 取出最旧的元素
    pub fn pop_back(&mut self) -> Option<T> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: 遍历和摘除的都是本链独占的节点。
        unsafe {
            if (*self.head).next.is_null() {
                let node = Box::from_raw(self.head);
                self.head = ptr::null_mut();
                return Some(node.value);
            }
            let mut prev = self.head;
            while !(*(*prev).next).next.is_null() {
                prev = (*prev).next;
            }
            let node = Box::from_raw((*prev).next);
            (*prev).next = ptr::null_mut();
            Some(node.value)
        }
    }

    /// 从新到旧遍历
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            cur: self.head,
            _marker: PhantomData,
        }
    }

    fn into_raw(self) -> Option<(*mut Node<T>, *mut Node<T>)> {
        let this = ManuallyDrop::new(self);
        let first = this.head;
        if first.is_null() {
            return None;
        }
        let mut last = first;
        // SAFETY: 节点由本链独占。
        unsafe {
            while !(*last).next.is_null() {
                last = (*last).next;
            }
        }
        Some((first, last))
    }
}

impl<T> Default for Chain<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Drop for Chain<T> {
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
    }
}

impl<T> Iterator for Chain<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.pop_front()
    }
}

impl<T: fmt::Debug> fmt::Debug for Chain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// [`Chain`] 的借用迭代器
pub struct Iter<'a, T> {
    cur: *const Node<T>,
    _marker: PhantomData<&'a Node<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.cur.is_null() {
            return None;
        }
        // SAFETY: 节点在借用期间由 Chain 保持存活。
        let node = unsafe { &*self.cur };
        self.cur = node.next;
        Some(&node.value)
    }
}
