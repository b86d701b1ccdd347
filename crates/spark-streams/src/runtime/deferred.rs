//! 一次性完成信号 [`Deferred`]。
//!
//! # 设计背景（Why）
//! - 流的状态机在同步代码里决定结果，却要把结果交给稍后才轮询的 future；
//! - `futures::channel::oneshot` 只允许一个接收方，而 `closed`、`ready` 与中止请求常被多方同时等待。
//!
//! # 契约说明（What）
//! - 兑现只发生一次，之后的兑现尝试返回 `false`；
//! - 等待者拿到结果的克隆，丢弃等待 future 不影响其他等待者。
//!
//! # 实现要点（How）
//! - 槽位保存 waker 列表或最终结果；兑现时先替换槽位、释放借用，再逐个唤醒，避免唤醒回调重入时借用冲突。

use std::cell::RefCell;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::{Result, StreamError};

enum Slot<T> {
    Pending(Vec<Waker>),
    Settled(Result<T>),
}

/// 可被多方观察的一次性完成信号。
///
/// # 教案式说明
/// - **意图 (Why)**：读者的 `closed`、写者的 `ready`/`closed`、写请求与中止请求都需要
///   “先创建、稍后由状态机兑现”的完成对象，并且可能被多个等待者同时观察。
/// - **契约 (What)**：
///   - 只会被兑现一次，之后的 [`Deferred::resolve`]/[`Deferred::reject`] 返回 `false` 且不生效；
///   - 克隆共享同一个槽位，[`Deferred::wait`] 得到的 future 可在任意时刻被丢弃；
///   - 等待者拿到的是结果的克隆，因此要求 `T: Clone`。
/// - **执行逻辑 (How)**：内部以 `Rc<RefCell<Slot>>` 保存 waker 列表或最终结果，兑现时先释放借用再唤醒。
pub struct Deferred<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Rc::clone(&self.slot),
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Deferred<T> {
    /// 创建待定状态的完成信号。
    pub fn new() -> Self {
        Self {
            slot: Rc::new(RefCell::new(Slot::Pending(Vec::new()))),
        }
    }

    /// 创建已成功的完成信号。
    pub fn resolved(value: T) -> Self {
        Self {
            slot: Rc::new(RefCell::new(Slot::Settled(Ok(value)))),
        }
    }

    /// 创建已失败的完成信号。
    pub fn rejected(error: StreamError) -> Self {
        Self {
            slot: Rc::new(RefCell::new(Slot::Settled(Err(error)))),
        }
    }

    /// 以成功兑现；已兑现时返回 `false`。
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// 以失败兑现；已兑现时返回 `false`。
    pub fn reject(&self, error: StreamError) -> bool {
        self.settle(Err(error))
    }

    /// 无论当前状态如何，都让后续观察者看到 `error`。
    ///
    /// 用于释放读写锁：已经兑现的 `closed` 也要改写为“锁已释放”。
    pub(crate) fn force_reject(&self, error: StreamError) {
        if !self.reject(error.clone()) {
            *self.slot.borrow_mut() = Slot::Settled(Err(error));
        }
    }

    /// 是否仍处于待定状态。
    pub fn is_pending(&self) -> bool {
        matches!(*self.slot.borrow(), Slot::Pending(_))
    }

    /// 查看已兑现的结果。
    pub fn outcome(&self) -> Option<Result<T>> {
        match &*self.slot.borrow() {
            Slot::Pending(_) => None,
            Slot::Settled(outcome) => Some(outcome.clone()),
        }
    }

    /// 返回一个等待兑现的 future。
    pub fn wait(&self) -> DeferredFuture<T> {
        DeferredFuture {
            slot: Rc::clone(&self.slot),
        }
    }

    fn settle(&self, outcome: Result<T>) -> bool {
        let wakers = {
            let mut slot = self.slot.borrow_mut();
            match &mut *slot {
                Slot::Settled(_) => return false,
                Slot::Pending(wakers) => {
                    let wakers = mem::take(wakers);
                    *slot = Slot::Settled(outcome);
                    wakers
                }
            }
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

/// [`Deferred::wait`] 返回的 future。
pub struct DeferredFuture<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T: Clone> Future for DeferredFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        match &mut *slot {
            Slot::Settled(outcome) => Poll::Ready(outcome.clone()),
            Slot::Pending(wakers) => {
                if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}
