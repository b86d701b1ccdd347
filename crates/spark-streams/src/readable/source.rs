//! 可读流的底层来源钩子。

use futures::FutureExt;

use crate::Completion;
use crate::error::StreamError;
use crate::hook::ready_ok;

use super::{ReadableByteStreamController, ReadableStreamDefaultController};

/// 值流的数据来源。
///
/// # 教案式说明
/// - **意图 (Why)**：把“数据从哪里来”留给使用者，流只负责排队、背压与状态迁移。
/// - **契约 (What)**：
///   - `start` 在构造流时同步调用一次，返回的完成决定何时开始拉取；
///   - `pull` 只在 `start` 完成后、且流需要更多数据时调用，同一时刻至多一个拉取在进行；
///   - `cancel` 在消费者取消时调用一次，之后不再调用任何钩子；
///   - 任意钩子返回错误都会使流出错（`cancel` 除外，其错误只交给取消的调用方）。
/// - **执行逻辑 (How)**：钩子的同步部分在调用时立即执行，返回的 future 由调度器驱动。
pub trait UnderlyingSource<T> {
    fn start(&mut self, controller: &ReadableStreamDefaultController<T>) -> Completion {
        let _ = controller;
        ready_ok()
    }

    fn pull(&mut self, controller: &ReadableStreamDefaultController<T>) -> Completion {
        let _ = controller;
        ready_ok()
    }

    fn cancel(&mut self, reason: StreamError) -> Completion {
        let _ = reason;
        ready_ok()
    }
}

/// 字节流的数据来源，钩子语义与 [`UnderlyingSource`] 相同。
pub trait UnderlyingByteSource {
    fn start(&mut self, controller: &ReadableByteStreamController) -> Completion {
        let _ = controller;
        ready_ok()
    }

    fn pull(&mut self, controller: &ReadableByteStreamController) -> Completion {
        let _ = controller;
        ready_ok()
    }

    fn cancel(&mut self, reason: StreamError) -> Completion {
        let _ = reason;
        ready_ok()
    }
}

/// 由迭代器驱动的来源：每次拉取产出一个值，耗尽即关闭。
pub(crate) struct IterSource<I> {
    iter: Option<I>,
}

impl<I> IterSource<I> {
    pub(crate) fn new(iter: I) -> Self {
        Self { iter: Some(iter) }
    }
}

impl<I> UnderlyingSource<I::Item> for IterSource<I>
where
    I: Iterator,
    I::Item: 'static,
{
    fn pull(&mut self, controller: &ReadableStreamDefaultController<I::Item>) -> Completion {
        let next = self.iter.as_mut().and_then(Iterator::next);
        let outcome = match next {
            Some(value) => controller.enqueue(value),
            None => {
                self.iter = None;
                controller.close()
            }
        };
        futures::future::ready(outcome).boxed_local()
    }

    fn cancel(&mut self, _reason: StreamError) -> Completion {
        self.iter = None;
        ready_ok()
    }
}
