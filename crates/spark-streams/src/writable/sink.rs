use crate::Completion;
use crate::error::StreamError;
use crate::hook::ready_ok;

use super::WritableStreamDefaultController;

/// 可写流的下游。
///
/// # 教案式说明
/// - **意图 (Why)**：把“值写到哪里”留给使用者，流负责排队、背压与关闭/中止的先后顺序。
/// - **契约 (What)**：
///   - `start` 在构造流时同步调用一次；在其完成前不会调用 `write`；
///   - `write` 严格串行：上一次写入的完成兑现后才会发起下一次；
///   - `close` 在所有已排队写入完成后调用一次；`abort` 在没有进行中操作时调用一次；
///   - `close` 与 `abort` 至多调用其一。
/// - **风险提示（Trade-offs）**：`write` 返回的错误会使流出错，剩余排队写入全部失败。
pub trait UnderlyingSink<T> {
    fn start(&mut self, controller: &WritableStreamDefaultController<T>) -> Completion {
        let _ = controller;
        ready_ok()
    }

    fn write(&mut self, chunk: T, controller: &WritableStreamDefaultController<T>) -> Completion {
        let _ = (chunk, controller);
        ready_ok()
    }

    fn close(&mut self) -> Completion {
        ready_ok()
    }

    fn abort(&mut self, reason: StreamError) -> Completion {
        let _ = reason;
        ready_ok()
    }
}
