//! 中止信号原语。
//!
//! # 设计背景（Why）
//! - 管道需要一个外部可触发的“请停止”信号，可写流控制器也需要把中止原因暴露给正在执行的写入；
//! - 信号一旦触发即不可撤销，原因对所有观察者可见。
//!
//! # 契约说明（What）
//! - [`AbortController::abort`] 返回 `true` 表示首次触发，重复触发不会改写原因；
//! - [`AbortSignal`] 可自由克隆，所有克隆共享同一状态。

use std::future::Future;

use crate::error::StreamError;
use crate::runtime::Deferred;

const DEFAULT_ABORT_REASON: &str = "signal is aborted without reason";

/// 中止信号的观察端。
#[derive(Clone)]
pub struct AbortSignal {
    fired: Deferred<StreamError>,
}

impl AbortSignal {
    fn new() -> Self {
        Self {
            fired: Deferred::new(),
        }
    }

    /// 查询信号是否已触发。
    pub fn is_aborted(&self) -> bool {
        !self.fired.is_pending()
    }

    /// 读取触发原因；未触发时返回 `None`。
    pub fn reason(&self) -> Option<StreamError> {
        self.fired.outcome().map(|outcome| outcome.unwrap_or_else(|err| err))
    }

    /// 等待信号触发并返回原因。
    ///
    /// # 契约说明（What）
    /// - 若信号已触发，返回的 future 在首次轮询时立即完成；
    /// - future 可随时丢弃，不影响信号本身。
    pub fn aborted(&self) -> impl Future<Output = StreamError> + 'static {
        let wait = self.fired.wait();
        async move { wait.await.unwrap_or_else(|err| err) }
    }
}

/// 中止信号的触发端。
///
/// # 教案式说明
/// - **意图 (Why)**：把“谁可以触发”与“谁只能观察”分离，管道只拿到 [`AbortSignal`]。
/// - **契约 (What)**：`abort(None)` 使用默认原因 [`StreamError::Aborted`]。
/// - **设计权衡 (Trade-offs)**：信号只在单线程内共享，不提供 `Send` 保证。
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    /// 创建未触发的控制器。
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    /// 返回关联的观察端。
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// 触发中止。返回值为 `true` 表示本次调用首次触发。
    pub fn abort(&self, reason: Option<StreamError>) -> bool {
        let reason = reason.unwrap_or_else(|| StreamError::aborted(DEFAULT_ABORT_REASON));
        let first = self.signal.fired.resolve(reason);
        if first {
            tracing::trace!("abort signal fired");
        }
        first
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}
