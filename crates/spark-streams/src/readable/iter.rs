//! 以 `futures::Stream` 的形式消费可读流。

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use futures::future::FutureExt;

use crate::error::{Result, StreamError};
use crate::runtime;

use super::{ReadFuture, ReadableStreamDefaultReader};

/// 可读流的异步序列视图。
///
/// # 契约说明（What）
/// - 每个元素为 `Ok(value)`；流出错时产出一次 `Err(reason)` 后结束；
/// - 流结束或出错后自动释放读者锁；
/// - 提前丢弃序列时，若未设置 `prevent_cancel`，以 [`StreamError::Unspecified`] 取消流，随后释放锁。
pub struct ReadableStreamIter<T: 'static> {
    reader: Option<ReadableStreamDefaultReader<T>>,
    pending: Option<ReadFuture<T>>,
    prevent_cancel: bool,
}

impl<T: 'static> ReadableStreamIter<T> {
    pub(crate) fn new(reader: ReadableStreamDefaultReader<T>, prevent_cancel: bool) -> Self {
        Self {
            reader: Some(reader),
            pending: None,
            prevent_cancel,
        }
    }

    fn finish(&mut self) {
        self.pending = None;
        if let Some(reader) = self.reader.take() {
            reader.release_lock();
        }
    }
}

impl<T: 'static> Stream for ReadableStreamIter<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(reader) = this.reader.as_ref() else {
            return Poll::Ready(None);
        };
        let read = this.pending.get_or_insert_with(|| reader.read());
        match read.poll_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(outcome) => {
                this.pending = None;
                match outcome {
                    Ok(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
                    Ok(None) => {
                        this.finish();
                        Poll::Ready(None)
                    }
                    Err(error) => {
                        this.finish();
                        Poll::Ready(Some(Err(error)))
                    }
                }
            }
        }
    }
}

impl<T: 'static> Drop for ReadableStreamIter<T> {
    fn drop(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        if !self.prevent_cancel {
            let cancelled = reader.cancel(StreamError::Unspecified);
            runtime::spawn_local(async move {
                if let Err(error) = cancelled.await {
                    tracing::trace!(error = %error, "cancel on iterator drop failed");
                }
            });
        }
        reader.release_lock();
    }
}
