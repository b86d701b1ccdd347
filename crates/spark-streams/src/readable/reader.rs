//! 读者：默认读者与 BYOB 读者，以及挂起读取的通道表示。
//!
//! # 设计背景（Why）
//! - 读者锁把流的消费权交给唯一持有者，读取请求按 FIFO 顺序排队兑现；
//! - 每个读取以一次性通道表示：生产端兑现时只发送消息，消费端的后续逻辑由调度器驱动。
//!
//! # 契约说明（What）
//! - 释放锁后，尚未兑现的读取全部以 [`StreamError::InvalidState`] 失败，`closed` 同样被拒绝；
//! - 读者被丢弃时自动释放锁。

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::channel::oneshot;

use crate::ByteView;
use crate::Completion;
use crate::error::{Result, StreamError};
use crate::hook::ready_err;
use crate::runtime::{Deferred, DeferredFuture};

use super::default_controller::STREAM_DROPPED;
use super::{
    ControllerSteps, PendingReads, ReadableState, ReadableStream, ReaderLock, StreamRef,
    readable_cancel,
};

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

const READER_RELEASED: &str = "reader lock has been released";

/// 一次挂起的默认读取。
pub(crate) struct ReadRequest<T> {
    tx: oneshot::Sender<Result<Option<T>>>,
}

impl<T> ReadRequest<T> {
    pub(crate) fn new() -> (Self, ReadFuture<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, ReadFuture { rx })
    }

    pub(crate) fn chunk(self, chunk: T) {
        let _ = self.tx.send(Ok(Some(chunk)));
    }

    pub(crate) fn close(self) {
        let _ = self.tx.send(Ok(None));
    }

    pub(crate) fn error(self, error: StreamError) {
        let _ = self.tx.send(Err(error));
    }
}

/// 默认读取的结果：`Ok(Some(value))` 为一个值，`Ok(None)` 表示流已结束。
pub struct ReadFuture<T> {
    rx: oneshot::Receiver<Result<Option<T>>>,
}

impl<T> Future for ReadFuture<T> {
    type Output = Result<Option<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(StreamError::invalid_state(
                "read request was dropped",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// BYOB 读取的结果。
///
/// - `done == false` 时 `value` 必为填充后的视图；
/// - `done == true` 时 `value` 为归还的（可能为空的）视图，取消导致的结束为 `None`。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadIntoResult {
    pub value: Option<ByteView>,
    pub done: bool,
}

/// 一次挂起的 BYOB 读取。
pub(crate) struct ReadIntoRequest {
    tx: oneshot::Sender<Result<ReadIntoResult>>,
}

impl ReadIntoRequest {
    pub(crate) fn new() -> (Self, ReadIntoFuture) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, ReadIntoFuture { rx })
    }

    pub(crate) fn chunk(self, view: ByteView) {
        let _ = self.tx.send(Ok(ReadIntoResult {
            value: Some(view),
            done: false,
        }));
    }

    pub(crate) fn close(self, view: Option<ByteView>) {
        let _ = self.tx.send(Ok(ReadIntoResult {
            value: view,
            done: true,
        }));
    }

    pub(crate) fn error(self, error: StreamError) {
        let _ = self.tx.send(Err(error));
    }
}

/// BYOB 读取返回的 future。
pub struct ReadIntoFuture {
    rx: oneshot::Receiver<Result<ReadIntoResult>>,
}

impl Future for ReadIntoFuture {
    type Output = Result<ReadIntoResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(StreamError::invalid_state(
                "read request was dropped",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn acquire_lock<T>(stream: &StreamRef<T>, requests: PendingReads<T>) -> Result<(u64, Deferred<()>)> {
    let mut inner = stream.borrow_mut();
    if inner.reader.is_some() {
        return Err(StreamError::invalid_state(
            "stream is already locked to a reader",
        ));
    }
    let closed = match inner.state {
        ReadableState::Readable => Deferred::new(),
        ReadableState::Closed => Deferred::resolved(()),
        ReadableState::Errored => Deferred::rejected(inner.stored_error()),
    };
    let id = NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed);
    inner.reader = Some(ReaderLock {
        id,
        closed: closed.clone(),
        requests,
    });
    Ok((id, closed))
}

/// 解除锁定并返回尚未兑现的读取；锁已不属于 `id` 时返回 `None`。
fn release_lock<T>(stream: &StreamRef<T>, id: u64) -> Option<PendingReads<T>> {
    let (state, controller, lock) = {
        let mut inner = stream.borrow_mut();
        if inner.reader.as_ref().is_none_or(|lock| lock.id != id) {
            return None;
        }
        let lock = inner.reader.take()?;
        (inner.state, inner.controller.clone(), lock)
    };
    let released = StreamError::invalid_state(READER_RELEASED);
    if state == ReadableState::Readable {
        lock.closed.reject(released);
    } else {
        lock.closed.force_reject(released);
    }
    if let Some(controller) = controller {
        controller.release_steps();
    }
    tracing::trace!(lock = id, "reader lock released");
    Some(lock.requests)
}

enum ReadStep<T> {
    Pull(Option<Rc<dyn ControllerSteps<T>>>),
    Done,
    Failed(StreamError),
}

/// 默认读者。
///
/// # 教案式说明
/// - **意图 (Why)**：按顺序逐个取值，适用于值流与字节流。
/// - **契约 (What)**：
///   - [`ReadableStreamDefaultReader::read`] 在流已关闭时立即得到 `Ok(None)`，出错时得到存储的原因；
///   - 释放后 `read` 与 `cancel` 返回 [`StreamError::InvalidState`]。
/// - **设计权衡 (Trade-offs)**：丢弃读者即释放锁，仍在等待的读取会以状态错误结束。
pub struct ReadableStreamDefaultReader<T: 'static> {
    stream: RefCell<Option<StreamRef<T>>>,
    id: u64,
    closed: Deferred<()>,
}

impl<T: 'static> ReadableStreamDefaultReader<T> {
    pub(crate) fn acquire(stream: &ReadableStream<T>) -> Result<Self> {
        let (id, closed) = acquire_lock(&stream.inner, PendingReads::Default(VecDeque::new()))?;
        Ok(Self {
            stream: RefCell::new(Some(Rc::clone(&stream.inner))),
            id,
            closed,
        })
    }

    /// 读取下一个值。
    pub fn read(&self) -> ReadFuture<T> {
        let (request, future) = ReadRequest::new();
        let Some(stream) = self.stream.borrow().clone() else {
            request.error(StreamError::invalid_state(READER_RELEASED));
            return future;
        };
        let step = {
            let mut inner = stream.borrow_mut();
            inner.disturbed = true;
            match inner.state {
                ReadableState::Closed => ReadStep::Done,
                ReadableState::Errored => ReadStep::Failed(inner.stored_error()),
                ReadableState::Readable => ReadStep::Pull(inner.controller.clone()),
            }
        };
        match step {
            ReadStep::Pull(Some(controller)) => controller.pull_steps(request),
            ReadStep::Pull(None) => request.error(StreamError::invalid_state(STREAM_DROPPED)),
            ReadStep::Done => request.close(),
            ReadStep::Failed(error) => request.error(error),
        }
        future
    }

    /// 通过读者取消流，语义同 [`ReadableStream::cancel`]，但不检查锁。
    pub fn cancel(&self, reason: StreamError) -> Completion {
        match self.stream.borrow().clone() {
            Some(stream) => readable_cancel(&stream, reason),
            None => ready_err(StreamError::invalid_state(READER_RELEASED)),
        }
    }

    /// 流关闭时成功，出错或锁被释放时失败。
    pub fn closed(&self) -> DeferredFuture<()> {
        self.closed.wait()
    }

    /// 释放锁；重复调用无效果。
    pub fn release_lock(&self) {
        let Some(stream) = self.stream.borrow_mut().take() else {
            return;
        };
        if let Some(PendingReads::Default(requests)) = release_lock(&stream, self.id) {
            for request in requests {
                request.error(StreamError::invalid_state(READER_RELEASED));
            }
        }
    }
}

impl<T: 'static> Drop for ReadableStreamDefaultReader<T> {
    fn drop(&mut self) {
        self.release_lock();
    }
}

/// BYOB 读者：读取直接写入调用方提供的缓冲区。
pub struct ReadableStreamByobReader {
    stream: RefCell<Option<StreamRef<ByteView>>>,
    id: u64,
    closed: Deferred<()>,
}

impl ReadableStreamByobReader {
    pub(crate) fn acquire(stream: &ReadableStream<ByteView>) -> Result<Self> {
        if stream.inner.borrow().byte_controller.is_none() {
            return Err(StreamError::invalid_state(
                "BYOB readers can only be acquired for byte streams",
            ));
        }
        let (id, closed) = acquire_lock(&stream.inner, PendingReads::Byob(VecDeque::new()))?;
        Ok(Self {
            stream: RefCell::new(Some(Rc::clone(&stream.inner))),
            id,
            closed,
        })
    }

    /// 读取到 `view` 中，至少填满一个元素。
    pub fn read(&self, view: ByteView) -> ReadIntoFuture {
        self.read_with_min(view, 1)
    }

    /// 读取到 `view` 中，至少填满 `min_elements` 个元素才兑现（流结束时除外）。
    ///
    /// # 契约说明（What）
    /// - 零长度视图、`min_elements == 0` 或超过视图元素数时立即以 [`StreamError::InvalidArgument`] 失败；
    /// - 校验失败时视图随错误一起被丢弃。
    pub fn read_with_min(&self, view: ByteView, min_elements: usize) -> ReadIntoFuture {
        let (request, future) = ReadIntoRequest::new();
        if view.byte_length() == 0 || view.buffer_len() == 0 {
            request.error(StreamError::invalid_argument(
                "view must have a non-zero byte length",
            ));
            return future;
        }
        if min_elements == 0 {
            request.error(StreamError::invalid_argument(
                "min must be greater than zero",
            ));
            return future;
        }
        if min_elements > view.len() {
            request.error(StreamError::invalid_argument(
                "min must not exceed the number of elements in the view",
            ));
            return future;
        }
        let Some(stream) = self.stream.borrow().clone() else {
            request.error(StreamError::invalid_state(READER_RELEASED));
            return future;
        };
        let (errored, controller) = {
            let mut inner = stream.borrow_mut();
            inner.disturbed = true;
            let errored = (inner.state == ReadableState::Errored).then(|| inner.stored_error());
            (errored, inner.byte_controller.clone())
        };
        match (errored, controller) {
            (Some(error), _) => request.error(error),
            (None, Some(controller)) => controller.pull_into(view, min_elements, request),
            (None, None) => request.error(StreamError::invalid_state(STREAM_DROPPED)),
        }
        future
    }

    pub fn cancel(&self, reason: StreamError) -> Completion {
        match self.stream.borrow().clone() {
            Some(stream) => readable_cancel(&stream, reason),
            None => ready_err(StreamError::invalid_state(READER_RELEASED)),
        }
    }

    pub fn closed(&self) -> DeferredFuture<()> {
        self.closed.wait()
    }

    pub fn release_lock(&self) {
        let Some(stream) = self.stream.borrow_mut().take() else {
            return;
        };
        if let Some(PendingReads::Byob(requests)) = release_lock(&stream, self.id) {
            for request in requests {
                request.error(StreamError::invalid_state(READER_RELEASED));
            }
        }
    }
}

impl Drop for ReadableStreamByobReader {
    fn drop(&mut self) {
        self.release_lock();
    }
}
