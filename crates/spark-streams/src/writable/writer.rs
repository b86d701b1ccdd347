//! 写者：可写流的独占写入端。

use std::cell::RefCell;
use std::rc::Rc;

use futures::FutureExt;

use crate::Completion;
use crate::error::{Result, StreamError};
use crate::hook::{ready_err, ready_ok};
use crate::runtime::{Deferred, DeferredFuture};

use super::{WritableRef, WritableState, WritableStream, writable_abort, writable_close};

const WRITER_RELEASED: &str = "writer lock has been released";

/// 写者与流本体共享的 `ready`/`closed` 信号。
pub(crate) struct WriterSignals {
    ready: RefCell<Deferred<()>>,
    closed: Deferred<()>,
}

impl WriterSignals {
    pub(crate) fn ready(&self) -> Deferred<()> {
        self.ready.borrow().clone()
    }

    pub(crate) fn closed(&self) -> Deferred<()> {
        self.closed.clone()
    }

    /// 背压出现时换上新的待定 `ready`。
    pub(crate) fn reset_ready(&self) {
        *self.ready.borrow_mut() = Deferred::new();
    }

    pub(crate) fn ensure_ready_rejected(&self, error: StreamError) {
        let ready = self.ready();
        if ready.is_pending() {
            ready.reject(error);
        } else {
            *self.ready.borrow_mut() = Deferred::rejected(error);
        }
    }

    fn ensure_closed_rejected(&self, error: StreamError) {
        self.closed.force_reject(error);
    }
}

/// 可写流写者。
///
/// # 教案式说明
/// - **意图 (Why)**：把写入、关闭、中止与背压观察集中到唯一持有者上。
/// - **契约 (What)**：
///   - [`WritableStreamDefaultWriter::ready`] 在没有背压时兑现，出错时拒绝；
///   - [`WritableStreamDefaultWriter::write`] 的完成在下游处理完该值后兑现；
///   - 释放后所有操作返回 [`StreamError::InvalidState`]，`ready` 与 `closed` 均被拒绝；
///   - 写者被丢弃时自动释放锁。
/// - **执行逻辑 (How)**：获取锁时按流状态初始化 `ready` 与 `closed`。
pub struct WritableStreamDefaultWriter<T: 'static> {
    stream: RefCell<Option<WritableRef<T>>>,
    signals: Rc<WriterSignals>,
}

impl<T: 'static> WritableStreamDefaultWriter<T> {
    pub(crate) fn acquire(stream: &WritableStream<T>) -> Result<Self> {
        let mut inner = stream.inner.borrow_mut();
        if inner.writer.is_some() {
            return Err(StreamError::invalid_state(
                "stream is already locked to a writer",
            ));
        }
        let (ready, closed) = match inner.state {
            WritableState::Writable => {
                let ready = if !inner.close_queued_or_in_flight() && inner.backpressure {
                    Deferred::new()
                } else {
                    Deferred::resolved(())
                };
                (ready, Deferred::new())
            }
            WritableState::Erroring => (Deferred::rejected(inner.stored_error()), Deferred::new()),
            WritableState::Closed => (Deferred::resolved(()), Deferred::resolved(())),
            WritableState::Errored => {
                let stored = inner.stored_error();
                (Deferred::rejected(stored.clone()), Deferred::rejected(stored))
            }
        };
        let signals = Rc::new(WriterSignals {
            ready: RefCell::new(ready),
            closed,
        });
        inner.writer = Some(Rc::clone(&signals));
        Ok(Self {
            stream: RefCell::new(Some(Rc::clone(&stream.inner))),
            signals,
        })
    }

    fn stream(&self) -> Option<WritableRef<T>> {
        self.stream.borrow().clone()
    }

    pub fn ready(&self) -> DeferredFuture<()> {
        self.signals.ready().wait()
    }

    pub fn closed(&self) -> DeferredFuture<()> {
        self.signals.closed().wait()
    }

    /// 期望尺寸；出错或正在出错时为 `None`，关闭后为 `0`。
    pub fn desired_size(&self) -> Result<Option<f64>> {
        let stream = self
            .stream()
            .ok_or_else(|| StreamError::invalid_state(WRITER_RELEASED))?;
        let (state, controller) = {
            let inner = stream.borrow();
            (inner.state, inner.controller.clone())
        };
        Ok(match state {
            WritableState::Errored | WritableState::Erroring => None,
            WritableState::Closed => Some(0.0),
            WritableState::Writable => controller.map(|controller| controller.desired_size()),
        })
    }

    /// 写入一个值。
    pub fn write(&self, chunk: T) -> Completion {
        let Some(stream) = self.stream() else {
            return ready_err(StreamError::invalid_state(WRITER_RELEASED));
        };
        let controller = stream.borrow().controller.clone();
        let Some(controller) = controller else {
            return ready_err(StreamError::invalid_state("stream has been dropped"));
        };
        let size = controller.chunk_size(&chunk);
        let request = {
            let mut inner = stream.borrow_mut();
            let still_locked = inner
                .writer
                .as_ref()
                .is_some_and(|signals| Rc::ptr_eq(signals, &self.signals));
            if !still_locked {
                return ready_err(StreamError::invalid_state(WRITER_RELEASED));
            }
            let closing =
                inner.close_queued_or_in_flight() || inner.state == WritableState::Closed;
            match inner.state {
                WritableState::Errored => return ready_err(inner.stored_error()),
                _ if closing => {
                    return ready_err(StreamError::invalid_state(
                        "cannot write to a stream that is closing or closed",
                    ));
                }
                WritableState::Erroring => return ready_err(inner.stored_error()),
                _ => inner.add_write_request(),
            }
        };
        controller.write(chunk, size);
        request.wait().boxed_local()
    }

    pub fn close(&self) -> Completion {
        let Some(stream) = self.stream() else {
            return ready_err(StreamError::invalid_state(WRITER_RELEASED));
        };
        if stream.borrow().close_queued_or_in_flight() {
            return ready_err(StreamError::invalid_state(
                "cannot close a stream that is already closing",
            ));
        }
        writable_close(&stream)
    }

    /// 关闭流，但把已有的错误原样向外传播；已在关闭中或已关闭时视为成功。
    pub(crate) fn close_with_error_propagation(&self) -> Completion {
        let Some(stream) = self.stream() else {
            return ready_err(StreamError::invalid_state(WRITER_RELEASED));
        };
        let (state, closing, stored) = {
            let inner = stream.borrow();
            (
                inner.state,
                inner.close_queued_or_in_flight(),
                inner.stored_error(),
            )
        };
        if closing || state == WritableState::Closed {
            return ready_ok();
        }
        if state == WritableState::Errored {
            return ready_err(stored);
        }
        writable_close(&stream)
    }

    pub fn abort(&self, reason: StreamError) -> Completion {
        match self.stream() {
            Some(stream) => writable_abort(&stream, reason),
            None => ready_err(StreamError::invalid_state(WRITER_RELEASED)),
        }
    }

    /// 释放锁；重复调用无效果。
    pub fn release_lock(&self) {
        let Some(stream) = self.stream.borrow_mut().take() else {
            return;
        };
        let released = StreamError::invalid_state(WRITER_RELEASED);
        self.signals.ensure_ready_rejected(released.clone());
        self.signals.ensure_closed_rejected(released);
        stream.borrow_mut().writer = None;
        tracing::trace!("writer lock released");
    }
}

impl<T: 'static> Drop for WritableStreamDefaultWriter<T> {
    fn drop(&mut self) {
        self.release_lock();
    }
}
