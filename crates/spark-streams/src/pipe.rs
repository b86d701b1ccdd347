//! 管道：把可读流的值持续写入可写流，并在任一端结束时按选项传播关闭、出错与取消。
//!
//! # 设计背景（Why）
//! - 手写“读一个写一个”的循环很容易忽略背压、漏掉错误传播或在关闭时丢失尚未完成的写入；
//! - 管道把这些规则固化下来：先等写者就绪再读取，任一端结束时先等待最后一次写入，再执行收尾动作。
//!
//! # 契约说明（What）
//! - 两端在调用时立即锁定，管道结束后两把锁都会释放；
//! - 收尾原因的检查顺序为：中止信号、源出错、目标出错（含正在出错）、源关闭、目标已关闭或正在关闭；
//! - 返回的完成在收尾动作结束后兑现：收尾动作失败时以该错误拒绝，否则以触发收尾的原始错误拒绝，
//!   源正常关闭时兑现为成功；
//! - 管道循环由调度器驱动，调用方不轮询返回值也会继续推进。

use futures::FutureExt;
use futures::future::{self, Either, LocalBoxFuture};

use crate::Completion;
use crate::error::{Result, StreamError};
use crate::hook::ready_err;
use crate::readable::{ReadableState, ReadableStream, ReadableStreamDefaultReader};
use crate::runtime::{self, Deferred};
use crate::signal::AbortSignal;
use crate::transform::TransformStream;
use crate::writable::{WritableState, WritableStream, WritableStreamDefaultWriter};

/// 管道选项。
///
/// - `prevent_close`：源关闭时不关闭目标；
/// - `prevent_abort`：源出错时不中止目标；
/// - `prevent_cancel`：目标出错或关闭时不取消源；
/// - `signal`：外部中止信号，触发后按上述选项中止目标并取消源。
#[derive(Clone, Default)]
pub struct PipeOptions {
    pub prevent_close: bool,
    pub prevent_abort: bool,
    pub prevent_cancel: bool,
    pub signal: Option<AbortSignal>,
}

impl PipeOptions {
    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// 可写端与可读端的组合，[`ReadableStream::pipe_through`] 的参数。
pub struct ReadableWritablePair<I, O> {
    pub writable: WritableStream<I>,
    pub readable: ReadableStream<O>,
}

impl<I: 'static, O: 'static> From<&TransformStream<I, O>> for ReadableWritablePair<I, O> {
    fn from(transform: &TransformStream<I, O>) -> Self {
        Self {
            writable: transform.writable(),
            readable: transform.readable(),
        }
    }
}

impl<I: 'static, O: 'static> From<TransformStream<I, O>> for ReadableWritablePair<I, O> {
    fn from(transform: TransformStream<I, O>) -> Self {
        Self::from(&transform)
    }
}

/// 触发收尾的原因。
#[derive(Debug)]
enum Shutdown {
    Aborted(StreamError),
    SourceErrored(StreamError),
    DestErrored(StreamError),
    SourceClosed,
    DestClosed,
}

impl Shutdown {
    fn label(&self) -> &'static str {
        match self {
            Shutdown::Aborted(_) => "aborted",
            Shutdown::SourceErrored(_) => "source errored",
            Shutdown::DestErrored(_) => "destination errored",
            Shutdown::SourceClosed => "source closed",
            Shutdown::DestClosed => "destination closed",
        }
    }
}

struct Pipe<T: 'static> {
    source: ReadableStream<T>,
    dest: WritableStream<T>,
    reader: ReadableStreamDefaultReader<T>,
    writer: WritableStreamDefaultWriter<T>,
    options: PipeOptions,
    last_write: Option<Completion>,
}

impl<T: 'static> Pipe<T> {
    /// 按固定顺序检查两端状态，返回应当触发的收尾原因。
    fn check(&self) -> Option<Shutdown> {
        if let Some(signal) = &self.options.signal {
            if let Some(reason) = signal.reason() {
                return Some(Shutdown::Aborted(reason));
            }
        }
        let (source_state, source_error) = {
            let inner = self.source.inner.borrow();
            (inner.state, inner.stored_error())
        };
        if source_state == ReadableState::Errored {
            return Some(Shutdown::SourceErrored(source_error));
        }
        let (dest_state, dest_closing, dest_error) = {
            let inner = self.dest.inner.borrow();
            (
                inner.state,
                inner.close_queued_or_in_flight(),
                inner.stored_error(),
            )
        };
        if matches!(dest_state, WritableState::Erroring | WritableState::Errored) {
            return Some(Shutdown::DestErrored(dest_error));
        }
        if source_state == ReadableState::Closed {
            return Some(Shutdown::SourceClosed);
        }
        if dest_closing || dest_state == WritableState::Closed {
            return Some(Shutdown::DestClosed);
        }
        None
    }

    /// 任一端状态变化或中止信号触发时完成。
    fn watch(&self) -> LocalBoxFuture<'static, ()> {
        let mut events: Vec<LocalBoxFuture<'static, ()>> = vec![
            self.reader.closed().map(|_| ()).boxed_local(),
            self.writer.closed().map(|_| ()).boxed_local(),
        ];
        if let Some(signal) = &self.options.signal {
            events.push(signal.aborted().map(|_| ()).boxed_local());
        }
        future::select_all(events).map(|_| ()).boxed_local()
    }

    async fn pump(&mut self) -> Shutdown {
        loop {
            if let Some(shutdown) = self.check() {
                return shutdown;
            }
            let ready = self.writer.ready().boxed_local();
            match future::select(ready, self.watch()).await {
                Either::Left((Ok(()), _)) => {}
                Either::Left((Err(_), _)) | Either::Right(_) => continue,
            }
            if let Some(shutdown) = self.check() {
                return shutdown;
            }
            let read = self.reader.read().boxed_local();
            match future::select(read, self.watch()).await {
                Either::Left((Ok(Some(chunk)), _)) => {
                    self.last_write = Some(self.writer.write(chunk));
                }
                Either::Left((Ok(None), _)) | Either::Right(_) => {}
                Either::Left((Err(error), _)) => {
                    if let Some(shutdown) = self.check() {
                        return shutdown;
                    }
                    return Shutdown::SourceErrored(error);
                }
            }
        }
    }

    /// 目标仍可写且未在关闭时，等待最后一次写入结束。
    async fn wait_for_pending_write(&mut self) {
        let writable = {
            let inner = self.dest.inner.borrow();
            inner.state == WritableState::Writable && !inner.close_queued_or_in_flight()
        };
        if !writable {
            return;
        }
        if let Some(write) = self.last_write.take() {
            if let Err(error) = write.await {
                tracing::trace!(code = error.code(), error = %error, "last piped write failed");
            }
        }
    }

    /// 依据原因生成收尾动作与原始结果。
    fn plan(&self, shutdown: Shutdown) -> (Vec<Completion>, Result<()>) {
        let options = &self.options;
        match shutdown {
            Shutdown::Aborted(error) => {
                let mut actions = Vec::new();
                if !options.prevent_abort && self.dest.state() == WritableState::Writable {
                    actions.push(self.writer.abort(error.clone()));
                }
                if !options.prevent_cancel && self.source.state() == ReadableState::Readable {
                    actions.push(self.reader.cancel(error.clone()));
                }
                (actions, Err(error))
            }
            Shutdown::SourceErrored(error) => {
                let actions = if options.prevent_abort {
                    Vec::new()
                } else {
                    vec![self.writer.abort(error.clone())]
                };
                (actions, Err(error))
            }
            Shutdown::DestErrored(error) => {
                let actions = if options.prevent_cancel {
                    Vec::new()
                } else {
                    vec![self.reader.cancel(error.clone())]
                };
                (actions, Err(error))
            }
            Shutdown::SourceClosed => {
                let actions = if options.prevent_close {
                    Vec::new()
                } else {
                    vec![self.writer.close_with_error_propagation()]
                };
                (actions, Ok(()))
            }
            Shutdown::DestClosed => {
                let error = StreamError::invalid_state("the destination writable stream closed");
                let actions = if options.prevent_cancel {
                    Vec::new()
                } else {
                    vec![self.reader.cancel(error.clone())]
                };
                (actions, Err(error))
            }
        }
    }

    async fn run(mut self) -> Result<()> {
        let shutdown = self.pump().await;
        tracing::debug!(reason = shutdown.label(), "pipe shutting down");
        self.wait_for_pending_write().await;
        let (actions, original) = self.plan(shutdown);
        let outcome = match future::try_join_all(actions).await {
            Ok(_) => original,
            Err(error) => Err(error),
        };
        self.writer.release_lock();
        self.reader.release_lock();
        match &outcome {
            Ok(()) => tracing::debug!("pipe finished"),
            Err(error) => tracing::debug!(code = error.code(), error = %error, "pipe finished with error"),
        }
        outcome
    }
}

impl<T: 'static> ReadableStream<T> {
    /// 把本流管道到 `dest`。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：在两个流之间搬运数据，同时遵守目标的背压。
    /// - **契约 (What)**：
    ///   - 任一端已被锁定时立即以 [`StreamError::InvalidState`] 失败且不锁定另一端；
    ///   - 本流被标记为已扰动；
    ///   - 完成语义见模块文档。
    /// - **执行逻辑 (How)**：锁定两端后把循环交给调度器，返回的完成只观察结果。
    pub fn pipe_to(&self, dest: &WritableStream<T>, options: PipeOptions) -> Completion {
        if self.is_locked() {
            return ready_err(StreamError::invalid_state(
                "cannot pipe a stream that is locked to a reader",
            ));
        }
        if dest.is_locked() {
            return ready_err(StreamError::invalid_state(
                "cannot pipe to a stream that is locked to a writer",
            ));
        }
        let reader = match self.get_reader() {
            Ok(reader) => reader,
            Err(error) => return ready_err(error),
        };
        let writer = match dest.get_writer() {
            Ok(writer) => writer,
            Err(error) => return ready_err(error),
        };
        self.inner.borrow_mut().disturbed = true;
        tracing::debug!(
            prevent_close = options.prevent_close,
            prevent_abort = options.prevent_abort,
            prevent_cancel = options.prevent_cancel,
            "pipe started"
        );
        let pipe = Pipe {
            source: self.clone(),
            dest: dest.clone(),
            reader,
            writer,
            options,
            last_write: None,
        };
        let done = Deferred::new();
        let settle = done.clone();
        runtime::spawn_local(async move {
            match pipe.run().await {
                Ok(()) => {
                    settle.resolve(());
                }
                Err(error) => {
                    settle.reject(error);
                }
            }
        });
        done.wait().boxed_local()
    }

    /// 管道到 `transform` 的可写端并返回其可读端。
    ///
    /// 本流或可写端已锁定时返回 [`StreamError::InvalidState`]；管道本身的失败只记录日志。
    pub fn pipe_through<O, P>(&self, transform: P, options: PipeOptions) -> Result<ReadableStream<O>>
    where
        O: 'static,
        P: Into<ReadableWritablePair<T, O>>,
    {
        let pair = transform.into();
        if self.is_locked() {
            return Err(StreamError::invalid_state(
                "cannot pipe a stream that is locked to a reader",
            ));
        }
        if pair.writable.is_locked() {
            return Err(StreamError::invalid_state(
                "cannot pipe to a stream that is locked to a writer",
            ));
        }
        let piping = self.pipe_to(&pair.writable, options);
        runtime::spawn_local(async move {
            if let Err(error) = piping.await {
                tracing::debug!(code = error.code(), error = %error, "pipe through ended with error");
            }
        });
        Ok(pair.readable)
    }
}
