//! 可读流：状态机、读者锁与控制器分派。
//!
//! # 设计背景（Why）
//! - 可读流在“可读 → 已关闭 / 已出错”之间单向迁移，读者锁保证同一时刻只有一个消费者；
//! - 值流与字节流共享同一套状态机，只在“控制器如何满足一次读取”上分叉，因此以
//!   [`ControllerSteps`] 作为接缝，字节流额外持有字节控制器以支持 BYOB 读取。
//!
//! # 契约说明（What）
//! - 状态一旦离开 `Readable` 便不再变化；
//! - 任何时刻只有一个读者锁，读者类型决定挂起请求队列的种类；
//! - 在控制器状态与流状态上都不会跨越用户钩子持有借用。
//!
//! # 实现要点（How）
//! - 流本体持有控制器的强引用，控制器通过 `Weak` 反指流本体，避免引用环；
//! - 读请求以 `oneshot` 通道表达，兑现时只发送消息，不会同步执行等待者的逻辑。

mod byte_controller;
mod default_controller;
mod iter;
mod reader;
mod source;

pub use byte_controller::{ByteStreamOptions, ReadableByteStreamController, ReadableStreamByobRequest};
pub use default_controller::ReadableStreamDefaultController;
pub use iter::ReadableStreamIter;
pub use reader::{
    ReadFuture, ReadIntoFuture, ReadIntoResult, ReadableStreamByobReader,
    ReadableStreamDefaultReader,
};
pub use source::{UnderlyingByteSource, UnderlyingSource};

pub(crate) use byte_controller::ByteControllerCore;
pub(crate) use default_controller::DefaultControllerCore;
pub(crate) use reader::{ReadIntoRequest, ReadRequest};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::rc::{Rc, Weak};

use futures::FutureExt;

use crate::ByteView;
use crate::Completion;
use crate::error::{Result, StreamError};
use crate::runtime::Deferred;
use crate::strategy::QueuingStrategy;

pub(crate) type StreamRef<T> = Rc<RefCell<ReadableInner<T>>>;
pub(crate) type WeakStreamRef<T> = Weak<RefCell<ReadableInner<T>>>;

type TeeHook<T> = fn(&ReadableStream<T>) -> Result<(ReadableStream<T>, ReadableStream<T>)>;

/// 可读流状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadableState {
    Readable,
    Closed,
    Errored,
}

/// 控制器种类标签。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerKind {
    Default,
    Byte,
}

/// 控制器需要向流本体提供的三个步骤。
pub(crate) trait ControllerSteps<T> {
    /// 为一次默认读取提供数据，或把请求挂起。
    fn pull_steps(&self, request: ReadRequest<T>);
    /// 丢弃排队数据并调用来源的取消钩子。
    fn cancel_steps(&self, reason: StreamError) -> Completion;
    /// 读者释放锁时的控制器侧清理。
    fn release_steps(&self);
}

pub(crate) enum PendingReads<T> {
    Default(VecDeque<ReadRequest<T>>),
    Byob(VecDeque<ReadIntoRequest>),
}

pub(crate) struct ReaderLock<T> {
    pub(crate) id: u64,
    pub(crate) closed: Deferred<()>,
    pub(crate) requests: PendingReads<T>,
}

pub(crate) struct ReadableInner<T> {
    pub(crate) state: ReadableState,
    pub(crate) stored_error: Option<StreamError>,
    pub(crate) disturbed: bool,
    pub(crate) reader: Option<ReaderLock<T>>,
    pub(crate) controller: Option<Rc<dyn ControllerSteps<T>>>,
    pub(crate) byte_controller: Option<Rc<ByteControllerCore>>,
    tee_hook: Option<TeeHook<T>>,
}

impl<T> ReadableInner<T> {
    fn new() -> Self {
        Self {
            state: ReadableState::Readable,
            stored_error: None,
            disturbed: false,
            reader: None,
            controller: None,
            byte_controller: None,
            tee_hook: None,
        }
    }

    pub(crate) fn stored_error(&self) -> StreamError {
        self.stored_error.clone().unwrap_or(StreamError::Unspecified)
    }

    pub(crate) fn has_default_reader(&self) -> bool {
        matches!(
            self.reader,
            Some(ReaderLock {
                requests: PendingReads::Default(_),
                ..
            })
        )
    }

    pub(crate) fn has_byob_reader(&self) -> bool {
        matches!(
            self.reader,
            Some(ReaderLock {
                requests: PendingReads::Byob(_),
                ..
            })
        )
    }

    pub(crate) fn num_read_requests(&self) -> usize {
        match &self.reader {
            Some(ReaderLock {
                requests: PendingReads::Default(queue),
                ..
            }) => queue.len(),
            _ => 0,
        }
    }

    pub(crate) fn num_read_into_requests(&self) -> usize {
        match &self.reader {
            Some(ReaderLock {
                requests: PendingReads::Byob(queue),
                ..
            }) => queue.len(),
            _ => 0,
        }
    }

    pub(crate) fn take_read_request(&mut self) -> Option<ReadRequest<T>> {
        match &mut self.reader {
            Some(ReaderLock {
                requests: PendingReads::Default(queue),
                ..
            }) => queue.pop_front(),
            _ => None,
        }
    }

    pub(crate) fn take_read_into_request(&mut self) -> Option<ReadIntoRequest> {
        match &mut self.reader {
            Some(ReaderLock {
                requests: PendingReads::Byob(queue),
                ..
            }) => queue.pop_front(),
            _ => None,
        }
    }

    /// 挂起一次默认读取；没有默认读者时把请求原样退回。
    pub(crate) fn push_read_request(
        &mut self,
        request: ReadRequest<T>,
    ) -> std::result::Result<(), ReadRequest<T>> {
        match &mut self.reader {
            Some(ReaderLock {
                requests: PendingReads::Default(queue),
                ..
            }) => {
                queue.push_back(request);
                Ok(())
            }
            _ => Err(request),
        }
    }

    pub(crate) fn push_read_into_request(
        &mut self,
        request: ReadIntoRequest,
    ) -> std::result::Result<(), ReadIntoRequest> {
        match &mut self.reader {
            Some(ReaderLock {
                requests: PendingReads::Byob(queue),
                ..
            }) => {
                queue.push_back(request);
                Ok(())
            }
            _ => Err(request),
        }
    }
}

/// 把一个值或结束信号交给最早挂起的默认读取。
pub(crate) fn fulfill_read_request<T>(stream: &StreamRef<T>, chunk: Option<T>) {
    let request = stream.borrow_mut().take_read_request();
    if let Some(request) = request {
        match chunk {
            Some(chunk) => request.chunk(chunk),
            None => request.close(),
        }
    }
}

/// 把填充好的视图交给最早挂起的 BYOB 读取。
pub(crate) fn fulfill_read_into_request(stream: &StreamRef<ByteView>, view: ByteView, done: bool) {
    let request = stream.borrow_mut().take_read_into_request();
    if let Some(request) = request {
        if done {
            request.close(Some(view));
        } else {
            request.chunk(view);
        }
    }
}

/// 关闭流：兑现读者的 `closed`，并以“结束”完成所有挂起的默认读取。
pub(crate) fn readable_close<T>(stream: &StreamRef<T>) {
    let (closed, requests) = {
        let mut inner = stream.borrow_mut();
        if inner.state != ReadableState::Readable {
            return;
        }
        inner.state = ReadableState::Closed;
        match &mut inner.reader {
            None => (None, VecDeque::new()),
            Some(lock) => {
                let requests = match &mut lock.requests {
                    PendingReads::Default(queue) => mem::take(queue),
                    PendingReads::Byob(_) => VecDeque::new(),
                };
                (Some(lock.closed.clone()), requests)
            }
        }
    };
    tracing::debug!("readable stream closed");
    if let Some(closed) = closed {
        closed.resolve(());
    }
    for request in requests {
        request.close();
    }
}

/// 使流出错：保存原因，拒绝读者的 `closed` 与所有挂起的读取。
pub(crate) fn readable_error<T>(stream: &StreamRef<T>, error: StreamError) {
    let (closed, reads) = {
        let mut inner = stream.borrow_mut();
        if inner.state != ReadableState::Readable {
            return;
        }
        inner.state = ReadableState::Errored;
        inner.stored_error = Some(error.clone());
        match &mut inner.reader {
            None => (None, None),
            Some(lock) => {
                let empty = match lock.requests {
                    PendingReads::Default(_) => PendingReads::Default(VecDeque::new()),
                    PendingReads::Byob(_) => PendingReads::Byob(VecDeque::new()),
                };
                let reads = mem::replace(&mut lock.requests, empty);
                (Some(lock.closed.clone()), Some(reads))
            }
        }
    };
    tracing::debug!(code = error.code(), error = %error, "readable stream errored");
    if let Some(closed) = closed {
        closed.reject(error.clone());
    }
    match reads {
        Some(PendingReads::Default(requests)) => {
            for request in requests {
                request.error(error.clone());
            }
        }
        Some(PendingReads::Byob(requests)) => {
            for request in requests {
                request.error(error.clone());
            }
        }
        None => {}
    }
}

/// 取消流：关闭后调用控制器的取消步骤，结果只反映来源钩子的成败。
pub(crate) fn readable_cancel<T: 'static>(stream: &StreamRef<T>, reason: StreamError) -> Completion {
    let controller = {
        let mut inner = stream.borrow_mut();
        inner.disturbed = true;
        match inner.state {
            ReadableState::Closed => return futures::future::ready(Ok(())).boxed_local(),
            ReadableState::Errored => {
                return futures::future::ready(Err(inner.stored_error())).boxed_local();
            }
            ReadableState::Readable => inner.controller.clone(),
        }
    };
    tracing::debug!(reason = %reason, "cancelling readable stream");
    readable_close(stream);
    let byob_requests = {
        let mut inner = stream.borrow_mut();
        match &mut inner.reader {
            Some(ReaderLock {
                requests: PendingReads::Byob(queue),
                ..
            }) => mem::take(queue),
            _ => VecDeque::new(),
        }
    };
    for request in byob_requests {
        request.close(None);
    }
    match controller {
        Some(controller) => controller.cancel_steps(reason),
        None => futures::future::ready(Ok(())).boxed_local(),
    }
}

/// 可读流句柄。
///
/// # 教案式说明
/// - **意图 (Why)**：对外暴露锁定、取消、读者获取、管道与分叉等入口，状态本体由内部共享。
/// - **契约 (What)**：
///   - 句柄可克隆，所有克隆指向同一个流；
///   - 锁定期间 [`ReadableStream::cancel`]、[`ReadableStream::get_reader`] 等入口返回
///     [`StreamError::InvalidState`]。
/// - **设计权衡 (Trade-offs)**：单线程共享，句柄不实现 `Send`。
pub struct ReadableStream<T> {
    pub(crate) inner: StreamRef<T>,
}

impl<T> Clone for ReadableStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> ReadableStream<T> {
    /// 以默认策略（高水位线 1，每个值计 1）创建值流。
    pub fn new<S>(source: S) -> Result<Self>
    where
        S: UnderlyingSource<T> + 'static,
    {
        Self::with_strategy(source, QueuingStrategy::default())
    }

    /// 以指定策略创建值流；来源的 `start` 钩子在返回前同步执行。
    pub fn with_strategy<S>(source: S, strategy: QueuingStrategy<T>) -> Result<Self>
    where
        S: UnderlyingSource<T> + 'static,
    {
        let high_water_mark = strategy.validated_high_water_mark()?;
        let inner = Rc::new(RefCell::new(ReadableInner::new()));
        let core = DefaultControllerCore::new(
            Rc::downgrade(&inner),
            Rc::new(RefCell::new(source)),
            high_water_mark,
            strategy.into_size_fn(),
        );
        inner.borrow_mut().controller = Some(core.clone() as Rc<dyn ControllerSteps<T>>);
        core.start();
        Ok(Self { inner })
    }

    /// 由迭代器按需产出值，迭代结束即关闭。
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
    {
        let inner = Rc::new(RefCell::new(ReadableInner::new()));
        let core = DefaultControllerCore::new(
            Rc::downgrade(&inner),
            Rc::new(RefCell::new(source::IterSource::new(iter.into_iter()))),
            0.0,
            None,
        );
        inner.borrow_mut().controller = Some(core.clone() as Rc<dyn ControllerSteps<T>>);
        core.start();
        Self { inner }
    }

    /// 是否已被读者锁定。
    pub fn is_locked(&self) -> bool {
        self.inner.borrow().reader.is_some()
    }

    pub fn state(&self) -> ReadableState {
        self.inner.borrow().state
    }

    /// 是否曾被读取或取消。
    pub fn is_disturbed(&self) -> bool {
        self.inner.borrow().disturbed
    }

    pub fn controller_kind(&self) -> ControllerKind {
        if self.inner.borrow().byte_controller.is_some() {
            ControllerKind::Byte
        } else {
            ControllerKind::Default
        }
    }

    /// 取消未锁定的流。
    pub fn cancel(&self, reason: StreamError) -> Completion {
        if self.is_locked() {
            return futures::future::ready(Err(StreamError::invalid_state(
                "cannot cancel a stream that is locked to a reader",
            )))
            .boxed_local();
        }
        readable_cancel(&self.inner, reason)
    }

    /// 获取默认读者并锁定流。
    pub fn get_reader(&self) -> Result<ReadableStreamDefaultReader<T>> {
        ReadableStreamDefaultReader::acquire(self)
    }

    /// 以异步序列的方式消费流；序列被丢弃时，除非 `prevent_cancel`，否则取消流。
    pub fn values(&self, prevent_cancel: bool) -> Result<ReadableStreamIter<T>> {
        let reader = self.get_reader()?;
        Ok(ReadableStreamIter::new(reader, prevent_cancel))
    }
}

impl<T: Clone + 'static> ReadableStream<T> {
    /// 分叉为两个独立消费的分支。
    ///
    /// # 契约说明（What）
    /// - 值流的每个值在分支一得到原值、分支二得到克隆；
    /// - 字节流走字节分叉，分支同样是字节流且支持 BYOB 读取，两分支不共享可变缓冲区；
    /// - 只有两个分支都取消时才会取消源流，原因为 [`StreamError::Combined`]。
    pub fn tee(&self) -> Result<(ReadableStream<T>, ReadableStream<T>)> {
        let hook = self.inner.borrow().tee_hook;
        match hook {
            Some(byte_tee) => byte_tee(self),
            None => crate::tee::default_tee(self),
        }
    }
}

impl ReadableStream<ByteView> {
    /// 创建字节流。
    pub fn new_bytes<S>(source: S, options: ByteStreamOptions) -> Result<Self>
    where
        S: UnderlyingByteSource + 'static,
    {
        let options = options.validated()?;
        let inner = Rc::new(RefCell::new(ReadableInner::new()));
        let core = ByteControllerCore::new(
            Rc::downgrade(&inner),
            Rc::new(RefCell::new(source)),
            options,
        );
        {
            let mut guard = inner.borrow_mut();
            guard.controller = Some(core.clone() as Rc<dyn ControllerSteps<ByteView>>);
            guard.byte_controller = Some(core.clone());
            guard.tee_hook = Some(crate::tee::byte_tee);
        }
        core.start();
        Ok(Self { inner })
    }

    /// 获取 BYOB 读者；只有字节流支持。
    pub fn get_byob_reader(&self) -> Result<ReadableStreamByobReader> {
        ReadableStreamByobReader::acquire(self)
    }
}
