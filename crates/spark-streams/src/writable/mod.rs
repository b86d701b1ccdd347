//! 可写流：写入排队、背压、关闭与中止的状态机。
//!
//! # 设计背景（Why）
//! - 写入者可能比下游更快，写入必须排队并按 FIFO 交给下游，一次只有一个写入在进行；
//! - “出错”分为两段：先进入 `Erroring` 等待进行中的操作结束，再进入 `Errored` 并兑现中止请求，
//!   这样下游永远不会在一个写入尚未结束时收到中止。
//!
//! # 契约说明（What）
//! - 状态迁移：`Writable → Erroring → Errored`，`Writable → Closed`，`Erroring` 也可能因进行中的
//!   关闭成功而落到 `Closed`；
//! - 关闭请求与进行中的关闭互斥，关闭标记排在所有已排队写入之后；
//! - 背压标志只在变化时翻转写者的 `ready`。
//!
//! # 实现要点（How）
//! - 流本体持有控制器强引用，控制器弱引用流本体；
//! - 等待下游完成的后续任务持有流本体强引用，保证调用方拿到的完成对象总会被兑现。

mod controller;
mod sink;
mod writer;

pub use controller::WritableStreamDefaultController;
pub use sink::UnderlyingSink;
pub use writer::WritableStreamDefaultWriter;

pub(crate) use controller::WritableControllerCore;
pub(crate) use writer::WriterSignals;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::rc::{Rc, Weak};

use futures::FutureExt;

use crate::Completion;
use crate::error::{Result, StreamError};
use crate::hook::{ready_err, ready_ok};
use crate::runtime::{self, Deferred};
use crate::strategy::QueuingStrategy;

pub(crate) type WritableRef<T> = Rc<RefCell<WritableInner<T>>>;
pub(crate) type WeakWritableRef<T> = Weak<RefCell<WritableInner<T>>>;

/// 可写流状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WritableState {
    Writable,
    Erroring,
    Closed,
    Errored,
}

pub(crate) struct PendingAbort {
    completion: Deferred<()>,
    reason: StreamError,
    was_already_erroring: bool,
}

pub(crate) struct WritableInner<T> {
    pub(crate) state: WritableState,
    pub(crate) stored_error: Option<StreamError>,
    pub(crate) writer: Option<Rc<WriterSignals>>,
    pub(crate) controller: Option<Rc<WritableControllerCore<T>>>,
    write_requests: VecDeque<Deferred<()>>,
    in_flight_write_request: Option<Deferred<()>>,
    close_request: Option<Deferred<()>>,
    in_flight_close_request: Option<Deferred<()>>,
    pending_abort_request: Option<PendingAbort>,
    pub(crate) backpressure: bool,
}

impl<T> WritableInner<T> {
    fn new() -> Self {
        Self {
            state: WritableState::Writable,
            stored_error: None,
            writer: None,
            controller: None,
            write_requests: VecDeque::new(),
            in_flight_write_request: None,
            close_request: None,
            in_flight_close_request: None,
            pending_abort_request: None,
            backpressure: false,
        }
    }

    pub(crate) fn stored_error(&self) -> StreamError {
        self.stored_error.clone().unwrap_or(StreamError::Unspecified)
    }

    pub(crate) fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close_request.is_some()
    }

    fn has_operation_marked_in_flight(&self) -> bool {
        self.in_flight_write_request.is_some() || self.in_flight_close_request.is_some()
    }

    pub(crate) fn add_write_request(&mut self) -> Deferred<()> {
        let request = Deferred::new();
        self.write_requests.push_back(request.clone());
        request
    }

    pub(crate) fn mark_first_write_request_in_flight(&mut self) {
        self.in_flight_write_request = self.write_requests.pop_front();
    }

    pub(crate) fn mark_close_request_in_flight(&mut self) {
        self.in_flight_close_request = self.close_request.take();
    }
}

/// 中止流：触发控制器的中止信号，进入出错流程，返回的完成在下游中止钩子结束后兑现。
pub(crate) fn writable_abort<T: 'static>(stream: &WritableRef<T>, reason: StreamError) -> Completion {
    let controller = {
        let inner = stream.borrow();
        if matches!(inner.state, WritableState::Closed | WritableState::Errored) {
            return ready_ok();
        }
        inner.controller.clone()
    };
    if let Some(controller) = &controller {
        controller.signal_abort(reason.clone());
    }
    let (completion, start_erroring_with) = {
        let mut inner = stream.borrow_mut();
        if matches!(inner.state, WritableState::Closed | WritableState::Errored) {
            return ready_ok();
        }
        if let Some(pending) = &inner.pending_abort_request {
            let wait = pending.completion.wait();
            return wait.boxed_local();
        }
        let was_already_erroring = inner.state == WritableState::Erroring;
        let reason = if was_already_erroring {
            StreamError::Unspecified
        } else {
            reason
        };
        let completion = Deferred::new();
        inner.pending_abort_request = Some(PendingAbort {
            completion: completion.clone(),
            reason: reason.clone(),
            was_already_erroring,
        });
        (completion, (!was_already_erroring).then_some(reason))
    };
    tracing::debug!("aborting writable stream");
    if let Some(reason) = start_erroring_with {
        start_erroring(stream, reason);
    }
    completion.wait().boxed_local()
}

/// 追加关闭请求；关闭标记排在已排队写入之后。
pub(crate) fn writable_close<T: 'static>(stream: &WritableRef<T>) -> Completion {
    let (completion, controller, ready) = {
        let mut inner = stream.borrow_mut();
        if matches!(inner.state, WritableState::Closed | WritableState::Errored) {
            return ready_err(StreamError::invalid_state(
                "cannot close a stream that is closed or errored",
            ));
        }
        let completion = Deferred::new();
        inner.close_request = Some(completion.clone());
        let ready = match &inner.writer {
            Some(signals) if inner.backpressure && inner.state == WritableState::Writable => {
                Some(signals.ready())
            }
            _ => None,
        };
        (completion, inner.controller.clone(), ready)
    };
    if let Some(ready) = ready {
        ready.resolve(());
    }
    if let Some(controller) = controller {
        controller.close();
    }
    completion.wait().boxed_local()
}

pub(crate) fn deal_with_rejection<T: 'static>(stream: &WritableRef<T>, error: StreamError) {
    let state = stream.borrow().state;
    if state == WritableState::Writable {
        start_erroring(stream, error);
    } else {
        finish_erroring(stream);
    }
}

pub(crate) fn start_erroring<T: 'static>(stream: &WritableRef<T>, reason: StreamError) {
    let (writer, finish_now) = {
        let mut inner = stream.borrow_mut();
        inner.state = WritableState::Erroring;
        inner.stored_error = Some(reason.clone());
        let started = inner
            .controller
            .as_ref()
            .is_some_and(|controller| controller.is_started());
        (
            inner.writer.clone(),
            !inner.has_operation_marked_in_flight() && started,
        )
    };
    tracing::debug!(code = reason.code(), error = %reason, "writable stream erroring");
    if let Some(writer) = writer {
        writer.ensure_ready_rejected(reason);
    }
    if finish_now {
        finish_erroring(stream);
    }
}

pub(crate) fn finish_erroring<T: 'static>(stream: &WritableRef<T>) {
    let (controller, stored, write_requests, abort) = {
        let mut inner = stream.borrow_mut();
        inner.state = WritableState::Errored;
        (
            inner.controller.clone(),
            inner.stored_error(),
            mem::take(&mut inner.write_requests),
            inner.pending_abort_request.take(),
        )
    };
    tracing::debug!(code = stored.code(), "writable stream errored");
    if let Some(controller) = &controller {
        controller.error_steps();
    }
    for request in write_requests {
        request.reject(stored.clone());
    }
    let Some(abort) = abort else {
        reject_close_and_closed_if_needed(stream);
        return;
    };
    if abort.was_already_erroring {
        abort.completion.reject(stored);
        reject_close_and_closed_if_needed(stream);
        return;
    }
    let aborted = match &controller {
        Some(controller) => controller.abort_steps(abort.reason),
        None => ready_ok(),
    };
    let stream = Rc::clone(stream);
    runtime::spawn_local(async move {
        match aborted.await {
            Ok(()) => {
                abort.completion.resolve(());
            }
            Err(error) => {
                abort.completion.reject(error);
            }
        }
        reject_close_and_closed_if_needed(&stream);
    });
}

pub(crate) fn finish_in_flight_write<T>(stream: &WritableRef<T>) {
    let request = stream.borrow_mut().in_flight_write_request.take();
    if let Some(request) = request {
        request.resolve(());
    }
}

pub(crate) fn finish_in_flight_write_with_error<T: 'static>(
    stream: &WritableRef<T>,
    error: StreamError,
) {
    let request = stream.borrow_mut().in_flight_write_request.take();
    if let Some(request) = request {
        request.reject(error.clone());
    }
    deal_with_rejection(stream, error);
}

pub(crate) fn finish_in_flight_close<T>(stream: &WritableRef<T>) {
    let (request, abort, writer) = {
        let mut inner = stream.borrow_mut();
        let request = inner.in_flight_close_request.take();
        let mut abort = None;
        if inner.state == WritableState::Erroring {
            inner.stored_error = None;
            abort = inner.pending_abort_request.take();
        }
        inner.state = WritableState::Closed;
        (request, abort, inner.writer.clone())
    };
    tracing::debug!("writable stream closed");
    if let Some(request) = request {
        request.resolve(());
    }
    if let Some(abort) = abort {
        abort.completion.resolve(());
    }
    if let Some(writer) = writer {
        writer.closed().resolve(());
    }
}

pub(crate) fn finish_in_flight_close_with_error<T: 'static>(
    stream: &WritableRef<T>,
    error: StreamError,
) {
    let (request, abort) = {
        let mut inner = stream.borrow_mut();
        (
            inner.in_flight_close_request.take(),
            inner.pending_abort_request.take(),
        )
    };
    if let Some(request) = request {
        request.reject(error.clone());
    }
    if let Some(abort) = abort {
        abort.completion.reject(error.clone());
    }
    deal_with_rejection(stream, error);
}

fn reject_close_and_closed_if_needed<T>(stream: &WritableRef<T>) {
    let (stored, close_request, writer) = {
        let mut inner = stream.borrow_mut();
        (
            inner.stored_error(),
            inner.close_request.take(),
            inner.writer.clone(),
        )
    };
    if let Some(request) = close_request {
        request.reject(stored.clone());
    }
    if let Some(writer) = writer {
        writer.closed().reject(stored);
    }
}

pub(crate) fn update_backpressure<T>(stream: &WritableRef<T>, backpressure: bool) {
    let writer = {
        let mut inner = stream.borrow_mut();
        let changed = inner.backpressure != backpressure;
        inner.backpressure = backpressure;
        if changed { inner.writer.clone() } else { None }
    };
    if let Some(writer) = writer {
        if backpressure {
            writer.reset_ready();
        } else {
            writer.ready().resolve(());
        }
    }
}

/// 可写流句柄。
///
/// # 教案式说明
/// - **意图 (Why)**：对外暴露锁定、中止、关闭与写者获取，真正的写入通过写者完成。
/// - **契约 (What)**：锁定期间 [`WritableStream::abort`] 与 [`WritableStream::close`] 返回
///   [`StreamError::InvalidState`]。
/// - **设计权衡 (Trade-offs)**：与可读流一致，单线程共享、不实现 `Send`。
pub struct WritableStream<T> {
    pub(crate) inner: WritableRef<T>,
}

impl<T> Clone for WritableStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> WritableStream<T> {
    /// 以默认策略（高水位线 1）创建可写流。
    pub fn new<S>(sink: S) -> Result<Self>
    where
        S: UnderlyingSink<T> + 'static,
    {
        Self::with_strategy(sink, QueuingStrategy::default())
    }

    /// 以指定策略创建可写流；下游的 `start` 钩子在返回前同步执行。
    pub fn with_strategy<S>(sink: S, strategy: QueuingStrategy<T>) -> Result<Self>
    where
        S: UnderlyingSink<T> + 'static,
    {
        let high_water_mark = strategy.validated_high_water_mark()?;
        let inner = Rc::new(RefCell::new(WritableInner::new()));
        let core = WritableControllerCore::new(
            Rc::downgrade(&inner),
            Rc::new(RefCell::new(sink)),
            high_water_mark,
            strategy.into_size_fn(),
        );
        inner.borrow_mut().controller = Some(Rc::clone(&core));
        core.start();
        Ok(Self { inner })
    }

    pub fn is_locked(&self) -> bool {
        self.inner.borrow().writer.is_some()
    }

    pub fn state(&self) -> WritableState {
        self.inner.borrow().state
    }

    pub fn abort(&self, reason: StreamError) -> Completion {
        if self.is_locked() {
            return ready_err(StreamError::invalid_state(
                "cannot abort a stream that is locked to a writer",
            ));
        }
        writable_abort(&self.inner, reason)
    }

    pub fn close(&self) -> Completion {
        if self.is_locked() {
            return ready_err(StreamError::invalid_state(
                "cannot close a stream that is locked to a writer",
            ));
        }
        if self.inner.borrow().close_queued_or_in_flight() {
            return ready_err(StreamError::invalid_state(
                "cannot close a stream that is already closing",
            ));
        }
        writable_close(&self.inner)
    }

    pub fn get_writer(&self) -> Result<WritableStreamDefaultWriter<T>> {
        WritableStreamDefaultWriter::acquire(self)
    }
}
