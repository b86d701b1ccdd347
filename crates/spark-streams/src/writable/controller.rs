//! 可写流控制器：写入队列推进与下游钩子调度。

use std::cell::RefCell;
use std::mem;
use std::rc::{Rc, Weak};

use crate::Completion;
use crate::error::StreamError;
use crate::hook::{invoke_hook, ready_ok};
use crate::queue::SizedQueue;
use crate::runtime;
use crate::signal::{AbortController, AbortSignal};
use crate::strategy::SizeFn;

use super::{
    UnderlyingSink, WeakWritableRef, WritableRef, WritableState, deal_with_rejection,
    finish_erroring, finish_in_flight_close, finish_in_flight_close_with_error,
    finish_in_flight_write, finish_in_flight_write_with_error, start_erroring,
    update_backpressure,
};

/// 写入队列条目；关闭标记以尺寸 0 排在末尾。
enum WriteRecord<T> {
    Chunk(T),
    /// 值已交给下游，条目保留到写入完成以维持排队总量。
    InFlight,
    Close,
}

struct WritableControllerState<T> {
    stream: WeakWritableRef<T>,
    queue: SizedQueue<WriteRecord<T>>,
    high_water_mark: f64,
    size: Option<SizeFn<T>>,
    sink: Option<Rc<RefCell<dyn UnderlyingSink<T>>>>,
    started: bool,
}

pub(crate) struct WritableControllerCore<T> {
    this: Weak<Self>,
    abort_controller: AbortController,
    state: RefCell<WritableControllerState<T>>,
}

impl<T: 'static> WritableControllerCore<T> {
    pub(crate) fn new(
        stream: WeakWritableRef<T>,
        sink: Rc<RefCell<dyn UnderlyingSink<T>>>,
        high_water_mark: f64,
        size: Option<SizeFn<T>>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            abort_controller: AbortController::new(),
            state: RefCell::new(WritableControllerState {
                stream,
                queue: SizedQueue::new(),
                high_water_mark,
                size,
                sink: Some(sink),
                started: false,
            }),
        })
    }

    fn handle(&self) -> WritableStreamDefaultController<T> {
        WritableStreamDefaultController {
            core: self.this.clone(),
        }
    }

    fn stream(&self) -> Option<WritableRef<T>> {
        self.state.borrow().stream.upgrade()
    }

    pub(crate) fn is_started(&self) -> bool {
        self.state.borrow().started
    }

    pub(crate) fn signal_abort(&self, reason: StreamError) {
        self.abort_controller.abort(Some(reason));
    }

    pub(crate) fn start(&self) {
        let Some(stream) = self.stream() else {
            return;
        };
        update_backpressure(&stream, self.backpressure());
        let sink = self.state.borrow().sink.clone();
        let controller = self.handle();
        let started = match sink {
            Some(sink) => invoke_hook(&sink, |sink| sink.start(&controller)),
            None => ready_ok(),
        };
        let Some(core) = self.this.upgrade() else {
            return;
        };
        runtime::spawn_local(async move {
            let outcome = started.await;
            core.state.borrow_mut().started = true;
            match outcome {
                Ok(()) => core.advance_queue_if_needed(&stream),
                Err(error) => deal_with_rejection(&stream, error),
            }
        });
    }

    pub(crate) fn desired_size(&self) -> f64 {
        let inner = self.state.borrow();
        inner.high_water_mark - inner.queue.total_size()
    }

    pub(crate) fn backpressure(&self) -> bool {
        self.desired_size() <= 0.0
    }

    /// 计算值的尺寸；尺寸函数失败时使流出错并按 1 计。
    pub(crate) fn chunk_size(&self, chunk: &T) -> f64 {
        let size_fn = self.state.borrow().size.clone();
        let Some(size_fn) = size_fn else {
            return 1.0;
        };
        match size_fn(chunk) {
            Ok(size) => size,
            Err(error) => {
                self.error_if_needed(error);
                1.0
            }
        }
    }

    pub(crate) fn write(&self, chunk: T, size: f64) {
        let Some(stream) = self.stream() else {
            return;
        };
        let pushed = self
            .state
            .borrow_mut()
            .queue
            .push(WriteRecord::Chunk(chunk), size);
        if let Err(error) = pushed {
            self.error_if_needed(error);
            return;
        }
        let update = {
            let inner = stream.borrow();
            !inner.close_queued_or_in_flight() && inner.state == WritableState::Writable
        };
        if update {
            update_backpressure(&stream, self.backpressure());
        }
        self.advance_queue_if_needed(&stream);
    }

    pub(crate) fn close(&self) {
        let pushed = self.state.borrow_mut().queue.push(WriteRecord::Close, 0.0);
        debug_assert!(pushed.is_ok());
        if let Some(stream) = self.stream() {
            self.advance_queue_if_needed(&stream);
        }
    }

    fn advance_queue_if_needed(&self, stream: &WritableRef<T>) {
        if !self.is_started() {
            return;
        }
        let state = {
            let inner = stream.borrow();
            if inner.in_flight_write_request.is_some() {
                return;
            }
            inner.state
        };
        match state {
            WritableState::Closed | WritableState::Errored => return,
            WritableState::Erroring => {
                finish_erroring(stream);
                return;
            }
            WritableState::Writable => {}
        }
        let next = {
            let inner = self.state.borrow();
            match inner.queue.peek() {
                None => None,
                Some(WriteRecord::Close) => Some(true),
                Some(_) => Some(false),
            }
        };
        match next {
            None => {}
            Some(true) => self.process_close(stream),
            Some(false) => self.process_write(stream),
        }
    }

    fn process_close(&self, stream: &WritableRef<T>) {
        stream.borrow_mut().mark_close_request_in_flight();
        let sink = {
            let mut inner = self.state.borrow_mut();
            inner.queue.pop();
            inner.sink.clone()
        };
        let closed = match sink {
            Some(sink) => invoke_hook(&sink, |sink| sink.close()),
            None => ready_ok(),
        };
        self.clear_algorithms();
        let stream = Rc::clone(stream);
        runtime::spawn_local(async move {
            match closed.await {
                Ok(()) => finish_in_flight_close(&stream),
                Err(error) => finish_in_flight_close_with_error(&stream, error),
            }
        });
    }

    fn process_write(&self, stream: &WritableRef<T>) {
        stream.borrow_mut().mark_first_write_request_in_flight();
        let (chunk, sink) = {
            let mut inner = self.state.borrow_mut();
            let chunk = match inner.queue.peek_mut() {
                Some(record) => match mem::replace(record, WriteRecord::InFlight) {
                    WriteRecord::Chunk(chunk) => Some(chunk),
                    other => {
                        *record = other;
                        None
                    }
                },
                None => None,
            };
            (chunk, inner.sink.clone())
        };
        let controller = self.handle();
        let written = match (chunk, sink) {
            (Some(chunk), Some(sink)) => invoke_hook(&sink, |sink| sink.write(chunk, &controller)),
            _ => ready_ok(),
        };
        let Some(core) = self.this.upgrade() else {
            return;
        };
        let stream = Rc::clone(stream);
        runtime::spawn_local(async move {
            match written.await {
                Ok(()) => {
                    finish_in_flight_write(&stream);
                    core.state.borrow_mut().queue.pop();
                    let update = {
                        let inner = stream.borrow();
                        !inner.close_queued_or_in_flight()
                            && inner.state == WritableState::Writable
                    };
                    if update {
                        update_backpressure(&stream, core.backpressure());
                    }
                    core.advance_queue_if_needed(&stream);
                }
                Err(error) => {
                    if stream.borrow().state == WritableState::Writable {
                        core.clear_algorithms();
                    }
                    finish_in_flight_write_with_error(&stream, error);
                }
            }
        });
    }

    fn clear_algorithms(&self) {
        let released = {
            let mut inner = self.state.borrow_mut();
            (inner.sink.take(), inner.size.take())
        };
        drop(released);
    }

    pub(crate) fn error_if_needed(&self, error: StreamError) {
        let writable = self
            .stream()
            .is_some_and(|stream| stream.borrow().state == WritableState::Writable);
        if writable {
            self.error(error);
        }
    }

    fn error(&self, error: StreamError) {
        self.clear_algorithms();
        if let Some(stream) = self.stream() {
            start_erroring(&stream, error);
        }
    }

    pub(crate) fn error_steps(&self) {
        self.state.borrow_mut().queue.reset();
    }

    pub(crate) fn abort_steps(&self, reason: StreamError) -> Completion {
        let sink = self.state.borrow().sink.clone();
        let aborted = match sink {
            Some(sink) => invoke_hook(&sink, |sink| sink.abort(reason)),
            None => ready_ok(),
        };
        self.clear_algorithms();
        aborted
    }
}

/// 可写流控制器句柄，交给下游钩子使用。
///
/// # 契约说明（What）
/// - [`WritableStreamDefaultController::signal`] 在流被中止时触发，进行中的写入可据此提前结束；
/// - [`WritableStreamDefaultController::error`] 只在流仍可写时生效。
pub struct WritableStreamDefaultController<T> {
    core: Weak<WritableControllerCore<T>>,
}

impl<T> Clone for WritableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: 'static> WritableStreamDefaultController<T> {
    /// 中止信号；流被释放后返回一个永不触发的信号。
    pub fn signal(&self) -> AbortSignal {
        match self.core.upgrade() {
            Some(core) => core.abort_controller.signal(),
            None => AbortController::new().signal(),
        }
    }

    pub fn error(&self, reason: StreamError) {
        if let Some(core) = self.core.upgrade() {
            core.error_if_needed(reason);
        }
    }
}
