//! 值流控制器：排队、拉取合并与关闭排空。

use std::cell::RefCell;
use std::mem;
use std::rc::{Rc, Weak};

use crate::Completion;
use crate::error::{Result, StreamError};
use crate::hook::{invoke_hook, ready_ok};
use crate::queue::SizedQueue;
use crate::runtime;
use crate::strategy::SizeFn;

use super::{
    ControllerSteps, ReadRequest, ReadableState, StreamRef, UnderlyingSource, WeakStreamRef,
    fulfill_read_request, readable_close, readable_error,
};

pub(crate) const STREAM_DROPPED: &str = "stream has been dropped";

/// 拉取调度标志，值流与字节流共用。
///
/// - `pulling` 为真时新的拉取需求只记为 `pull_again`，拉取完成后再补一次；
/// - `close_requested` 表示生产端已请求关闭，等待队列排空。
#[derive(Debug, Default)]
pub(crate) struct PullFlags {
    pub(crate) started: bool,
    pub(crate) close_requested: bool,
    pulling: bool,
    pull_again: bool,
}

impl PullFlags {
    /// 返回 `true` 表示调用方应当立即发起拉取。
    pub(crate) fn begin(&mut self) -> bool {
        if self.pulling {
            self.pull_again = true;
            return false;
        }
        self.pulling = true;
        true
    }

    /// 结束一次拉取，返回是否需要补拉。
    pub(crate) fn finish(&mut self) -> bool {
        self.pulling = false;
        mem::take(&mut self.pull_again)
    }
}

struct DefaultState<T> {
    stream: WeakStreamRef<T>,
    queue: SizedQueue<T>,
    high_water_mark: f64,
    size: Option<SizeFn<T>>,
    source: Option<Rc<RefCell<dyn UnderlyingSource<T>>>>,
    flags: PullFlags,
}

pub(crate) struct DefaultControllerCore<T> {
    this: Weak<Self>,
    state: RefCell<DefaultState<T>>,
}

impl<T: 'static> DefaultControllerCore<T> {
    pub(crate) fn new(
        stream: WeakStreamRef<T>,
        source: Rc<RefCell<dyn UnderlyingSource<T>>>,
        high_water_mark: f64,
        size: Option<SizeFn<T>>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            state: RefCell::new(DefaultState {
                stream,
                queue: SizedQueue::new(),
                high_water_mark,
                size,
                source: Some(source),
                flags: PullFlags::default(),
            }),
        })
    }

    fn handle(&self) -> ReadableStreamDefaultController<T> {
        ReadableStreamDefaultController {
            core: self.this.clone(),
        }
    }

    fn stream(&self) -> Option<StreamRef<T>> {
        self.state.borrow().stream.upgrade()
    }

    pub(crate) fn start(&self) {
        let source = self.state.borrow().source.clone();
        let controller = self.handle();
        let started = match source {
            Some(source) => invoke_hook(&source, |source| source.start(&controller)),
            None => ready_ok(),
        };
        let weak = self.this.clone();
        runtime::spawn_local(async move {
            let outcome = started.await;
            let Some(core) = weak.upgrade() else {
                return;
            };
            match outcome {
                Ok(()) => {
                    core.state.borrow_mut().flags.started = true;
                    core.call_pull_if_needed();
                }
                Err(error) => core.error(error),
            }
        });
    }

    pub(crate) fn desired_size(&self) -> Option<f64> {
        let stream = self.stream()?;
        let state = stream.borrow().state;
        match state {
            ReadableState::Errored => None,
            ReadableState::Closed => Some(0.0),
            ReadableState::Readable => {
                let inner = self.state.borrow();
                Some(inner.high_water_mark - inner.queue.total_size())
            }
        }
    }

    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        if self.state.borrow().flags.close_requested {
            return false;
        }
        self.stream()
            .is_some_and(|stream| stream.borrow().state == ReadableState::Readable)
    }

    fn should_call_pull(&self) -> bool {
        if !self.can_close_or_enqueue() || !self.state.borrow().flags.started {
            return false;
        }
        let Some(stream) = self.stream() else {
            return false;
        };
        let waiting = {
            let inner = stream.borrow();
            inner.reader.is_some() && inner.num_read_requests() > 0
        };
        waiting || self.desired_size().is_some_and(|desired| desired > 0.0)
    }

    pub(crate) fn call_pull_if_needed(&self) {
        if !self.should_call_pull() {
            return;
        }
        if !self.state.borrow_mut().flags.begin() {
            return;
        }
        let source = self.state.borrow().source.clone();
        let controller = self.handle();
        let pulled = match source {
            Some(source) => invoke_hook(&source, |source| source.pull(&controller)),
            None => ready_ok(),
        };
        let weak = self.this.clone();
        runtime::spawn_local(async move {
            let outcome = pulled.await;
            let Some(core) = weak.upgrade() else {
                return;
            };
            match outcome {
                Ok(()) => {
                    let again = core.state.borrow_mut().flags.finish();
                    if again {
                        core.call_pull_if_needed();
                    }
                }
                Err(error) => core.error(error),
            }
        });
    }

    /// 入队一个值：有挂起读取时直接交付，否则按尺寸函数计量后排队。
    pub(crate) fn enqueue_chunk(&self, chunk: T) -> Result<()> {
        let Some(stream) = self.stream() else {
            return Err(StreamError::invalid_state(STREAM_DROPPED));
        };
        let direct = {
            let inner = stream.borrow();
            inner.reader.is_some() && inner.num_read_requests() > 0
        };
        if direct {
            fulfill_read_request(&stream, Some(chunk));
        } else {
            let size_fn = self.state.borrow().size.clone();
            let size = match size_fn {
                Some(size_fn) => size_fn(&chunk),
                None => Ok(1.0),
            };
            let pushed = size.and_then(|size| self.state.borrow_mut().queue.push(chunk, size));
            if let Err(error) = pushed {
                self.error(error.clone());
                return Err(error);
            }
        }
        self.call_pull_if_needed();
        Ok(())
    }

    /// 请求关闭；队列为空时立即关闭流，否则等最后一个值被读走。
    pub(crate) fn request_close(&self) {
        if !self.can_close_or_enqueue() {
            return;
        }
        let drained = {
            let mut inner = self.state.borrow_mut();
            inner.flags.close_requested = true;
            inner.queue.is_empty()
        };
        if drained {
            self.clear_algorithms();
            if let Some(stream) = self.stream() {
                readable_close(&stream);
            }
        }
    }

    pub(crate) fn error(&self, error: StreamError) {
        let Some(stream) = self.stream() else {
            return;
        };
        if stream.borrow().state != ReadableState::Readable {
            return;
        }
        self.state.borrow_mut().queue.reset();
        self.clear_algorithms();
        readable_error(&stream, error);
    }

    fn clear_algorithms(&self) {
        let released = {
            let mut inner = self.state.borrow_mut();
            (inner.source.take(), inner.size.take())
        };
        drop(released);
    }
}

impl<T: 'static> ControllerSteps<T> for DefaultControllerCore<T> {
    fn pull_steps(&self, request: ReadRequest<T>) {
        let Some(stream) = self.stream() else {
            request.error(StreamError::invalid_state(STREAM_DROPPED));
            return;
        };
        let chunk = self.state.borrow_mut().queue.pop();
        match chunk {
            Some(chunk) => {
                let drained = {
                    let inner = self.state.borrow();
                    inner.flags.close_requested && inner.queue.is_empty()
                };
                if drained {
                    self.clear_algorithms();
                    readable_close(&stream);
                } else {
                    self.call_pull_if_needed();
                }
                request.chunk(chunk);
            }
            None => {
                let pushed = stream.borrow_mut().push_read_request(request);
                if let Err(request) = pushed {
                    request.error(StreamError::invalid_state("stream has no default reader"));
                    return;
                }
                self.call_pull_if_needed();
            }
        }
    }

    fn cancel_steps(&self, reason: StreamError) -> Completion {
        let source = {
            let mut inner = self.state.borrow_mut();
            inner.queue.reset();
            inner.source.clone()
        };
        let cancelled = match source {
            Some(source) => invoke_hook(&source, |source| source.cancel(reason)),
            None => ready_ok(),
        };
        self.clear_algorithms();
        cancelled
    }

    fn release_steps(&self) {}
}

/// 值流控制器句柄，交给来源钩子使用。
///
/// # 契约说明（What）
/// - 句柄弱引用控制器，流被释放后所有操作返回 [`StreamError::InvalidState`]；
/// - [`ReadableStreamDefaultController::enqueue`] 与 [`ReadableStreamDefaultController::close`]
///   在流已关闭、出错或正在排空时返回 [`StreamError::InvalidState`]；
/// - [`ReadableStreamDefaultController::error`] 对非可读状态的流无效果。
pub struct ReadableStreamDefaultController<T> {
    core: Weak<DefaultControllerCore<T>>,
}

impl<T> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: 'static> ReadableStreamDefaultController<T> {
    fn core(&self) -> Result<Rc<DefaultControllerCore<T>>> {
        self.core
            .upgrade()
            .ok_or_else(|| StreamError::invalid_state(STREAM_DROPPED))
    }

    /// 高水位线减去排队总量；出错时为 `None`，关闭后为 `0`。
    pub fn desired_size(&self) -> Option<f64> {
        self.core.upgrade()?.desired_size()
    }

    pub fn enqueue(&self, chunk: T) -> Result<()> {
        let core = self.core()?;
        if !core.can_close_or_enqueue() {
            return Err(StreamError::invalid_state(
                "cannot enqueue to a stream that is closed or draining",
            ));
        }
        core.enqueue_chunk(chunk)
    }

    pub fn close(&self) -> Result<()> {
        let core = self.core()?;
        if !core.can_close_or_enqueue() {
            return Err(StreamError::invalid_state(
                "stream is already closing or closed",
            ));
        }
        core.request_close();
        Ok(())
    }

    pub fn error(&self, reason: StreamError) {
        if let Some(core) = self.core.upgrade() {
            core.error(reason);
        }
    }

    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.can_close_or_enqueue())
    }

    pub(crate) fn has_backpressure(&self) -> bool {
        self.core
            .upgrade()
            .is_none_or(|core| !core.should_call_pull())
    }

    pub(crate) fn close_if_possible(&self) {
        if let Some(core) = self.core.upgrade() {
            core.request_close();
        }
    }
}
