//! 转换流：一对由转换器连接的可写端与可读端。
//!
//! # 设计背景（Why）
//! - 写入端收到的每个值交给转换器，转换器通过控制器向读取端产出零个或多个值；
//! - 读取端没有需求时，写入端必须停下来等待，因此两端之间有一个独立的背压标志与“背压变化”信号。
//!
//! # 契约说明（What）
//! - 初始处于背压状态，读取端第一次拉取时解除；
//! - 写入端的关闭、中止与读取端的取消三者共享同一个收尾完成对象，谁先到谁负责收尾，
//!   后到者只等待它；
//! - 转换器任一钩子失败都会让两端同时出错。
//!
//! # 实现要点（How）
//! - 写入端与读取端各自持有指向共享核心的强引用，核心只弱引用两端的控制器；
//! - 转换器控制器对输入类型做了类型擦除，钩子签名只出现输出类型。

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use futures::FutureExt;

use crate::Completion;
use crate::error::{Result, StreamError};
use crate::hook::{invoke_hook, ready_ok};
use crate::readable::{
    ReadableState, ReadableStream, ReadableStreamDefaultController, UnderlyingSource,
    WeakStreamRef,
};
use crate::runtime::{self, Deferred};
use crate::strategy::QueuingStrategy;
use crate::writable::{
    UnderlyingSink, WeakWritableRef, WritableState, WritableStream,
    WritableStreamDefaultController,
};

/// 转换器钩子。
///
/// # 契约说明（What）
/// - `transform` 对每个输入值调用一次，严格串行；
/// - `flush` 在写入端关闭时调用一次，之后读取端关闭；
/// - `cancel` 在写入端被中止或读取端被取消时调用一次；
/// - 三者中至多调用 `flush` 与 `cancel` 其一。
pub trait Transformer<I, O> {
    fn start(&mut self, controller: &TransformStreamDefaultController<O>) -> Completion {
        let _ = controller;
        ready_ok()
    }

    fn transform(&mut self, chunk: I, controller: &TransformStreamDefaultController<O>)
    -> Completion;

    fn flush(&mut self, controller: &TransformStreamDefaultController<O>) -> Completion {
        let _ = controller;
        ready_ok()
    }

    fn cancel(&mut self, reason: StreamError) -> Completion {
        let _ = reason;
        ready_ok()
    }
}

/// 原样转发的转换器。
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityTransformer;

impl<T: 'static> Transformer<T, T> for IdentityTransformer {
    fn transform(&mut self, chunk: T, controller: &TransformStreamDefaultController<T>) -> Completion {
        futures::future::ready(controller.enqueue(chunk)).boxed_local()
    }
}

/// 转换器控制器对输出侧的操作集合。
trait TransformOps<O> {
    fn desired_size(&self) -> Option<f64>;
    fn enqueue(&self, chunk: O) -> Result<()>;
    fn error(&self, reason: StreamError);
    fn terminate(&self);
}

/// 交给转换器的控制器句柄。
pub struct TransformStreamDefaultController<O> {
    ops: Weak<dyn TransformOps<O>>,
}

impl<O> Clone for TransformStreamDefaultController<O> {
    fn clone(&self) -> Self {
        Self {
            ops: self.ops.clone(),
        }
    }
}

impl<O> TransformStreamDefaultController<O> {
    /// 读取端的期望尺寸。
    pub fn desired_size(&self) -> Option<f64> {
        self.ops.upgrade()?.desired_size()
    }

    /// 向读取端产出一个值；读取端不可入队时返回 [`StreamError::InvalidState`]。
    pub fn enqueue(&self, chunk: O) -> Result<()> {
        match self.ops.upgrade() {
            Some(ops) => ops.enqueue(chunk),
            None => Err(StreamError::invalid_state("transform stream has been dropped")),
        }
    }

    /// 让两端同时出错。
    pub fn error(&self, reason: StreamError) {
        if let Some(ops) = self.ops.upgrade() {
            ops.error(reason);
        }
    }

    /// 关闭读取端并让写入端出错。
    pub fn terminate(&self) {
        if let Some(ops) = self.ops.upgrade() {
            ops.terminate();
        }
    }
}

struct TransformState<I, O> {
    backpressure: Option<bool>,
    backpressure_change: Deferred<()>,
    readable: WeakStreamRef<O>,
    writable: WeakWritableRef<I>,
    readable_controller: Option<ReadableStreamDefaultController<O>>,
    writable_controller: Option<WritableStreamDefaultController<I>>,
    transformer: Option<Rc<RefCell<dyn Transformer<I, O>>>>,
    finish: Option<Deferred<()>>,
}

struct TransformCore<I, O> {
    this: Weak<Self>,
    start_gate: Deferred<()>,
    state: RefCell<TransformState<I, O>>,
}

impl<I: 'static, O: 'static> TransformCore<I, O> {
    fn controller(&self) -> TransformStreamDefaultController<O> {
        let ops: Weak<dyn TransformOps<O>> = self.this.clone();
        TransformStreamDefaultController { ops }
    }

    fn readable_controller(&self) -> Option<ReadableStreamDefaultController<O>> {
        self.state.borrow().readable_controller.clone()
    }

    fn writable_controller(&self) -> Option<WritableStreamDefaultController<I>> {
        self.state.borrow().writable_controller.clone()
    }

    fn readable_state(&self) -> Option<(ReadableState, StreamError)> {
        let readable = self.state.borrow().readable.upgrade()?;
        let inner = readable.borrow();
        Some((inner.state, inner.stored_error()))
    }

    fn writable_state(&self) -> Option<(WritableState, StreamError)> {
        let writable = self.state.borrow().writable.upgrade()?;
        let inner = writable.borrow();
        Some((inner.state, inner.stored_error()))
    }

    fn set_backpressure(&self, backpressure: bool) {
        let previous = {
            let mut state = self.state.borrow_mut();
            state.backpressure = Some(backpressure);
            std::mem::replace(&mut state.backpressure_change, Deferred::new())
        };
        previous.resolve(());
    }

    fn clear_algorithms(&self) {
        let transformer = self.state.borrow_mut().transformer.take();
        drop(transformer);
    }

    fn take_transformer(&self) -> Option<Rc<RefCell<dyn Transformer<I, O>>>> {
        let transformer = self.state.borrow().transformer.clone();
        self.clear_algorithms();
        transformer
    }

    fn unblock_write(&self) {
        if self.state.borrow().backpressure == Some(true) {
            self.set_backpressure(false);
        }
    }

    fn error_writable_and_unblock_write(&self, error: StreamError) {
        self.clear_algorithms();
        if let Some(controller) = self.writable_controller() {
            controller.error(error);
        }
        self.unblock_write();
    }

    fn error_both(&self, error: StreamError) {
        if let Some(controller) = self.readable_controller() {
            controller.error(error.clone());
        }
        self.error_writable_and_unblock_write(error);
    }

    fn perform_transform(&self, chunk: I) -> Completion {
        let transformer = self.state.borrow().transformer.clone();
        let controller = self.controller();
        let transformed = match transformer {
            Some(transformer) => {
                invoke_hook(&transformer, |transformer| transformer.transform(chunk, &controller))
            }
            None => ready_ok(),
        };
        let weak = self.this.clone();
        async move {
            let outcome = transformed.await;
            if let Err(error) = &outcome {
                if let Some(core) = weak.upgrade() {
                    core.error_both(error.clone());
                }
            }
            outcome
        }
        .boxed_local()
    }

    /// 新建收尾完成对象；已存在时返回 `Err` 携带已有的等待。
    fn begin_finish(&self) -> std::result::Result<Deferred<()>, Completion> {
        let mut state = self.state.borrow_mut();
        if let Some(finish) = &state.finish {
            return Err(finish.wait().boxed_local());
        }
        let finish = Deferred::new();
        state.finish = Some(finish.clone());
        Ok(finish)
    }
}

impl<I: 'static, O: 'static> TransformOps<O> for TransformCore<I, O> {
    fn desired_size(&self) -> Option<f64> {
        self.readable_controller()?.desired_size()
    }

    fn enqueue(&self, chunk: O) -> Result<()> {
        let Some(controller) = self.readable_controller() else {
            return Err(StreamError::invalid_state("transform stream has been dropped"));
        };
        if !controller.can_close_or_enqueue() {
            return Err(StreamError::invalid_state(
                "readable side is not in a state that permits enqueue",
            ));
        }
        if let Err(error) = controller.enqueue(chunk) {
            self.error_writable_and_unblock_write(error.clone());
            return Err(error);
        }
        let backpressure = controller.has_backpressure();
        if self.state.borrow().backpressure != Some(backpressure) {
            debug_assert!(backpressure);
            self.set_backpressure(true);
        }
        Ok(())
    }

    fn error(&self, reason: StreamError) {
        self.error_both(reason);
    }

    fn terminate(&self) {
        if let Some(controller) = self.readable_controller() {
            controller.close_if_possible();
        }
        self.error_writable_and_unblock_write(StreamError::invalid_state(
            "transform stream terminated",
        ));
    }
}

struct TransformSink<I, O> {
    core: Rc<TransformCore<I, O>>,
}

impl<I: 'static, O: 'static> UnderlyingSink<I> for TransformSink<I, O> {
    fn start(&mut self, controller: &WritableStreamDefaultController<I>) -> Completion {
        self.core.state.borrow_mut().writable_controller = Some(controller.clone());
        self.core.start_gate.wait().boxed_local()
    }

    fn write(&mut self, chunk: I, _controller: &WritableStreamDefaultController<I>) -> Completion {
        let (blocked, change) = {
            let state = self.core.state.borrow();
            (
                state.backpressure == Some(true),
                state.backpressure_change.clone(),
            )
        };
        if !blocked {
            return self.core.perform_transform(chunk);
        }
        let core = Rc::clone(&self.core);
        async move {
            let _ = change.wait().await;
            if let Some((WritableState::Erroring, stored)) = core.writable_state() {
                return Err(stored);
            }
            core.perform_transform(chunk).await
        }
        .boxed_local()
    }

    fn close(&mut self) -> Completion {
        let finish = match self.core.begin_finish() {
            Ok(finish) => finish,
            Err(existing) => return existing,
        };
        let transformer = self.core.take_transformer();
        let controller = self.core.controller();
        let flushed = match transformer {
            Some(transformer) => invoke_hook(&transformer, |transformer| transformer.flush(&controller)),
            None => ready_ok(),
        };
        let core = Rc::clone(&self.core);
        let settle = finish.clone();
        runtime::spawn_local(async move {
            match flushed.await {
                Ok(()) => match core.readable_state() {
                    Some((ReadableState::Errored, stored)) => {
                        settle.reject(stored);
                    }
                    _ => {
                        if let Some(controller) = core.readable_controller() {
                            controller.close_if_possible();
                        }
                        settle.resolve(());
                    }
                },
                Err(error) => {
                    if let Some(controller) = core.readable_controller() {
                        controller.error(error.clone());
                    }
                    settle.reject(error);
                }
            }
        });
        finish.wait().boxed_local()
    }

    fn abort(&mut self, reason: StreamError) -> Completion {
        let finish = match self.core.begin_finish() {
            Ok(finish) => finish,
            Err(existing) => return existing,
        };
        let transformer = self.core.take_transformer();
        let cancelled = match transformer {
            Some(transformer) => {
                let reason = reason.clone();
                invoke_hook(&transformer, |transformer| transformer.cancel(reason))
            }
            None => ready_ok(),
        };
        let core = Rc::clone(&self.core);
        let settle = finish.clone();
        runtime::spawn_local(async move {
            match cancelled.await {
                Ok(()) => match core.readable_state() {
                    Some((ReadableState::Errored, stored)) => {
                        settle.reject(stored);
                    }
                    _ => {
                        if let Some(controller) = core.readable_controller() {
                            controller.error(reason);
                        }
                        settle.resolve(());
                    }
                },
                Err(error) => {
                    if let Some(controller) = core.readable_controller() {
                        controller.error(error.clone());
                    }
                    settle.reject(error);
                }
            }
        });
        finish.wait().boxed_local()
    }
}

struct TransformSource<I, O> {
    core: Rc<TransformCore<I, O>>,
}

impl<I: 'static, O: 'static> UnderlyingSource<O> for TransformSource<I, O> {
    fn start(&mut self, controller: &ReadableStreamDefaultController<O>) -> Completion {
        self.core.state.borrow_mut().readable_controller = Some(controller.clone());
        self.core.start_gate.wait().boxed_local()
    }

    fn pull(&mut self, _controller: &ReadableStreamDefaultController<O>) -> Completion {
        self.core.set_backpressure(false);
        let change = self.core.state.borrow().backpressure_change.clone();
        change.wait().boxed_local()
    }

    fn cancel(&mut self, reason: StreamError) -> Completion {
        let finish = match self.core.begin_finish() {
            Ok(finish) => finish,
            Err(existing) => return existing,
        };
        let transformer = self.core.take_transformer();
        let cancelled = match transformer {
            Some(transformer) => {
                let reason = reason.clone();
                invoke_hook(&transformer, |transformer| transformer.cancel(reason))
            }
            None => ready_ok(),
        };
        let core = Rc::clone(&self.core);
        let settle = finish.clone();
        runtime::spawn_local(async move {
            match cancelled.await {
                Ok(()) => match core.writable_state() {
                    Some((WritableState::Errored, stored)) => {
                        settle.reject(stored);
                    }
                    _ => {
                        if let Some(controller) = core.writable_controller() {
                            controller.error(reason);
                        }
                        core.unblock_write();
                        settle.resolve(());
                    }
                },
                Err(error) => {
                    if let Some(controller) = core.writable_controller() {
                        controller.error(error.clone());
                    }
                    core.unblock_write();
                    settle.reject(error);
                }
            }
        });
        finish.wait().boxed_local()
    }
}

/// 转换流。
///
/// # 教案式说明
/// - **意图 (Why)**：把“逐值变换”包装成一对标准的可写/可读流，以便放进管道中间。
/// - **契约 (What)**：
///   - 默认写入端高水位线为 1，读取端为 0；
///   - 转换器的 `start` 在构造时同步调用，两端都等待它完成后才开始工作。
/// - **设计权衡 (Trade-offs)**：核心持有两端句柄，两端控制器持有核心，生命周期随最后一个端点结束。
pub struct TransformStream<I: 'static, O: 'static> {
    readable: ReadableStream<O>,
    writable: WritableStream<I>,
}

impl<I: 'static, O: 'static> Clone for TransformStream<I, O> {
    fn clone(&self) -> Self {
        Self {
            readable: self.readable.clone(),
            writable: self.writable.clone(),
        }
    }
}

impl<T: 'static> TransformStream<T, T> {
    /// 原样转发的转换流。
    pub fn identity() -> Result<Self> {
        Self::new(IdentityTransformer)
    }
}

impl<I: 'static, O: 'static> TransformStream<I, O> {
    pub fn new<X>(transformer: X) -> Result<Self>
    where
        X: Transformer<I, O> + 'static,
    {
        Self::with_strategies(transformer, QueuingStrategy::new(1.0), QueuingStrategy::new(0.0))
    }

    pub fn with_strategies<X>(
        transformer: X,
        writable_strategy: QueuingStrategy<I>,
        readable_strategy: QueuingStrategy<O>,
    ) -> Result<Self>
    where
        X: Transformer<I, O> + 'static,
    {
        writable_strategy.validated_high_water_mark()?;
        readable_strategy.validated_high_water_mark()?;
        let transformer: Rc<RefCell<dyn Transformer<I, O>>> = Rc::new(RefCell::new(transformer));
        let core = Rc::new_cyclic(|this| TransformCore {
            this: this.clone(),
            start_gate: Deferred::new(),
            state: RefCell::new(TransformState {
                backpressure: None,
                backpressure_change: Deferred::new(),
                readable: Weak::new(),
                writable: Weak::new(),
                readable_controller: None,
                writable_controller: None,
                transformer: Some(Rc::clone(&transformer)),
                finish: None,
            }),
        });
        let writable = WritableStream::with_strategy(
            TransformSink {
                core: Rc::clone(&core),
            },
            writable_strategy,
        )?;
        let readable = ReadableStream::with_strategy(
            TransformSource {
                core: Rc::clone(&core),
            },
            readable_strategy,
        )?;
        {
            let mut state = core.state.borrow_mut();
            state.readable = Rc::downgrade(&readable.inner);
            state.writable = Rc::downgrade(&writable.inner);
        }
        core.set_backpressure(true);

        let controller = core.controller();
        let started = invoke_hook(&transformer, |transformer| transformer.start(&controller));
        let gate = core.start_gate.clone();
        runtime::spawn_local(async move {
            match started.await {
                Ok(()) => {
                    gate.resolve(());
                }
                Err(error) => {
                    gate.reject(error);
                }
            }
        });
        tracing::debug!("transform stream created");
        Ok(Self { readable, writable })
    }

    pub fn readable(&self) -> ReadableStream<O> {
        self.readable.clone()
    }

    pub fn writable(&self) -> WritableStream<I> {
        self.writable.clone()
    }
}
