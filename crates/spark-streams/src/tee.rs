//! 分叉：把一个可读流拆成两个独立消费的分支。
//!
//! # 设计背景（Why）
//! - 同一份数据常常需要两个消费者（例如一路写盘、一路计算摘要），而可读流只允许一个读者；
//! - 分叉持有源流的读者，任一分支拉取时读一次源流，把结果同时交给两个分支。
//!
//! # 契约说明（What）
//! - 同一时刻对源流至多一个读取在进行；读取进行中出现的拉取只记为“稍后再读”；
//! - 源流关闭时两个未取消的分支关闭，源流出错时两个分支都以同一原因出错；
//! - 取消单个分支不影响另一分支；两个分支都取消后，以 [`StreamError::Combined`] 取消源流，
//!   两次取消拿到同一个结果；
//! - 字节流的分叉在两种读者之间切换：分支有 BYOB 请求时用 BYOB 读者直接读进分支缓冲区，
//!   否则用默认读者；交给另一分支的永远是复制后的字节。
//!
//! # 实现要点（How）
//! - 共享状态以 `Rc` 在两个分支来源之间共享，分支控制器在来源的 `start` 中记录；
//! - 字节分叉切换读者时递增代次号，旧读者 `closed` 的拒绝不会误伤新读者。

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures::FutureExt;

use crate::ByteView;
use crate::Completion;
use crate::error::{Result, StreamError};
use crate::hook::{ready_err, ready_ok};
use crate::readable::{
    ByteStreamOptions, ReadableByteStreamController, ReadableStream, ReadableStreamByobReader,
    ReadableStreamByobRequest, ReadableStreamDefaultController, ReadableStreamDefaultReader, UnderlyingByteSource,
    UnderlyingSource,
};
use crate::runtime::{self, Deferred, DeferredFuture};

const BRANCHES: usize = 2;

/// 分支已关闭、出错或被取消时推送会被拒绝，分叉记录后继续。
fn ignore_rejection(outcome: Result<()>, operation: &'static str) {
    if let Err(error) = outcome {
        tracing::trace!(operation, code = error.code(), error = %error, "tee branch rejected a push");
    }
}

/// 两个分支共享的取消记录。
struct CancelState {
    canceled: [bool; BRANCHES],
    reasons: [Option<StreamError>; BRANCHES],
    completion: Deferred<()>,
}

impl CancelState {
    fn new() -> Self {
        Self {
            canceled: [false; BRANCHES],
            reasons: [None, None],
            completion: Deferred::new(),
        }
    }

    fn any_active(&self) -> bool {
        self.canceled.iter().any(|canceled| !canceled)
    }

    /// 记录一个分支的取消；两个分支都已取消时返回组合原因。
    fn record(&mut self, branch: usize, reason: StreamError) -> Option<StreamError> {
        self.canceled[branch] = true;
        self.reasons[branch] = Some(reason);
        if self.canceled.iter().all(|canceled| *canceled) {
            let reasons = self
                .reasons
                .iter()
                .map(|reason| reason.clone().unwrap_or(StreamError::Unspecified))
                .collect();
            return Some(StreamError::Combined(reasons));
        }
        None
    }
}

/// 以 `cancel` 的结果兑现共享的取消完成。
fn settle_with(completion: Deferred<()>, cancel: Completion) {
    runtime::spawn_local(async move {
        match cancel.await {
            Ok(()) => {
                completion.resolve(());
            }
            Err(error) => {
                completion.reject(error);
            }
        }
    });
}

struct DefaultTee<T: 'static> {
    reader: ReadableStreamDefaultReader<T>,
    reading: Cell<bool>,
    read_again: Cell<bool>,
    cancel: RefCell<CancelState>,
    controllers: RefCell<[Option<ReadableStreamDefaultController<T>>; BRANCHES]>,
}

impl<T: Clone + 'static> DefaultTee<T> {
    fn controller(&self, branch: usize) -> Option<ReadableStreamDefaultController<T>> {
        self.controllers.borrow()[branch].clone()
    }

    fn pull(self: &Rc<Self>) {
        if self.reading.get() {
            self.read_again.set(true);
            return;
        }
        self.reading.set(true);
        let read = self.reader.read();
        let tee = Rc::clone(self);
        runtime::spawn_local(async move {
            match read.await {
                Ok(Some(chunk)) => tee.on_chunk(chunk),
                Ok(None) => tee.on_close(),
                Err(_) => tee.reading.set(false),
            }
        });
    }

    fn on_chunk(self: &Rc<Self>, chunk: T) {
        self.read_again.set(false);
        let canceled = self.cancel.borrow().canceled;
        let second = (!canceled[1]).then(|| chunk.clone());
        if !canceled[0] {
            if let Some(controller) = self.controller(0) {
                ignore_rejection(controller.enqueue(chunk), "enqueue");
            }
        }
        if let (Some(chunk), Some(controller)) = (second, self.controller(1)) {
            ignore_rejection(controller.enqueue(chunk), "enqueue");
        }
        self.reading.set(false);
        if self.read_again.get() {
            self.pull();
        }
    }

    fn on_close(&self) {
        self.reading.set(false);
        let (canceled, completion, active) = {
            let cancel = self.cancel.borrow();
            (cancel.canceled, cancel.completion.clone(), cancel.any_active())
        };
        for (branch, canceled) in canceled.iter().enumerate() {
            if !canceled {
                if let Some(controller) = self.controller(branch) {
                    controller.close_if_possible();
                }
            }
        }
        if active {
            completion.resolve(());
        }
    }

    fn on_error(&self, error: StreamError) {
        for branch in 0..BRANCHES {
            if let Some(controller) = self.controller(branch) {
                controller.error(error.clone());
            }
        }
        let (completion, active) = {
            let cancel = self.cancel.borrow();
            (cancel.completion.clone(), cancel.any_active())
        };
        if active {
            completion.resolve(());
        }
    }

    fn cancel_branch(&self, branch: usize, reason: StreamError) -> Completion {
        let (combined, completion) = {
            let mut cancel = self.cancel.borrow_mut();
            (cancel.record(branch, reason), cancel.completion.clone())
        };
        if let Some(combined) = combined {
            tracing::debug!("both tee branches cancelled; cancelling source");
            settle_with(completion.clone(), self.reader.cancel(combined));
        }
        completion.wait().boxed_local()
    }
}

struct DefaultBranch<T: 'static> {
    tee: Rc<DefaultTee<T>>,
    branch: usize,
}

impl<T: Clone + 'static> UnderlyingSource<T> for DefaultBranch<T> {
    fn start(&mut self, controller: &ReadableStreamDefaultController<T>) -> Completion {
        self.tee.controllers.borrow_mut()[self.branch] = Some(controller.clone());
        ready_ok()
    }

    fn pull(&mut self, _controller: &ReadableStreamDefaultController<T>) -> Completion {
        self.tee.pull();
        ready_ok()
    }

    fn cancel(&mut self, reason: StreamError) -> Completion {
        self.tee.cancel_branch(self.branch, reason)
    }
}

/// 值流分叉：分支二得到克隆，分支一得到原值。
pub(crate) fn default_tee<T: Clone + 'static>(
    stream: &ReadableStream<T>,
) -> Result<(ReadableStream<T>, ReadableStream<T>)> {
    let reader = stream.get_reader()?;
    let tee = Rc::new(DefaultTee {
        reader,
        reading: Cell::new(false),
        read_again: Cell::new(false),
        cancel: RefCell::new(CancelState::new()),
        controllers: RefCell::new([None, None]),
    });
    let first = ReadableStream::new(DefaultBranch {
        tee: Rc::clone(&tee),
        branch: 0,
    })?;
    let second = ReadableStream::new(DefaultBranch {
        tee: Rc::clone(&tee),
        branch: 1,
    })?;
    let closed = tee.reader.closed();
    let watcher = Rc::clone(&tee);
    runtime::spawn_local(async move {
        if let Err(error) = closed.await {
            watcher.on_error(error);
        }
    });
    tracing::debug!("readable stream teed");
    Ok((first, second))
}

enum TeeReader {
    Default(ReadableStreamDefaultReader<ByteView>),
    Byob(ReadableStreamByobReader),
}

impl TeeReader {
    fn closed(&self) -> DeferredFuture<()> {
        match self {
            TeeReader::Default(reader) => reader.closed(),
            TeeReader::Byob(reader) => reader.closed(),
        }
    }

    fn cancel(&self, reason: StreamError) -> Completion {
        match self {
            TeeReader::Default(reader) => reader.cancel(reason),
            TeeReader::Byob(reader) => reader.cancel(reason),
        }
    }
}

struct ByteTee {
    source: ReadableStream<ByteView>,
    reader: RefCell<Option<TeeReader>>,
    reader_generation: Cell<u64>,
    reading: Cell<bool>,
    read_again: [Cell<bool>; BRANCHES],
    cancel: RefCell<CancelState>,
    controllers: RefCell<[Option<ReadableByteStreamController>; BRANCHES]>,
}

impl ByteTee {
    fn controller(&self, branch: usize) -> Option<ReadableByteStreamController> {
        self.controllers.borrow()[branch].clone()
    }

    /// 监听当前读者的 `closed`；读者已被替换时忽略其拒绝。
    fn forward_reader_error(self: &Rc<Self>) {
        let generation = self.reader_generation.get();
        let closed = match self.reader.borrow().as_ref() {
            Some(reader) => reader.closed(),
            None => return,
        };
        let tee = Rc::clone(self);
        runtime::spawn_local(async move {
            let Err(error) = closed.await else {
                return;
            };
            if tee.reader_generation.get() != generation {
                return;
            }
            for branch in 0..BRANCHES {
                if let Some(controller) = tee.controller(branch) {
                    controller.error(error.clone());
                }
            }
            let (completion, active) = {
                let cancel = tee.cancel.borrow();
                (cancel.completion.clone(), cancel.any_active())
            };
            if active {
                completion.resolve(());
            }
        });
    }

    /// 换上另一种读者；旧读者先释放锁。
    fn switch_reader(self: &Rc<Self>, byob: bool) -> Result<()> {
        let current_is_byob = matches!(self.reader.borrow().as_ref(), Some(TeeReader::Byob(_)));
        if current_is_byob == byob && self.reader.borrow().is_some() {
            return Ok(());
        }
        self.reader_generation.set(self.reader_generation.get() + 1);
        let previous = self.reader.borrow_mut().take();
        drop(previous);
        let next = if byob {
            TeeReader::Byob(self.source.get_byob_reader()?)
        } else {
            TeeReader::Default(self.source.get_reader()?)
        };
        *self.reader.borrow_mut() = Some(next);
        tracing::trace!(byob, "byte tee switched reader");
        self.forward_reader_error();
        Ok(())
    }

    fn pull(self: &Rc<Self>, branch: usize) -> Completion {
        if self.reading.get() {
            self.read_again[branch].set(true);
            return ready_ok();
        }
        self.reading.set(true);
        let request = self
            .controller(branch)
            .and_then(|controller| controller.byob_request());
        let started = match request {
            None => self.pull_with_default_reader(),
            Some(request) => self.pull_with_byob_reader(&request, branch),
        };
        match started {
            Ok(()) => ready_ok(),
            Err(error) => {
                self.reading.set(false);
                ready_err(error)
            }
        }
    }

    /// 读取结束后按“稍后再读”标记补拉。
    fn pull_again_if_requested(self: &Rc<Self>) {
        self.reading.set(false);
        for branch in 0..BRANCHES {
            if self.read_again[branch].get() {
                if let Some(Err(error)) = self.pull(branch).now_or_never() {
                    tracing::trace!(branch, code = error.code(), error = %error, "byte tee pull failed");
                }
                return;
            }
        }
    }

    fn pull_with_default_reader(self: &Rc<Self>) -> Result<()> {
        self.switch_reader(false)?;
        let read = match self.reader.borrow().as_ref() {
            Some(TeeReader::Default(reader)) => reader.read(),
            _ => return Err(StreamError::invalid_state("byte tee lost its default reader")),
        };
        let tee = Rc::clone(self);
        runtime::spawn_local(async move {
            match read.await {
                Ok(Some(chunk)) => tee.on_default_chunk(chunk),
                Ok(None) => tee.on_default_close(),
                Err(_) => tee.reading.set(false),
            }
        });
        Ok(())
    }

    fn on_default_chunk(self: &Rc<Self>, chunk: ByteView) {
        for again in &self.read_again {
            again.set(false);
        }
        let canceled = self.cancel.borrow().canceled;
        let second = (!canceled[1]).then(|| chunk.copied());
        if !canceled[0] {
            if let Some(controller) = self.controller(0) {
                ignore_rejection(controller.enqueue(chunk), "enqueue");
            }
        }
        if let (Some(chunk), Some(controller)) = (second, self.controller(1)) {
            ignore_rejection(controller.enqueue(chunk), "enqueue");
        }
        self.pull_again_if_requested();
    }

    fn on_default_close(&self) {
        self.reading.set(false);
        let (canceled, completion, active) = {
            let cancel = self.cancel.borrow();
            (cancel.canceled, cancel.completion.clone(), cancel.any_active())
        };
        for (branch, canceled) in canceled.iter().enumerate() {
            if !canceled {
                if let Some(controller) = self.controller(branch) {
                    controller.close_if_possible();
                }
            }
        }
        for branch in 0..BRANCHES {
            if let Some(request) = self
                .controller(branch)
                .and_then(|controller| controller.byob_request())
            {
                ignore_rejection(request.respond(0), "respond");
            }
        }
        if active {
            completion.resolve(());
        }
    }

    /// 分支缓冲区只在 BYOB 读者就位后才借走，切换失败时仍留在分支的请求里。
    fn pull_with_byob_reader(
        self: &Rc<Self>,
        request: &ReadableStreamByobRequest,
        branch: usize,
    ) -> Result<()> {
        self.switch_reader(true)?;
        let read = {
            let current = self.reader.borrow();
            let Some(TeeReader::Byob(reader)) = current.as_ref() else {
                return Err(StreamError::invalid_state("byte tee lost its BYOB reader"));
            };
            reader.read(request.take_view()?)
        };
        let tee = Rc::clone(self);
        runtime::spawn_local(async move {
            match read.await {
                Ok(result) if !result.done => match result.value {
                    Some(chunk) => tee.on_byob_chunk(chunk, branch),
                    None => tee.reading.set(false),
                },
                Ok(result) => tee.on_byob_close(result.value, branch),
                Err(_) => tee.reading.set(false),
            }
        });
        Ok(())
    }

    fn on_byob_chunk(self: &Rc<Self>, chunk: ByteView, branch: usize) {
        for again in &self.read_again {
            again.set(false);
        }
        let other = 1 - branch;
        let canceled = self.cancel.borrow().canceled;
        let cloned = (!canceled[other]).then(|| chunk.copied());
        if !canceled[branch] {
            if let Some(request) = self
                .controller(branch)
                .and_then(|controller| controller.byob_request())
            {
                ignore_rejection(request.respond_with_new_view(chunk), "respond_with_new_view");
            }
        }
        if let Some(cloned) = cloned {
            if let Some(controller) = self.controller(other) {
                ignore_rejection(controller.enqueue(cloned), "enqueue");
            }
        }
        self.pull_again_if_requested();
    }

    fn on_byob_close(&self, chunk: Option<ByteView>, branch: usize) {
        self.reading.set(false);
        let other = 1 - branch;
        let (canceled, completion) = {
            let cancel = self.cancel.borrow();
            (cancel.canceled, cancel.completion.clone())
        };
        if !canceled[branch] {
            if let Some(controller) = self.controller(branch) {
                controller.close_if_possible();
            }
        }
        if !canceled[other] {
            if let Some(controller) = self.controller(other) {
                controller.close_if_possible();
            }
        }
        if let Some(chunk) = chunk {
            debug_assert_eq!(chunk.byte_length(), 0);
            if !canceled[branch] {
                if let Some(request) = self
                    .controller(branch)
                    .and_then(|controller| controller.byob_request())
                {
                    ignore_rejection(request.respond_with_new_view(chunk), "respond_with_new_view");
                }
            }
            if !canceled[other] {
                if let Some(request) = self
                    .controller(other)
                    .and_then(|controller| controller.byob_request())
                {
                    ignore_rejection(request.respond(0), "respond");
                }
            }
        }
        if !canceled[branch] || !canceled[other] {
            completion.resolve(());
        }
    }

    fn cancel_branch(&self, branch: usize, reason: StreamError) -> Completion {
        let (combined, completion) = {
            let mut cancel = self.cancel.borrow_mut();
            (cancel.record(branch, reason), cancel.completion.clone())
        };
        if let Some(combined) = combined {
            tracing::debug!("both tee branches cancelled; cancelling source");
            let cancel = match self.reader.borrow().as_ref() {
                Some(reader) => reader.cancel(combined),
                None => self.source.cancel(combined),
            };
            settle_with(completion.clone(), cancel);
        }
        completion.wait().boxed_local()
    }
}

struct ByteBranch {
    tee: Rc<ByteTee>,
    branch: usize,
}

impl UnderlyingByteSource for ByteBranch {
    fn start(&mut self, controller: &ReadableByteStreamController) -> Completion {
        self.tee.controllers.borrow_mut()[self.branch] = Some(controller.clone());
        ready_ok()
    }

    fn pull(&mut self, _controller: &ReadableByteStreamController) -> Completion {
        self.tee.pull(self.branch)
    }

    fn cancel(&mut self, reason: StreamError) -> Completion {
        self.tee.cancel_branch(self.branch, reason)
    }
}

/// 字节流分叉：两个分支都是高水位线为 0 的字节流。
pub(crate) fn byte_tee(
    stream: &ReadableStream<ByteView>,
) -> Result<(ReadableStream<ByteView>, ReadableStream<ByteView>)> {
    let reader = stream.get_reader()?;
    let tee = Rc::new(ByteTee {
        source: stream.clone(),
        reader: RefCell::new(Some(TeeReader::Default(reader))),
        reader_generation: Cell::new(0),
        reading: Cell::new(false),
        read_again: [Cell::new(false), Cell::new(false)],
        cancel: RefCell::new(CancelState::new()),
        controllers: RefCell::new([None, None]),
    });
    let first = ReadableStream::new_bytes(
        ByteBranch {
            tee: Rc::clone(&tee),
            branch: 0,
        },
        ByteStreamOptions::default(),
    )?;
    let second = ReadableStream::new_bytes(
        ByteBranch {
            tee: Rc::clone(&tee),
            branch: 1,
        },
        ByteStreamOptions::default(),
    )?;
    tee.forward_reader_error();
    tracing::debug!("byte stream teed");
    Ok((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::run_until_stalled;

    struct Idle;

    impl UnderlyingByteSource for Idle {}

    /// 切换到 BYOB 读者失败时，分支的缓冲区仍留在其 BYOB 请求中。
    #[test]
    fn failed_reader_switch_keeps_branch_buffer() {
        let source = ReadableStream::new_bytes(Idle, ByteStreamOptions::default())
            .expect("创建字节流");
        let _held = source.get_reader().expect("外部读者占用来源");
        let tee = Rc::new(ByteTee {
            source: source.clone(),
            reader: RefCell::new(None),
            reader_generation: Cell::new(0),
            reading: Cell::new(true),
            read_again: [Cell::new(false), Cell::new(false)],
            cancel: RefCell::new(CancelState::new()),
            controllers: RefCell::new([None, None]),
        });
        let branch = ReadableStream::new_bytes(
            ByteBranch {
                tee: Rc::clone(&tee),
                branch: 0,
            },
            ByteStreamOptions::default(),
        )
        .expect("创建分支");
        let reader = branch.get_byob_reader().expect("获取 BYOB 读者");
        let _pending = reader.read(ByteView::new(vec![0; 4]));
        run_until_stalled();
        assert!(tee.read_again[0].get());

        tee.reading.set(false);
        let outcome = tee.pull(0).now_or_never();

        assert!(matches!(outcome, Some(Err(StreamError::InvalidState(_)))));
        assert!(!tee.reading.get());
        let request = tee
            .controller(0)
            .and_then(|controller| controller.byob_request())
            .expect("请求仍在");
        assert_eq!(request.remaining(), Ok(4));
        assert_eq!(request.with_view(|region| region.len()), Ok(4));
    }
}
