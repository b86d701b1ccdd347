//! 字节流控制器：字节队列、挂起的填充请求与 BYOB 请求句柄。
//!
//! # 设计背景（Why）
//! - 字节流既要支持“拿到什么给什么”的默认读取，也要支持把数据直接写进调用方缓冲区的 BYOB 读取；
//! - 两种读取可能在同一个流上交替出现（例如 tee 的分支），所以挂起的填充请求要记住自己的读者类型，
//!   读者释放后仍可被来源响应，其字节再回流到队列。
//!
//! # 契约说明（What）
//! - 队列中每个条目是一段连续字节，尺寸即其长度；
//! - 挂起的填充请求按 FIFO 处理，只有队首请求会暴露为 BYOB 请求；
//! - 填充只在达到最小填充量且按元素对齐时兑现，未对齐的尾部字节回流到队列；
//! - 关闭时若队首请求残留不足一个元素的字节，这些字节被丢弃，读取以零长度视图结束。
//!
//! # 实现要点（How）
//! - 描述符持有调用方缓冲区的所有权；来源通过 [`ReadableStreamByobRequest::take_view`]
//!   借走缓冲区后，必须通过 [`ReadableStreamByobRequest::respond_with_new_view`] 归还；
//! - BYOB 请求句柄携带代次号，任何会改变队首描述符的操作都会使旧句柄失效。

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use bytes::{Buf, Bytes};

use crate::ByteView;
use crate::Completion;
use crate::error::{Result, StreamError};
use crate::hook::{invoke_hook, ready_ok};
use crate::queue::SizedQueue;
use crate::runtime;
use crate::strategy::validate_high_water_mark;

use super::default_controller::{PullFlags, STREAM_DROPPED};
use super::{
    ControllerSteps, ReadIntoRequest, ReadRequest, ReadableState, StreamRef,
    UnderlyingByteSource, WeakStreamRef, fulfill_read_into_request, fulfill_read_request,
    readable_close, readable_error,
};

/// 字节流构造参数。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ByteStreamOptions {
    /// 高水位线，单位为字节，默认 0。
    pub high_water_mark: f64,
    /// 设置后，默认读取在队列为空时会预先分配该大小的缓冲区，交给来源以 BYOB 方式填充。
    pub auto_allocate_chunk_size: Option<usize>,
}

impl Default for ByteStreamOptions {
    fn default() -> Self {
        Self {
            high_water_mark: 0.0,
            auto_allocate_chunk_size: None,
        }
    }
}

impl ByteStreamOptions {
    pub(crate) fn validated(self) -> Result<Self> {
        validate_high_water_mark(self.high_water_mark)?;
        if self.auto_allocate_chunk_size == Some(0) {
            return Err(StreamError::invalid_argument(
                "auto allocate chunk size must be greater than zero",
            ));
        }
        Ok(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReaderType {
    Default,
    Byob,
    /// 原读者已释放，请求只等待来源响应后回流到队列。
    None,
}

struct PullIntoDescriptor {
    /// 被来源借走期间为 `None`。
    buffer: Option<Vec<u8>>,
    buffer_byte_length: usize,
    byte_offset: usize,
    byte_length: usize,
    bytes_filled: usize,
    minimum_fill: usize,
    element_size: usize,
    reader_type: ReaderType,
}

impl PullIntoDescriptor {
    fn remaining(&self) -> usize {
        self.byte_length - self.bytes_filled
    }

    fn into_view(self) -> ByteView {
        let filled = self.bytes_filled - self.bytes_filled % self.element_size;
        match self.buffer {
            Some(buffer) => {
                ByteView::from_raw(buffer, self.byte_offset, filled, self.element_size)
            }
            None => ByteView::new(Vec::new()),
        }
    }
}

struct ByteState {
    stream: WeakStreamRef<ByteView>,
    queue: SizedQueue<Bytes>,
    high_water_mark: f64,
    auto_allocate_chunk_size: Option<usize>,
    pending_pull_intos: VecDeque<PullIntoDescriptor>,
    byob_generation: u64,
    byob_active: bool,
    source: Option<Rc<RefCell<dyn UnderlyingByteSource>>>,
    flags: PullFlags,
}

impl ByteState {
    fn invalidate_byob_request(&mut self) {
        if self.byob_active {
            self.byob_active = false;
            self.byob_generation += 1;
        }
    }

    fn clear_pending_pull_intos(&mut self) {
        self.invalidate_byob_request();
        self.pending_pull_intos.clear();
    }

    fn push_bytes(&mut self, chunk: Bytes) -> Result<()> {
        let size = chunk.len() as f64;
        self.queue.push(chunk, size)
    }
}

/// 用队列中的字节尽量填充 `desc`，返回是否已达到可兑现的填充量。
fn fill_from_queue(queue: &mut SizedQueue<Bytes>, desc: &mut PullIntoDescriptor) -> bool {
    if desc.buffer.is_none() {
        return false;
    }
    let available = queue.total_size() as usize;
    let max_to_copy = available.min(desc.remaining());
    let max_filled = desc.bytes_filled + max_to_copy;
    let aligned = max_filled - max_filled % desc.element_size;
    let mut remaining = max_to_copy;
    let mut ready = false;
    if aligned >= desc.minimum_fill {
        remaining = aligned.saturating_sub(desc.bytes_filled);
        ready = true;
    }
    let mut dest = desc.byte_offset + desc.bytes_filled;
    let mut copied = 0;
    if let Some(buffer) = desc.buffer.as_mut() {
        while remaining > 0 {
            let Some(head) = queue.peek_mut() else {
                break;
            };
            let count = remaining.min(head.len());
            buffer[dest..dest + count].copy_from_slice(&head[..count]);
            if count == head.len() {
                queue.pop();
            } else {
                head.advance(count);
                queue.shrink_head(count as f64);
            }
            dest += count;
            copied += count;
            remaining -= count;
        }
    }
    desc.bytes_filled += copied;
    ready
}

pub(crate) struct ByteControllerCore {
    this: Weak<Self>,
    state: RefCell<ByteState>,
}

impl ByteControllerCore {
    pub(crate) fn new(
        stream: WeakStreamRef<ByteView>,
        source: Rc<RefCell<dyn UnderlyingByteSource>>,
        options: ByteStreamOptions,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            state: RefCell::new(ByteState {
                stream,
                queue: SizedQueue::new(),
                high_water_mark: options.high_water_mark,
                auto_allocate_chunk_size: options.auto_allocate_chunk_size,
                pending_pull_intos: VecDeque::new(),
                byob_generation: 0,
                byob_active: false,
                source: Some(source),
                flags: PullFlags::default(),
            }),
        })
    }

    fn handle(&self) -> ReadableByteStreamController {
        ReadableByteStreamController {
            core: self.this.clone(),
        }
    }

    fn stream(&self) -> Option<StreamRef<ByteView>> {
        self.state.borrow().stream.upgrade()
    }

    fn stream_state(&self) -> Option<ReadableState> {
        self.stream().map(|stream| stream.borrow().state)
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

    fn desired_size(&self) -> Option<f64> {
        match self.stream_state()? {
            ReadableState::Errored => None,
            ReadableState::Closed => Some(0.0),
            ReadableState::Readable => {
                let inner = self.state.borrow();
                Some(inner.high_water_mark - inner.queue.total_size())
            }
        }
    }

    fn can_close_or_enqueue(&self) -> bool {
        !self.state.borrow().flags.close_requested
            && self.stream_state() == Some(ReadableState::Readable)
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
            (inner.has_default_reader() && inner.num_read_requests() > 0)
                || (inner.has_byob_reader() && inner.num_read_into_requests() > 0)
        };
        waiting || self.desired_size().is_some_and(|desired| desired > 0.0)
    }

    fn call_pull_if_needed(&self) {
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

    fn clear_algorithms(&self) {
        let source = self.state.borrow_mut().source.take();
        drop(source);
    }

    pub(crate) fn error(&self, error: StreamError) {
        let Some(stream) = self.stream() else {
            return;
        };
        if stream.borrow().state != ReadableState::Readable {
            return;
        }
        {
            let mut inner = self.state.borrow_mut();
            inner.clear_pending_pull_intos();
            inner.queue.reset();
        }
        self.clear_algorithms();
        readable_error(&stream, error);
    }

    fn close(&self) -> Result<()> {
        let Some(stream) = self.stream() else {
            return Err(StreamError::invalid_state(STREAM_DROPPED));
        };
        if self.state.borrow().flags.close_requested
            || stream.borrow().state != ReadableState::Readable
        {
            return Ok(());
        }
        {
            let mut inner = self.state.borrow_mut();
            if inner.queue.total_size() > 0.0 {
                inner.flags.close_requested = true;
                return Ok(());
            }
            if let Some(first) = inner.pending_pull_intos.front_mut() {
                let partial = first.bytes_filled % first.element_size;
                if partial > 0 {
                    tracing::warn!(
                        discarded = partial,
                        element_size = first.element_size,
                        "closing byte stream with a partially filled element; trailing bytes dropped"
                    );
                    first.bytes_filled -= partial;
                }
            }
        }
        self.clear_algorithms();
        readable_close(&stream);
        Ok(())
    }

    fn enqueue(&self, view: ByteView) -> Result<()> {
        let Some(stream) = self.stream() else {
            return Err(StreamError::invalid_state(STREAM_DROPPED));
        };
        let (buffer, offset, length, _) = view.into_parts();
        let chunk = Bytes::from(buffer).slice(offset..offset + length);
        let orphaned_head = {
            let mut inner = self.state.borrow_mut();
            if inner.byob_active
                && inner
                    .pending_pull_intos
                    .front()
                    .is_some_and(|first| first.buffer.is_none())
            {
                return Err(StreamError::invalid_state(
                    "the BYOB request view was taken; respond with a new view instead of enqueueing",
                ));
            }
            inner.invalidate_byob_request();
            inner
                .pending_pull_intos
                .front()
                .is_some_and(|first| first.reader_type == ReaderType::None)
        };
        if orphaned_head {
            self.enqueue_detached_head_to_queue()?;
            let filled = self.process_pull_intos_using_queue();
            self.commit_all(&stream, filled);
        }
        let (default_reader, byob_reader) = {
            let inner = stream.borrow();
            (inner.has_default_reader(), inner.has_byob_reader())
        };
        if default_reader {
            self.process_read_requests_using_queue(&stream);
            if stream.borrow().num_read_requests() == 0 {
                self.state.borrow_mut().push_bytes(chunk)?;
            } else {
                self.state.borrow_mut().pending_pull_intos.pop_front();
                fulfill_read_request(&stream, Some(ByteView::from(chunk)));
            }
        } else if byob_reader {
            self.state.borrow_mut().push_bytes(chunk)?;
            let filled = self.process_pull_intos_using_queue();
            self.commit_all(&stream, filled);
        } else {
            self.state.borrow_mut().push_bytes(chunk)?;
        }
        self.call_pull_if_needed();
        Ok(())
    }

    fn enqueue_detached_head_to_queue(&self) -> Result<()> {
        let mut inner = self.state.borrow_mut();
        let Some(first) = inner.pending_pull_intos.pop_front() else {
            return Ok(());
        };
        if first.bytes_filled > 0 {
            if let Some(buffer) = first.buffer.as_ref() {
                let start = first.byte_offset;
                let copy = Bytes::copy_from_slice(&buffer[start..start + first.bytes_filled]);
                inner.push_bytes(copy)?;
            }
        }
        Ok(())
    }

    fn process_read_requests_using_queue(&self, stream: &StreamRef<ByteView>) {
        loop {
            if self.state.borrow().queue.total_size() <= 0.0 {
                return;
            }
            let request = stream.borrow_mut().take_read_request();
            let Some(request) = request else {
                return;
            };
            self.fill_read_request_from_queue(request);
        }
    }

    fn fill_read_request_from_queue(&self, request: ReadRequest<ByteView>) {
        let entry = self.state.borrow_mut().queue.pop();
        self.handle_queue_drain();
        match entry {
            Some(bytes) => request.chunk(ByteView::from(bytes)),
            None => request.error(StreamError::invalid_state("byte queue unexpectedly empty")),
        }
    }

    fn handle_queue_drain(&self) {
        let (drained, close_requested) = {
            let inner = self.state.borrow();
            (inner.queue.total_size() <= 0.0, inner.flags.close_requested)
        };
        if drained && close_requested {
            self.clear_algorithms();
            if let Some(stream) = self.stream() {
                readable_close(&stream);
            }
        } else {
            self.call_pull_if_needed();
        }
    }

    /// 依次用队列填充挂起的请求，返回已达到兑现条件的描述符。
    fn process_pull_intos_using_queue(&self) -> Vec<PullIntoDescriptor> {
        let mut filled = Vec::new();
        loop {
            let mut inner = self.state.borrow_mut();
            if inner.queue.total_size() <= 0.0 || inner.pending_pull_intos.is_empty() {
                break;
            }
            let ByteState {
                queue,
                pending_pull_intos,
                ..
            } = &mut *inner;
            let ready = match pending_pull_intos.front_mut() {
                Some(head) => fill_from_queue(queue, head),
                None => false,
            };
            inner.invalidate_byob_request();
            if !ready {
                break;
            }
            if let Some(desc) = inner.pending_pull_intos.pop_front() {
                filled.push(desc);
            }
        }
        filled
    }

    fn commit_all(&self, stream: &StreamRef<ByteView>, filled: Vec<PullIntoDescriptor>) {
        for desc in filled {
            self.commit(stream, desc);
        }
    }

    fn commit(&self, stream: &StreamRef<ByteView>, desc: PullIntoDescriptor) {
        let done = stream.borrow().state == ReadableState::Closed;
        let reader_type = desc.reader_type;
        let view = desc.into_view();
        match reader_type {
            ReaderType::Default => {
                fulfill_read_request(stream, if done { None } else { Some(view) });
            }
            ReaderType::Byob => fulfill_read_into_request(stream, view, done),
            ReaderType::None => {}
        }
    }

    /// 处理一次 BYOB 读取。
    pub(crate) fn pull_into(&self, view: ByteView, min_elements: usize, request: ReadIntoRequest) {
        let Some(stream) = self.stream() else {
            request.error(StreamError::invalid_state(STREAM_DROPPED));
            return;
        };
        let element_size = view.element_size();
        let (buffer, byte_offset, byte_length, _) = view.into_parts();
        let mut desc = PullIntoDescriptor {
            buffer_byte_length: buffer.len(),
            buffer: Some(buffer),
            byte_offset,
            byte_length,
            bytes_filled: 0,
            minimum_fill: min_elements * element_size,
            element_size,
            reader_type: ReaderType::Byob,
        };

        if !self.state.borrow().pending_pull_intos.is_empty() {
            self.state.borrow_mut().pending_pull_intos.push_back(desc);
            self.push_read_into_request(&stream, request);
            return;
        }

        if stream.borrow().state == ReadableState::Closed {
            desc.bytes_filled = 0;
            request.close(Some(desc.into_view()));
            return;
        }

        let (has_bytes, close_requested) = {
            let inner = self.state.borrow();
            (inner.queue.total_size() > 0.0, inner.flags.close_requested)
        };
        if has_bytes {
            let ready = fill_from_queue(&mut self.state.borrow_mut().queue, &mut desc);
            if ready {
                self.handle_queue_drain();
                request.chunk(desc.into_view());
                return;
            }
            if close_requested {
                let partial = desc.bytes_filled % element_size;
                if partial > 0 {
                    tracing::warn!(
                        discarded = partial,
                        element_size,
                        "byte stream closed with a partially filled element; trailing bytes dropped"
                    );
                }
                desc.bytes_filled -= partial;
                self.state.borrow_mut().queue.reset();
                self.clear_algorithms();
                readable_close(&stream);
                request.close(Some(desc.into_view()));
                return;
            }
        }

        self.state.borrow_mut().pending_pull_intos.push_back(desc);
        self.push_read_into_request(&stream, request);
        self.call_pull_if_needed();
    }

    fn push_read_into_request(&self, stream: &StreamRef<ByteView>, request: ReadIntoRequest) {
        let pushed = stream.borrow_mut().push_read_into_request(request);
        if let Err(request) = pushed {
            request.error(StreamError::invalid_state("stream has no BYOB reader"));
        }
    }

    fn current_byob_request(&self) -> Option<ReadableStreamByobRequest> {
        let mut inner = self.state.borrow_mut();
        if inner.pending_pull_intos.is_empty() {
            return None;
        }
        inner.byob_active = true;
        Some(ReadableStreamByobRequest {
            core: self.this.clone(),
            generation: inner.byob_generation,
        })
    }

    fn check_byob_request(&self, generation: u64) -> Result<()> {
        let inner = self.state.borrow();
        if !inner.byob_active || inner.byob_generation != generation {
            return Err(StreamError::invalid_state(
                "this BYOB request has been invalidated",
            ));
        }
        Ok(())
    }

    fn respond(&self, bytes_written: usize) -> Result<()> {
        let closed = self.stream_state() == Some(ReadableState::Closed);
        {
            let inner = self.state.borrow();
            let first = inner
                .pending_pull_intos
                .front()
                .ok_or_else(|| StreamError::invalid_state("no pending BYOB request"))?;
            if closed {
                if bytes_written != 0 {
                    return Err(StreamError::invalid_state(
                        "bytes written must be 0 when responding on a closed stream",
                    ));
                }
            } else {
                if bytes_written == 0 {
                    return Err(StreamError::invalid_state(
                        "bytes written must be greater than 0 on a readable stream",
                    ));
                }
                if first.bytes_filled + bytes_written > first.byte_length {
                    return Err(StreamError::invalid_argument(
                        "bytes written exceeds the remaining view length",
                    ));
                }
            }
            if first.buffer.is_none() {
                return Err(StreamError::invalid_state(
                    "the BYOB request view was taken; use respond_with_new_view",
                ));
            }
        }
        self.respond_internal(bytes_written)
    }

    fn respond_with_new_view(&self, view: ByteView) -> Result<()> {
        let closed = self.stream_state() == Some(ReadableState::Closed);
        let bytes_written = view.byte_length();
        {
            let mut inner = self.state.borrow_mut();
            let first = inner
                .pending_pull_intos
                .front_mut()
                .ok_or_else(|| StreamError::invalid_state("no pending BYOB request"))?;
            if closed && bytes_written != 0 {
                return Err(StreamError::invalid_state(
                    "view must be empty when responding on a closed stream",
                ));
            }
            if !closed && bytes_written == 0 {
                return Err(StreamError::invalid_state(
                    "view must not be empty when responding on a readable stream",
                ));
            }
            if first.byte_offset + first.bytes_filled != view.byte_offset() {
                return Err(StreamError::invalid_argument(
                    "view offset does not match the BYOB request region",
                ));
            }
            if first.buffer_byte_length != view.buffer_len() {
                return Err(StreamError::invalid_argument(
                    "view buffer length does not match the BYOB request buffer",
                ));
            }
            if first.bytes_filled + bytes_written > first.byte_length {
                return Err(StreamError::invalid_argument(
                    "view length exceeds the BYOB request region",
                ));
            }
            first.buffer = Some(view.into_buffer());
        }
        self.respond_internal(bytes_written)
    }

    fn respond_internal(&self, bytes_written: usize) -> Result<()> {
        let Some(stream) = self.stream() else {
            return Err(StreamError::invalid_state(STREAM_DROPPED));
        };
        self.state.borrow_mut().invalidate_byob_request();
        if stream.borrow().state == ReadableState::Closed {
            self.respond_in_closed_state(&stream);
        } else {
            self.respond_in_readable_state(&stream, bytes_written)?;
        }
        self.call_pull_if_needed();
        Ok(())
    }

    fn respond_in_closed_state(&self, stream: &StreamRef<ByteView>) {
        {
            let mut inner = self.state.borrow_mut();
            if inner
                .pending_pull_intos
                .front()
                .is_some_and(|first| first.reader_type == ReaderType::None)
            {
                inner.pending_pull_intos.pop_front();
            }
        }
        if !stream.borrow().has_byob_reader() {
            return;
        }
        while stream.borrow().num_read_into_requests() > 0 {
            let desc = self.state.borrow_mut().pending_pull_intos.pop_front();
            match desc {
                Some(desc) => self.commit(stream, desc),
                None => break,
            }
        }
    }

    fn respond_in_readable_state(
        &self,
        stream: &StreamRef<ByteView>,
        bytes_written: usize,
    ) -> Result<()> {
        let (reader_type, below_minimum) = {
            let mut inner = self.state.borrow_mut();
            let Some(first) = inner.pending_pull_intos.front_mut() else {
                return Ok(());
            };
            first.bytes_filled += bytes_written;
            (first.reader_type, first.bytes_filled < first.minimum_fill)
        };
        if reader_type == ReaderType::None {
            self.enqueue_detached_head_to_queue()?;
            let filled = self.process_pull_intos_using_queue();
            self.commit_all(stream, filled);
            return Ok(());
        }
        if below_minimum {
            return Ok(());
        }
        let desc = {
            let mut inner = self.state.borrow_mut();
            let Some(mut desc) = inner.pending_pull_intos.pop_front() else {
                return Ok(());
            };
            let remainder = desc.bytes_filled % desc.element_size;
            if remainder > 0 {
                if let Some(buffer) = desc.buffer.as_ref() {
                    let end = desc.byte_offset + desc.bytes_filled;
                    let tail = Bytes::copy_from_slice(&buffer[end - remainder..end]);
                    inner.push_bytes(tail)?;
                }
                desc.bytes_filled -= remainder;
            }
            desc
        };
        let filled = self.process_pull_intos_using_queue();
        self.commit(stream, desc);
        self.commit_all(stream, filled);
        Ok(())
    }
}

impl ControllerSteps<ByteView> for ByteControllerCore {
    fn pull_steps(&self, request: ReadRequest<ByteView>) {
        let Some(stream) = self.stream() else {
            request.error(StreamError::invalid_state(STREAM_DROPPED));
            return;
        };
        if self.state.borrow().queue.total_size() > 0.0 {
            self.fill_read_request_from_queue(request);
            return;
        }
        {
            let mut inner = self.state.borrow_mut();
            if let Some(size) = inner.auto_allocate_chunk_size {
                inner.pending_pull_intos.push_back(PullIntoDescriptor {
                    buffer: Some(vec![0; size]),
                    buffer_byte_length: size,
                    byte_offset: 0,
                    byte_length: size,
                    bytes_filled: 0,
                    minimum_fill: 1,
                    element_size: 1,
                    reader_type: ReaderType::Default,
                });
            }
        }
        let pushed = stream.borrow_mut().push_read_request(request);
        if let Err(request) = pushed {
            request.error(StreamError::invalid_state("stream has no default reader"));
            return;
        }
        self.call_pull_if_needed();
    }

    fn cancel_steps(&self, reason: StreamError) -> Completion {
        let source = {
            let mut inner = self.state.borrow_mut();
            inner.clear_pending_pull_intos();
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

    fn release_steps(&self) {
        let mut inner = self.state.borrow_mut();
        if let Some(mut first) = inner.pending_pull_intos.pop_front() {
            first.reader_type = ReaderType::None;
            inner.pending_pull_intos.clear();
            inner.pending_pull_intos.push_back(first);
        }
    }
}

/// 字节流控制器句柄。
///
/// # 契约说明（What）
/// - [`ReadableByteStreamController::enqueue`] 拒绝零长度视图；若当前 BYOB 请求的缓冲区已被借走，
///   必须先通过请求句柄归还；
/// - [`ReadableByteStreamController::byob_request`] 在存在挂起填充请求时返回队首请求的句柄。
#[derive(Clone)]
pub struct ReadableByteStreamController {
    core: Weak<ByteControllerCore>,
}

impl ReadableByteStreamController {
    fn core(&self) -> Result<Rc<ByteControllerCore>> {
        self.core
            .upgrade()
            .ok_or_else(|| StreamError::invalid_state(STREAM_DROPPED))
    }

    pub fn desired_size(&self) -> Option<f64> {
        self.core.upgrade()?.desired_size()
    }

    /// 当前队首填充请求的句柄。
    pub fn byob_request(&self) -> Option<ReadableStreamByobRequest> {
        self.core.upgrade()?.current_byob_request()
    }

    pub fn enqueue(&self, chunk: ByteView) -> Result<()> {
        if chunk.byte_length() == 0 || chunk.buffer_len() == 0 {
            return Err(StreamError::invalid_argument(
                "chunk must have a non-zero byte length",
            ));
        }
        let core = self.core()?;
        if !core.can_close_or_enqueue() {
            return Err(StreamError::invalid_state(
                "cannot enqueue to a stream that is closed or draining",
            ));
        }
        core.enqueue(chunk)
    }

    pub fn close(&self) -> Result<()> {
        let core = self.core()?;
        if !core.can_close_or_enqueue() {
            return Err(StreamError::invalid_state(
                "stream is already closing or closed",
            ));
        }
        core.close()
    }

    pub fn error(&self, reason: StreamError) {
        if let Some(core) = self.core.upgrade() {
            core.error(reason);
        }
    }

    pub(crate) fn close_if_possible(&self) {
        if let Some(core) = self.core.upgrade() {
            if core.can_close_or_enqueue() {
                if let Err(error) = core.close() {
                    tracing::trace!(code = error.code(), error = %error, "byte stream close skipped");
                }
            }
        }
    }
}

/// BYOB 请求句柄：暴露队首填充请求的剩余区域。
///
/// # 教案式说明
/// - **意图 (Why)**：来源可以直接写入消费者的缓冲区，省去一次复制。
/// - **契约 (What)**：
///   - 句柄在被响应、被入队覆盖或流出错后失效，失效后的操作返回 [`StreamError::InvalidState`]；
///   - [`ReadableStreamByobRequest::take_view`] 借走缓冲区后，只能用
///     [`ReadableStreamByobRequest::respond_with_new_view`] 归还。
/// - **执行逻辑 (How)**：句柄携带代次号，与控制器当前代次比对判断是否失效。
#[derive(Clone)]
pub struct ReadableStreamByobRequest {
    core: Weak<ByteControllerCore>,
    generation: u64,
}

impl ReadableStreamByobRequest {
    fn core(&self) -> Result<Rc<ByteControllerCore>> {
        let core = self
            .core
            .upgrade()
            .ok_or_else(|| StreamError::invalid_state(STREAM_DROPPED))?;
        core.check_byob_request(self.generation)?;
        Ok(core)
    }

    /// 剩余可写字节数。
    pub fn remaining(&self) -> Result<usize> {
        let core = self.core()?;
        let inner = core.state.borrow();
        inner
            .pending_pull_intos
            .front()
            .map(PullIntoDescriptor::remaining)
            .ok_or_else(|| StreamError::invalid_state("no pending BYOB request"))
    }

    /// 就地写入剩余区域，不转移缓冲区所有权。
    pub fn with_view<R>(&self, write: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let core = self.core()?;
        let mut inner = core.state.borrow_mut();
        let first = inner
            .pending_pull_intos
            .front_mut()
            .ok_or_else(|| StreamError::invalid_state("no pending BYOB request"))?;
        let start = first.byte_offset + first.bytes_filled;
        let end = first.byte_offset + first.byte_length;
        let buffer = first.buffer.as_mut().ok_or_else(|| {
            StreamError::invalid_state("the BYOB request view was taken")
        })?;
        Ok(write(&mut buffer[start..end]))
    }

    /// 借走剩余区域对应的视图。
    pub fn take_view(&self) -> Result<ByteView> {
        let core = self.core()?;
        let mut inner = core.state.borrow_mut();
        let first = inner
            .pending_pull_intos
            .front_mut()
            .ok_or_else(|| StreamError::invalid_state("no pending BYOB request"))?;
        let buffer = first.buffer.take().ok_or_else(|| {
            StreamError::invalid_state("the BYOB request view was already taken")
        })?;
        Ok(ByteView::from_raw(
            buffer,
            first.byte_offset + first.bytes_filled,
            first.remaining(),
            1,
        ))
    }

    /// 声明已向剩余区域写入 `bytes_written` 字节。
    pub fn respond(&self, bytes_written: usize) -> Result<()> {
        self.core()?.respond(bytes_written)
    }

    /// 归还缓冲区，并以视图长度作为写入字节数。
    pub fn respond_with_new_view(&self, view: ByteView) -> Result<()> {
        self.core()?.respond_with_new_view(view)
    }
}
