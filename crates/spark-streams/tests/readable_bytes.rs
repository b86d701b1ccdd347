//! `readable_bytes` 集成测试：字节流控制器、BYOB 读者与 BYOB 请求的公开契约。
//!
//! # 测试目标（Why）
//! - 字节流最容易出错的是“部分填充”：一个块跨越多次读取、最少元素数、元素对齐以及关闭时的残留字节；
//! - 来源通过 BYOB 请求直接写入读者缓冲区的路径与排队路径必须给出一致的结果。
//!
//! # 结构安排（How）
//! - `Bytes` 来源在 `start` 中预置若干块并可选择关闭，同时交出控制器句柄；
//! - `Responder` 来源在 `pull` 中通过 BYOB 请求就地写入固定字节。

use std::cell::RefCell;
use std::rc::Rc;

use futures::FutureExt;
use spark_streams::runtime::{block_on, run_until_stalled};
use spark_streams::{
    ByteStreamOptions, ByteView, Completion, ControllerKind, ReadableByteStreamController,
    ReadableState, ReadableStream, StreamError, UnderlyingByteSource, UnderlyingSource,
};

fn done() -> Completion {
    futures::future::ready(Ok(())).boxed_local()
}

type SharedController = Rc<RefCell<Option<ReadableByteStreamController>>>;

#[derive(Default)]
struct Preloaded {
    chunks: Vec<Vec<u8>>,
    close: bool,
    controller: SharedController,
}

impl UnderlyingByteSource for Preloaded {
    fn start(&mut self, controller: &ReadableByteStreamController) -> Completion {
        *self.controller.borrow_mut() = Some(controller.clone());
        let mut outcome = Ok(());
        for chunk in self.chunks.drain(..) {
            outcome = outcome.and_then(|()| controller.enqueue(ByteView::new(chunk)));
        }
        if self.close {
            outcome = outcome.and_then(|()| controller.close());
        }
        futures::future::ready(outcome).boxed_local()
    }
}

/// 每次拉取都通过 BYOB 请求写入 `payload`。
struct Responder {
    payload: Vec<u8>,
}

impl UnderlyingByteSource for Responder {
    fn pull(&mut self, controller: &ReadableByteStreamController) -> Completion {
        let Some(request) = controller.byob_request() else {
            return done();
        };
        let payload = self.payload.clone();
        let outcome = request
            .with_view(|region| {
                let written = payload.len().min(region.len());
                region[..written].copy_from_slice(&payload[..written]);
                written
            })
            .and_then(|written| request.respond(written));
        futures::future::ready(outcome).boxed_local()
    }
}

fn shared_controller(controller: &SharedController) -> ReadableByteStreamController {
    controller.borrow().clone().expect("start 已保存控制器")
}

/// 一个 10 字节的块被 4 字节与 6 字节的两次 BYOB 读取依次取走。
#[test]
fn one_chunk_spans_two_byob_reads() {
    let stream = ReadableStream::new_bytes(
        Preloaded {
            chunks: vec![(1..=10).collect()],
            ..Preloaded::default()
        },
        ByteStreamOptions::default(),
    )
    .expect("创建字节流");
    assert_eq!(stream.controller_kind(), ControllerKind::Byte);
    let reader = stream.get_byob_reader().expect("获取 BYOB 读者");

    let first = block_on(reader.read(ByteView::new(vec![0; 4]))).expect("第一次读取");
    let second = block_on(reader.read(ByteView::new(vec![0; 6]))).expect("第二次读取");

    assert!(!first.done);
    assert_eq!(first.value.expect("有数据").as_bytes(), &[1, 2, 3, 4]);
    assert!(!second.done);
    assert_eq!(
        second.value.expect("有数据").as_bytes(),
        &[5, 6, 7, 8, 9, 10]
    );
}

/// 来源在 `pull` 中通过 BYOB 请求就地写入，读者拿回自己的缓冲区。
#[test]
fn source_fills_reader_buffer_through_byob_request() {
    let stream = ReadableStream::new_bytes(
        Responder {
            payload: vec![7, 7, 7],
        },
        ByteStreamOptions::default(),
    )
    .expect("创建字节流");
    let reader = stream.get_byob_reader().expect("获取 BYOB 读者");

    let result = block_on(reader.read(ByteView::new(vec![0; 8]))).expect("读取成功");

    let view = result.value.expect("有数据");
    assert_eq!(view.as_bytes(), &[7, 7, 7]);
    assert_eq!(view.byte_offset(), 0);
    assert_eq!(view.buffer_len(), 8);
}

/// 自动分配：默认读者也能驱动来源的 BYOB 请求路径。
#[test]
fn auto_allocation_serves_default_reader() {
    let stream = ReadableStream::new_bytes(
        Responder {
            payload: vec![1, 2, 3, 4, 5],
        },
        ByteStreamOptions {
            auto_allocate_chunk_size: Some(16),
            ..ByteStreamOptions::default()
        },
    )
    .expect("创建字节流");
    let reader = stream.get_reader().expect("获取默认读者");

    let chunk = block_on(reader.read()).expect("读取成功").expect("有数据");

    assert_eq!(chunk.as_bytes(), &[1, 2, 3, 4, 5]);
}

/// 最少元素数：凑满 2 个双字节元素前读取保持挂起，多余的 1 字节留在队列中。
#[test]
fn read_with_min_waits_for_enough_elements() {
    let controller = SharedController::default();
    let stream = ReadableStream::new_bytes(
        Preloaded {
            chunks: vec![vec![1, 2, 3]],
            controller: Rc::clone(&controller),
            ..Preloaded::default()
        },
        ByteStreamOptions::default(),
    )
    .expect("创建字节流");
    let controller = shared_controller(&controller);
    let reader = stream.get_byob_reader().expect("获取 BYOB 读者");

    let view = ByteView::with_element_size(vec![0; 8], 2).expect("合法视图");
    let mut pending = reader.read_with_min(view, 2);
    run_until_stalled();
    assert!((&mut pending).now_or_never().is_none());

    controller.enqueue(ByteView::new(vec![4, 5])).expect("补充字节");
    let result = block_on(pending).expect("读取成功");

    let view = result.value.expect("有数据");
    assert_eq!(view.element_size(), 2);
    assert_eq!(view.len(), 2);
    assert_eq!(view.as_bytes(), &[1, 2, 3, 4]);

    let rest = block_on(reader.read(ByteView::new(vec![0; 4]))).expect("读取剩余");
    assert_eq!(rest.value.expect("有数据").as_bytes(), &[5]);
}

#[test]
fn read_with_min_rejects_invalid_arguments() {
    let stream =
        ReadableStream::new_bytes(Preloaded::default(), ByteStreamOptions::default())
            .expect("创建字节流");
    let reader = stream.get_byob_reader().expect("获取 BYOB 读者");

    let zero_min = block_on(reader.read_with_min(ByteView::new(vec![0; 4]), 0));
    let too_many = block_on(reader.read_with_min(ByteView::new(vec![0; 4]), 5));
    let empty = block_on(reader.read(ByteView::new(Vec::new())));

    assert!(matches!(zero_min, Err(StreamError::InvalidArgument(_))));
    assert!(matches!(too_many, Err(StreamError::InvalidArgument(_))));
    assert!(matches!(empty, Err(StreamError::InvalidArgument(_))));
    assert_eq!(stream.state(), ReadableState::Readable);
}

/// 关闭时不足一个元素的残留字节被丢弃，读取以零长度视图结束。
#[test]
fn partial_element_is_dropped_when_closing() {
    let stream = ReadableStream::new_bytes(
        Preloaded {
            chunks: vec![vec![9, 9]],
            close: true,
            ..Preloaded::default()
        },
        ByteStreamOptions::default(),
    )
    .expect("创建字节流");
    let reader = stream.get_byob_reader().expect("获取 BYOB 读者");

    let view = ByteView::with_element_size(vec![0; 4], 4).expect("合法视图");
    let result = block_on(reader.read(view)).expect("读取结束而非失败");

    assert!(result.done);
    let view = result.value.expect("归还缓冲区");
    assert_eq!(view.byte_length(), 0);
    assert_eq!(view.buffer_len(), 4);
    assert_eq!(stream.state(), ReadableState::Closed);
}

/// 关闭后最少元素数无法满足时，已对齐的字节仍随结束信号交给读者，不会被丢弃。
#[test]
fn aligned_bytes_survive_close_below_minimum() {
    let stream = ReadableStream::new_bytes(
        Preloaded {
            chunks: vec![(1..=10).collect()],
            close: true,
            ..Preloaded::default()
        },
        ByteStreamOptions::default(),
    )
    .expect("创建字节流");
    let reader = stream.get_byob_reader().expect("获取 BYOB 读者");

    let result =
        block_on(reader.read_with_min(ByteView::new(vec![0; 16]), 16)).expect("读取结束而非失败");

    assert!(result.done);
    let view = result.value.expect("携带剩余字节");
    assert_eq!(view.as_bytes(), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    assert_eq!(view.buffer_len(), 16);
    assert_eq!(stream.state(), ReadableState::Closed);
}

/// 关闭时只丢弃最后一个不完整元素，前面完整的元素照常交付。
#[test]
fn only_trailing_partial_element_is_dropped_on_close() {
    let stream = ReadableStream::new_bytes(
        Preloaded {
            chunks: vec![vec![1, 2, 3, 4, 5, 6]],
            close: true,
            ..Preloaded::default()
        },
        ByteStreamOptions::default(),
    )
    .expect("创建字节流");
    let reader = stream.get_byob_reader().expect("获取 BYOB 读者");

    let view = ByteView::with_element_size(vec![0; 8], 4).expect("合法视图");
    let result = block_on(reader.read_with_min(view, 2)).expect("读取结束而非失败");

    assert!(result.done);
    let view = result.value.expect("携带完整元素");
    assert_eq!(view.len(), 1);
    assert_eq!(view.as_bytes(), &[1, 2, 3, 4]);
}

/// 挂起读取已部分填充时关闭，来源以 `respond(0)` 归还缓冲区，读取以零长度视图结束。
#[test]
fn close_with_pending_partial_fill_completes_on_respond_zero() {
    let controller = SharedController::default();
    let stream = ReadableStream::new_bytes(
        Preloaded {
            controller: Rc::clone(&controller),
            ..Preloaded::default()
        },
        ByteStreamOptions::default(),
    )
    .expect("创建字节流");
    let controller = shared_controller(&controller);
    let reader = stream.get_byob_reader().expect("获取 BYOB 读者");

    let view = ByteView::with_element_size(vec![0; 4], 4).expect("合法视图");
    let pending = reader.read(view);
    run_until_stalled();
    controller.enqueue(ByteView::new(vec![9, 9])).expect("部分填充");
    controller.close().expect("关闭");
    assert_eq!(stream.state(), ReadableState::Closed);

    let request = controller.byob_request().expect("仍有挂起请求");
    assert!(matches!(request.respond(1), Err(StreamError::InvalidState(_))));
    request.respond(0).expect("关闭后以 0 字节响应");

    let result = block_on(pending).expect("读取结束");
    assert!(result.done);
    assert_eq!(result.value.expect("归还缓冲区").byte_length(), 0);
}

/// 借走 BYOB 请求的视图后必须以新视图归还，且偏移与缓冲区长度需匹配。
#[test]
fn respond_with_new_view_checks_region() {
    let controller = SharedController::default();
    let stream = ReadableStream::new_bytes(
        Preloaded {
            controller: Rc::clone(&controller),
            ..Preloaded::default()
        },
        ByteStreamOptions::default(),
    )
    .expect("创建字节流");
    let controller = shared_controller(&controller);
    let reader = stream.get_byob_reader().expect("获取 BYOB 读者");
    let pending = reader.read(ByteView::new(vec![0; 6]));
    run_until_stalled();

    let request = controller.byob_request().expect("挂起请求");
    assert_eq!(request.remaining().expect("剩余字节"), 6);
    let mut view = request.take_view().expect("借走视图");
    assert!(matches!(
        controller.enqueue(ByteView::new(vec![1])),
        Err(StreamError::InvalidState(_))
    ));
    assert!(matches!(
        request.respond_with_new_view(ByteView::new(vec![0; 3])),
        Err(StreamError::InvalidArgument(_))
    ));

    view.as_bytes_mut()[..2].copy_from_slice(&[4, 2]);
    let buffer = view.into_buffer();
    let filled = ByteView::from_parts(buffer, 0, 2).expect("合法视图");
    request.respond_with_new_view(filled).expect("归还视图");

    let result = block_on(pending).expect("读取成功");
    assert_eq!(result.value.expect("有数据").as_bytes(), &[4, 2]);
    assert!(request.respond(1).is_err());
}

/// BYOB 读者释放后，已部分完成的请求转入队列，由新的默认读者读出。
#[test]
fn released_byob_fill_moves_to_queue() {
    let controller = SharedController::default();
    let stream = ReadableStream::new_bytes(
        Preloaded {
            controller: Rc::clone(&controller),
            ..Preloaded::default()
        },
        ByteStreamOptions::default(),
    )
    .expect("创建字节流");
    let controller = shared_controller(&controller);
    let reader = stream.get_byob_reader().expect("获取 BYOB 读者");
    let pending = reader.read(ByteView::new(vec![0; 8]));
    run_until_stalled();

    reader.release_lock();
    assert!(matches!(block_on(pending), Err(StreamError::InvalidState(_))));

    let request = controller.byob_request().expect("请求仍在");
    request
        .with_view(|region| region[..3].copy_from_slice(&[3, 2, 1]))
        .expect("写入剩余区域");
    request.respond(3).expect("响应");

    let reader = stream.get_reader().expect("获取默认读者");
    let chunk = block_on(reader.read()).expect("读取成功").expect("有数据");
    assert_eq!(chunk.as_bytes(), &[3, 2, 1]);
}

struct NoBytes;

impl UnderlyingSource<ByteView> for NoBytes {}

#[test]
fn byob_reader_requires_byte_stream() {
    let stream = ReadableStream::new(NoBytes).expect("创建值流");

    assert_eq!(stream.controller_kind(), ControllerKind::Default);
    assert!(matches!(
        stream.get_byob_reader(),
        Err(StreamError::InvalidState(_))
    ));
    assert!(!stream.is_locked());
}

#[test]
fn zero_length_enqueue_is_rejected() {
    let controller = SharedController::default();
    let _stream = ReadableStream::new_bytes(
        Preloaded {
            controller: Rc::clone(&controller),
            ..Preloaded::default()
        },
        ByteStreamOptions::default(),
    )
    .expect("创建字节流");
    let controller = shared_controller(&controller);

    assert!(matches!(
        controller.enqueue(ByteView::new(Vec::new())),
        Err(StreamError::InvalidArgument(_))
    ));
    assert_eq!(controller.desired_size(), Some(0.0));
}
