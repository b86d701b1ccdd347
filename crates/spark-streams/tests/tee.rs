//! `tee` 集成测试：值流与字节流分叉的公开契约。
//!
//! # 测试目标（Why）
//! - 两个分支必须各自看到完整且有序的数据，消费速度互不影响；
//! - 只有两个分支都取消时才取消源流，且组合原因只交付一次；
//! - 字节流分叉后两个分支不得共享可变缓冲区，BYOB 分支读入自己的缓冲区。
//!
//! # 结构安排（How）
//! - 值流来源记录取消原因，字节流来源在 `start` 中预置数据；
//! - 分支读取通过 `block_on` 驱动，取消完成通过 `run_until_stalled` 观察是否仍挂起。

use std::cell::RefCell;
use std::rc::Rc;

use futures::{FutureExt, TryStreamExt};
use spark_streams::runtime::{block_on, run_until_stalled};
use spark_streams::{
    ByteStreamOptions, ByteView, Completion, ControllerKind, ReadableByteStreamController,
    ReadableState, ReadableStream, ReadableStreamDefaultController, StreamError,
    UnderlyingByteSource, UnderlyingSource,
};

fn done() -> Completion {
    futures::future::ready(Ok(())).boxed_local()
}

/// 不主动产出数据，只记录取消原因并交出控制器。
#[derive(Default)]
struct Idle {
    cancelled: Rc<RefCell<Vec<StreamError>>>,
    controller: Rc<RefCell<Option<ReadableStreamDefaultController<String>>>>,
}

impl UnderlyingSource<String> for Idle {
    fn start(&mut self, controller: &ReadableStreamDefaultController<String>) -> Completion {
        *self.controller.borrow_mut() = Some(controller.clone());
        done()
    }

    fn cancel(&mut self, reason: StreamError) -> Completion {
        self.cancelled.borrow_mut().push(reason);
        done()
    }
}

struct Preloaded(Vec<u8>);

impl UnderlyingByteSource for Preloaded {
    fn start(&mut self, controller: &ReadableByteStreamController) -> Completion {
        let outcome = controller.enqueue(ByteView::new(std::mem::take(&mut self.0)));
        futures::future::ready(outcome).boxed_local()
    }
}

/// 分支一先读完、分支二后读，二者都得到完整有序的数据。
#[test]
fn both_branches_see_every_chunk() {
    let source = ReadableStream::from_iter(vec!["c1", "c2", "c3"]);
    let (first, second) = source.tee().expect("分叉");
    assert!(source.is_locked());

    let seen_first: Vec<&str> =
        block_on(first.values(false).expect("分支一迭代").try_collect()).expect("分支一读取");
    let seen_second: Vec<&str> =
        block_on(second.values(false).expect("分支二迭代").try_collect()).expect("分支二读取");

    assert_eq!(seen_first, vec!["c1", "c2", "c3"]);
    assert_eq!(seen_second, vec!["c1", "c2", "c3"]);
    assert_eq!(source.state(), ReadableState::Closed);
}

/// 只取消一个分支不会取消源流，另一分支继续读到全部数据。
#[test]
fn single_branch_cancel_keeps_source_flowing() {
    let source = ReadableStream::from_iter(vec![1, 2, 3]);
    let (first, second) = source.tee().expect("分叉");

    let cancelling = first.cancel(StreamError::reason("not interested"));
    run_until_stalled();
    let seen: Vec<i32> =
        block_on(second.values(false).expect("分支二迭代").try_collect()).expect("分支二读取");

    assert_eq!(seen, vec![1, 2, 3]);
    assert!(block_on(cancelling).is_ok());
    assert_eq!(first.state(), ReadableState::Closed);
}

/// 两个分支都取消后，源流恰好收到一次组合原因，两个取消完成同时兑现。
#[test]
fn cancelling_both_branches_cancels_source_once() {
    let cancelled = Rc::new(RefCell::new(Vec::new()));
    let source = ReadableStream::new(Idle {
        cancelled: Rc::clone(&cancelled),
        ..Idle::default()
    })
    .expect("创建可读流");
    let (first, second) = source.tee().expect("分叉");
    run_until_stalled();

    let mut cancel_first = first.cancel(StreamError::reason("r1"));
    run_until_stalled();
    assert!(cancelled.borrow().is_empty());
    assert!((&mut cancel_first).now_or_never().is_none());

    let cancel_second = second.cancel(StreamError::reason("r2"));
    let (a, b) = block_on(futures::future::join(cancel_first, cancel_second));

    assert!(a.is_ok() && b.is_ok());
    assert_eq!(
        *cancelled.borrow(),
        vec![StreamError::Combined(vec![
            StreamError::reason("r1"),
            StreamError::reason("r2"),
        ])]
    );
    assert_eq!(source.state(), ReadableState::Closed);
}

/// 源流出错时两个分支都以同一原因出错。
#[test]
fn source_error_reaches_both_branches() {
    let controller = Rc::new(RefCell::new(None));
    let source = ReadableStream::new(Idle {
        controller: Rc::clone(&controller),
        ..Idle::default()
    })
    .expect("创建可读流");
    let (first, second) = source.tee().expect("分叉");
    let first_reader = first.get_reader().expect("分支一读者");
    let second_reader = second.get_reader().expect("分支二读者");
    let pending = first_reader.read();
    run_until_stalled();

    let controller: ReadableStreamDefaultController<String> =
        controller.borrow().clone().expect("start 已保存控制器");
    controller.error(StreamError::reason("upstream broke"));

    assert_eq!(block_on(pending), Err(StreamError::reason("upstream broke")));
    assert_eq!(
        block_on(second_reader.read()),
        Err(StreamError::reason("upstream broke"))
    );
    assert_eq!(first.state(), ReadableState::Errored);
    assert_eq!(second.state(), ReadableState::Errored);
}

/// 字节流分叉：分支仍是字节流，两个默认读者读到相同内容。
#[test]
fn byte_tee_yields_byte_branches() {
    let source = ReadableStream::new_bytes(Preloaded((1..=6).collect()), ByteStreamOptions::default())
        .expect("创建字节流");
    let (first, second) = source.tee().expect("分叉");
    assert_eq!(first.controller_kind(), ControllerKind::Byte);
    assert_eq!(second.controller_kind(), ControllerKind::Byte);

    let first_reader = first.get_reader().expect("分支一读者");
    let second_reader = second.get_reader().expect("分支二读者");
    let a = block_on(first_reader.read()).expect("分支一读取").expect("有数据");
    let b = block_on(second_reader.read()).expect("分支二读取").expect("有数据");

    assert_eq!(a.as_bytes(), &[1, 2, 3, 4, 5, 6]);
    assert_eq!(b.as_bytes(), &[1, 2, 3, 4, 5, 6]);
}

/// BYOB 分支读入自己的缓冲区，另一分支收到独立的副本。
#[test]
fn byob_branch_reads_into_own_buffer() {
    let source = ReadableStream::new_bytes(Preloaded((1..=10).collect()), ByteStreamOptions::default())
        .expect("创建字节流");
    let (first, second) = source.tee().expect("分叉");

    let byob = first.get_byob_reader().expect("分支一 BYOB 读者");
    let result = block_on(byob.read(ByteView::new(vec![0; 4]))).expect("BYOB 读取");
    let view = result.value.expect("有数据");
    assert_eq!(view.as_bytes(), &[1, 2, 3, 4]);
    assert_eq!(view.buffer_len(), 4);

    let reader = second.get_reader().expect("分支二读者");
    let copy = block_on(reader.read()).expect("分支二读取").expect("有数据");
    assert_eq!(copy.as_bytes(), &[1, 2, 3, 4]);

    let mut view = view;
    view.as_bytes_mut()[0] = 0xff;
    assert_eq!(copy.as_bytes()[0], 1);
}
