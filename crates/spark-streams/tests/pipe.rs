//! `pipe` 集成测试：管道的数据搬运、收尾传播与 `prevent_*` 选项。
//!
//! # 测试目标（Why）
//! - 正常路径：来源的全部值按序写入目标，来源结束后目标被关闭；
//! - 失败路径：来源出错中止目标，目标出错取消来源，中止信号同时作用于两端；
//! - `prevent_*` 选项只抑制对应的传播动作，不影响管道自身的结果。
//!
//! # 结构安排（How）
//! - `Ticker` 来源每次拉取产出下一个整数或保持空闲，并记录取消原因；
//! - `Journal` 下游记录写入、关闭与中止，可配置在第 N 个写入时失败。

use std::cell::RefCell;
use std::rc::Rc;

use futures::FutureExt;
use spark_streams::runtime::{block_on, run_until_stalled};
use spark_streams::{
    AbortController, Completion, PipeOptions, ReadableState, ReadableStream,
    ReadableStreamDefaultController, StreamError, UnderlyingSink, UnderlyingSource, WritableState,
    WritableStream, WritableStreamDefaultController,
};

fn done() -> Completion {
    futures::future::ready(Ok(())).boxed_local()
}

#[derive(Default)]
struct Record {
    writes: Vec<String>,
    closed: bool,
    aborted: Option<StreamError>,
}

#[derive(Default)]
struct Journal {
    record: Rc<RefCell<Record>>,
    fail_on: Option<usize>,
}

impl UnderlyingSink<String> for Journal {
    fn write(&mut self, chunk: String, _controller: &WritableStreamDefaultController<String>) -> Completion {
        let mut record = self.record.borrow_mut();
        if self.fail_on == Some(record.writes.len()) {
            return futures::future::ready(Err(StreamError::reason("disk full"))).boxed_local();
        }
        record.writes.push(chunk);
        done()
    }

    fn close(&mut self) -> Completion {
        self.record.borrow_mut().closed = true;
        done()
    }

    fn abort(&mut self, reason: StreamError) -> Completion {
        self.record.borrow_mut().aborted = Some(reason);
        done()
    }
}

/// `produce` 为真时每次拉取产出一个值，否则保持空闲。
#[derive(Default)]
struct Ticker {
    produce: bool,
    next: u32,
    cancelled: Rc<RefCell<Option<StreamError>>>,
    controller: Rc<RefCell<Option<ReadableStreamDefaultController<String>>>>,
}

impl UnderlyingSource<String> for Ticker {
    fn start(&mut self, controller: &ReadableStreamDefaultController<String>) -> Completion {
        *self.controller.borrow_mut() = Some(controller.clone());
        done()
    }

    fn pull(&mut self, controller: &ReadableStreamDefaultController<String>) -> Completion {
        if !self.produce {
            return done();
        }
        self.next += 1;
        futures::future::ready(controller.enqueue(format!("t{}", self.next))).boxed_local()
    }

    fn cancel(&mut self, reason: StreamError) -> Completion {
        *self.cancelled.borrow_mut() = Some(reason);
        done()
    }
}

fn words() -> ReadableStream<String> {
    ReadableStream::from_iter(vec!["a".to_owned(), "b".to_owned()])
}

/// 来源的全部值按序写入，来源结束后目标关闭，两端锁都被释放。
#[test]
fn forwards_all_chunks_then_closes() {
    let record = Rc::new(RefCell::new(Record::default()));
    let source = words();
    let dest = WritableStream::new(Journal {
        record: Rc::clone(&record),
        ..Journal::default()
    })
    .expect("创建可写流");

    let outcome = block_on(source.pipe_to(&dest, PipeOptions::default()));

    assert!(outcome.is_ok());
    assert_eq!(record.borrow().writes, vec!["a", "b"]);
    assert!(record.borrow().closed);
    assert_eq!(dest.state(), WritableState::Closed);
    assert!(!source.is_locked());
    assert!(!dest.is_locked());
    assert!(source.is_disturbed());
}

#[test]
fn prevent_close_leaves_destination_open() {
    let record = Rc::new(RefCell::new(Record::default()));
    let source = words();
    let dest = WritableStream::new(Journal {
        record: Rc::clone(&record),
        ..Journal::default()
    })
    .expect("创建可写流");
    let options = PipeOptions {
        prevent_close: true,
        ..PipeOptions::default()
    };

    assert!(block_on(source.pipe_to(&dest, options)).is_ok());

    assert_eq!(record.borrow().writes, vec!["a", "b"]);
    assert!(!record.borrow().closed);
    assert_eq!(dest.state(), WritableState::Writable);
    assert!(!dest.is_locked());
}

/// 来源出错：目标以同一原因中止，管道以该原因失败。
#[test]
fn source_error_aborts_destination() {
    let record = Rc::new(RefCell::new(Record::default()));
    let controller = Rc::new(RefCell::new(None));
    let source = ReadableStream::new(Ticker {
        controller: Rc::clone(&controller),
        ..Ticker::default()
    })
    .expect("创建可读流");
    let dest = WritableStream::new(Journal {
        record: Rc::clone(&record),
        ..Journal::default()
    })
    .expect("创建可写流");

    let piping = source.pipe_to(&dest, PipeOptions::default());
    run_until_stalled();
    let controller: ReadableStreamDefaultController<String> =
        controller.borrow().clone().expect("start 已保存控制器");
    controller.error(StreamError::reason("upstream"));
    let outcome = block_on(piping);

    assert_eq!(outcome, Err(StreamError::reason("upstream")));
    assert_eq!(record.borrow().aborted, Some(StreamError::reason("upstream")));
    assert_eq!(dest.state(), WritableState::Errored);
}

#[test]
fn prevent_abort_keeps_destination_writable() {
    let record = Rc::new(RefCell::new(Record::default()));
    let controller = Rc::new(RefCell::new(None));
    let source = ReadableStream::new(Ticker {
        controller: Rc::clone(&controller),
        ..Ticker::default()
    })
    .expect("创建可读流");
    let dest = WritableStream::new(Journal {
        record: Rc::clone(&record),
        ..Journal::default()
    })
    .expect("创建可写流");
    let options = PipeOptions {
        prevent_abort: true,
        ..PipeOptions::default()
    };

    let piping = source.pipe_to(&dest, options);
    run_until_stalled();
    let controller: ReadableStreamDefaultController<String> =
        controller.borrow().clone().expect("start 已保存控制器");
    controller.error(StreamError::reason("upstream"));

    assert_eq!(block_on(piping), Err(StreamError::reason("upstream")));
    assert!(record.borrow().aborted.is_none());
    assert_eq!(dest.state(), WritableState::Writable);
}

/// 目标写入失败：来源以同一原因取消，管道以该原因失败。
#[test]
fn destination_error_cancels_source() {
    let cancelled = Rc::new(RefCell::new(None));
    let source = ReadableStream::new(Ticker {
        produce: true,
        cancelled: Rc::clone(&cancelled),
        ..Ticker::default()
    })
    .expect("创建可读流");
    let record = Rc::new(RefCell::new(Record::default()));
    let dest = WritableStream::new(Journal {
        record: Rc::clone(&record),
        fail_on: Some(2),
    })
    .expect("创建可写流");

    let outcome = block_on(source.pipe_to(&dest, PipeOptions::default()));

    assert_eq!(outcome, Err(StreamError::reason("disk full")));
    assert_eq!(*cancelled.borrow(), Some(StreamError::reason("disk full")));
    assert_eq!(record.borrow().writes, vec!["t1", "t2"]);
    assert_eq!(source.state(), ReadableState::Closed);
}

#[test]
fn prevent_cancel_keeps_source_readable() {
    let cancelled = Rc::new(RefCell::new(None));
    let source = ReadableStream::new(Ticker {
        produce: true,
        cancelled: Rc::clone(&cancelled),
        ..Ticker::default()
    })
    .expect("创建可读流");
    let dest = WritableStream::new(Journal {
        fail_on: Some(0),
        ..Journal::default()
    })
    .expect("创建可写流");
    let options = PipeOptions {
        prevent_cancel: true,
        ..PipeOptions::default()
    };

    assert_eq!(
        block_on(source.pipe_to(&dest, options)),
        Err(StreamError::reason("disk full"))
    );
    assert!(cancelled.borrow().is_none());
    assert_eq!(source.state(), ReadableState::Readable);
    assert!(!source.is_locked());
}

/// 中止信号：目标被中止、来源被取消，管道以信号原因失败。
#[test]
fn abort_signal_shuts_down_both_sides() {
    let cancelled = Rc::new(RefCell::new(None));
    let source = ReadableStream::new(Ticker {
        cancelled: Rc::clone(&cancelled),
        ..Ticker::default()
    })
    .expect("创建可读流");
    let record = Rc::new(RefCell::new(Record::default()));
    let dest = WritableStream::new(Journal {
        record: Rc::clone(&record),
        ..Journal::default()
    })
    .expect("创建可写流");
    let abort = AbortController::new();

    let piping = source.pipe_to(&dest, PipeOptions::default().with_signal(abort.signal()));
    run_until_stalled();
    assert!(abort.abort(Some(StreamError::reason("user"))));
    let outcome = block_on(piping);

    assert_eq!(outcome, Err(StreamError::reason("user")));
    assert_eq!(*cancelled.borrow(), Some(StreamError::reason("user")));
    assert_eq!(record.borrow().aborted, Some(StreamError::reason("user")));
    assert!(!source.is_locked());
    assert!(!dest.is_locked());
}

/// 信号在管道开始前已触发：不读取任何值，直接收尾。
#[test]
fn pre_aborted_signal_skips_reading() {
    let record = Rc::new(RefCell::new(Record::default()));
    let source = words();
    let dest = WritableStream::new(Journal {
        record: Rc::clone(&record),
        ..Journal::default()
    })
    .expect("创建可写流");
    let abort = AbortController::new();
    abort.abort(None);

    let outcome = block_on(source.pipe_to(&dest, PipeOptions::default().with_signal(abort.signal())));

    assert!(matches!(outcome, Err(StreamError::Aborted(_))));
    assert!(record.borrow().writes.is_empty());
    assert_eq!(source.state(), ReadableState::Closed);
    assert_eq!(dest.state(), WritableState::Errored);
}

#[test]
fn locked_stream_cannot_be_piped() {
    let source = words();
    let dest = WritableStream::new(Journal::default()).expect("创建可写流");
    let reader = source.get_reader().expect("锁定来源");

    let outcome = block_on(source.pipe_to(&dest, PipeOptions::default()));

    assert!(matches!(outcome, Err(StreamError::InvalidState(_))));
    assert!(!dest.is_locked());
    drop(reader);
    assert!(!source.is_disturbed());
}
