//! `transform` 集成测试：转换流两端的联动契约。
//!
//! # 测试目标（Why）
//! - 写入端的值经转换器变换后按序出现在读取端，`flush` 的产出排在最后；
//! - 任一端的失败、取消或中止都要传播到另一端，转换器的 `cancel` 钩子收到原因；
//! - `terminate` 关闭读取端并让写入端出错。
//!
//! # 结构安排（How）
//! - `Shouting` 转换器把每个值按空白拆分并转为大写，记录钩子调用；
//! - 写入与读取在同一个 `block_on` 中并发推进，读取端默认高水位线为 0，只有挂起读取时才拉动转换。

use std::cell::RefCell;
use std::rc::Rc;

use futures::FutureExt;
use spark_streams::runtime::{block_on, run_until_stalled};
use spark_streams::{
    Completion, PipeOptions, QueuingStrategy, ReadableState, ReadableStream, ReadableStreamDefaultReader,
    StreamError, TransformStream, TransformStreamDefaultController, Transformer, WritableState,
};

fn done() -> Completion {
    futures::future::ready(Ok(())).boxed_local()
}

#[derive(Default)]
struct Shouting {
    seen: Rc<RefCell<Vec<String>>>,
    cancelled: Rc<RefCell<Vec<StreamError>>>,
    flushed: Rc<RefCell<bool>>,
}

impl Transformer<String, String> for Shouting {
    fn transform(
        &mut self,
        chunk: String,
        controller: &TransformStreamDefaultController<String>,
    ) -> Completion {
        self.seen.borrow_mut().push(chunk.clone());
        match chunk.as_str() {
            "boom" => {
                return futures::future::ready(Err(StreamError::reason("boom"))).boxed_local();
            }
            "stop" => {
                controller.terminate();
                return done();
            }
            _ => {}
        }
        let outcome = chunk
            .split_whitespace()
            .try_for_each(|word| controller.enqueue(word.to_uppercase()));
        futures::future::ready(outcome).boxed_local()
    }

    fn flush(&mut self, controller: &TransformStreamDefaultController<String>) -> Completion {
        *self.flushed.borrow_mut() = true;
        futures::future::ready(controller.enqueue("<eof>".to_owned())).boxed_local()
    }

    fn cancel(&mut self, reason: StreamError) -> Completion {
        self.cancelled.borrow_mut().push(reason);
        done()
    }
}

async fn read_all(reader: &ReadableStreamDefaultReader<String>) -> Result<Vec<String>, StreamError> {
    let mut values = Vec::new();
    while let Some(value) = reader.read().await? {
        values.push(value);
    }
    Ok(values)
}

/// 原样转发：写入的值按序出现在读取端，关闭写入端后读取端结束。
#[test]
fn identity_forwards_and_closes() {
    let transform = TransformStream::<String, String>::identity().expect("创建转换流");
    let writer = transform.writable().get_writer().expect("获取写者");
    let reader = transform.readable().get_reader().expect("获取读者");

    let writing = async {
        writer.write("a".to_owned()).await?;
        writer.write("b".to_owned()).await?;
        writer.close().await
    };
    let (written, read) = block_on(futures::future::join(writing, read_all(&reader)));

    assert!(written.is_ok());
    assert_eq!(read.expect("读取成功"), vec!["a", "b"]);
    assert_eq!(transform.writable().state(), WritableState::Closed);
    assert_eq!(transform.readable().state(), ReadableState::Closed);
}

/// 一个写入可以产出多个值；`flush` 的产出排在最后。
#[test]
fn transformer_splits_and_flushes() {
    let flushed = Rc::new(RefCell::new(false));
    let transform = TransformStream::new(Shouting {
        flushed: Rc::clone(&flushed),
        ..Shouting::default()
    })
    .expect("创建转换流");
    let writer = transform.writable().get_writer().expect("获取写者");
    let reader = transform.readable().get_reader().expect("获取读者");

    let writing = async {
        writer.write("hello world".to_owned()).await?;
        writer.write("x".to_owned()).await?;
        writer.close().await
    };
    let (written, read) = block_on(futures::future::join(writing, read_all(&reader)));

    assert!(written.is_ok());
    assert!(*flushed.borrow());
    assert_eq!(read.expect("读取成功"), vec!["HELLO", "WORLD", "X", "<eof>"]);
}

/// 转换失败让两端都以同一原因出错。
#[test]
fn transform_failure_errors_both_sides() {
    let transform = TransformStream::new(Shouting::default()).expect("创建转换流");
    let writer = transform.writable().get_writer().expect("获取写者");
    let reader = transform.readable().get_reader().expect("获取读者");

    let (written, read) = block_on(futures::future::join(
        writer.write("boom".to_owned()),
        reader.read(),
    ));
    run_until_stalled();

    assert_eq!(written, Err(StreamError::reason("boom")));
    assert_eq!(read, Err(StreamError::reason("boom")));
    assert_eq!(transform.writable().state(), WritableState::Errored);
    assert_eq!(transform.readable().state(), ReadableState::Errored);
}

/// `terminate`：读取端正常结束，之后的写入失败。
#[test]
fn terminate_closes_readable_and_errors_writable() {
    let transform = TransformStream::new(Shouting::default()).expect("创建转换流");
    let writer = transform.writable().get_writer().expect("获取写者");
    let reader = transform.readable().get_reader().expect("获取读者");

    let (written, read) = block_on(futures::future::join(
        writer.write("stop".to_owned()),
        reader.read(),
    ));
    run_until_stalled();

    assert!(written.is_ok());
    assert_eq!(read, Ok(None));
    assert_eq!(transform.readable().state(), ReadableState::Closed);
    assert!(matches!(
        block_on(writer.write("late".to_owned())),
        Err(StreamError::InvalidState(_))
    ));
}

/// 取消读取端：转换器的 `cancel` 收到原因，写入端以同一原因出错。
#[test]
fn cancelling_readable_cancels_transformer() {
    let cancelled = Rc::new(RefCell::new(Vec::new()));
    let transform = TransformStream::new(Shouting {
        cancelled: Rc::clone(&cancelled),
        ..Shouting::default()
    })
    .expect("创建转换流");
    let writer = transform.writable().get_writer().expect("获取写者");
    let reader = transform.readable().get_reader().expect("获取读者");
    run_until_stalled();

    assert!(block_on(reader.cancel(StreamError::reason("enough"))).is_ok());

    assert_eq!(*cancelled.borrow(), vec![StreamError::reason("enough")]);
    assert_eq!(
        block_on(writer.write("more".to_owned())),
        Err(StreamError::reason("enough"))
    );
}

/// 中止写入端：转换器的 `cancel` 收到原因，读取端以同一原因出错。
#[test]
fn aborting_writable_errors_readable() {
    let cancelled = Rc::new(RefCell::new(Vec::new()));
    let transform = TransformStream::new(Shouting {
        cancelled: Rc::clone(&cancelled),
        ..Shouting::default()
    })
    .expect("创建转换流");
    let writer = transform.writable().get_writer().expect("获取写者");
    let reader = transform.readable().get_reader().expect("获取读者");
    run_until_stalled();

    assert!(block_on(writer.abort(StreamError::reason("halt"))).is_ok());

    assert_eq!(*cancelled.borrow(), vec![StreamError::reason("halt")]);
    assert_eq!(block_on(reader.read()), Err(StreamError::reason("halt")));
    assert_eq!(transform.writable().state(), WritableState::Errored);
}

/// 读取端没有消费时，写入端在第一个值之后进入背压。
#[test]
fn unread_output_applies_backpressure() {
    let transform = TransformStream::<u32, u32>::identity().expect("创建转换流");
    let writer = transform.writable().get_writer().expect("获取写者");
    run_until_stalled();
    assert_eq!(writer.desired_size(), Ok(Some(1.0)));

    let mut first = writer.write(1);
    run_until_stalled();
    assert!((&mut first).now_or_never().is_none());
    assert_eq!(writer.desired_size(), Ok(Some(0.0)));

    let reader = transform.readable().get_reader().expect("获取读者");
    assert_eq!(block_on(reader.read()), Ok(Some(1)));
    assert!(block_on(first).is_ok());
    assert_eq!(writer.desired_size(), Ok(Some(1.0)));
}

/// 背压期间挂起的写入在闸门打开后重新检查写入端：已在出错流程中则以存储的原因失败，转换器不再被调用。
#[test]
fn parked_write_rechecks_erroring_after_unblock() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let cancelled = Rc::new(RefCell::new(Vec::new()));
    let transform = TransformStream::with_strategies(
        Shouting {
            seen: Rc::clone(&seen),
            cancelled: Rc::clone(&cancelled),
            ..Shouting::default()
        },
        QueuingStrategy::new(1.0),
        QueuingStrategy::new(1.0),
    )
    .expect("创建转换流");
    let writer = transform.writable().get_writer().expect("获取写者");
    let reader = transform.readable().get_reader().expect("获取读者");
    run_until_stalled();

    assert!(block_on(writer.write("a".to_owned())).is_ok());
    let parked = writer.write("b".to_owned());
    run_until_stalled();
    assert_eq!(*seen.borrow(), vec!["a"]);

    let aborting = writer.abort(StreamError::reason("halt"));
    assert_eq!(transform.writable().state(), WritableState::Erroring);
    assert_eq!(block_on(reader.read()), Ok(Some("A".to_owned())));
    let (parked, aborted) = block_on(futures::future::join(parked, aborting));

    assert_eq!(parked, Err(StreamError::reason("halt")));
    assert!(aborted.is_ok());
    assert_eq!(*seen.borrow(), vec!["a"]);
    assert_eq!(*cancelled.borrow(), vec![StreamError::reason("halt")]);
    assert_eq!(transform.writable().state(), WritableState::Errored);
    assert_eq!(block_on(reader.read()), Err(StreamError::reason("halt")));
}

#[test]
fn pipe_through_identity_preserves_values() {
    let source = ReadableStream::from_iter(vec![1, 2, 3]);
    let identity = TransformStream::<i32, i32>::identity().expect("创建转换流");

    let readable = source
        .pipe_through(&identity, PipeOptions::default())
        .expect("建立管道");
    let reader = readable.get_reader().expect("获取读者");
    let values = block_on(async {
        let mut values = Vec::new();
        while let Some(value) = reader.read().await? {
            values.push(value);
        }
        Ok::<_, StreamError>(values)
    });

    assert_eq!(values, Ok(vec![1, 2, 3]));
    assert_eq!(source.state(), ReadableState::Closed);
}
