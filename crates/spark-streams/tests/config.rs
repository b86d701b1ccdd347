//! `config` 集成测试：由 TOML 配置构造流与管道选项。
//!
//! # 测试目标（Why）
//! - 配置只有在真正用于构造流时才有意义，这里从文本出发一路验证到流的期望尺寸与管道行为。
//!
//! # 结构安排（How）
//! - 解析一份覆盖全部小节的配置，再分别构造值流、可写流、字节流并执行一次管道。

use std::cell::RefCell;
use std::rc::Rc;

use futures::FutureExt;
use spark_streams::runtime::{block_on, run_until_stalled};
use spark_streams::{
    Completion, ReadableStream, ReadableStreamDefaultController, StreamConfig, StreamError,
    UnderlyingSink, UnderlyingSource, WritableState, WritableStream,
    WritableStreamDefaultController,
};

const CONFIG: &str = r#"
[readable]
high_water_mark = 3.0

[writable]
high_water_mark = 2.0

[bytes]
high_water_mark = 512.0
auto_allocate_chunk_size = 64

[pipe]
prevent_close = true
"#;

struct Captured(Rc<RefCell<Option<ReadableStreamDefaultController<u8>>>>);

impl UnderlyingSource<u8> for Captured {
    fn start(&mut self, controller: &ReadableStreamDefaultController<u8>) -> Completion {
        *self.0.borrow_mut() = Some(controller.clone());
        futures::future::ready(Ok(())).boxed_local()
    }
}

struct Discard;

impl UnderlyingSink<u8> for Discard {
    fn write(&mut self, _chunk: u8, _controller: &WritableStreamDefaultController<u8>) -> Completion {
        futures::future::ready(Ok(())).boxed_local()
    }
}

/// 测试意图（Why）：确认配置中的高水位线原样进入流的期望尺寸。
/// 步骤说明（How）：按配置构造值流与可写流，读取初始期望尺寸。
/// 契约校验（What）：值流为 3，可写流为 2。
#[test]
fn strategies_come_from_configuration() {
    let config = StreamConfig::from_toml_str(CONFIG).expect("合法配置");

    let slot = Rc::new(RefCell::new(None));
    let _readable =
        ReadableStream::with_strategy(Captured(Rc::clone(&slot)), config.readable_strategy().into())
            .expect("创建可读流");
    let controller = slot.borrow().clone().expect("start 已保存控制器");
    assert_eq!(controller.desired_size(), Some(3.0));

    let writable = WritableStream::with_strategy(Discard, config.writable_strategy().into())
        .expect("创建可写流");
    let writer = writable.get_writer().expect("获取写者");
    run_until_stalled();
    assert_eq!(writer.desired_size(), Ok(Some(2.0)));
}

/// 测试意图（Why）：确认管道默认选项来自配置。
/// 步骤说明（How）：以配置的管道选项执行一次管道。
/// 契约校验（What）：`prevent_close` 生效，目标在来源结束后仍可写。
#[test]
fn pipe_options_come_from_configuration() {
    let config = StreamConfig::from_toml_str(CONFIG).expect("合法配置");
    let source = ReadableStream::from_iter(vec![1_u8, 2, 3]);
    let dest = WritableStream::new(Discard).expect("创建可写流");

    assert!(block_on(source.pipe_to(&dest, config.pipe_options())).is_ok());
    assert_eq!(dest.state(), WritableState::Writable);
}

#[test]
fn byte_stream_options_come_from_configuration() {
    let config = StreamConfig::from_toml_str(CONFIG).expect("合法配置");
    let options = config.byte_stream_options();

    assert_eq!(options.high_water_mark, 512.0);
    assert_eq!(options.auto_allocate_chunk_size, Some(64));
}

#[test]
fn malformed_document_is_invalid_argument() {
    let outcome = StreamConfig::from_toml_str("[readable\nhigh_water_mark = 1.0");

    assert!(matches!(outcome, Err(StreamError::InvalidArgument(_))));
}
