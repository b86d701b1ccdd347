//! `spark-streams` 提供单线程、协作式调度、背压感知的可读/可写/转换流引擎。
//!
//! # 模块定位（Why）
//! - 数据在生产者与消费者之间流动时，双方速度往往不一致；流引擎用“排队总量 vs 高水位线”的
//!   期望尺寸把消费端的压力反馈给生产端，并以锁保证同一时刻只有一个消费者或写入者；
//! - 可读流、可写流与转换流是三个可组合的原语，管道与分叉两个算法只依赖它们的公开契约。
//!
//! # 设计概要（How）
//! - `queue`：带尺寸计量的 FIFO 队列；`strategy`：高水位线与尺寸函数；
//! - `readable`：值流控制器、字节流控制器（含 BYOB 读取）、默认读者与 BYOB 读者、异步迭代；
//! - `writable`：一次只有一个在途写入的写入管线、写者与 `ready`/`closed` 信号；
//! - `transform`：由转换器连接的可写端与可读端；
//! - `pipe` 与 `tee`：建立在上述公开契约之上的两个高层算法；
//! - `runtime`：线程局部的任务调度器与多等待者的一次性完成对象 [`runtime::Deferred`]；
//! - `config`：以 TOML 描述的默认策略。
//!
//! # 使用约束（What）
//! - 所有对象只在创建它们的线程内使用，异步完成由 [`runtime::block_on`] 或
//!   [`runtime::run_until_stalled`] 驱动；
//! - 用户钩子返回 [`Completion`]，钩子的同步部分在调用时立即执行。

mod config;
mod error;
mod hook;
mod pipe;
mod queue;
mod signal;
mod strategy;
mod tee;
mod transform;
mod view;

pub mod readable;
pub mod runtime;
pub mod writable;

use futures::future::LocalBoxFuture;

pub use config::{ByteStreamConfig, PipeConfig, StrategyConfig, StreamConfig};
pub use error::{Result, StreamError, codes};
pub use pipe::{PipeOptions, ReadableWritablePair};
pub use queue::SizedQueue;
pub use readable::{
    ByteStreamOptions, ControllerKind, ReadFuture, ReadIntoFuture, ReadIntoResult,
    ReadableByteStreamController, ReadableState, ReadableStream, ReadableStreamByobReader,
    ReadableStreamByobRequest, ReadableStreamDefaultController, ReadableStreamDefaultReader,
    ReadableStreamIter, UnderlyingByteSource, UnderlyingSource,
};
pub use signal::{AbortController, AbortSignal};
pub use strategy::{
    ByteLength, ByteLengthQueuingStrategy, CountQueuingStrategy, QueuingStrategy, SizeFn,
};
pub use transform::{
    IdentityTransformer, TransformStream, TransformStreamDefaultController, Transformer,
};
pub use view::ByteView;
pub use writable::{
    UnderlyingSink, WritableState, WritableStream, WritableStreamDefaultController,
    WritableStreamDefaultWriter,
};

/// 用户钩子与流操作返回的异步完成。
pub type Completion<T = ()> = LocalBoxFuture<'static, Result<T>>;
