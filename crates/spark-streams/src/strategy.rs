//! 排队策略：高水位线与尺寸函数。
//!
//! # 设计背景（Why）
//! - 背压由“高水位线 - 排队总量”得到的期望尺寸驱动，尺寸函数决定每个值计入多少；
//! - 默认策略把每个值计为 1，字节长度策略按负载字节数计量。
//!
//! # 契约说明（What）
//! - 高水位线必须是非 NaN 的非负数（允许正无穷），否则构造流时返回 [`StreamError::InvalidArgument`]；
//! - 尺寸函数可以失败，失败会使对应流进入错误态。

use std::fmt;
use std::rc::Rc;

use bytes::Bytes;

use crate::ByteView;
use crate::error::{Result, StreamError};

/// 用户提供的尺寸函数。
pub type SizeFn<T> = Rc<dyn Fn(&T) -> Result<f64>>;

/// 高水位线与可选尺寸函数的组合。
pub struct QueuingStrategy<T> {
    high_water_mark: f64,
    size: Option<SizeFn<T>>,
}

impl<T> Clone for QueuingStrategy<T> {
    fn clone(&self) -> Self {
        Self {
            high_water_mark: self.high_water_mark,
            size: self.size.clone(),
        }
    }
}

impl<T> fmt::Debug for QueuingStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuingStrategy")
            .field("high_water_mark", &self.high_water_mark)
            .field("custom_size", &self.size.is_some())
            .finish()
    }
}

impl<T> Default for QueuingStrategy<T> {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl<T> QueuingStrategy<T> {
    /// 每个值计为 1 的策略。
    pub fn new(high_water_mark: f64) -> Self {
        Self {
            high_water_mark,
            size: None,
        }
    }

    /// 使用自定义尺寸函数。
    pub fn with_size<F>(high_water_mark: f64, size: F) -> Self
    where
        F: Fn(&T) -> Result<f64> + 'static,
    {
        Self {
            high_water_mark,
            size: Some(Rc::new(size)),
        }
    }

    /// 高水位线；构造流时才校验，这里原样返回。
    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    pub(crate) fn validated_high_water_mark(&self) -> Result<f64> {
        validate_high_water_mark(self.high_water_mark)
    }

    pub(crate) fn into_size_fn(self) -> Option<SizeFn<T>> {
        self.size
    }
}

pub(crate) fn validate_high_water_mark(high_water_mark: f64) -> Result<f64> {
    if high_water_mark.is_nan() || high_water_mark < 0.0 {
        return Err(StreamError::invalid_argument(
            "high water mark must be a non-negative number",
        ));
    }
    Ok(high_water_mark)
}

/// 按个数计量的策略。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CountQueuingStrategy {
    high_water_mark: f64,
}

impl CountQueuingStrategy {
    /// 高水位线以值的个数表示。
    pub fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }

    /// 构造时给出的高水位线。
    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl<T> From<CountQueuingStrategy> for QueuingStrategy<T> {
    fn from(strategy: CountQueuingStrategy) -> Self {
        QueuingStrategy::new(strategy.high_water_mark)
    }
}

/// 能报告负载字节数的值。
pub trait ByteLength {
    fn byte_length(&self) -> usize;
}

impl ByteLength for Vec<u8> {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

impl ByteLength for Bytes {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

impl ByteLength for String {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

impl ByteLength for ByteView {
    fn byte_length(&self) -> usize {
        ByteView::byte_length(self)
    }
}

/// 按字节长度计量的策略。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: f64,
}

impl ByteLengthQueuingStrategy {
    /// 高水位线以字节数表示，每个值按 [`ByteLength::byte_length`] 计量。
    pub fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }

    /// 构造时给出的高水位线。
    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl<T: ByteLength> From<ByteLengthQueuingStrategy> for QueuingStrategy<T> {
    fn from(strategy: ByteLengthQueuingStrategy) -> Self {
        QueuingStrategy::with_size(strategy.high_water_mark, |chunk: &T| {
            Ok(chunk.byte_length() as f64)
        })
    }
}
