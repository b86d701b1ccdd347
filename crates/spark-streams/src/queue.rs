//! 带尺寸计量的 FIFO 队列。
//!
//! # 设计背景（Why）
//! - 所有控制器都需要同时回答“下一个值是什么”和“当前排队总量是多少”，后者决定期望尺寸与背压；
//! - 浮点累加会产生极小的负数误差，出队时需要钳制到 0。
//!
//! # 契约说明（What）
//! - 入队尺寸必须是有限且非负的数，否则返回 [`StreamError::InvalidArgument`] 且队列保持不变；
//! - [`SizedQueue::total_size`] 恒为非负。

use std::collections::VecDeque;

use crate::error::{Result, StreamError};

/// 记录每个元素尺寸的 FIFO 队列。
#[derive(Debug)]
pub struct SizedQueue<V> {
    entries: VecDeque<(V, f64)>,
    total: f64,
}

impl<V> Default for SizedQueue<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SizedQueue<V> {
    /// 创建空队列。
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            total: 0.0,
        }
    }

    /// 以给定尺寸入队。
    pub fn push(&mut self, value: V, size: f64) -> Result<()> {
        if !size.is_finite() || size < 0.0 {
            return Err(StreamError::invalid_argument(
                "size must be a finite, non-negative number",
            ));
        }
        self.entries.push_back((value, size));
        self.total += size;
        Ok(())
    }

    /// 出队队首元素。
    pub fn pop(&mut self) -> Option<V> {
        let (value, size) = self.entries.pop_front()?;
        self.total -= size;
        if self.total < 0.0 {
            self.total = 0.0;
        }
        Some(value)
    }

    /// 查看队首元素。
    pub fn peek(&self) -> Option<&V> {
        self.entries.front().map(|(value, _)| value)
    }

    /// 可变地查看队首元素。
    pub fn peek_mut(&mut self) -> Option<&mut V> {
        self.entries.front_mut().map(|(value, _)| value)
    }

    /// 队首元素被部分消费后，同步扣减其登记尺寸。
    pub(crate) fn shrink_head(&mut self, amount: f64) {
        if let Some((_, size)) = self.entries.front_mut() {
            *size = (*size - amount).max(0.0);
            self.total = (self.total - amount).max(0.0);
        }
    }

    /// 清空队列并归零总量。
    pub fn reset(&mut self) {
        self.entries.clear();
        self.total = 0.0;
    }

    /// 当前排队总量。
    pub fn total_size(&self) -> f64 {
        self.total
    }

    /// 排队条目数，与各条目的尺寸无关。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否没有任何条目；尺寸为 0 的条目也算在内。
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
