//! 字节视图：字节流与 BYOB 读取交换的缓冲区描述。
//!
//! # 设计背景（Why）
//! - BYOB 读取需要把调用方的缓冲区“移交”给流，填充后再连同所有权一起归还；
//! - 视图除了偏移与长度，还携带元素宽度，使 16/32/64 位元素的读取按整元素完成。
//!
//! # 契约说明（What）
//! - `byte_offset + byte_length` 不超过底层缓冲区长度；
//! - `byte_length` 恒为 `element_size` 的整数倍；
//! - 移交即转移所有权：流持有缓冲区期间，调用方无法再访问它。

use bytes::Bytes;

use crate::error::{Result, StreamError};

/// 底层缓冲区上的一段可见区域。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteView {
    buffer: Vec<u8>,
    byte_offset: usize,
    byte_length: usize,
    element_size: usize,
}

impl ByteView {
    /// 覆盖整个缓冲区、元素宽度为 1 的视图。
    pub fn new(buffer: Vec<u8>) -> Self {
        let byte_length = buffer.len();
        Self {
            buffer,
            byte_offset: 0,
            byte_length,
            element_size: 1,
        }
    }

    /// 指定可见区域的视图。
    pub fn from_parts(buffer: Vec<u8>, byte_offset: usize, byte_length: usize) -> Result<Self> {
        Self::with_layout(buffer, byte_offset, byte_length, 1)
    }

    /// 覆盖整个缓冲区、按 `element_size` 字节计元素的视图。
    pub fn with_element_size(buffer: Vec<u8>, element_size: usize) -> Result<Self> {
        let byte_length = buffer.len();
        Self::with_layout(buffer, 0, byte_length, element_size)
    }

    /// 完整指定布局。
    ///
    /// # 契约说明（What）
    /// - `element_size` 只能是 1、2、4、8；
    /// - 偏移与长度都必须按元素对齐，且区域位于缓冲区之内。
    pub fn with_layout(
        buffer: Vec<u8>,
        byte_offset: usize,
        byte_length: usize,
        element_size: usize,
    ) -> Result<Self> {
        if !matches!(element_size, 1 | 2 | 4 | 8) {
            return Err(StreamError::invalid_argument(
                "element size must be 1, 2, 4 or 8",
            ));
        }
        if byte_offset % element_size != 0 || byte_length % element_size != 0 {
            return Err(StreamError::invalid_argument(
                "view offset and length must be aligned to the element size",
            ));
        }
        let end = byte_offset
            .checked_add(byte_length)
            .ok_or_else(|| StreamError::invalid_argument("view region overflows"))?;
        if end > buffer.len() {
            return Err(StreamError::invalid_argument(
                "view region exceeds the buffer length",
            ));
        }
        Ok(Self {
            buffer,
            byte_offset,
            byte_length,
            element_size,
        })
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// 可见区域内的元素个数。
    pub fn len(&self) -> usize {
        self.byte_length / self.element_size
    }

    pub fn is_empty(&self) -> bool {
        self.byte_length == 0
    }

    /// 底层缓冲区的总长度。
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// 可见区域的只读切片。
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[self.byte_offset..self.byte_offset + self.byte_length]
    }

    /// 可见区域的可写切片。
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.byte_offset..self.byte_offset + self.byte_length]
    }

    /// 取回完整的底层缓冲区。
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    /// 把可见区域复制到一块新缓冲区上，布局保持不变。
    pub fn copied(&self) -> ByteView {
        ByteView {
            buffer: self.as_bytes().to_vec(),
            byte_offset: 0,
            byte_length: self.byte_length,
            element_size: self.element_size,
        }
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, usize, usize, usize) {
        (
            self.buffer,
            self.byte_offset,
            self.byte_length,
            self.element_size,
        )
    }

    /// 由内部持有的描述符重建视图，调用方保证布局合法。
    pub(crate) fn from_raw(
        buffer: Vec<u8>,
        byte_offset: usize,
        byte_length: usize,
        element_size: usize,
    ) -> Self {
        Self {
            buffer,
            byte_offset,
            byte_length,
            element_size,
        }
    }
}

impl From<Vec<u8>> for ByteView {
    fn from(buffer: Vec<u8>) -> Self {
        ByteView::new(buffer)
    }
}

impl From<&[u8]> for ByteView {
    fn from(bytes: &[u8]) -> Self {
        ByteView::new(bytes.to_vec())
    }
}

impl From<Bytes> for ByteView {
    fn from(bytes: Bytes) -> Self {
        ByteView::new(Vec::from(bytes))
    }
}
