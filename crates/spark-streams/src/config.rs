//! 流配置：从 TOML 加载队列策略、字节流参数与管道默认选项。
//!
//! # 设计背景（Why）
//! - 高水位线等参数往往需要按部署环境调整，把它们集中在一个可序列化结构里，
//!   构造流时只需从配置取出现成的策略；
//! - 配置在加载时统一校验，避免非法值拖到构造流时才暴露。
//!
//! # 契约说明（What）
//! - 所有字段都有默认值，空文档即默认配置；未知字段被拒绝；
//! - 高水位线必须是非负且非 NaN，自动分配块大小不得为 0，否则返回 [`StreamError::InvalidArgument`]。

use serde::Deserialize;

use crate::error::{Result, StreamError};
use crate::pipe::PipeOptions;
use crate::readable::ByteStreamOptions;
use crate::strategy::{CountQueuingStrategy, validate_high_water_mark};

/// 计数策略配置。
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StrategyConfig {
    pub high_water_mark: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 1.0,
        }
    }
}

/// 字节流配置。
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ByteStreamConfig {
    pub high_water_mark: f64,
    pub auto_allocate_chunk_size: Option<usize>,
}

/// 管道默认选项；中止信号只能在运行时提供。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipeConfig {
    pub prevent_close: bool,
    pub prevent_abort: bool,
    pub prevent_cancel: bool,
}

/// 流引擎的整体配置。
///
/// ```toml
/// [readable]
/// high_water_mark = 4.0
///
/// [bytes]
/// high_water_mark = 65536.0
/// auto_allocate_chunk_size = 4096
///
/// [pipe]
/// prevent_cancel = true
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    pub readable: StrategyConfig,
    pub writable: StrategyConfig,
    pub bytes: ByteStreamConfig,
    pub pipe: PipeConfig,
}

impl StreamConfig {
    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|err| {
            StreamError::invalid_argument(format!("invalid stream configuration: {err}"))
        })?;
        config.validate()?;
        tracing::debug!(
            readable_hwm = config.readable.high_water_mark,
            writable_hwm = config.writable.high_water_mark,
            bytes_hwm = config.bytes.high_water_mark,
            "stream configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_high_water_mark(self.readable.high_water_mark)?;
        validate_high_water_mark(self.writable.high_water_mark)?;
        self.byte_stream_options().validated()?;
        Ok(())
    }

    pub fn readable_strategy(&self) -> CountQueuingStrategy {
        CountQueuingStrategy::new(self.readable.high_water_mark)
    }

    pub fn writable_strategy(&self) -> CountQueuingStrategy {
        CountQueuingStrategy::new(self.writable.high_water_mark)
    }

    pub fn byte_stream_options(&self) -> ByteStreamOptions {
        ByteStreamOptions {
            high_water_mark: self.bytes.high_water_mark,
            auto_allocate_chunk_size: self.bytes.auto_allocate_chunk_size,
        }
    }

    pub fn pipe_options(&self) -> PipeOptions {
        PipeOptions {
            prevent_close: self.pipe.prevent_close,
            prevent_abort: self.pipe.prevent_abort,
            prevent_cancel: self.pipe.prevent_cancel,
            signal: None,
        }
    }
}
