//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为可读/可写/转换流的全部失败路径提供统一错误域，取代宿主语言中“任意值都可以作为原因”的习惯；
//! - 区分“调用方用法错误”（状态不符、参数非法）与“流自身携带的失败原因”，便于上层判断是否可重试。
//!
//! ## 设计要求（What）
//! - 错误必须 `Clone + PartialEq`：同一个原因会被存储在流上，并多次交付给读者、写者与管道；
//! - 每个变体都映射到稳定的 `streams.*` 错误码，供日志与告警聚合使用。
//!
//! ## 扩展建议（How）
//! - 新增变体时同步补充 [`codes`] 常量与 [`StreamError::code`] 的映射；
//! - 原因文本使用 `Cow<'static, str>`，静态文案零分配，动态文案按需拥有。

use std::borrow::Cow;

use thiserror::Error;

/// 流引擎统一的 `Result` 别名。
pub type Result<T, E = StreamError> = core::result::Result<T, E>;

/// 稳定错误码集合。
pub mod codes {
    /// 在当前状态下不允许该操作（例如向已关闭的流写入、重复获取锁）。
    pub const INVALID_STATE: &str = "streams.invalid_state";
    /// 参数越界或非法（例如负数水位线、区域不匹配的视图）。
    pub const INVALID_ARGUMENT: &str = "streams.invalid_argument";
    /// 由中止信号触发的终止。
    pub const ABORTED: &str = "streams.aborted";
    /// 由用户钩子或调用方提供的失败原因。
    pub const REASON: &str = "streams.reason";
    /// tee 两个分支各自取消原因的组合。
    pub const COMBINED: &str = "streams.combined";
    /// 未给出原因的取消或中止。
    pub const UNSPECIFIED: &str = "streams.unspecified";
}

/// 流引擎错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：流的“错误”与“取消原因”在语义上都是一个可被复制、可被比较的值；
///   用枚举承载可以让测试精确断言交付给每个消费者的原因。
/// - **契约 (What)**：
///   - [`StreamError::InvalidState`] 与 [`StreamError::InvalidArgument`] 表示调用方用法错误，
///     通常同步返回且不会改变流状态；
///   - 其余变体是“流携带的原因”，会被存储并传播给所有等待者。
/// - **设计权衡 (Trade-offs)**：[`StreamError::Combined`] 使用 `Vec` 保存组合原因，tee 双分支取消时
///   才会出现，额外分配可以忽略。
#[derive(Clone, Debug, PartialEq, Error)]
pub enum StreamError {
    /// 当前状态不允许该操作。
    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// 参数非法或越界。
    #[error("invalid argument: {0}")]
    InvalidArgument(Cow<'static, str>),

    /// 中止信号触发。
    #[error("aborted: {0}")]
    Aborted(Cow<'static, str>),

    /// 调用方或用户钩子给出的原因。
    #[error("{0}")]
    Reason(Cow<'static, str>),

    /// 多个原因的组合，顺序与分支编号一致。
    #[error("combined reasons: {0:?}")]
    Combined(Vec<StreamError>),

    /// 未给出原因。
    #[error("unspecified reason")]
    Unspecified,
}

impl StreamError {
    /// 构造状态错误。
    pub fn invalid_state(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidState(message.into())
    }

    /// 构造参数错误。
    pub fn invalid_argument(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// 构造中止错误。
    pub fn aborted(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Aborted(message.into())
    }

    /// 构造普通原因。
    pub fn reason(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Reason(message.into())
    }

    /// 返回稳定错误码。
    ///
    /// # 契约说明（What）
    /// - 返回值来自 [`codes`]，在版本间保持不变，可直接作为日志字段或指标标签。
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidState(_) => codes::INVALID_STATE,
            Self::InvalidArgument(_) => codes::INVALID_ARGUMENT,
            Self::Aborted(_) => codes::ABORTED,
            Self::Reason(_) => codes::REASON,
            Self::Combined(_) => codes::COMBINED,
            Self::Unspecified => codes::UNSPECIFIED,
        }
    }

    /// 是否为调用方用法错误。
    pub fn is_usage_error(&self) -> bool {
        matches!(self, Self::InvalidState(_) | Self::InvalidArgument(_))
    }
}
