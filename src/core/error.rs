//! 错误分类与外部协作方错误
//!
//! 每个错误类型通过 `class()` 映射到 ErrorClass，Agent 循环据此决定是上报 Failed、
//! 下一轮重试还是静默退出。

use std::any::Any;

use thiserror::Error;

/// 错误分类（决定处理方式）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 配置错误（未注册 Provider、参数不符、缓存未初始化、连接参数非法）：仅影响当前操作
    Configuration,
    /// 外部依赖暂时失败（分配 API、查询后端）：下一轮重试，不转为 Failed
    TransientExternal,
    /// Provider 判定不可恢复：步骤终态 Failed
    TerminalStep,
    /// 协作式取消，不视为错误
    Cancellation,
}

impl ErrorClass {
    /// 是否应在下一轮循环中重试
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::TransientExternal)
    }
}

/// Provider 状态读写失败（持久化层不可用或数据损坏）
#[derive(Error, Debug)]
pub enum StateError {
    #[error("State store unavailable: {0}")]
    Unavailable(String),

    #[error("State serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("State store task failed: {0}")]
    Join(String),
}

impl StateError {
    /// 状态层失败一律下一轮重试；损坏的载荷不代表 Provider 的终态判定
    pub fn class(&self) -> ErrorClass {
        ErrorClass::TransientExternal
    }
}

/// 步骤分配 API 错误
#[derive(Error, Debug)]
pub enum AssignmentError {
    #[error("Assignment request failed: {0}")]
    Transport(String),

    #[error("Assignment API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid assignment response: {0}")]
    InvalidResponse(String),
}

impl AssignmentError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::TransientExternal
    }
}

/// 查询后端错误
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    #[error("Query transport failed: {0}")]
    Transport(String),

    #[error("Query rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Malformed query response: {0}")]
    MalformedResponse(String),
}

impl QueryError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::TransientExternal
    }
}

/// 从 panic 载荷中提取可读信息
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
