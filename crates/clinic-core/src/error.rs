//! 错误定义模块

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 诊所系统统一错误类型
#[derive(Error, Debug)]
pub enum ClinicError {
    #[error("验证错误: {0}")]
    Validation(String),

    #[error("非法状态转换: 从 {from} 到 {to}")]
    IllegalTransition { from: String, to: String },

    #[error("前置条件未满足: {0}")]
    PreconditionNotMet(String),

    #[error("重复条目: {0}")]
    DuplicateEntry(String),

    #[error("资源繁忙: {0}")]
    ResourceBusy(String),

    #[error("库存不足: 药品 {drug_id} 需要 {required}, 现有 {available}")]
    InsufficientStock {
        drug_id: String,
        required: u32,
        available: u32,
    },

    #[error("药品已过期: {drug_id} 有效期至 {expiry}")]
    ExpiredStock { drug_id: String, expiry: NaiveDate },

    #[error("并发修改冲突: 期望版本 {expected}, 实际版本 {actual}")]
    ConcurrentModification { expected: u64, actual: u64 },

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),
}

/// 错误类别，供调用方按类别处理结构化错误
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ValidationError,
    IllegalTransitionError,
    PreconditionNotMetError,
    DuplicateEntryError,
    ResourceBusyError,
    InsufficientStockError,
    ExpiredStockError,
    ConcurrentModificationError,
    NotFoundError,
    /// 存储或配置层的基础设施错误，核心操作不会产生
    InternalError,
}

impl ClinicError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClinicError::Validation(_) => ErrorKind::ValidationError,
            ClinicError::IllegalTransition { .. } => ErrorKind::IllegalTransitionError,
            ClinicError::PreconditionNotMet(_) => ErrorKind::PreconditionNotMetError,
            ClinicError::DuplicateEntry(_) => ErrorKind::DuplicateEntryError,
            ClinicError::ResourceBusy(_) => ErrorKind::ResourceBusyError,
            ClinicError::InsufficientStock { .. } => ErrorKind::InsufficientStockError,
            ClinicError::ExpiredStock { .. } => ErrorKind::ExpiredStockError,
            ClinicError::ConcurrentModification { .. } => ErrorKind::ConcurrentModificationError,
            ClinicError::NotFound(_) => ErrorKind::NotFoundError,
            ClinicError::Io(_) | ClinicError::Serialization(_) | ClinicError::Config(_) => {
                ErrorKind::InternalError
            }
        }
    }

    /// 构造非法状态转换错误
    pub fn illegal_transition(from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        ClinicError::IllegalTransition {
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        }
    }
}

/// 诊所系统统一结果类型
pub type Result<T> = std::result::Result<T, ClinicError>;
